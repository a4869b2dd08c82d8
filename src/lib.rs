pub mod aggregate;
pub mod config;
pub mod design;
pub mod emit;
pub mod indexer;
pub mod join;
pub mod pipeline;
pub mod predictor;
pub mod progress;
pub mod store;
pub mod types;
