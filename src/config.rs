//! # Run Configuration
//!
//! Everything a run needs besides the design matrix and the model: where the
//! store lives, which model it belongs to, how many draws to request, how large a
//! chunk is, and how the summaries are computed.
//!
//! The configuration can be built in code, loaded from a TOML file, or assembled
//! by the CLI. In every case `validate` runs before any work begins, so an invalid
//! setting never leaves a half-written store behind.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The default number of design rows per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;
/// The default number of posterior draws requested per row.
pub const DEFAULT_DRAW_COUNT: usize = 1_000;
/// Lower credible bound probability (2.5th percentile).
pub const DEFAULT_LOWER_QUANTILE: f64 = 0.025;
/// Upper credible bound probability (97.5th percentile).
pub const DEFAULT_UPPER_QUANTILE: f64 = 0.975;

/// Maps draws from the model's native scale to the reported scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScaleTransform {
    /// The model works on a log scale; reported values are `exp(value)`.
    #[default]
    Exp,
    /// The model's native scale is the reported scale.
    Identity,
}

impl ScaleTransform {
    #[inline]
    pub fn apply(self, value: f64) -> f64 {
        match self {
            Self::Exp => value.exp(),
            Self::Identity => value,
        }
    }
}

/// Invalid settings, detected before any chunk is emitted.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Chunk size must be a positive integer (got {0}).")]
    InvalidChunkSize(usize),
    #[error("Draw count must be a positive integer (got {0}).")]
    InvalidDrawCount(usize),
    #[error("Draw count {requested} exceeds the {available} posterior draws available from the model.")]
    DrawCountExceedsPosterior { requested: usize, available: usize },
    #[error("Exceedance threshold must be a finite number (got {0}).")]
    InvalidThreshold(f64),
    #[error(
        "Quantile probabilities must satisfy 0 <= lower < upper <= 1 (got lower={lower}, upper={upper})."
    )]
    InvalidQuantiles { lower: f64, upper: f64 },
    #[error("Worker count must be at least 1.")]
    InvalidWorkers,
    #[error(
        "Model identifier '{0}' is not usable as a store name. Use letters, digits, '.', '_' or '-'."
    )]
    InvalidModelId(String),
    #[error("The design matrix contains no rows; there is nothing to predict.")]
    EmptyDesign,
    #[error(
        "Cannot resume: the existing store for model '{model_id}' was written with {field} = {stored}, but this run uses {requested}. Start a fresh run instead."
    )]
    ResumeMismatch {
        model_id: String,
        field: &'static str,
        stored: String,
        requested: String,
    },
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration file: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// The complete set of knobs for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Identifies the model; also names the store directory.
    pub model_id: String,
    /// Parent directory of all per-model stores.
    pub output_dir: PathBuf,
    #[serde(default = "default_draw_count")]
    pub draw_count: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Threshold on the back-transformed scale for `prob_exceed`.
    pub threshold: f64,
    #[serde(default)]
    pub transform: ScaleTransform,
    #[serde(default = "default_lower_quantile")]
    pub lower_quantile: f64,
    #[serde(default = "default_upper_quantile")]
    pub upper_quantile: f64,
    /// Number of chunks emitted concurrently. 1 keeps peak memory at one chunk.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Skip chunks that already have a published artifact.
    #[serde(default)]
    pub resume: bool,
}

fn default_draw_count() -> usize {
    DEFAULT_DRAW_COUNT
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_lower_quantile() -> f64 {
    DEFAULT_LOWER_QUANTILE
}

fn default_upper_quantile() -> f64 {
    DEFAULT_UPPER_QUANTILE
}

fn default_workers() -> usize {
    1
}

impl PipelineConfig {
    /// A configuration with library defaults for everything except the required fields.
    pub fn new(model_id: impl Into<String>, output_dir: impl Into<PathBuf>, threshold: f64) -> Self {
        Self {
            model_id: model_id.into(),
            output_dir: output_dir.into(),
            draw_count: DEFAULT_DRAW_COUNT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            threshold,
            transform: ScaleTransform::default(),
            lower_quantile: DEFAULT_LOWER_QUANTILE,
            upper_quantile: DEFAULT_UPPER_QUANTILE,
            workers: 1,
            resume: false,
        }
    }

    /// Loads a configuration from a TOML file. The result is not yet validated.
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let toml_string = fs::read_to_string(path)?;
        let config = toml::from_str(&toml_string)?;
        Ok(config)
    }

    /// Checks every setting that can be checked without the design or the model.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_model_id(&self.model_id)?;
        if self.chunk_size == 0 {
            return Err(ConfigurationError::InvalidChunkSize(self.chunk_size));
        }
        if self.draw_count == 0 {
            return Err(ConfigurationError::InvalidDrawCount(self.draw_count));
        }
        if self.draw_count > u32::MAX as usize {
            return Err(ConfigurationError::InvalidDrawCount(self.draw_count));
        }
        if !self.threshold.is_finite() {
            return Err(ConfigurationError::InvalidThreshold(self.threshold));
        }
        let (lower, upper) = (self.lower_quantile, self.upper_quantile);
        if !(0.0..=1.0).contains(&lower) || !(0.0..=1.0).contains(&upper) || lower >= upper {
            return Err(ConfigurationError::InvalidQuantiles { lower, upper });
        }
        if self.workers == 0 {
            return Err(ConfigurationError::InvalidWorkers);
        }
        Ok(())
    }

    /// The directory holding this model's store.
    pub fn model_dir(&self) -> PathBuf {
        self.output_dir.join(&self.model_id)
    }
}

/// A model identifier must map to exactly one directory under the output root.
pub fn validate_model_id(model_id: &str) -> Result<(), ConfigurationError> {
    let well_formed = !model_id.is_empty()
        && model_id != "."
        && model_id != ".."
        && model_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if well_formed {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidModelId(model_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid_config() -> PipelineConfig {
        PipelineConfig::new("pm25_v1", "/tmp/out", 35.0)
    }

    #[test]
    fn defaults_validate() {
        let config = valid_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.transform, ScaleTransform::Exp);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let mut config = valid_config();
        config.chunk_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidChunkSize(0))
        ));
    }

    #[test]
    fn zero_draw_count_is_rejected() {
        let mut config = valid_config();
        config.draw_count = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidDrawCount(0))
        ));
    }

    #[test]
    fn non_finite_threshold_is_rejected() {
        let mut config = valid_config();
        config.threshold = f64::NAN;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidThreshold(_))
        ));
    }

    #[test]
    fn inverted_quantiles_are_rejected() {
        let mut config = valid_config();
        config.lower_quantile = 0.9;
        config.upper_quantile = 0.1;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidQuantiles { .. })
        ));
    }

    #[test]
    fn model_ids_that_escape_the_store_are_rejected() {
        for bad in ["", ".", "..", "a/b", "model id", "../up"] {
            assert!(validate_model_id(bad).is_err(), "accepted {bad:?}");
        }
        for good in ["m1", "pm2.5-daily", "model_A"] {
            assert!(validate_model_id(good).is_ok(), "rejected {good:?}");
        }
    }

    #[test]
    fn scale_transform_applies() {
        assert_eq!(ScaleTransform::Identity.apply(2.0), 2.0);
        assert!((ScaleTransform::Exp.apply(0.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn loads_toml_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "model_id = \"m2\"\noutput_dir = \"store\"\nthreshold = 1.5\nchunk_size = 250\ntransform = \"identity\""
        )
        .unwrap();
        file.flush().unwrap();

        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.model_id, "m2");
        assert_eq!(config.chunk_size, 250);
        assert_eq!(config.draw_count, DEFAULT_DRAW_COUNT);
        assert_eq!(config.transform, ScaleTransform::Identity);
        assert_eq!(config.workers, 1);
        assert!(!config.resume);
        assert_eq!(config.model_dir(), PathBuf::from("store").join("m2"));
    }
}
