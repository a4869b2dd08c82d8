#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process;

use postscan::config::{PipelineConfig, ScaleTransform};
use postscan::design::load_design_matrix;
use postscan::indexer::RowIndexer;
use postscan::pipeline::{self, PipelineOutcome};
use postscan::predictor::LinearPosterior;
use postscan::progress::ProgressBarObserver;

const SUMMARY_TSV: &str = "summary.tsv";
const SUMMARY_PARQUET: &str = "summary.parquet";

#[derive(Clone, Copy, ValueEnum)]
pub enum TransformCli {
    Exp,
    Identity,
}

impl From<TransformCli> for ScaleTransform {
    fn from(value: TransformCli) -> Self {
        match value {
            TransformCli::Exp => ScaleTransform::Exp,
            TransformCli::Identity => ScaleTransform::Identity,
        }
    }
}

/// Settings that override the `--config` file.
#[derive(Args)]
pub struct ConfigArgs {
    /// TOML file with pipeline settings
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Identifier of the model; names the store directory
    #[arg(long, value_name = "ID")]
    pub model_id: Option<String>,

    /// Root directory for per-model stores
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Posterior draws per row
    #[arg(long, value_name = "N")]
    pub draws: Option<usize>,

    /// Rows per chunk
    #[arg(long, value_name = "N")]
    pub chunk_size: Option<usize>,

    /// Exceedance threshold on the response scale
    #[arg(long, value_name = "VALUE")]
    pub threshold: Option<f64>,

    /// Back-transformation from the draw scale to the response scale
    #[arg(long, value_enum)]
    pub transform: Option<TransformCli>,

    /// Lower credible-interval probability
    #[arg(long, value_name = "P")]
    pub lower_quantile: Option<f64>,

    /// Upper credible-interval probability
    #[arg(long, value_name = "P")]
    pub upper_quantile: Option<f64>,

    /// Chunks emitted concurrently (capped at the number of CPUs)
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,
}

#[derive(Args)]
pub struct RunArgs {
    /// Design matrix (TSV or Parquet) with x, y, date and covariate columns
    #[arg(value_name = "DESIGN_PATH")]
    pub design: PathBuf,

    /// TOML file with exported posterior coefficient draws
    #[arg(long, value_name = "PATH")]
    pub posterior: PathBuf,

    /// Keep chunks already published by an interrupted run
    #[arg(long)]
    pub resume: bool,

    #[command(flatten)]
    pub settings: ConfigArgs,
}

#[derive(Parser)]
#[command(
    name = "postscan",
    about = "Memory-bounded posterior-predictive summaries over large design matrices",
    long_about = "Emits posterior draws chunk by chunk into an on-disk store, summarizes \
                 them per row, and joins the summaries back onto the design matrix."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Emit, store, summarize and join posterior draws for a design matrix
    #[command(about = "Run the full pipeline (outputs: summary.tsv, summary.parquet)")]
    Run(RunArgs),

    /// Re-summarize an existing store without calling the model
    #[command(about = "Re-aggregate a completed store, e.g. with a new threshold")]
    Summarize(ConfigArgs),

    /// Show how a design matrix would be chunked
    #[command(about = "Print the chunk plan for a design matrix")]
    Plan {
        /// Design matrix (TSV or Parquet)
        #[arg(value_name = "DESIGN_PATH")]
        design: PathBuf,

        /// Rows per chunk
        #[arg(long, value_name = "N", default_value_t = postscan::config::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },

    /// Display version and build information
    #[command(about = "Display version and build information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Summarize(args)) => summarize(args),
        Some(Commands::Plan { design, chunk_size }) => print_plan(&design, chunk_size),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => Cli::command().print_help().map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Builds the configuration from the optional file, then applies flag overrides.
fn resolve_config(args: ConfigArgs) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => {
            let model_id = args
                .model_id
                .clone()
                .ok_or("--model-id is required when no --config file is given")?;
            let threshold = args
                .threshold
                .ok_or("--threshold is required when no --config file is given")?;
            PipelineConfig::new(model_id, PathBuf::from("."), threshold)
        }
    };

    if let Some(model_id) = args.model_id {
        config.model_id = model_id;
    }
    if let Some(output_dir) = args.output_dir {
        config.output_dir = output_dir;
    }
    if let Some(draws) = args.draws {
        config.draw_count = draws;
    }
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(threshold) = args.threshold {
        config.threshold = threshold;
    }
    if let Some(transform) = args.transform {
        config.transform = transform.into();
    }
    if let Some(lower) = args.lower_quantile {
        config.lower_quantile = lower;
    }
    if let Some(upper) = args.upper_quantile {
        config.upper_quantile = upper;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }

    let cpus = num_cpus::get().max(1);
    if config.workers > cpus {
        println!(
            "Requested {} workers but only {} CPUs are available; using {}.",
            config.workers, cpus, cpus
        );
        config.workers = cpus;
    }
    Ok(config)
}

fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let RunArgs {
        design,
        posterior,
        resume,
        settings,
    } = args;
    let mut config = resolve_config(settings)?;
    config.resume = config.resume || resume;

    println!("Loading design matrix from {}", design.display());
    let design = load_design_matrix(&design)?;
    println!(
        "Loaded {} rows with {} covariates",
        design.len(),
        design.covariate_names().len()
    );
    let posterior = LinearPosterior::load(&posterior)?;
    println!(
        "Loaded posterior with {} terms and {} draws",
        posterior.terms.len(),
        posterior.draws.len()
    );

    let mut progress = ProgressBarObserver::new();
    let outcome = pipeline::run(&config, &design, &posterior, &mut progress)?;
    println!(
        "Published {} chunks ({} skipped, {} records)",
        outcome.chunks_written, outcome.chunks_skipped, outcome.records_written
    );
    if let Some(peak) = outcome.peak_rss_bytes {
        println!(
            "Peak resident memory during emission: {:.1} MiB",
            peak as f64 / (1024.0 * 1024.0)
        );
    }
    write_outputs(&config, &outcome)
}

fn summarize(args: ConfigArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(args)?;
    let mut progress = ProgressBarObserver::new();
    let outcome = pipeline::summarize_store(&config, &mut progress)?;
    println!(
        "Re-summarized {} chunks ({} records)",
        outcome.num_chunks, outcome.records_scanned
    );
    write_outputs(&config, &outcome)
}

fn write_outputs(
    config: &PipelineConfig,
    outcome: &PipelineOutcome,
) -> Result<(), Box<dyn std::error::Error>> {
    let model_dir = config.model_dir();
    let tsv_path = model_dir.join(SUMMARY_TSV);
    let parquet_path = model_dir.join(SUMMARY_PARQUET);
    outcome.table.write_tsv(&tsv_path)?;
    outcome.table.write_parquet(&parquet_path)?;

    let without_draws = outcome
        .table
        .rows()
        .iter()
        .filter(|row| row.summary.as_ref().is_none_or(|s| s.n_draws == 0))
        .count();
    println!(
        "Wrote {} rows to {} and {}",
        outcome.table.len(),
        tsv_path.display(),
        parquet_path.display()
    );
    if without_draws > 0 {
        println!("{without_draws} rows had no usable draws; their statistics are NA.");
    }
    if outcome.missing_values > 0 {
        println!(
            "{} draw values were missing and excluded from the summaries.",
            outcome.missing_values
        );
    }
    Ok(())
}

fn print_plan(design: &Path, chunk_size: usize) -> Result<(), Box<dyn std::error::Error>> {
    let design = load_design_matrix(design)?;
    let plan = RowIndexer::new(chunk_size)?.plan(design.len())?;
    println!(
        "{} rows in {} chunks of up to {} rows",
        plan.num_rows(),
        plan.len(),
        plan.chunk_size()
    );
    for chunk in plan.iter() {
        println!(
            "chunk {:>6}  rows {}..={}  ({} rows)",
            chunk.index,
            chunk.first_row(),
            chunk.last_row(),
            chunk.len()
        );
    }
    Ok(())
}

/// Format seconds into a human-readable duration like "2.4 hours ago"
fn format_duration_ago(seconds: u64) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;

    if seconds < MINUTE {
        format!("{} seconds ago", seconds)
    } else if seconds < HOUR {
        format!("{:.1} minutes ago", seconds as f64 / MINUTE as f64)
    } else if seconds < DAY {
        format!("{:.1} hours ago", seconds as f64 / HOUR as f64)
    } else {
        format!("{:.1} days ago", seconds as f64 / DAY as f64)
    }
}

fn print_version_info() {
    let version = env!("CARGO_PKG_VERSION");
    let build_timestamp: u64 = env!("POSTSCAN_BUILD_TIMESTAMP").parse().unwrap_or(0);

    println!("postscan {}", version);

    if build_timestamp > 0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        if now > build_timestamp {
            println!("Built: {}", format_duration_ago(now - build_timestamp));
        } else {
            println!("Built: just now");
        }
    }
}
