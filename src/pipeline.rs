// ========================================================================================
//
//                        The run orchestrator
//
// ========================================================================================
//
// A run is strictly phased: every chunk is emitted and durably published before the
// aggregation engine reads anything back, and the join happens only after the engine
// has produced every summary. During emission at most `workers` chunks of draws are
// alive at once; each is dropped as soon as its artifact is published.

use crate::aggregate::{AggregationEngine, AggregationError, StoreScan, SummaryOptions};
use crate::config::{ConfigurationError, PipelineConfig};
use crate::design::DesignMatrix;
use crate::emit::DrawEmitter;
use crate::indexer::{Chunk, RowIndexer};
use crate::join::{JoinIntegrityError, SummaryTable, join_summaries};
use crate::predictor::{ModelEvaluationError, PosteriorPredictor};
use crate::progress::{ChunkProgressObserver, PipelineStage};
use crate::store::{DrawStore, PersistenceError, RunManifest};
use crate::types::SummaryRecord;
use log::{debug, info};
use rayon::prelude::*;
use std::sync::{Mutex, MutexGuard, PoisonError};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use thiserror::Error;

// ========================================================================================
//                          Public API, context & error handling
// ========================================================================================

/// Every way a run can fail, by the stage that raised it.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("Model evaluation failed: {0}")]
    ModelEvaluation(#[from] ModelEvaluationError),
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),
    #[error("Join integrity violated: {0}")]
    JoinIntegrity(#[from] JoinIntegrityError),
    #[error(
        "The store for model '{model_id}' holds {published} of {expected} chunks. Resume the run before summarizing."
    )]
    IncompleteStore {
        model_id: String,
        published: usize,
        expected: usize,
    },
    #[error(
        "Cannot resume model '{model_id}': {published} chunks are published but manifest.toml is missing, so their plan cannot be verified. Start a fresh run instead."
    )]
    UnverifiableResume { model_id: String, published: usize },
    #[error(
        "The store for model '{model_id}' yielded {scanned} draw records, expected {expected} ({num_rows} rows x {draw_count} draws)."
    )]
    RecordCountMismatch {
        model_id: String,
        scanned: u64,
        expected: u64,
        num_rows: u64,
        draw_count: usize,
    },
    #[error("Failed to build the emission thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// What a completed run produced, plus the counters worth reporting.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub table: SummaryTable,
    pub num_chunks: usize,
    pub chunks_written: usize,
    pub chunks_skipped: usize,
    pub records_written: u64,
    pub records_scanned: u64,
    pub missing_values: u64,
    pub peak_buffered_rows: usize,
    /// Highest resident set observed between chunks, in bytes.
    pub peak_rss_bytes: Option<u64>,
}

/// Samples the resident set of this process.
struct MemoryProbe {
    system: System,
    pid: Option<Pid>,
    peak: Option<u64>,
}

impl MemoryProbe {
    fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
            peak: None,
        }
    }

    fn sample(&mut self) -> Option<u64> {
        let pid = self.pid?;
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        let rss = self.system.process(pid)?.memory();
        self.peak = Some(self.peak.map_or(rss, |peak| peak.max(rss)));
        Some(rss)
    }
}

/// Shared between emission workers; only touched after a chunk is published.
struct EmissionTracker<'o> {
    observer: &'o mut dyn ChunkProgressObserver,
    probe: MemoryProbe,
    completed: usize,
}

impl EmissionTracker<'_> {
    fn chunk_published(&mut self, chunk: &Chunk, records: u64) {
        self.completed += 1;
        self.observer
            .on_chunk_done(PipelineStage::Emission, self.completed);
        match self.probe.sample() {
            Some(rss) => debug!(
                "Chunk {} published ({} records); resident set {:.1} MiB",
                chunk.index,
                records,
                rss as f64 / (1024.0 * 1024.0)
            ),
            None => debug!("Chunk {} published ({} records)", chunk.index, records),
        }
    }
}

// ========================================================================================
//                                  Orchestration
// ========================================================================================

/// Runs the whole pipeline for one model: plan, emit and publish every chunk,
/// aggregate the store, and join the summaries back onto `design`.
pub fn run<P>(
    config: &PipelineConfig,
    design: &DesignMatrix,
    predictor: &P,
    observer: &mut dyn ChunkProgressObserver,
) -> Result<PipelineOutcome, PipelineError>
where
    P: PosteriorPredictor + Sync + ?Sized,
{
    config.validate()?;
    if let Some(available) = predictor.posterior_size() {
        if config.draw_count > available {
            return Err(ConfigurationError::DrawCountExceedsPosterior {
                requested: config.draw_count,
                available,
            }
            .into());
        }
    }
    let plan = RowIndexer::new(config.chunk_size)?.plan(design.len())?;
    info!(
        "Model '{}': {} rows in {} chunks of up to {} rows, {} draws per row",
        config.model_id,
        plan.num_rows(),
        plan.len(),
        plan.chunk_size(),
        config.draw_count
    );

    let store = DrawStore::open(&config.output_dir, &config.model_id)?;
    let manifest = RunManifest::for_plan(&config.model_id, &plan, config.draw_count);
    prepare_store(&store, &manifest, design, config.resume)?;

    let pending: Vec<&Chunk> = plan
        .iter()
        .filter(|chunk| !(config.resume && store.is_published(chunk)))
        .collect();
    let chunks_skipped = plan.len() - pending.len();
    if chunks_skipped > 0 {
        info!(
            "Resuming: {} of {} chunks already published",
            chunks_skipped,
            plan.len()
        );
    }

    let mut tracker = EmissionTracker {
        observer: &mut *observer,
        probe: MemoryProbe::new(),
        completed: chunks_skipped,
    };
    tracker
        .observer
        .on_stage_start(PipelineStage::Emission, plan.len());
    let emitter = DrawEmitter::new(
        predictor,
        &config.model_id,
        design.covariate_names(),
        config.draw_count,
    );
    let records_written = if config.workers > 1 {
        emit_parallel(&store, &emitter, design, &pending, config.workers, &mut tracker)?
    } else {
        emit_sequential(&store, &emitter, design, &pending, &mut tracker)?
    };
    tracker.observer.on_stage_finish(PipelineStage::Emission);
    let peak_rss_bytes = tracker.probe.peak;
    if let Some(peak) = peak_rss_bytes {
        info!(
            "Emission complete; peak resident set {:.1} MiB",
            peak as f64 / (1024.0 * 1024.0)
        );
    }

    let scan = aggregate_store(&store, plan.len(), config, observer)?;
    let expected_records = plan.num_rows() * config.draw_count as u64;
    if scan.records_scanned != expected_records {
        return Err(PipelineError::RecordCountMismatch {
            model_id: config.model_id.clone(),
            scanned: scan.records_scanned,
            expected: expected_records,
            num_rows: plan.num_rows(),
            draw_count: config.draw_count,
        });
    }

    let table = join_stage(design, scan.summaries, observer)?;
    Ok(PipelineOutcome {
        table,
        num_chunks: plan.len(),
        chunks_written: pending.len(),
        chunks_skipped,
        records_written,
        records_scanned: scan.records_scanned,
        missing_values: scan.missing_values,
        peak_buffered_rows: scan.peak_buffered_rows,
        peak_rss_bytes,
    })
}

/// Re-aggregates a completed store and rejoins it onto the persisted design
/// matrix without invoking the model. Summary settings come from `config`.
pub fn summarize_store(
    config: &PipelineConfig,
    observer: &mut dyn ChunkProgressObserver,
) -> Result<PipelineOutcome, PipelineError> {
    config.validate()?;
    let store = DrawStore::open_existing(&config.output_dir, &config.model_id)?;
    let design = store.read_design()?;
    let num_chunks = match store.read_manifest()? {
        Some(manifest) => manifest.num_chunks,
        None => RowIndexer::new(config.chunk_size)?.plan(design.len())?.len(),
    };
    let published = store.published_chunks()?.len();
    if published != num_chunks {
        return Err(PipelineError::IncompleteStore {
            model_id: config.model_id.clone(),
            published,
            expected: num_chunks,
        });
    }
    info!(
        "Re-summarizing model '{}' ({} rows, {} chunks) with threshold {}",
        config.model_id,
        design.len(),
        num_chunks,
        config.threshold
    );

    let scan = aggregate_store(&store, num_chunks, config, observer)?;
    let table = join_stage(&design, scan.summaries, observer)?;
    Ok(PipelineOutcome {
        table,
        num_chunks,
        chunks_written: 0,
        chunks_skipped: num_chunks,
        records_written: 0,
        records_scanned: scan.records_scanned,
        missing_values: scan.missing_values,
        peak_buffered_rows: scan.peak_buffered_rows,
        peak_rss_bytes: None,
    })
}

/// Fresh runs start from an empty store. Resumed runs keep published chunks but
/// only when the stored manifest describes the same plan and the stored design
/// holds the same rows.
fn prepare_store(
    store: &DrawStore,
    manifest: &RunManifest,
    design: &DesignMatrix,
    resume: bool,
) -> Result<(), PipelineError> {
    if resume {
        match store.read_manifest()? {
            Some(stored) => stored.check_resumable(manifest)?,
            None => {
                let published = store.published_chunks()?.len();
                if published > 0 {
                    return Err(PipelineError::UnverifiableResume {
                        model_id: store.model_id().to_string(),
                        published,
                    });
                }
            }
        }
        if store.design_path().is_file() {
            let stored = store.read_design()?;
            if let Some((was, now)) = stored.first_difference(design) {
                return Err(ConfigurationError::ResumeMismatch {
                    model_id: store.model_id().to_string(),
                    field: "design",
                    stored: was,
                    requested: now,
                }
                .into());
            }
        }
        let swept = store.sweep_partials()?;
        if swept > 0 {
            info!("Swept {swept} partial chunk files left by an interrupted run");
        }
    } else {
        let cleared = store.clear_chunks()?;
        if cleared > 0 {
            info!(
                "Cleared {} chunk files from a previous run of model '{}'",
                cleared,
                store.model_id()
            );
        }
    }
    store.write_design(design)?;
    store.write_manifest(manifest)?;
    Ok(())
}

fn emit_chunk<P>(
    store: &DrawStore,
    emitter: &DrawEmitter<'_, P>,
    design: &DesignMatrix,
    chunk: &Chunk,
) -> Result<u64, PipelineError>
where
    P: PosteriorPredictor + ?Sized,
{
    let batch = emitter.emit(chunk, design.chunk_rows(chunk))?;
    let missing = batch.missing_count();
    if missing > 0 {
        debug!("Chunk {}: {} of {} draws missing", chunk.index, missing, batch.len());
    }
    store.write_chunk(chunk, &batch)?;
    Ok(batch.len() as u64)
}

fn emit_sequential<P>(
    store: &DrawStore,
    emitter: &DrawEmitter<'_, P>,
    design: &DesignMatrix,
    pending: &[&Chunk],
    tracker: &mut EmissionTracker<'_>,
) -> Result<u64, PipelineError>
where
    P: PosteriorPredictor + ?Sized,
{
    let mut records = 0;
    for chunk in pending {
        let written = emit_chunk(store, emitter, design, chunk)?;
        tracker.chunk_published(chunk, written);
        records += written;
    }
    Ok(records)
}

fn emit_parallel<P>(
    store: &DrawStore,
    emitter: &DrawEmitter<'_, P>,
    design: &DesignMatrix,
    pending: &[&Chunk],
    workers: usize,
    tracker: &mut EmissionTracker<'_>,
) -> Result<u64, PipelineError>
where
    P: PosteriorPredictor + Sync + ?Sized,
{
    let pool = rayon::ThreadPoolBuilder::new().num_threads(workers).build()?;
    let tracker = Mutex::new(tracker);
    let written: Vec<u64> = pool.install(|| {
        pending
            .par_iter()
            .map(|chunk| {
                let written = emit_chunk(store, emitter, design, chunk)?;
                locked(&tracker).chunk_published(chunk, written);
                Ok(written)
            })
            .collect::<Result<Vec<u64>, PipelineError>>()
    })?;
    Ok(written.into_iter().sum())
}

/// A panicking worker fails the run through rayon; the tracker's counters stay usable.
fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn aggregate_store(
    store: &DrawStore,
    total_chunks: usize,
    config: &PipelineConfig,
    observer: &mut dyn ChunkProgressObserver,
) -> Result<StoreScan, PipelineError> {
    observer.on_stage_start(PipelineStage::Aggregation, total_chunks);
    let engine = AggregationEngine::new(SummaryOptions::from(config));
    let scan = engine.aggregate(store)?;
    observer.on_chunk_done(PipelineStage::Aggregation, scan.files_scanned);
    observer.on_stage_finish(PipelineStage::Aggregation);
    debug!(
        "Aggregation buffered at most {} rows at once",
        scan.peak_buffered_rows
    );
    Ok(scan)
}

fn join_stage(
    design: &DesignMatrix,
    summaries: Vec<SummaryRecord>,
    observer: &mut dyn ChunkProgressObserver,
) -> Result<SummaryTable, PipelineError> {
    observer.on_stage_start(PipelineStage::Join, 1);
    let table = join_summaries(design, summaries)?;
    observer.on_chunk_done(PipelineStage::Join, 1);
    observer.on_stage_finish(PipelineStage::Join);
    Ok(table)
}
