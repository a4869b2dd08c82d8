//! # Streaming Aggregation over the Draw Store
//!
//! Summaries are computed by scanning published chunk files one at a time, never
//! by loading the store wholesale.
//!
//! Files are visited in order of the first row id their name declares. Draws are
//! buffered per row; once a file has been read, every buffered row whose id is
//! below the first row of the next file can no longer receive draws, so it is
//! summarized and released. With disjoint chunks this keeps at most one chunk's
//! draws in memory, while the result stays independent of how rows were chunked.
//!
//! Statistics, per row, over non-missing draws only:
//! - arithmetic mean and sample standard deviation (n - 1 denominator),
//! - lower/upper quantiles by linear interpolation between order statistics,
//! - the same four on the back-transformed scale,
//! - the fraction of back-transformed draws strictly above the threshold.

use crate::config::{PipelineConfig, ScaleTransform};
use crate::design::ROW_ID_COLUMN;
use crate::emit::{DRAW_ID_COLUMN, MODEL_ID_COLUMN, VALUE_COLUMN};
use crate::store::{ChunkArtifact, DrawStore, PersistenceError};
use crate::types::{DrawId, DrawRecord, RowId, SummaryRecord};
use log::{debug, info};
use polars::prelude::*;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AggregationError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("Chunk file '{path}' has an unreadable column: {source}")]
    Frame {
        path: PathBuf,
        #[source]
        source: PolarsError,
    },
    #[error("Chunk file '{path}' contains a record with a null {column}.")]
    NullKey { path: PathBuf, column: &'static str },
    #[error(
        "Chunk file '{path}' holds draws for model '{found}' inside the store of model '{expected}'."
    )]
    ForeignModel {
        path: PathBuf,
        expected: String,
        found: String,
    },
    #[error(
        "Chunk files '{first}' and '{second}' declare overlapping row ranges. The store mixes two chunk plans; rerun without resume."
    )]
    OverlappingChunks { first: PathBuf, second: PathBuf },
    #[error("Chunk file '{path}' holds row {row_id}, outside its declared range {first}..={last}.")]
    RowOutsideChunk {
        path: PathBuf,
        row_id: RowId,
        first: RowId,
        last: RowId,
    },
}

/// How per-row statistics are computed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummaryOptions {
    pub threshold: f64,
    pub transform: ScaleTransform,
    pub lower_quantile: f64,
    pub upper_quantile: f64,
}

impl From<&PipelineConfig> for SummaryOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            threshold: config.threshold,
            transform: config.transform,
            lower_quantile: config.lower_quantile,
            upper_quantile: config.upper_quantile,
        }
    }
}

/// The result of one full scan of a store.
#[derive(Debug, Clone)]
pub struct StoreScan {
    /// One summary per distinct row id in the store, ordered by row id.
    pub summaries: Vec<SummaryRecord>,
    pub files_scanned: usize,
    pub records_scanned: u64,
    pub missing_values: u64,
    /// The largest number of rows buffered at once during the scan.
    pub peak_buffered_rows: usize,
}

/// Linear-interpolation quantile of an ascending, non-empty slice.
pub fn quantile_sorted(sorted: &[f64], probability: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let position = (sorted.len() - 1) as f64 * probability;
    let lower = position.floor() as usize;
    let upper = (lower + 1).min(sorted.len() - 1);
    let weight = position - lower as f64;
    sorted[lower] + weight * (sorted[upper] - sorted[lower])
}

fn mean_and_sd(values: &[f64]) -> (f64, Option<f64>) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let sd = (values.len() > 1).then(|| {
        let sum_sq: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
        (sum_sq / (n - 1.0)).sqrt()
    });
    (mean, sd)
}

/// Summarizes the non-missing draws of one row. `values` is reordered in place.
pub fn summarize_draws(row_id: RowId, values: &mut [f64], options: &SummaryOptions) -> SummaryRecord {
    if values.is_empty() {
        return SummaryRecord::empty(row_id);
    }
    values.sort_unstable_by(f64::total_cmp);
    let (mean_log, sd_log) = mean_and_sd(values);
    let lwr_log = quantile_sorted(values, options.lower_quantile);
    let upr_log = quantile_sorted(values, options.upper_quantile);

    let back: Vec<f64> = values.iter().map(|&v| options.transform.apply(v)).collect();
    let exceeding = back.iter().filter(|&&v| v > options.threshold).count();
    let prob_exceed = Some(exceeding as f64 / values.len() as f64);
    let native = SummaryRecord {
        row_id,
        n_draws: values.len(),
        mean_log: Some(mean_log),
        sd_log,
        lwr_log: Some(lwr_log),
        upr_log: Some(upr_log),
        prob_exceed,
        ..SummaryRecord::empty(row_id)
    };

    // A back-transform that overflows leaves the response-scale moments undefined.
    if back.iter().any(|v| !v.is_finite()) {
        return native;
    }
    // The transform is monotone, so `back` is already sorted.
    let (mean, sd) = mean_and_sd(&back);
    SummaryRecord {
        mean: Some(mean),
        sd,
        lwr: Some(quantile_sorted(&back, options.lower_quantile)),
        upr: Some(quantile_sorted(&back, options.upper_quantile)),
        ..native
    }
}

/// Groups the draw store by row id and summarizes every row.
#[derive(Debug, Clone)]
pub struct AggregationEngine {
    options: SummaryOptions,
}

impl AggregationEngine {
    pub fn new(options: SummaryOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SummaryOptions {
        &self.options
    }

    /// Scans every published chunk of `store`. Must only run once all chunks of
    /// the run are published.
    pub fn aggregate(&self, store: &DrawStore) -> Result<StoreScan, AggregationError> {
        let mut artifacts = store.published_chunks()?;
        artifacts.sort_by_key(|artifact| (artifact.first_row, artifact.index));
        // The watermark below is only sound for disjoint row ranges.
        for pair in artifacts.windows(2) {
            if pair[1].first_row <= pair[0].last_row {
                return Err(AggregationError::OverlappingChunks {
                    first: pair[0].path.clone(),
                    second: pair[1].path.clone(),
                });
            }
        }
        info!(
            "Aggregating {} chunk files for model '{}'",
            artifacts.len(),
            store.model_id()
        );

        let mut scan = StoreScan {
            summaries: Vec::new(),
            files_scanned: 0,
            records_scanned: 0,
            missing_values: 0,
            peak_buffered_rows: 0,
        };
        let mut pending: BTreeMap<RowId, Vec<f64>> = BTreeMap::new();

        for (position, artifact) in artifacts.iter().enumerate() {
            let df = store.read_chunk(artifact)?;
            self.accumulate(&df, artifact, store.model_id(), &mut pending, &mut scan)?;
            drop(df);
            scan.files_scanned += 1;
            scan.peak_buffered_rows = scan.peak_buffered_rows.max(pending.len());

            let ready = match artifacts.get(position + 1) {
                Some(next) => {
                    let still_open = pending.split_off(&next.first_row);
                    std::mem::replace(&mut pending, still_open)
                }
                None => std::mem::take(&mut pending),
            };
            debug!(
                "Chunk {}: {} rows finalized, {} still buffered",
                artifact.index,
                ready.len(),
                pending.len()
            );
            scan.summaries.extend(self.summarize_group(ready));
        }

        info!(
            "Summarized {} rows from {} records ({} missing)",
            scan.summaries.len(),
            scan.records_scanned,
            scan.missing_values
        );
        Ok(scan)
    }

    fn summarize_group(&self, ready: BTreeMap<RowId, Vec<f64>>) -> Vec<SummaryRecord> {
        let ready: Vec<(RowId, Vec<f64>)> = ready.into_iter().collect();
        let options = self.options;
        ready
            .into_par_iter()
            .map(|(row_id, mut values)| summarize_draws(row_id, &mut values, &options))
            .collect()
    }

    fn accumulate(
        &self,
        df: &DataFrame,
        artifact: &ChunkArtifact,
        model_id: &str,
        pending: &mut BTreeMap<RowId, Vec<f64>>,
        scan: &mut StoreScan,
    ) -> Result<(), AggregationError> {
        let frame_error = |source: PolarsError| AggregationError::Frame {
            path: artifact.path.clone(),
            source,
        };
        let row_ids = df
            .column(ROW_ID_COLUMN)
            .and_then(|c| c.cast(&DataType::UInt64))
            .map_err(frame_error)?;
        let row_ids = row_ids.u64().map_err(frame_error)?;
        let draw_ids = df
            .column(DRAW_ID_COLUMN)
            .and_then(|c| c.cast(&DataType::UInt32))
            .map_err(frame_error)?;
        let draw_ids = draw_ids.u32().map_err(frame_error)?;
        let model_ids = df.column(MODEL_ID_COLUMN).map_err(frame_error)?;
        let model_ids = model_ids.str().map_err(frame_error)?;
        let values = df
            .column(VALUE_COLUMN)
            .and_then(|c| c.cast(&DataType::Float64))
            .map_err(frame_error)?;
        let values = values.f64().map_err(frame_error)?;

        let null_key = |column: &'static str| AggregationError::NullKey {
            path: artifact.path.clone(),
            column,
        };
        let columns = row_ids
            .into_iter()
            .zip(draw_ids)
            .zip(model_ids)
            .zip(values);
        for (((row_id, draw_id), record_model), value) in columns {
            let record = DrawRecord {
                row_id: RowId(row_id.ok_or_else(|| null_key(ROW_ID_COLUMN))?),
                draw_id: DrawId(draw_id.ok_or_else(|| null_key(DRAW_ID_COLUMN))?),
                model_id: record_model.ok_or_else(|| null_key(MODEL_ID_COLUMN))?,
                value,
            };
            if record.model_id != model_id {
                return Err(AggregationError::ForeignModel {
                    path: artifact.path.clone(),
                    expected: model_id.to_string(),
                    found: record.model_id.to_string(),
                });
            }
            if !artifact.contains(record.row_id) {
                return Err(AggregationError::RowOutsideChunk {
                    path: artifact.path.clone(),
                    row_id: record.row_id,
                    first: artifact.first_row,
                    last: artifact.last_row,
                });
            }

            scan.records_scanned += 1;
            let draws = pending.entry(record.row_id).or_default();
            match record.value {
                Some(v) if v.is_finite() => draws.push(v),
                _ => scan.missing_values += 1,
            }
        }
        Ok(())
    }
}
