// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use chrono::NaiveDate;
use std::fmt;

/// The globally unique identifier of one design-matrix row.
/// Assigned once at matrix construction, in file order, and never reused or reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RowId(pub u64);

/// The index of a posterior draw within one emitted draw matrix (`0..draw_count`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct DrawId(pub u32);

/// The position of a chunk in the chunk plan. Also the identity of its on-disk artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ChunkIndex(pub usize);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ChunkIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One prediction unit: a spatial cell at one calendar date, with its covariates.
///
/// The auxiliary covariates are stored positionally; their names live once on the
/// owning `DesignMatrix`. A covariate the feature pipeline could not compute is NaN.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignRow {
    pub row_id: RowId,
    pub x: f64,
    pub y: f64,
    pub date: NaiveDate,
    pub day_of_year: u32,
    pub doy_sin: f64,
    pub doy_cos: f64,
    pub covariates: Vec<f64>,
}

/// One posterior draw of the modeled quantity for one row under one model.
/// `value` is `None` when the model could not evaluate the row for this draw.
/// Decoded from a chunk file, borrowing the file's `model_id` column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawRecord<'a> {
    pub row_id: RowId,
    pub draw_id: DrawId,
    pub model_id: &'a str,
    pub value: Option<f64>,
}

/// The aggregate of all draws sharing a `row_id` under one model.
///
/// Fields suffixed `_log` are on the model's native scale; the unsuffixed fields are
/// on the back-transformed scale. Every statistic is `None` when no draw contributed.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRecord {
    pub row_id: RowId,
    /// Number of non-missing draws that contributed to the statistics.
    pub n_draws: usize,
    pub mean_log: Option<f64>,
    pub sd_log: Option<f64>,
    pub lwr_log: Option<f64>,
    pub upr_log: Option<f64>,
    pub mean: Option<f64>,
    pub sd: Option<f64>,
    pub lwr: Option<f64>,
    pub upr: Option<f64>,
    pub prob_exceed: Option<f64>,
}

impl SummaryRecord {
    /// A summary for a row whose draws were all missing.
    pub fn empty(row_id: RowId) -> Self {
        Self {
            row_id,
            n_draws: 0,
            mean_log: None,
            sd_log: None,
            lwr_log: None,
            upr_log: None,
            mean: None,
            sd: None,
            lwr: None,
            upr: None,
            prob_exceed: None,
        }
    }
}
