//! # Design Matrix Loading and Validation
//!
//! The design matrix is produced by the external feature-engineering pipeline. This
//! module reads it from TSV or Parquet, validates it against the schema the core
//! relies on, and turns it into `DesignRow`s with dense row identifiers.
//!
//! - Required columns: `x`, `y`, `date` (`YYYY-MM-DD`).
//! - Optional temporal columns: `day_of_year`, `doy_sin`, `doy_cos`. Missing ones
//!   are derived from `date`.
//! - Every other column is an auxiliary covariate, kept in file order. Covariates
//!   may contain nulls; they become NaN and the model decides what to do with them.
//! - `row_id` is reserved. Identifiers are assigned here, never read from input.

use crate::indexer::{Chunk, RowIndexer};
use crate::types::{DesignRow, RowId};
use chrono::{Datelike, NaiveDate};
use log::info;
use polars::prelude::*;
use std::f64::consts::PI;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

pub const ROW_ID_COLUMN: &str = "row_id";
pub const X_COLUMN: &str = "x";
pub const Y_COLUMN: &str = "y";
pub const DATE_COLUMN: &str = "date";
pub const DAY_OF_YEAR_COLUMN: &str = "day_of_year";
pub const DOY_SIN_COLUMN: &str = "doy_sin";
pub const DOY_COS_COLUMN: &str = "doy_cos";

const DATE_FORMAT: &str = "%Y-%m-%d";
const MEAN_TROPICAL_YEAR_DAYS: f64 = 365.25;

/// A comprehensive error type for design matrix loading and validation failures.
#[derive(Error, Debug)]
pub enum DesignError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the design matrix. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing or null values were found in the required column '{0}'.")]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in the required column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("Row {row}: '{value}' is not a valid date (expected YYYY-MM-DD).")]
    InvalidDate { row: usize, value: String },
    #[error("Row {row}: day_of_year {value} is outside 1..=366.")]
    InvalidDayOfYear { row: usize, value: i64 },
    #[error(
        "The column '{0}' is reserved. Row identifiers are assigned by postscan and must not be supplied."
    )]
    ReservedColumn(String),
    #[error("The design matrix contains no rows.")]
    Empty,
    #[error("Row {row} carries {found} covariates, but the matrix declares {expected}.")]
    CovariateArity {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("Row identifiers must be dense and ordered: position {position} holds row_id {found}.")]
    NonDenseRowIds { position: usize, found: u64 },
}

/// An immutable, validated design matrix with dense row identifiers `0..len`.
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    covariate_names: Vec<String>,
    rows: Vec<DesignRow>,
}

impl DesignRow {
    /// Builds a row from its coordinates, date and covariates, deriving the
    /// day-of-year and its harmonic terms from the date.
    pub fn at(row_id: RowId, x: f64, y: f64, date: NaiveDate, covariates: Vec<f64>) -> Self {
        let day_of_year = date.ordinal();
        let (doy_sin, doy_cos) = harmonics(day_of_year);
        Self {
            row_id,
            x,
            y,
            date,
            day_of_year,
            doy_sin,
            doy_cos,
            covariates,
        }
    }

    /// The human-readable calendar label for this row, e.g. "15 June 2021".
    pub fn calendar_label(&self) -> String {
        calendar_label(self.date)
    }

    fn same_inputs(&self, other: &DesignRow) -> bool {
        same_value(self.x, other.x)
            && same_value(self.y, other.y)
            && self.date == other.date
            && self.covariates.len() == other.covariates.len()
            && self
                .covariates
                .iter()
                .zip(&other.covariates)
                .all(|(&a, &b)| same_value(a, b))
    }

    fn describe(&self) -> String {
        format!(
            "row {} (x {}, y {}, date {}, covariates {:?})",
            self.row_id,
            self.x,
            self.y,
            self.date.format(DATE_FORMAT),
            self.covariates
        )
    }
}

fn same_value(a: f64, b: f64) -> bool {
    a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan())
}

/// The annual harmonic terms for a day of the year.
pub fn harmonics(day_of_year: u32) -> (f64, f64) {
    let angle = 2.0 * PI * day_of_year as f64 / MEAN_TROPICAL_YEAR_DAYS;
    (angle.sin(), angle.cos())
}

pub fn calendar_label(date: NaiveDate) -> String {
    date.format("%-d %B %Y").to_string()
}

impl DesignMatrix {
    /// Wraps already-identified rows, checking arity and id density.
    pub fn new(covariate_names: Vec<String>, rows: Vec<DesignRow>) -> Result<Self, DesignError> {
        if rows.is_empty() {
            return Err(DesignError::Empty);
        }
        for (position, row) in rows.iter().enumerate() {
            if row.row_id.0 != position as u64 {
                return Err(DesignError::NonDenseRowIds {
                    position,
                    found: row.row_id.0,
                });
            }
            if row.covariates.len() != covariate_names.len() {
                return Err(DesignError::CovariateArity {
                    row: position,
                    expected: covariate_names.len(),
                    found: row.covariates.len(),
                });
            }
        }
        Ok(Self {
            covariate_names,
            rows,
        })
    }

    /// Builds a matrix from unidentified points, assigning row ids in order.
    pub fn build<I>(covariate_names: Vec<String>, points: I) -> Result<Self, DesignError>
    where
        I: IntoIterator<Item = (f64, f64, NaiveDate, Vec<f64>)>,
    {
        let points: Vec<_> = points.into_iter().collect();
        let rows = RowIndexer::assign(points.len())
            .zip(points)
            .map(|(row_id, (x, y, date, covariates))| DesignRow::at(row_id, x, y, date, covariates))
            .collect();
        Self::new(covariate_names, rows)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn covariate_names(&self) -> &[String] {
        &self.covariate_names
    }

    pub fn rows(&self) -> &[DesignRow] {
        &self.rows
    }

    /// The first input that differs between `self` and `other`, described once
    /// for each side. Derived harmonics are not compared; they follow from the date.
    /// Missing covariate values compare equal to each other.
    pub fn first_difference(&self, other: &DesignMatrix) -> Option<(String, String)> {
        if self.covariate_names != other.covariate_names {
            return Some((
                format!("covariates [{}]", self.covariate_names.join(", ")),
                format!("covariates [{}]", other.covariate_names.join(", ")),
            ));
        }
        if self.len() != other.len() {
            return Some((format!("{} rows", self.len()), format!("{} rows", other.len())));
        }
        self.rows
            .iter()
            .zip(&other.rows)
            .find(|(a, b)| !a.same_inputs(b))
            .map(|(a, b)| (a.describe(), b.describe()))
    }

    /// The rows covered by one chunk of a plan built for this matrix.
    pub fn chunk_rows(&self, chunk: &Chunk) -> &[DesignRow] {
        &self.rows[chunk.rows.start as usize..chunk.rows.end as usize]
    }

    /// The persisted, `row_id`-keyed columnar form of the matrix.
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let rows = &self.rows;
        let mut columns: Vec<Column> = vec![
            Series::new(
                ROW_ID_COLUMN.into(),
                rows.iter().map(|r| r.row_id.0).collect::<Vec<u64>>(),
            )
            .into(),
            Series::new(X_COLUMN.into(), rows.iter().map(|r| r.x).collect::<Vec<f64>>()).into(),
            Series::new(Y_COLUMN.into(), rows.iter().map(|r| r.y).collect::<Vec<f64>>()).into(),
            Series::new(
                DATE_COLUMN.into(),
                rows.iter()
                    .map(|r| r.date.format(DATE_FORMAT).to_string())
                    .collect::<Vec<String>>(),
            )
            .into(),
            Series::new(
                DAY_OF_YEAR_COLUMN.into(),
                rows.iter().map(|r| r.day_of_year).collect::<Vec<u32>>(),
            )
            .into(),
            Series::new(
                DOY_SIN_COLUMN.into(),
                rows.iter().map(|r| r.doy_sin).collect::<Vec<f64>>(),
            )
            .into(),
            Series::new(
                DOY_COS_COLUMN.into(),
                rows.iter().map(|r| r.doy_cos).collect::<Vec<f64>>(),
            )
            .into(),
        ];
        for (idx, name) in self.covariate_names.iter().enumerate() {
            let values: Vec<f64> = rows.iter().map(|r| r.covariates[idx]).collect();
            columns.push(Series::new(name.as_str().into(), values).into());
        }
        DataFrame::new(columns)
    }

    /// Rebuilds a matrix from its persisted form. Row ids are read, not assigned,
    /// and must still be dense.
    pub fn from_dataframe(df: &DataFrame) -> Result<Self, DesignError> {
        let row_ids = internal::extract_row_ids(df)?;
        let mut loaded = internal::rows_from_frame(df, true)?;
        for (position, (row, row_id)) in loaded.rows.iter_mut().zip(row_ids).enumerate() {
            if row_id != position as u64 {
                return Err(DesignError::NonDenseRowIds {
                    position,
                    found: row_id,
                });
            }
            row.row_id = RowId(row_id);
        }
        Self::new(loaded.covariate_names, loaded.rows)
    }
}

/// Loads and validates a design matrix from a TSV or Parquet file.
pub fn load_design_matrix(path: &Path) -> Result<DesignMatrix, DesignError> {
    info!("Loading design matrix from '{}'", path.display());
    let df = internal::read_tabular(path)?;
    if df
        .get_column_names()
        .iter()
        .any(|name| name.as_str() == ROW_ID_COLUMN)
    {
        return Err(DesignError::ReservedColumn(ROW_ID_COLUMN.to_string()));
    }
    let loaded = internal::rows_from_frame(&df, false)?;
    let matrix = DesignMatrix::new(loaded.covariate_names, loaded.rows)?;
    info!(
        "Loaded {} design rows with {} auxiliary covariates",
        matrix.len(),
        matrix.covariate_names().len()
    );
    Ok(matrix)
}

/// Internal module for shared frame decoding logic.
mod internal {
    use super::*;

    pub(super) struct LoadedRows {
        pub covariate_names: Vec<String>,
        pub rows: Vec<DesignRow>,
    }

    const RESERVED: [&str; 7] = [
        ROW_ID_COLUMN,
        X_COLUMN,
        Y_COLUMN,
        DATE_COLUMN,
        DAY_OF_YEAR_COLUMN,
        DOY_SIN_COLUMN,
        DOY_COS_COLUMN,
    ];

    pub(super) fn read_tabular(path: &Path) -> Result<DataFrame, DesignError> {
        let file = File::open(path)?;
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref()
        {
            Some("parquet") | Some("pq") => Ok(ParquetReader::new(file).finish()?),
            _ => Ok(CsvReadOptions::default()
                .with_has_header(true)
                .map_parse_options(|options| options.with_separator(b'\t'))
                .into_reader_with_file_handle(file)
                .finish()?),
        }
    }

    fn has_column(df: &DataFrame, name: &str) -> bool {
        df.get_column_names()
            .iter()
            .any(|column| column.as_str() == name)
    }

    fn column<'a>(df: &'a DataFrame, name: &str) -> Result<&'a Column, DesignError> {
        df.column(name)
            .map_err(|_| DesignError::ColumnNotFound(name.to_string()))
    }

    /// Reads a numeric column as f64. Nulls are rejected unless `nullable`, in which
    /// case they become NaN.
    fn extract_f64(df: &DataFrame, name: &str, nullable: bool) -> Result<Vec<f64>, DesignError> {
        let series = column(df, name)?;
        if !nullable && series.null_count() > 0 {
            return Err(DesignError::MissingValuesFound(name.to_string()));
        }
        let wrong_type = || DesignError::ColumnWrongType {
            column_name: name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        };
        if matches!(series.dtype(), DataType::String) {
            return Err(wrong_type());
        }
        let casted = series.cast(&DataType::Float64).map_err(|_| wrong_type())?;
        if casted.null_count() > series.null_count() {
            return Err(wrong_type());
        }
        let values: Vec<f64> = casted
            .f64()?
            .into_iter()
            .map(|value| value.unwrap_or(f64::NAN))
            .collect();
        if !nullable && values.iter().any(|v| !v.is_finite()) {
            return Err(DesignError::NonFiniteValuesFound(name.to_string()));
        }
        Ok(values)
    }

    fn extract_dates(df: &DataFrame) -> Result<Vec<NaiveDate>, DesignError> {
        let series = column(df, DATE_COLUMN)?;
        if series.null_count() > 0 {
            return Err(DesignError::MissingValuesFound(DATE_COLUMN.to_string()));
        }
        let as_text = series
            .cast(&DataType::String)
            .map_err(|_| DesignError::ColumnWrongType {
                column_name: DATE_COLUMN.to_string(),
                expected_type: "date (YYYY-MM-DD)",
                found_type: format!("{:?}", series.dtype()),
            })?;
        as_text
            .str()?
            .into_iter()
            .enumerate()
            .map(|(row, value)| {
                let text = value.unwrap_or_default();
                NaiveDate::parse_from_str(text.trim(), DATE_FORMAT).map_err(|_| {
                    DesignError::InvalidDate {
                        row,
                        value: text.to_string(),
                    }
                })
            })
            .collect()
    }

    fn extract_day_of_year(df: &DataFrame) -> Result<Option<Vec<u32>>, DesignError> {
        if !has_column(df, DAY_OF_YEAR_COLUMN) {
            return Ok(None);
        }
        let series = column(df, DAY_OF_YEAR_COLUMN)?;
        if series.null_count() > 0 {
            return Err(DesignError::MissingValuesFound(DAY_OF_YEAR_COLUMN.to_string()));
        }
        let casted = series
            .cast(&DataType::Int64)
            .map_err(|_| DesignError::ColumnWrongType {
                column_name: DAY_OF_YEAR_COLUMN.to_string(),
                expected_type: "integer",
                found_type: format!("{:?}", series.dtype()),
            })?;
        let days = casted
            .i64()?
            .into_no_null_iter()
            .enumerate()
            .map(|(row, value)| {
                if (1..=366).contains(&value) {
                    Ok(value as u32)
                } else {
                    Err(DesignError::InvalidDayOfYear { row, value })
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(days))
    }

    pub(super) fn extract_row_ids(df: &DataFrame) -> Result<Vec<u64>, DesignError> {
        let series = column(df, ROW_ID_COLUMN)?;
        if series.null_count() > 0 {
            return Err(DesignError::MissingValuesFound(ROW_ID_COLUMN.to_string()));
        }
        let casted = series
            .cast(&DataType::UInt64)
            .map_err(|_| DesignError::ColumnWrongType {
                column_name: ROW_ID_COLUMN.to_string(),
                expected_type: "u64",
                found_type: format!("{:?}", series.dtype()),
            })?;
        Ok(casted.u64()?.into_no_null_iter().collect())
    }

    /// Decodes every row of a frame. Row ids are assigned by position here; the
    /// caller overwrites them when the frame carries persisted ids.
    pub(super) fn rows_from_frame(
        df: &DataFrame,
        allow_row_id: bool,
    ) -> Result<LoadedRows, DesignError> {
        if df.height() == 0 {
            return Err(DesignError::Empty);
        }
        let xs = extract_f64(df, X_COLUMN, false)?;
        let ys = extract_f64(df, Y_COLUMN, false)?;
        let dates = extract_dates(df)?;
        let days = extract_day_of_year(df)?;
        let sines = if has_column(df, DOY_SIN_COLUMN) {
            Some(extract_f64(df, DOY_SIN_COLUMN, false)?)
        } else {
            None
        };
        let cosines = if has_column(df, DOY_COS_COLUMN) {
            Some(extract_f64(df, DOY_COS_COLUMN, false)?)
        } else {
            None
        };

        let covariate_names: Vec<String> = df
            .get_column_names()
            .iter()
            .map(|name| name.to_string())
            .filter(|name| !RESERVED.contains(&name.as_str()))
            .collect();
        if !allow_row_id && has_column(df, ROW_ID_COLUMN) {
            return Err(DesignError::ReservedColumn(ROW_ID_COLUMN.to_string()));
        }
        let covariate_columns = covariate_names
            .iter()
            .map(|name| extract_f64(df, name, true))
            .collect::<Result<Vec<_>, _>>()?;

        let rows = RowIndexer::assign(df.height())
            .enumerate()
            .map(|(i, row_id)| {
                let covariates = covariate_columns.iter().map(|col| col[i]).collect();
                let mut row = DesignRow::at(row_id, xs[i], ys[i], dates[i], covariates);
                if let Some(days) = &days {
                    row.day_of_year = days[i];
                    let (sin, cos) = harmonics(days[i]);
                    row.doy_sin = sin;
                    row.doy_cos = cos;
                }
                if let Some(sines) = &sines {
                    row.doy_sin = sines[i];
                }
                if let Some(cosines) = &cosines {
                    row.doy_cos = cosines[i];
                }
                row
            })
            .collect();

        Ok(LoadedRows {
            covariate_names,
            rows,
        })
    }
}
