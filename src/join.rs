//! Rejoining summaries onto the design matrix.
//!
//! The join is a cardinality-preserving left join keyed by `row_id`: every design
//! row appears exactly once in the output, with null statistics when the store
//! held no draws for it. A summary that names a row the design does not contain,
//! or two summaries for one row, mean the store is corrupt or belongs to another
//! model; the join refuses rather than dropping or inventing rows.

use crate::design::{
    DATE_COLUMN, DAY_OF_YEAR_COLUMN, DOY_COS_COLUMN, DOY_SIN_COLUMN, DesignMatrix, ROW_ID_COLUMN,
    X_COLUMN, Y_COLUMN,
};
use crate::types::{DesignRow, RowId, SummaryRecord};
use itertools::Itertools;
use log::info;
use polars::prelude::*;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

pub const DATE_LABEL_COLUMN: &str = "date_label";
pub const SUMMARY_COLUMNS: [&str; 10] = [
    "n_draws",
    "mean_log",
    "sd_log",
    "lwr_log",
    "upr_log",
    "mean",
    "sd",
    "lwr",
    "upr",
    "prob_exceed",
];

#[derive(Error, Debug)]
pub enum JoinIntegrityError {
    #[error(
        "A summary references row_id {row_id}, which is not in the design matrix of {design_rows} rows. The store is corrupt or belongs to another model."
    )]
    UnknownRow { row_id: RowId, design_rows: usize },
    #[error("Two summaries reference row_id {0}.")]
    DuplicateSummary(RowId),
}

/// One design row with its (possibly absent) summary.
#[derive(Debug, Clone)]
pub struct JoinedRow {
    pub design: DesignRow,
    pub date_label: String,
    pub summary: Option<SummaryRecord>,
}

/// The final output: one entry per design row, ordered by row id.
#[derive(Debug, Clone)]
pub struct SummaryTable {
    covariate_names: Vec<String>,
    rows: Vec<JoinedRow>,
}

/// Left-joins `summaries` onto `design` by row id.
pub fn join_summaries(
    design: &DesignMatrix,
    summaries: Vec<SummaryRecord>,
) -> Result<SummaryTable, JoinIntegrityError> {
    // Row ids are dense, so the row id is the slot index.
    let mut slots: Vec<Option<SummaryRecord>> = vec![None; design.len()];
    for summary in summaries {
        let slot = usize::try_from(summary.row_id.0)
            .ok()
            .and_then(|idx| slots.get_mut(idx))
            .ok_or(JoinIntegrityError::UnknownRow {
                row_id: summary.row_id,
                design_rows: design.len(),
            })?;
        if slot.is_some() {
            return Err(JoinIntegrityError::DuplicateSummary(summary.row_id));
        }
        *slot = Some(summary);
    }

    let rows: Vec<JoinedRow> = design
        .rows()
        .iter()
        .zip(slots)
        .map(|(row, summary)| JoinedRow {
            date_label: row.calendar_label(),
            design: row.clone(),
            summary,
        })
        .collect();

    let unmatched = rows.iter().filter(|row| row.summary.is_none()).count();
    info!(
        "Joined {} summaries onto {} design rows ({} without draws)",
        rows.len() - unmatched,
        rows.len(),
        unmatched
    );
    Ok(SummaryTable {
        covariate_names: design.covariate_names().to_vec(),
        rows,
    })
}

fn format_optional(value: Option<f64>) -> String {
    value.map_or_else(|| "NA".to_string(), |v| v.to_string())
}

impl SummaryTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[JoinedRow] {
        &self.rows
    }

    pub fn covariate_names(&self) -> &[String] {
        &self.covariate_names
    }

    pub fn get(&self, row_id: RowId) -> Option<&JoinedRow> {
        self.rows.get(usize::try_from(row_id.0).ok()?)
    }

    /// The summaries present in the table, in row order.
    pub fn summaries(&self) -> impl Iterator<Item = &SummaryRecord> {
        self.rows.iter().filter_map(|row| row.summary.as_ref())
    }

    fn header(&self) -> Vec<&str> {
        let mut header = vec![
            ROW_ID_COLUMN,
            X_COLUMN,
            Y_COLUMN,
            DATE_COLUMN,
            DATE_LABEL_COLUMN,
            DAY_OF_YEAR_COLUMN,
            DOY_SIN_COLUMN,
            DOY_COS_COLUMN,
        ];
        header.extend(self.covariate_names.iter().map(String::as_str));
        header.extend(SUMMARY_COLUMNS);
        header
    }

    /// Writes the table as TSV with `NA` for nulls. The file appears only once complete.
    pub fn write_tsv(&self, path: &Path) -> io::Result<()> {
        let temp_path = path.with_extension("tsv.partial");
        let write_result = (|| -> io::Result<()> {
            let mut writer = BufWriter::new(File::create(&temp_path)?);
            writeln!(writer, "{}", self.header().iter().join("\t"))?;
            for row in &self.rows {
                let design = &row.design;
                let summary = row.summary.as_ref();
                let stat = |f: fn(&SummaryRecord) -> Option<f64>| format_optional(summary.and_then(f));
                let fields = [
                    design.row_id.to_string(),
                    design.x.to_string(),
                    design.y.to_string(),
                    design.date.format("%Y-%m-%d").to_string(),
                    row.date_label.clone(),
                    design.day_of_year.to_string(),
                    design.doy_sin.to_string(),
                    design.doy_cos.to_string(),
                ]
                .into_iter()
                .chain(design.covariates.iter().map(|&v| {
                    if v.is_nan() { "NA".to_string() } else { v.to_string() }
                }))
                .chain([
                    summary.map_or_else(|| "0".to_string(), |s| s.n_draws.to_string()),
                    stat(|s| s.mean_log),
                    stat(|s| s.sd_log),
                    stat(|s| s.lwr_log),
                    stat(|s| s.upr_log),
                    stat(|s| s.mean),
                    stat(|s| s.sd),
                    stat(|s| s.lwr),
                    stat(|s| s.upr),
                    stat(|s| s.prob_exceed),
                ]);
                writeln!(writer, "{}", fields.format("\t"))?;
            }
            writer.flush()?;
            let file = writer.into_inner().map_err(io::Error::other)?;
            file.sync_all()
        })();

        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }
        fs::rename(&temp_path, path).inspect_err(|_| {
            let _ = fs::remove_file(&temp_path);
        })
    }

    /// The table as a frame, for Parquet output and downstream tooling.
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let rows = &self.rows;
        let design_f64 = |name: &str, f: fn(&DesignRow) -> f64| -> Column {
            Series::new(name.into(), rows.iter().map(|r| f(&r.design)).collect::<Vec<f64>>())
                .into()
        };
        let summary_f64 = |name: &str, f: fn(&SummaryRecord) -> Option<f64>| -> Column {
            Series::new(
                name.into(),
                rows.iter()
                    .map(|r| r.summary.as_ref().and_then(f))
                    .collect::<Vec<Option<f64>>>(),
            )
            .into()
        };

        let mut columns: Vec<Column> = vec![
            Series::new(
                ROW_ID_COLUMN.into(),
                rows.iter().map(|r| r.design.row_id.0).collect::<Vec<u64>>(),
            )
            .into(),
            design_f64(X_COLUMN, |d| d.x),
            design_f64(Y_COLUMN, |d| d.y),
            Series::new(
                DATE_COLUMN.into(),
                rows.iter()
                    .map(|r| r.design.date.format("%Y-%m-%d").to_string())
                    .collect::<Vec<String>>(),
            )
            .into(),
            Series::new(
                DATE_LABEL_COLUMN.into(),
                rows.iter().map(|r| r.date_label.as_str()).collect::<Vec<&str>>(),
            )
            .into(),
            Series::new(
                DAY_OF_YEAR_COLUMN.into(),
                rows.iter().map(|r| r.design.day_of_year).collect::<Vec<u32>>(),
            )
            .into(),
            design_f64(DOY_SIN_COLUMN, |d| d.doy_sin),
            design_f64(DOY_COS_COLUMN, |d| d.doy_cos),
        ];
        for (idx, name) in self.covariate_names.iter().enumerate() {
            let values: Vec<f64> = rows.iter().map(|r| r.design.covariates[idx]).collect();
            columns.push(Series::new(name.as_str().into(), values).into());
        }
        columns.push(
            Series::new(
                "n_draws".into(),
                rows.iter()
                    .map(|r| r.summary.as_ref().map_or(0, |s| s.n_draws as u64))
                    .collect::<Vec<u64>>(),
            )
            .into(),
        );
        columns.extend([
            summary_f64("mean_log", |s| s.mean_log),
            summary_f64("sd_log", |s| s.sd_log),
            summary_f64("lwr_log", |s| s.lwr_log),
            summary_f64("upr_log", |s| s.upr_log),
            summary_f64("mean", |s| s.mean),
            summary_f64("sd", |s| s.sd),
            summary_f64("lwr", |s| s.lwr),
            summary_f64("upr", |s| s.upr),
            summary_f64("prob_exceed", |s| s.prob_exceed),
        ]);
        DataFrame::new(columns)
    }

    pub fn write_parquet(&self, path: &Path) -> PolarsResult<()> {
        let mut df = self.to_dataframe()?;
        let temp_path = path.with_extension("parquet.partial");
        let write_result = (|| -> PolarsResult<()> {
            let mut file = File::create(&temp_path)?;
            ParquetWriter::new(&mut file).finish(&mut df)?;
            file.sync_all()?;
            Ok(())
        })();

        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }
        fs::rename(&temp_path, path).map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            PolarsError::from(err)
        })
    }
}
