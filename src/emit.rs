//! Draw emission: one model call per chunk, reshaped into long form.
//!
//! A `DrawBatch` holds the long-form records of one chunk as parallel columns,
//! ordered draw-major (all rows of draw 0, then all rows of draw 1, ...). It lives
//! only until the sink has published it.

use crate::indexer::Chunk;
use crate::predictor::{ModelEvaluationError, PosteriorPredictor, RowBatch};
use crate::types::{DesignRow, RowId};
use ndarray::Array2;
use polars::prelude::*;

pub const DRAW_ID_COLUMN: &str = "draw_id";
pub const VALUE_COLUMN: &str = "value";
pub const MODEL_ID_COLUMN: &str = "model_id";

/// The long-form records of one chunk, column by column.
#[derive(Debug, Clone)]
pub struct DrawBatch {
    pub model_id: String,
    pub draw_ids: Vec<u32>,
    pub row_ids: Vec<u64>,
    pub values: Vec<Option<f64>>,
}

impl DrawBatch {
    /// Reshapes a `[draws, rows]` matrix whose column `j` belongs to row `first_row + j`.
    /// Non-finite entries become missing values.
    pub fn from_matrix(model_id: &str, first_row: RowId, draws: &Array2<f64>) -> Self {
        let (draw_count, row_count) = draws.dim();
        let len = draw_count * row_count;
        let mut batch = Self {
            model_id: model_id.to_string(),
            draw_ids: Vec::with_capacity(len),
            row_ids: Vec::with_capacity(len),
            values: Vec::with_capacity(len),
        };
        for (draw, draw_row) in draws.outer_iter().enumerate() {
            for (local, &value) in draw_row.iter().enumerate() {
                batch.draw_ids.push(draw as u32);
                batch.row_ids.push(first_row.0 + local as u64);
                batch.values.push(value.is_finite().then_some(value));
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of records whose value is missing.
    pub fn missing_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_none()).count()
    }

    /// The frame written to a chunk file: `draw_id`, `row_id`, `value`, `model_id`.
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let model_ids = vec![self.model_id.as_str(); self.len()];
        DataFrame::new(vec![
            Series::new(DRAW_ID_COLUMN.into(), self.draw_ids.as_slice()).into(),
            Series::new(crate::design::ROW_ID_COLUMN.into(), self.row_ids.as_slice()).into(),
            Series::new(VALUE_COLUMN.into(), self.values.as_slice()).into(),
            Series::new(MODEL_ID_COLUMN.into(), model_ids).into(),
        ])
    }
}

/// Invokes the model for one chunk at a time.
pub struct DrawEmitter<'a, P: PosteriorPredictor + ?Sized> {
    predictor: &'a P,
    model_id: &'a str,
    covariate_names: &'a [String],
    draw_count: usize,
}

impl<'a, P: PosteriorPredictor + ?Sized> DrawEmitter<'a, P> {
    pub fn new(
        predictor: &'a P,
        model_id: &'a str,
        covariate_names: &'a [String],
        draw_count: usize,
    ) -> Self {
        Self {
            predictor,
            model_id,
            covariate_names,
            draw_count,
        }
    }

    /// Emits the long-form draws for one chunk. `rows` must be the chunk's rows.
    pub fn emit(&self, chunk: &Chunk, rows: &[DesignRow]) -> Result<DrawBatch, ModelEvaluationError> {
        debug_assert_eq!(rows.len(), chunk.len());
        let batch = RowBatch {
            covariate_names: self.covariate_names,
            rows,
        };
        let draws = self.predictor.predict_draws(batch, self.draw_count)?;
        let (found_draws, found_rows) = draws.dim();
        if found_draws != self.draw_count || found_rows != rows.len() {
            return Err(ModelEvaluationError::ShapeMismatch {
                expected_draws: self.draw_count,
                expected_rows: rows.len(),
                found_draws,
                found_rows,
            });
        }
        Ok(DrawBatch::from_matrix(self.model_id, chunk.first_row(), &draws))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkIndex;
    use chrono::NaiveDate;
    use ndarray::array;

    struct FixedMatrix(Array2<f64>);

    impl PosteriorPredictor for FixedMatrix {
        fn predict_draws(
            &self,
            _batch: RowBatch<'_>,
            _draw_count: usize,
        ) -> Result<Array2<f64>, ModelEvaluationError> {
            Ok(self.0.clone())
        }
    }

    fn chunk_rows(chunk: &Chunk) -> Vec<DesignRow> {
        let date = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap();
        chunk
            .rows
            .clone()
            .map(|id| DesignRow::at(RowId(id), 0.0, 0.0, date, vec![]))
            .collect()
    }

    #[test]
    fn reshapes_draw_major_with_global_row_ids() {
        let chunk = Chunk {
            index: ChunkIndex(1),
            rows: 2..4,
        };
        let predictor = FixedMatrix(array![[2.0, 3.0], [3.0, f64::NAN], [4.0, 5.0]]);
        let emitter = DrawEmitter::new(&predictor, "m1", &[], 3);

        let batch = emitter.emit(&chunk, &chunk_rows(&chunk)).unwrap();
        assert_eq!(batch.len(), 6);
        assert_eq!(batch.row_ids, vec![2, 3, 2, 3, 2, 3]);
        assert_eq!(batch.draw_ids, vec![0, 0, 1, 1, 2, 2]);
        assert_eq!(batch.values[3], None);
        assert_eq!(batch.missing_count(), 1);
        assert_eq!(batch.values[4], Some(4.0));
        assert_eq!(batch.model_id, "m1");
    }

    #[test]
    fn wrong_shape_is_a_model_evaluation_error() {
        let chunk = Chunk {
            index: ChunkIndex(0),
            rows: 0..2,
        };
        let predictor = FixedMatrix(array![[1.0, 2.0]]);
        let emitter = DrawEmitter::new(&predictor, "m1", &[], 3);
        let err = emitter.emit(&chunk, &chunk_rows(&chunk)).unwrap_err();
        assert!(matches!(
            err,
            ModelEvaluationError::ShapeMismatch {
                expected_draws: 3,
                found_draws: 1,
                ..
            }
        ));
    }

    #[test]
    fn frame_has_the_store_schema() {
        let batch = DrawBatch::from_matrix("m1", RowId(10), &array![[0.5], [f64::INFINITY]]);
        let df = batch.to_dataframe().unwrap();
        assert_eq!(df.height(), 2);
        let names: Vec<String> = df.get_column_names().iter().map(|n| n.to_string()).collect();
        assert_eq!(names, vec!["draw_id", "row_id", "value", "model_id"]);
        assert_eq!(df.column("value").unwrap().null_count(), 1);
    }
}
