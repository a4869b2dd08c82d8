use std::fs;

use approx::assert_abs_diff_eq;
use chrono::NaiveDate;
use ndarray::Array2;
use tempfile::tempdir;

use postscan::aggregate::AggregationError;
use postscan::config::{ConfigurationError, PipelineConfig, ScaleTransform};
use postscan::design::DesignMatrix;
use postscan::pipeline::{self, PipelineError};
use postscan::predictor::{LinearPosterior, ModelEvaluationError, PosteriorPredictor, RowBatch};
use postscan::progress::{ChunkProgressObserver, NoopProgress, PipelineStage};
use postscan::store::DrawStore;
use postscan::types::{RowId, SummaryRecord};

/// Draw `d` of row `r` is `r + d * scale`.
struct RowPlusDraw {
    scale: f64,
}

impl PosteriorPredictor for RowPlusDraw {
    fn predict_draws(
        &self,
        batch: RowBatch<'_>,
        draw_count: usize,
    ) -> Result<Array2<f64>, ModelEvaluationError> {
        Ok(Array2::from_shape_fn((draw_count, batch.len()), |(d, j)| {
            batch.rows[j].row_id.0 as f64 + d as f64 * self.scale
        }))
    }
}

struct Constant(f64);

impl PosteriorPredictor for Constant {
    fn predict_draws(
        &self,
        batch: RowBatch<'_>,
        draw_count: usize,
    ) -> Result<Array2<f64>, ModelEvaluationError> {
        Ok(Array2::from_elem((draw_count, batch.len()), self.0))
    }
}

/// Odd rows cannot be evaluated by any draw.
struct OddRowsMissing;

impl PosteriorPredictor for OddRowsMissing {
    fn predict_draws(
        &self,
        batch: RowBatch<'_>,
        draw_count: usize,
    ) -> Result<Array2<f64>, ModelEvaluationError> {
        Ok(Array2::from_shape_fn((draw_count, batch.len()), |(d, j)| {
            let row = batch.rows[j].row_id.0;
            if row % 2 == 1 { f64::NAN } else { d as f64 }
        }))
    }
}

/// Fails for any batch that reaches `fail_from`.
struct FailsFrom {
    fail_from: u64,
}

impl PosteriorPredictor for FailsFrom {
    fn predict_draws(
        &self,
        batch: RowBatch<'_>,
        draw_count: usize,
    ) -> Result<Array2<f64>, ModelEvaluationError> {
        if batch.rows.iter().any(|row| row.row_id.0 >= self.fail_from) {
            return Err(ModelEvaluationError::Evaluation("simulated crash".into()));
        }
        RowPlusDraw { scale: 1.0 }.predict_draws(batch, draw_count)
    }
}

#[derive(Default)]
struct CountingObserver {
    emitted: usize,
    finished: Vec<PipelineStage>,
}

impl ChunkProgressObserver for CountingObserver {
    fn on_chunk_done(&mut self, stage: PipelineStage, completed_chunks: usize) {
        if stage == PipelineStage::Emission {
            self.emitted = completed_chunks;
        }
    }

    fn on_stage_finish(&mut self, stage: PipelineStage) {
        self.finished.push(stage);
    }
}

fn design(n: usize) -> DesignMatrix {
    let start = NaiveDate::from_ymd_opt(2020, 12, 30).unwrap();
    DesignMatrix::build(
        vec!["elevation".into()],
        (0..n).map(|i| {
            (
                i as f64 * 0.5,
                -(i as f64),
                start + chrono::Days::new(i as u64),
                vec![100.0 + i as f64],
            )
        }),
    )
    .unwrap()
}

fn config(dir: &std::path::Path, model_id: &str, chunk_size: usize, draws: usize) -> PipelineConfig {
    let mut config = PipelineConfig::new(model_id, dir, 0.5);
    config.chunk_size = chunk_size;
    config.draw_count = draws;
    config
}

fn summaries(outcome: &pipeline::PipelineOutcome) -> Vec<SummaryRecord> {
    outcome.table.summaries().cloned().collect()
}

#[test]
fn hand_computed_end_to_end_scenario() {
    let dir = tempdir().unwrap();
    let mut config = config(dir.path(), "scenario", 2, 3);
    config.transform = ScaleTransform::Identity;
    config.threshold = 2.5;

    let outcome = pipeline::run(
        &config,
        &design(4),
        &RowPlusDraw { scale: 1.0 },
        &mut NoopProgress,
    )
    .unwrap();
    assert_eq!(outcome.num_chunks, 2);
    assert_eq!(outcome.records_written, 12);
    assert_eq!(outcome.records_scanned, 12);
    assert_eq!(outcome.table.len(), 4);

    for row in 0..4u64 {
        let summary = outcome.table.get(RowId(row)).unwrap().summary.clone().unwrap();
        let r = row as f64;
        assert_eq!(summary.n_draws, 3);
        assert_abs_diff_eq!(summary.mean_log.unwrap(), r + 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.sd_log.unwrap(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.lwr_log.unwrap(), r + 0.05, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.upr_log.unwrap(), r + 1.95, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.mean.unwrap(), r + 1.0, epsilon = 1e-12);
    }
    // Row 1 draws {1, 2, 3}: one of three exceeds 2.5.
    let row1 = outcome.table.get(RowId(1)).unwrap().summary.clone().unwrap();
    assert_abs_diff_eq!(row1.prob_exceed.unwrap(), 1.0 / 3.0, epsilon = 1e-12);
}

#[test]
fn constant_model_collapses_every_statistic() {
    let dir = tempdir().unwrap();
    let config = config(dir.path(), "constant", 3, 20);
    let outcome = pipeline::run(&config, &design(7), &Constant(0.2), &mut NoopProgress).unwrap();

    let value = 0.2_f64.exp();
    for summary in outcome.table.summaries() {
        assert_abs_diff_eq!(summary.mean_log.unwrap(), 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.sd_log.unwrap(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.mean.unwrap(), value, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.sd.unwrap(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.lwr.unwrap(), value, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.upr.unwrap(), value, epsilon = 1e-12);
    }
}

#[test]
fn summaries_do_not_depend_on_chunk_size() {
    let dir = tempdir().unwrap();
    let design = design(11);
    let predictor = RowPlusDraw { scale: 0.001 };

    let one = pipeline::run(&config(dir.path(), "c1", 1, 8), &design, &predictor, &mut NoopProgress)
        .unwrap();
    let all = pipeline::run(&config(dir.path(), "cn", 11, 8), &design, &predictor, &mut NoopProgress)
        .unwrap();
    let odd = pipeline::run(&config(dir.path(), "c4", 4, 8), &design, &predictor, &mut NoopProgress)
        .unwrap();

    assert_eq!(one.num_chunks, 11);
    assert_eq!(all.num_chunks, 1);
    assert_eq!(summaries(&one), summaries(&all));
    assert_eq!(summaries(&odd), summaries(&all));
}

#[test]
fn exceedance_is_a_probability() {
    let dir = tempdir().unwrap();
    let design = design(5);

    let mut below = config(dir.path(), "below", 2, 10);
    below.threshold = 10.0;
    let outcome = pipeline::run(&below, &design, &Constant(1.0), &mut NoopProgress).unwrap();
    assert!(outcome.table.summaries().all(|s| s.prob_exceed == Some(0.0)));

    let mut above = config(dir.path(), "above", 2, 10);
    above.threshold = 1.0;
    let outcome = pipeline::run(&above, &design, &Constant(1.0), &mut NoopProgress).unwrap();
    assert!(outcome.table.summaries().all(|s| s.prob_exceed == Some(1.0)));

    let mut mixed = config(dir.path(), "mixed", 2, 10);
    mixed.transform = ScaleTransform::Identity;
    mixed.threshold = 2.0;
    let outcome = pipeline::run(&mixed, &design, &RowPlusDraw { scale: 0.5 }, &mut NoopProgress)
        .unwrap();
    assert!(outcome.table.summaries().all(|s| {
        let p = s.prob_exceed.unwrap();
        (0.0..=1.0).contains(&p)
    }));
}

#[test]
fn rows_without_draws_survive_the_join() {
    let dir = tempdir().unwrap();
    let config = config(dir.path(), "gaps", 3, 4);
    let outcome = pipeline::run(&config, &design(6), &OddRowsMissing, &mut NoopProgress).unwrap();

    assert_eq!(outcome.table.len(), 6);
    assert_eq!(outcome.missing_values, 12);
    for (position, row) in outcome.table.rows().iter().enumerate() {
        assert_eq!(row.design.row_id, RowId(position as u64));
        let summary = row.summary.as_ref().unwrap();
        if position % 2 == 1 {
            assert_eq!(summary.n_draws, 0);
            assert!(summary.mean.is_none());
            assert!(summary.prob_exceed.is_none());
        } else {
            assert_eq!(summary.n_draws, 4);
            assert!(summary.mean.is_some());
        }
    }
}

#[test]
fn resumed_run_matches_an_uninterrupted_one() {
    let dir = tempdir().unwrap();
    let design = design(8);
    let reference = pipeline::run(
        &config(dir.path(), "reference", 2, 5),
        &design,
        &RowPlusDraw { scale: 1.0 },
        &mut NoopProgress,
    )
    .unwrap();

    let mut crashing = config(dir.path(), "crashy", 2, 5);
    let err = pipeline::run(&crashing, &design, &FailsFrom { fail_from: 4 }, &mut NoopProgress)
        .unwrap_err();
    assert!(matches!(err, PipelineError::ModelEvaluation(_)));

    let store = DrawStore::open_existing(dir.path(), "crashy").unwrap();
    assert_eq!(store.published_chunks().unwrap().len(), 2);
    fs::write(store.partial_path(postscan::types::ChunkIndex(2)), b"torn write").unwrap();

    crashing.resume = true;
    let mut observer = CountingObserver::default();
    let resumed = pipeline::run(&crashing, &design, &RowPlusDraw { scale: 1.0 }, &mut observer)
        .unwrap();
    assert_eq!(resumed.chunks_skipped, 2);
    assert_eq!(resumed.chunks_written, 2);
    assert_eq!(observer.emitted, 4);
    assert_eq!(
        observer.finished,
        vec![
            PipelineStage::Emission,
            PipelineStage::Aggregation,
            PipelineStage::Join
        ]
    );
    assert_eq!(summaries(&resumed), summaries(&reference));
    assert!(!store.partial_path(postscan::types::ChunkIndex(2)).exists());

    crashing.resume = false;
    let fresh = pipeline::run(&crashing, &design, &RowPlusDraw { scale: 1.0 }, &mut NoopProgress)
        .unwrap();
    assert_eq!(fresh.chunks_written, 4);
    assert_eq!(summaries(&fresh), summaries(&reference));
}

#[test]
fn resume_refuses_a_different_plan() {
    let dir = tempdir().unwrap();
    let design = design(6);
    pipeline::run(
        &config(dir.path(), "m", 2, 3),
        &design,
        &Constant(0.0),
        &mut NoopProgress,
    )
    .unwrap();

    let mut changed = config(dir.path(), "m", 3, 3);
    changed.resume = true;
    let err = pipeline::run(&changed, &design, &Constant(0.0), &mut NoopProgress).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Configuration(ConfigurationError::ResumeMismatch {
            field: "chunk_size",
            ..
        })
    ));
}

#[test]
fn foreign_records_are_rejected_by_aggregation() {
    let dir = tempdir().unwrap();
    let design = design(4);
    let ours = config(dir.path(), "ours", 2, 3);
    let theirs = config(dir.path(), "theirs", 2, 3);
    pipeline::run(&ours, &design, &Constant(0.0), &mut NoopProgress).unwrap();
    pipeline::run(&theirs, &design, &Constant(1.0), &mut NoopProgress).unwrap();

    let our_store = DrawStore::open_existing(dir.path(), "ours").unwrap();
    let their_store = DrawStore::open_existing(dir.path(), "theirs").unwrap();
    let target = our_store.published_chunks().unwrap().remove(0);
    let source = their_store.published_chunks().unwrap().remove(0);
    fs::copy(&source.path, &target.path).unwrap();

    let err = pipeline::summarize_store(&ours, &mut NoopProgress).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Aggregation(AggregationError::ForeignModel { .. })
    ));
}

#[test]
fn summarize_store_applies_a_new_threshold_without_the_model() {
    let dir = tempdir().unwrap();
    let design = design(5);
    let mut config = config(dir.path(), "resum", 2, 4);
    config.transform = ScaleTransform::Identity;
    config.threshold = 100.0;
    let first = pipeline::run(&config, &design, &RowPlusDraw { scale: 1.0 }, &mut NoopProgress)
        .unwrap();
    assert!(first.table.summaries().all(|s| s.prob_exceed == Some(0.0)));

    config.threshold = -1.0;
    let again = pipeline::summarize_store(&config, &mut NoopProgress).unwrap();
    assert_eq!(again.chunks_written, 0);
    assert_eq!(again.table.len(), 5);
    assert!(again.table.summaries().all(|s| s.prob_exceed == Some(1.0)));
    let means = |o: &pipeline::PipelineOutcome| -> Vec<Option<f64>> {
        o.table.summaries().map(|s| s.mean).collect()
    };
    assert_eq!(means(&first), means(&again));
    assert_eq!(again.table.rows()[3].design, design.rows()[3]);
}

#[test]
fn draw_count_is_bounded_by_the_posterior() {
    let dir = tempdir().unwrap();
    let posterior =
        LinearPosterior::new(vec!["intercept".into(), "x".into()], vec![vec![0.0, 1.0]; 2])
            .unwrap();
    let err = pipeline::run(
        &config(dir.path(), "linear", 2, 3),
        &design(3),
        &posterior,
        &mut NoopProgress,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Configuration(ConfigurationError::DrawCountExceedsPosterior {
            requested: 3,
            available: 2
        })
    ));

    let outcome = pipeline::run(
        &config(dir.path(), "linear", 2, 2),
        &design(3),
        &posterior,
        &mut NoopProgress,
    )
    .unwrap();
    let last = outcome.table.get(RowId(2)).unwrap().summary.clone().unwrap();
    assert_abs_diff_eq!(last.mean_log.unwrap(), 1.0, epsilon = 1e-12);
}
