//! # The Predictive Capability Boundary
//!
//! The statistical model is external. postscan only ever asks it one question:
//! "give me `draw_count` posterior draws for these rows". The answer is a matrix of
//! shape `[draw_count, rows.len()]`; a non-finite entry means the model could not
//! evaluate that row for that draw.
//!
//! `LinearPosterior` is the one implementation shipped with the crate. It evaluates
//! posterior coefficient draws that the Bayesian engine has already exported, so
//! the command-line tool can run without linking a sampler.

use crate::types::DesignRow;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Failures of the predictive capability. Fatal for the chunk being emitted;
/// previously published chunks are unaffected.
#[derive(Error, Debug)]
pub enum ModelEvaluationError {
    #[error(
        "The model returned a {found_draws}x{found_rows} draw matrix, but {expected_draws}x{expected_rows} was requested."
    )]
    ShapeMismatch {
        expected_draws: usize,
        expected_rows: usize,
        found_draws: usize,
        found_rows: usize,
    },
    #[error("The model term '{0}' does not name a design column or an auxiliary covariate.")]
    UnknownTerm(String),
    #[error("Posterior draw {draw} has {found} coefficients, but {expected} terms are declared.")]
    CoefficientArity {
        draw: usize,
        expected: usize,
        found: usize,
    },
    #[error("The posterior contains no draws.")]
    EmptyPosterior,
    #[error("Requested {requested} draws, but the posterior only holds {available}.")]
    InsufficientDraws { requested: usize, available: usize },
    #[error("Failed to read posterior file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML posterior file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("The model failed to evaluate the batch: {0}")]
    Evaluation(String),
}

/// One batch of design rows handed to the model.
#[derive(Debug, Clone, Copy)]
pub struct RowBatch<'a> {
    pub covariate_names: &'a [String],
    pub rows: &'a [DesignRow],
}

impl<'a> RowBatch<'a> {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// The narrow interface to a fitted model.
pub trait PosteriorPredictor {
    /// The number of posterior draws the model can provide, if it is bounded.
    fn posterior_size(&self) -> Option<usize> {
        None
    }

    /// Returns a `[draw_count, batch.len()]` matrix of posterior draws.
    fn predict_draws(
        &self,
        batch: RowBatch<'_>,
        draw_count: usize,
    ) -> Result<Array2<f64>, ModelEvaluationError>;
}

impl<P: PosteriorPredictor + ?Sized> PosteriorPredictor for &P {
    fn posterior_size(&self) -> Option<usize> {
        (**self).posterior_size()
    }

    fn predict_draws(
        &self,
        batch: RowBatch<'_>,
        draw_count: usize,
    ) -> Result<Array2<f64>, ModelEvaluationError> {
        (**self).predict_draws(batch, draw_count)
    }
}

/// Where a linear-predictor term reads its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TermSource {
    Intercept,
    X,
    Y,
    DayOfYear,
    DoySin,
    DoyCos,
    Covariate(usize),
}

impl TermSource {
    fn resolve(term: &str, covariate_names: &[String]) -> Result<Self, ModelEvaluationError> {
        Ok(match term {
            "intercept" => Self::Intercept,
            "x" => Self::X,
            "y" => Self::Y,
            "day_of_year" => Self::DayOfYear,
            "doy_sin" => Self::DoySin,
            "doy_cos" => Self::DoyCos,
            other => Self::Covariate(
                covariate_names
                    .iter()
                    .position(|name| name == other)
                    .ok_or_else(|| ModelEvaluationError::UnknownTerm(other.to_string()))?,
            ),
        })
    }

    #[inline]
    fn value(self, row: &DesignRow) -> f64 {
        match self {
            Self::Intercept => 1.0,
            Self::X => row.x,
            Self::Y => row.y,
            Self::DayOfYear => row.day_of_year as f64,
            Self::DoySin => row.doy_sin,
            Self::DoyCos => row.doy_cos,
            Self::Covariate(idx) => row.covariates[idx],
        }
    }
}

/// The on-disk form of exported posterior coefficient draws.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearPosterior {
    /// Term names, aligned with every draw's coefficient vector.
    pub terms: Vec<String>,
    /// One coefficient vector per posterior draw.
    pub draws: Vec<Vec<f64>>,
}

impl LinearPosterior {
    pub fn new(terms: Vec<String>, draws: Vec<Vec<f64>>) -> Result<Self, ModelEvaluationError> {
        let posterior = Self { terms, draws };
        posterior.validate()?;
        Ok(posterior)
    }

    /// Loads and validates a posterior from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ModelEvaluationError> {
        let toml_string = fs::read_to_string(path)?;
        let posterior: Self = toml::from_str(&toml_string)?;
        posterior.validate()?;
        Ok(posterior)
    }

    fn validate(&self) -> Result<(), ModelEvaluationError> {
        if self.draws.is_empty() {
            return Err(ModelEvaluationError::EmptyPosterior);
        }
        for (draw, coefficients) in self.draws.iter().enumerate() {
            if coefficients.len() != self.terms.len() {
                return Err(ModelEvaluationError::CoefficientArity {
                    draw,
                    expected: self.terms.len(),
                    found: coefficients.len(),
                });
            }
        }
        Ok(())
    }

    /// The first `draw_count` coefficient vectors as a `[terms, draw_count]` matrix.
    fn coefficient_matrix(&self, draw_count: usize) -> Array2<f64> {
        Array2::from_shape_fn((self.terms.len(), draw_count), |(term, draw)| {
            self.draws[draw][term]
        })
    }
}

impl PosteriorPredictor for LinearPosterior {
    fn posterior_size(&self) -> Option<usize> {
        Some(self.draws.len())
    }

    fn predict_draws(
        &self,
        batch: RowBatch<'_>,
        draw_count: usize,
    ) -> Result<Array2<f64>, ModelEvaluationError> {
        if draw_count > self.draws.len() {
            return Err(ModelEvaluationError::InsufficientDraws {
                requested: draw_count,
                available: self.draws.len(),
            });
        }
        let sources = self
            .terms
            .iter()
            .map(|term| TermSource::resolve(term, batch.covariate_names))
            .collect::<Result<Vec<_>, _>>()?;

        // [rows, terms] · [terms, draws] = [rows, draws]; a NaN term value
        // propagates to every draw of that row.
        let design = Array2::from_shape_fn((batch.len(), sources.len()), |(row, term)| {
            sources[term].value(&batch.rows[row])
        });
        let linear_predictor = design.dot(&self.coefficient_matrix(draw_count));
        Ok(linear_predictor.reversed_axes().as_standard_layout().to_owned())
    }
}
