//! Ensemble reweighting against a reference distribution.
//!
//! The [`DistributionReweighter`] adjusts walker weights so that the weighted
//! distribution of the walkers' first progress coordinate matches a supplied
//! reference distribution as closely as possible, by minimising the binned
//! KL divergence subject to the weights lying on the probability simplex.
//!
//! ```rust
//! use weer_core::reweight::{DistributionReweighter, ReferenceDistribution};
//! use weer_core::reweight::divergence::CandidateSamples;
//! use std::sync::Arc;
//!
//! let reference = Arc::new(ReferenceDistribution::new(vec![1.0, 2.0, 3.0, 4.0, 5.0]).unwrap());
//! let reweighter = DistributionReweighter::new(reference);
//!
//! let candidate = CandidateSamples::from_points(&[1.2, 2.2, 2.8, 4.5, 5.5, 6.0, 5.0]).unwrap();
//! let initial = vec![1.0 / 7.0; 7];
//! let optimised = reweighter.optimize_weights(&initial, &candidate).unwrap();
//! assert!((optimised.sum() - 1.0).abs() < 1e-6);
//! ```

pub mod divergence;
pub mod histogram;
pub mod optimizer;

use crate::errors::{WeError, WeResult};
use crate::walker::Walker;
use divergence::{CandidateSamples, DivergenceProblem};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use optimizer::{OptimizationOutcome, ProjectedGradient};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default number of histogram bins used for divergence estimates.
pub const DEFAULT_BIN_COUNT: usize = 100;
/// Default floor added to every histogram bin.
pub const DEFAULT_EPSILON: f64 = 1e-10;

/// Read-only samples of the observable the walkers are compared against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDistribution {
    samples: Vec<f64>,
}

impl ReferenceDistribution {
    pub fn new(samples: Vec<f64>) -> WeResult<Self> {
        if samples.is_empty() {
            return Err(WeError::InvalidInput(
                "Reference distribution must contain at least one sample".to_string(),
            ));
        }
        if samples.iter().any(|x| !x.is_finite()) {
            return Err(WeError::InvalidInput(
                "Reference distribution samples must be finite".to_string(),
            ));
        }
        Ok(Self { samples })
    }

    /// Build from tabular data, using the first column as the observable axis.
    pub fn from_columns(table: &Array2<f64>) -> WeResult<Self> {
        if table.ncols() == 0 {
            return Err(WeError::InvalidInput(
                "Reference table has no columns".to_string(),
            ));
        }
        Self::new(table.index_axis(Axis(1), 0).to_vec())
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Result of reweighting a set of walkers in place.
#[derive(Debug, Clone, PartialEq)]
pub struct ReweightOutcome {
    /// Divergence with the weights the walkers had before reweighting
    pub initial_divergence: f64,
    /// Divergence with the optimised weights
    pub final_divergence: f64,
    /// Number of optimiser steps
    pub iterations: usize,
}

/// Produces corrected walker weights that match a reference distribution.
#[derive(Debug, Clone)]
pub struct DistributionReweighter {
    reference: Arc<ReferenceDistribution>,
    bin_count: usize,
    epsilon: f64,
    optimizer: ProjectedGradient,
}

impl DistributionReweighter {
    pub fn new(reference: Arc<ReferenceDistribution>) -> Self {
        Self {
            reference,
            bin_count: DEFAULT_BIN_COUNT,
            epsilon: DEFAULT_EPSILON,
            optimizer: ProjectedGradient::default(),
        }
    }

    pub fn with_bin_count(mut self, bin_count: usize) -> Self {
        self.bin_count = bin_count;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_optimizer(mut self, optimizer: ProjectedGradient) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn reference(&self) -> &ReferenceDistribution {
        &self.reference
    }

    fn problem(&self, candidate: &CandidateSamples) -> WeResult<DivergenceProblem> {
        DivergenceProblem::new(
            self.reference.samples(),
            candidate,
            self.bin_count,
            self.epsilon,
        )
    }

    /// KL divergence of the weighted candidate from the reference.
    pub fn divergence(&self, weights: &[f64], candidate: &CandidateSamples) -> WeResult<f64> {
        self.problem(candidate)?
            .divergence(ArrayView1::from(weights))
    }

    /// Full optimiser result, seeded at `initial`.
    pub fn optimize(
        &self,
        initial: &[f64],
        candidate: &CandidateSamples,
    ) -> WeResult<OptimizationOutcome> {
        let problem = self.problem(candidate)?;
        if initial.len() != problem.n_walkers() {
            return Err(WeError::InvalidInput(format!(
                "Initial weight vector length ({}) does not match number of candidate walkers ({})",
                initial.len(),
                problem.n_walkers()
            )));
        }

        self.optimizer.minimize(
            ArrayView1::from(initial),
            |w| problem.objective(w),
            |w| problem.gradient(w),
        )
    }

    /// Weight vector on the probability simplex minimising the divergence.
    pub fn optimize_weights(
        &self,
        initial: &[f64],
        candidate: &CandidateSamples,
    ) -> WeResult<Array1<f64>> {
        self.optimize(initial, candidate).map(|outcome| outcome.weights)
    }

    /// Reweight walkers in place, preserving their combined weight.
    ///
    /// Weights are normalised to the simplex for the optimisation and scaled
    /// back by the original total afterwards. On any error the walkers are
    /// left untouched.
    pub fn reweight_walkers<'a, I>(&self, walkers: I) -> WeResult<ReweightOutcome>
    where
        I: IntoIterator<Item = &'a mut Walker>,
    {
        let mut walkers: Vec<&'a mut Walker> = walkers.into_iter().collect();
        if walkers.is_empty() {
            return Err(WeError::InvalidInput(
                "Cannot reweight an empty set of walkers".to_string(),
            ));
        }

        let total: f64 = walkers.iter().map(|w| w.weight).sum();
        if !(total > 0.0) {
            return Err(WeError::InvalidInput(format!(
                "Cannot reweight walkers with total weight {}",
                total
            )));
        }

        let candidate = CandidateSamples::from_walkers(walkers.iter().map(|w| &**w))?;
        let problem = self.problem(&candidate)?;
        let initial = Array1::from_iter(walkers.iter().map(|w| w.weight / total));
        let initial_divergence = problem.objective(initial.view());

        let outcome = self.optimizer.minimize(
            initial.view(),
            |w| problem.objective(w),
            |w| problem.gradient(w),
        )?;

        for (walker, &w) in walkers.iter_mut().zip(outcome.weights.iter()) {
            walker.weight = w * total;
        }

        Ok(ReweightOutcome {
            initial_divergence,
            final_divergence: outcome.objective,
            iterations: outcome.iterations,
        })
    }
}

/// Minimise the divergence of `candidate` from `reference` over the simplex.
///
/// Free-function form of [`DistributionReweighter::optimize_weights`] using the
/// default optimiser settings.
pub fn optimize_weights(
    reference: &[f64],
    initial: &[f64],
    candidate: &CandidateSamples,
    bin_count: usize,
    epsilon: f64,
) -> WeResult<Array1<f64>> {
    let reference = Arc::new(ReferenceDistribution::new(reference.to_vec())?);
    DistributionReweighter::new(reference)
        .with_bin_count(bin_count)
        .with_epsilon(epsilon)
        .optimize_weights(initial, candidate)
}
