//! Per-iteration population control.
//!
//! [`PopulationController`] drives every bin of an iteration towards its
//! target walker count. For each bin it
//!
//! 1. partitions the walkers into subgroups,
//! 2. optionally reweights them against a reference distribution,
//! 3. merges each subgroup down to one walker when there are at least as many
//!    subgroups as the target count, or splits/merges around the bin's ideal
//!    weight inside each subgroup when there are fewer,
//! 4. adjusts the count to the target and
//! 5. optionally enforces the configured weight bounds.
//!
//! The surrounding simulation framework drives the controller through the
//! [`WeDriver`] lifecycle: `check_pre`, `resample`, `check_post`.

use crate::bin::{Bin, Binning};
use crate::config::{FailurePolicy, ResamplerConfig, ReweightScope};
use crate::errors::{WeError, WeResult};
use crate::observer::{ResamplingObserver, ThresholdViolation};
use crate::resample::{
    adjust_count, enforce_thresholds, merge_by_weight, split_by_weight, WeightBounds,
};
use crate::reweight::{DistributionReweighter, ReferenceDistribution};
use crate::subgroup::form_subgroups;
use crate::walker::{merge_walkers, total_weight, Walker};
use log::debug;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::sync::Arc;

/// Diagnostics of one resampling call, aggregated over bins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationSummary {
    pub total_subgroups: usize,
    /// Number of walkers held by all bins after resampling
    pub total_particles: usize,
    /// Walkers left outside the weight bounds
    pub warnings: Vec<ThresholdViolation>,
    /// Reweighting attempts that failed and fell back to the prior weights
    pub reweight_failures: usize,
}

impl IterationSummary {
    /// Combine the summaries of disjoint sets of bins.
    pub fn merge(mut self, other: IterationSummary) -> Self {
        self.total_subgroups += other.total_subgroups;
        self.total_particles += other.total_particles;
        self.warnings.extend(other.warnings);
        self.reweight_failures += other.reweight_failures;
        self
    }
}

/// Lifecycle through which a simulation framework drives resampling.
pub trait WeDriver {
    /// Validate the ensemble before any walker is touched.
    fn check_pre(&self, binning: &Binning) -> WeResult<()>;

    /// Resample every bin in place.
    ///
    /// On error no bin is modified.
    fn resample(
        &self,
        binning: &mut Binning,
        observer: &dyn ResamplingObserver,
    ) -> WeResult<IterationSummary>;

    /// Validate the ensemble after resampling against the mass it started with.
    fn check_post(&self, initial_weight: f64, binning: &Binning) -> WeResult<()>;

    /// `check_pre`, `resample` and `check_post` in order.
    fn run_iteration(
        &self,
        binning: &mut Binning,
        observer: &dyn ResamplingObserver,
    ) -> WeResult<IterationSummary> {
        self.check_pre(binning)?;
        let initial_weight = binning.total_weight();
        let mut working = binning.clone();
        let summary = self.resample(&mut working, observer)?;
        self.check_post(initial_weight, &working)?;
        *binning = working;
        Ok(summary)
    }
}

/// Weighted-ensemble population controller.
#[derive(Debug)]
pub struct PopulationController {
    config: ResamplerConfig,
    reweighter: Option<DistributionReweighter>,
}

impl PopulationController {
    pub fn new(config: ResamplerConfig) -> WeResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            reweighter: None,
        })
    }

    /// Supply the distribution that reweighting matches walkers against.
    pub fn with_reference(mut self, reference: Arc<ReferenceDistribution>) -> Self {
        let settings = &self.config.reweight;
        self.reweighter = Some(
            DistributionReweighter::new(reference)
                .with_bin_count(settings.bin_count)
                .with_epsilon(settings.epsilon)
                .with_optimizer(settings.optimizer()),
        );
        self
    }

    pub fn config(&self) -> &ResamplerConfig {
        &self.config
    }

    fn reweighter(&self) -> WeResult<&DistributionReweighter> {
        self.reweighter.as_ref().ok_or_else(|| {
            WeError::Configuration(format!(
                "Reweighting scope is {:?} but no reference distribution was supplied",
                self.config.reweight.scope
            ))
        })
    }

    fn bounds(&self) -> WeightBounds {
        WeightBounds {
            smallest: self.config.smallest_allowed_weight,
            largest: self.config.largest_allowed_weight,
        }
    }

    /// Reweight `walkers` under the configured failure policy.
    ///
    /// Returns whether the prior weights were retained after a failed optimisation.
    fn reweight<'a, I>(
        &self,
        bin_index: Option<usize>,
        walkers: I,
        observer: &dyn ResamplingObserver,
    ) -> WeResult<bool>
    where
        I: IntoIterator<Item = &'a mut Walker>,
    {
        let reweighter = self.reweighter()?;
        let walkers: Vec<&'a mut Walker> = walkers.into_iter().collect();
        let mass: f64 = walkers.iter().map(|w| w.weight).sum();
        if !(mass > 0.0) {
            debug!(
                "Skipping reweighting of {:?}: {} walkers carry no weight",
                bin_index,
                walkers.len()
            );
            return Ok(false);
        }

        let policy = self.config.reweight.on_failure;
        match reweighter.reweight_walkers(walkers) {
            Ok(outcome) => {
                debug!(
                    "Reweighted {:?}: divergence {:e} -> {:e} in {} iterations",
                    bin_index,
                    outcome.initial_divergence,
                    outcome.final_divergence,
                    outcome.iterations
                );
                Ok(false)
            }
            Err(e) if e.is_recoverable() => {
                observer.reweight_failed(bin_index, &e, policy);
                match policy {
                    FailurePolicy::RetainWeights => Ok(true),
                    FailurePolicy::Abort => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Resample one bin to its target count.
    ///
    /// The bin is only modified when resampling succeeds. Empty bins are left
    /// as they are whatever their target count. Only reweighting failures are
    /// reported to `observer` here; the bin's outcome is in the returned summary.
    pub fn resample_bin<R: Rng + ?Sized>(
        &self,
        bin_index: usize,
        bin: &mut Bin,
        rng: &mut R,
        observer: &dyn ResamplingObserver,
    ) -> WeResult<IterationSummary> {
        if bin.is_empty() {
            return Ok(IterationSummary::default());
        }
        let target_count = bin.target_count;
        if target_count == 0 {
            return Err(WeError::Configuration(format!(
                "Bin {} holds {} walkers but has a target count of 0",
                bin_index,
                bin.len()
            )));
        }

        let mut subgroups = form_subgroups(
            self.config.subgroup.as_ref(),
            bin_index,
            bin.walkers.clone(),
        )?;
        let n_subgroups = subgroups.len();
        let mut summary = IterationSummary {
            total_subgroups: n_subgroups,
            ..IterationSummary::default()
        };

        if self.config.reweight.scope == ReweightScope::PerBin
            && self.reweight(Some(bin_index), subgroups.iter_mut().flatten(), observer)?
        {
            summary.reweight_failures += 1;
        }

        let bin_weight: f64 = subgroups.iter().map(|g| total_weight(g)).sum();
        let ideal_weight = bin_weight / target_count as f64;

        let mut walkers: Vec<Walker> = if n_subgroups >= target_count {
            for group in subgroups.iter_mut().filter(|g| g.len() > 1) {
                let merged = merge_walkers(std::mem::take(group), rng)?;
                group.push(merged);
            }
            let mut groups = vec![subgroups.into_iter().flatten().collect::<Vec<_>>()];
            adjust_count(&mut groups, target_count, rng)?;
            groups.into_iter().flatten().collect()
        } else {
            for group in subgroups.iter_mut() {
                split_by_weight(group, ideal_weight, self.config.weight_split_threshold)?;
                merge_by_weight(group, ideal_weight, self.config.weight_merge_cutoff, rng)?;
            }
            if self.config.do_adjust_counts {
                subgroups.sort_by(|a, b| total_weight(b).total_cmp(&total_weight(a)));
                adjust_count(&mut subgroups, target_count, rng)?;
            }
            subgroups.into_iter().flatten().collect()
        };

        if self.config.do_thresholds {
            summary.warnings =
                enforce_thresholds(&mut walkers, self.bounds(), target_count, bin_index, rng)?;
        }

        summary.total_particles = walkers.len();
        bin.walkers = walkers;
        Ok(summary)
    }

    fn resample_bin_seeded(
        &self,
        bin_index: usize,
        bin: &mut Bin,
        seed: u64,
        observer: &dyn ResamplingObserver,
    ) -> WeResult<IterationSummary> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(bin_index as u64));
        self.resample_bin(bin_index, bin, &mut rng, observer)
    }

    fn mass_tolerance(&self, n_walkers: usize) -> f64 {
        self.config.mass_tolerance * n_walkers.max(1) as f64
    }
}

impl WeDriver for PopulationController {
    fn check_pre(&self, binning: &Binning) -> WeResult<()> {
        for (i, bin) in binning.iter().enumerate() {
            if !bin.is_empty() && bin.target_count == 0 {
                return Err(WeError::Configuration(format!(
                    "Bin {} holds {} walkers but has a target count of 0",
                    i,
                    bin.len()
                )));
            }
        }

        let n_walkers = binning.n_walkers();
        if n_walkers == 0 {
            return Ok(());
        }
        let total = binning.total_weight();
        if (total - 1.0).abs() > self.mass_tolerance(n_walkers) {
            return Err(WeError::Consistency(format!(
                "Total weight of {} walkers is {:.15}, expected 1",
                n_walkers, total
            )));
        }
        Ok(())
    }

    fn resample(
        &self,
        binning: &mut Binning,
        observer: &dyn ResamplingObserver,
    ) -> WeResult<IterationSummary> {
        let mut working = binning.clone();
        let mut summary = IterationSummary::default();

        if self.config.reweight.scope == ReweightScope::Global
            && working.n_walkers() > 0
            && self.reweight(
                None,
                working.iter_mut().flat_map(|b| b.walkers.iter_mut()),
                observer,
            )?
        {
            summary.reweight_failures += 1;
        }

        let seed = self
            .config
            .seed
            .unwrap_or_else(|| rand::thread_rng().gen());
        let per_bin: Vec<IterationSummary> = if self.config.parallel {
            working
                .bins
                .par_iter_mut()
                .enumerate()
                .map(|(i, bin)| self.resample_bin_seeded(i, bin, seed, observer))
                .collect::<WeResult<_>>()?
        } else {
            working
                .bins
                .iter_mut()
                .enumerate()
                .map(|(i, bin)| self.resample_bin_seeded(i, bin, seed, observer))
                .collect::<WeResult<_>>()?
        };

        // Bin events are only reported once every bin has succeeded
        for (i, bin_summary) in per_bin.iter().enumerate() {
            if bin_summary.total_particles > 0 {
                observer.bin_resampled(
                    i,
                    bin_summary.total_subgroups,
                    bin_summary.total_particles,
                );
            }
            for violation in &bin_summary.warnings {
                observer.threshold_violation(violation);
            }
        }
        let summary = per_bin.into_iter().fold(summary, IterationSummary::merge);

        observer.iteration_complete(&summary);
        *binning = working;
        Ok(summary)
    }

    fn check_post(&self, initial_weight: f64, binning: &Binning) -> WeResult<()> {
        for (i, bin) in binning.iter().enumerate() {
            for walker in &bin.walkers {
                if !walker.weight.is_finite() || walker.weight < 0.0 {
                    return Err(WeError::Consistency(format!(
                        "Walker in bin {} has invalid weight {}",
                        i, walker.weight
                    )));
                }
                // Reweighting may legitimately move a walker onto the simplex boundary
                if walker.weight == 0.0 && self.config.reweight.scope == ReweightScope::Disabled
                {
                    return Err(WeError::Consistency(format!(
                        "Walker in bin {} (parent {}) has zero weight",
                        i, walker.parent_id
                    )));
                }
            }
        }

        let total = binning.total_weight();
        let n_walkers = binning.n_walkers();
        if (total - initial_weight).abs() > self.mass_tolerance(n_walkers) {
            return Err(WeError::Consistency(format!(
                "Total weight changed during resampling: {:.15} -> {:.15}",
                initial_weight, total
            )));
        }
        Ok(())
    }
}
