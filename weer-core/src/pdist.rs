//! Weighted one-dimensional probability distributions in units of kT.
//!
//! Every frame of every walker trajectory contributes the walker's weight to a
//! histogram over the full range of the samples. The histogram is then
//! expressed as a free energy `-ln(h / max(h))`, so the most populated bin
//! sits at zero and empty bins are infinitely high.

use crate::errors::{WeError, WeResult};
use crate::reweight::divergence::CandidateSamples;
use crate::reweight::histogram::{build_histogram_with_edges, HistogramEdges};
use crate::walker::Walker;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreeEnergyProfile {
    /// Bin centres
    pub midpoints: Array1<f64>,
    /// Free energy per bin in kT
    pub values: Array1<f64>,
}

/// Free energy profile of weighted trajectories.
///
/// ```rust
/// use weer_core::pdist::free_energy_profile;
/// use weer_core::reweight::divergence::CandidateSamples;
///
/// let trajectories = CandidateSamples::from_trajectories(vec![vec![0.0, 0.0], vec![1.0]]).unwrap();
/// let profile = free_energy_profile(&trajectories, &[0.5, 0.5], 2).unwrap();
/// assert_eq!(profile.values[0], 0.0);
/// assert!((profile.values[1] - 2f64.ln()).abs() < 1e-12);
/// ```
pub fn free_energy_profile(
    trajectories: &CandidateSamples,
    weights: &[f64],
    bin_count: usize,
) -> WeResult<FreeEnergyProfile> {
    if weights.len() != trajectories.n_walkers() {
        return Err(WeError::InvalidInput(format!(
            "Weight vector length ({}) does not match number of trajectories ({})",
            weights.len(),
            trajectories.n_walkers()
        )));
    }

    let samples = trajectories.flatten();
    let edges = HistogramEdges::from_samples(&samples, bin_count)?;
    let sample_weights = trajectories.expand_weights(ArrayView1::from(weights));
    let histogram = build_histogram_with_edges(&samples, &edges, Some(&sample_weights), false)?;

    let peak = histogram.values.fold(0.0, |acc: f64, &h| acc.max(h));
    if !(peak > 0.0) {
        return Err(WeError::InvalidInput(
            "Cannot build a free energy profile from trajectories with zero total weight"
                .to_string(),
        ));
    }

    Ok(FreeEnergyProfile {
        midpoints: edges.midpoints(),
        values: histogram.values.mapv(|h| -(h / peak).ln()),
    })
}

/// Free energy profile of the first progress coordinate axis of `walkers`.
pub fn walker_profile(walkers: &[Walker], bin_count: usize) -> WeResult<FreeEnergyProfile> {
    let trajectories = CandidateSamples::from_walkers(walkers)?;
    let weights: Vec<f64> = walkers.iter().map(|w| w.weight).collect();
    free_energy_profile(&trajectories, &weights, bin_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use is_close::is_close;

    #[test]
    fn test_profile_relative_to_most_populated_bin() {
        let trajectories =
            CandidateSamples::from_trajectories(vec![vec![0.0, 0.0], vec![1.0, 1.0]]).unwrap();
        let profile = free_energy_profile(&trajectories, &[0.75, 0.25], 2).unwrap();

        assert!(is_close!(profile.midpoints[0], 0.25));
        assert!(is_close!(profile.midpoints[1], 0.75));
        assert_eq!(profile.values[0], 0.0);
        assert!(is_close!(profile.values[1], 3f64.ln()));
    }

    #[test]
    fn test_empty_bins_are_infinite() {
        let trajectories = CandidateSamples::from_points(&[0.0, 1.0]).unwrap();
        let profile = free_energy_profile(&trajectories, &[0.5, 0.5], 3).unwrap();

        assert_eq!(profile.values[0], 0.0);
        assert!(profile.values[1].is_infinite());
        assert_eq!(profile.values[2], 0.0);
    }

    #[test]
    fn test_walker_profile_uses_weights() {
        let walkers = vec![
            Walker::from_trajectory(0.9, vec![0.0]).unwrap(),
            Walker::from_trajectory(0.1, vec![1.0]).unwrap(),
        ];
        let profile = walker_profile(&walkers, 2).unwrap();
        assert!(is_close!(profile.values[1], 9f64.ln()));
    }

    #[test]
    fn test_invalid_inputs() {
        let trajectories = CandidateSamples::from_points(&[0.0, 1.0]).unwrap();
        assert!(free_energy_profile(&trajectories, &[1.0], 2).is_err());
        assert!(free_energy_profile(&trajectories, &[0.0, 0.0], 2).is_err());
        assert!(free_energy_profile(&trajectories, &[0.5, 0.5], 0).is_err());
    }
}
