//! Kullback-Leibler divergence between a reference sample set and a weighted
//! population of walker trajectories.
//!
//! Both sample sets are binned on the same edges, a small `epsilon` is added
//! to every bin and the two densities are renormalised before computing
//!
//! $$D(p \,\|\, q) = \sum_b \hat p_b \ln \frac{\hat p_b}{\hat q_b}$$
//!
//! where $p$ is the reference density and $q$ the weighted candidate density.
//! Every frame of walker $i$ contributes weight $w_i$ to the candidate.
//!
//! The candidate density is linear-fractional in the walker weights, so the
//! gradient with respect to the weights is available in closed form and is
//! used by the optimiser.

use super::histogram::{build_histogram_with_edges, HistogramEdges};
use crate::errors::{WeError, WeResult};
use crate::walker::Walker;
use ndarray::{Array1, ArrayView1};

/// First-axis progress coordinate samples of the walkers being reweighted.
///
/// Holds one trajectory per walker; the weight vector being optimised has one
/// entry per trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSamples {
    trajectories: Vec<Vec<f64>>,
}

impl CandidateSamples {
    pub fn from_trajectories(trajectories: Vec<Vec<f64>>) -> WeResult<Self> {
        if trajectories.is_empty() {
            return Err(WeError::InvalidInput(
                "Candidate samples must contain at least one walker".to_string(),
            ));
        }
        if let Some(i) = trajectories.iter().position(|t| t.is_empty()) {
            return Err(WeError::InvalidInput(format!(
                "Candidate trajectory {} has no frames",
                i
            )));
        }
        if trajectories.iter().flatten().any(|x| !x.is_finite()) {
            return Err(WeError::InvalidInput(
                "Candidate samples must be finite".to_string(),
            ));
        }
        Ok(Self { trajectories })
    }

    /// One sample per walker.
    pub fn from_points(points: &[f64]) -> WeResult<Self> {
        Self::from_trajectories(points.iter().map(|&x| vec![x]).collect())
    }

    /// Full first-axis trajectories of a set of walkers.
    pub fn from_walkers<'a, I>(walkers: I) -> WeResult<Self>
    where
        I: IntoIterator<Item = &'a Walker>,
    {
        Self::from_trajectories(
            walkers
                .into_iter()
                .map(|w| w.reference_axis().to_vec())
                .collect(),
        )
    }

    pub fn n_walkers(&self) -> usize {
        self.trajectories.len()
    }

    pub fn n_samples(&self) -> usize {
        self.trajectories.iter().map(Vec::len).sum()
    }

    pub fn trajectories(&self) -> &[Vec<f64>] {
        &self.trajectories
    }

    /// All samples, flattened in walker order.
    pub fn flatten(&self) -> Vec<f64> {
        self.trajectories.iter().flatten().copied().collect()
    }

    /// Per-sample weights for a per-walker weight vector.
    pub(crate) fn expand_weights(&self, weights: ArrayView1<f64>) -> Vec<f64> {
        self.trajectories
            .iter()
            .zip(weights.iter())
            .flat_map(|(t, &w)| std::iter::repeat(w).take(t.len()))
            .collect()
    }
}

/// A reference/candidate pair binned once on shared edges.
///
/// Binning is independent of the weights, so the per-walker bin counts are
/// computed up front and every objective or gradient evaluation only
/// reweights them.
#[derive(Debug, Clone)]
pub struct DivergenceProblem {
    edges: HistogramEdges,
    epsilon: f64,
    /// Reference density after the epsilon floor, normalised to unit sum
    reference: Array1<f64>,
    /// Sparse per-walker bin counts: (bin index, number of frames)
    counts: Vec<Vec<(usize, f64)>>,
    /// Frames per walker that fall inside the edges
    frames: Array1<f64>,
}

impl DivergenceProblem {
    pub fn new(
        reference: &[f64],
        candidate: &CandidateSamples,
        bin_count: usize,
        epsilon: f64,
    ) -> WeResult<Self> {
        if !epsilon.is_finite() || epsilon <= 0.0 {
            return Err(WeError::InvalidInput(format!(
                "Divergence epsilon must be positive, got {}",
                epsilon
            )));
        }

        let candidate_samples = candidate.flatten();
        let edges = HistogramEdges::covering(&[reference, &candidate_samples], bin_count)?;

        let reference_hist = build_histogram_with_edges(reference, &edges, None, true)?;
        let mut reference = reference_hist.values + epsilon;
        let reference_sum = reference.sum();
        reference /= reference_sum;

        let counts: Vec<Vec<(usize, f64)>> = candidate
            .trajectories()
            .iter()
            .map(|trajectory| {
                let mut per_bin: Vec<(usize, f64)> = Vec::new();
                for &x in trajectory {
                    if let Some(bin) = edges.index_of(x) {
                        match per_bin.iter_mut().find(|(b, _)| *b == bin) {
                            Some((_, n)) => *n += 1.0,
                            None => per_bin.push((bin, 1.0)),
                        }
                    }
                }
                per_bin
            })
            .collect();
        let frames = counts
            .iter()
            .map(|c| c.iter().map(|(_, n)| n).sum::<f64>())
            .collect();

        Ok(Self {
            edges,
            epsilon,
            reference,
            counts,
            frames,
        })
    }

    pub fn n_walkers(&self) -> usize {
        self.counts.len()
    }

    pub fn edges(&self) -> &HistogramEdges {
        &self.edges
    }

    fn check_weights(&self, weights: ArrayView1<f64>) -> WeResult<()> {
        if weights.len() != self.n_walkers() {
            return Err(WeError::InvalidInput(format!(
                "Weight vector length ({}) does not match number of candidate walkers ({})",
                weights.len(),
                self.n_walkers()
            )));
        }
        Ok(())
    }

    /// Weighted candidate mass per bin and its total.
    fn candidate_mass(&self, weights: ArrayView1<f64>) -> (Array1<f64>, f64) {
        let mut mass = Array1::zeros(self.edges.bin_count());
        for (walker_counts, &w) in self.counts.iter().zip(weights.iter()) {
            for &(bin, n) in walker_counts {
                mass[bin] += w * n;
            }
        }
        let total = mass.sum();
        (mass, total)
    }

    /// Candidate density with the epsilon floor, before renormalisation.
    fn floored_density(&self, mass: &Array1<f64>, total: f64) -> Array1<f64> {
        mass / (total * self.edges.width()) + self.epsilon
    }

    /// Divergence of the weighted candidate from the reference.
    ///
    /// Returns `+inf` when the weights leave no candidate mass on the edges.
    pub fn objective(&self, weights: ArrayView1<f64>) -> f64 {
        let (mass, total) = self.candidate_mass(weights);
        if !(total > 0.0) {
            return f64::INFINITY;
        }

        let q = self.floored_density(&mass, total);
        let q_sum = q.sum();

        self.reference
            .iter()
            .zip(q.iter())
            .map(|(&p, &q)| p * (p / (q / q_sum)).ln())
            .sum()
    }

    /// Gradient of [`objective`](Self::objective) with respect to the walker weights.
    ///
    /// The floored density sums to `1 / width + n_bins * epsilon` whatever the
    /// weights, so only the `-sum(p ln q)` term contributes.
    pub fn gradient(&self, weights: ArrayView1<f64>) -> Array1<f64> {
        let (mass, total) = self.candidate_mass(weights);
        if !(total > 0.0) {
            return Array1::from_elem(self.n_walkers(), f64::NAN);
        }

        let q = self.floored_density(&mass, total);
        let ratio = &self.reference / &q;
        let weighted_mass: f64 = ratio.iter().zip(mass.iter()).map(|(r, m)| r * m).sum();
        let scale = total * self.edges.width();

        Array1::from_iter(self.counts.iter().zip(self.frames.iter()).map(
            |(walker_counts, &n_frames)| {
                let direct: f64 = walker_counts.iter().map(|&(bin, n)| ratio[bin] * n).sum();
                (n_frames * weighted_mass / total - direct) / scale
            },
        ))
    }

    /// Checked divergence for a caller-supplied weight vector.
    pub fn divergence(&self, weights: ArrayView1<f64>) -> WeResult<f64> {
        self.check_weights(weights)?;
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(WeError::InvalidInput(
                "Walker weights must be finite and non-negative".to_string(),
            ));
        }
        let value = self.objective(weights);
        if !value.is_finite() {
            return Err(WeError::InvalidInput(
                "Walker weights leave no candidate mass to compare".to_string(),
            ));
        }
        Ok(value)
    }
}

/// KL divergence of the weighted candidate histogram relative to the reference histogram.
///
/// Lower is better; the value is zero only when the two binned distributions
/// coincide. The measure is not symmetric: `reference` is the base distribution.
///
/// ```rust
/// use weer_core::reweight::divergence::{kl_divergence, CandidateSamples};
///
/// let reference = [1.0, 2.0, 3.0, 4.0, 5.0];
/// let candidate = CandidateSamples::from_points(&reference).unwrap();
/// let d = kl_divergence(&[0.2; 5], &reference, &candidate, 100, 1e-10).unwrap();
/// assert!(d.abs() < 1e-8);
/// ```
pub fn kl_divergence(
    weights: &[f64],
    reference: &[f64],
    candidate: &CandidateSamples,
    bin_count: usize,
    epsilon: f64,
) -> WeResult<f64> {
    let problem = DivergenceProblem::new(reference, candidate, bin_count, epsilon)?;
    problem.divergence(ArrayView1::from(weights))
}

/// Weighted candidate density on the edges shared with `reference`.
///
/// Useful for inspecting how close a reweighted population is to the reference.
pub fn candidate_density(
    weights: &[f64],
    reference: &[f64],
    candidate: &CandidateSamples,
    bin_count: usize,
) -> WeResult<(HistogramEdges, Array1<f64>)> {
    if weights.len() != candidate.n_walkers() {
        return Err(WeError::InvalidInput(format!(
            "Weight vector length ({}) does not match number of candidate walkers ({})",
            weights.len(),
            candidate.n_walkers()
        )));
    }
    let samples = candidate.flatten();
    let edges = HistogramEdges::covering(&[reference, &samples], bin_count)?;
    let sample_weights = candidate.expand_weights(ArrayView1::from(weights));
    let hist = build_histogram_with_edges(&samples, &edges, Some(&sample_weights), true)?;
    Ok((edges, hist.values))
}
