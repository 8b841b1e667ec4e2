//! Equal-width histograms over a shared set of edges.
//!
//! Two sample sets can only be compared bin-by-bin when both histograms use
//! the same edges, so edges are a value of their own ([`HistogramEdges`]) that
//! can be computed once over the union of several sample sets and reused.

use crate::errors::{WeError, WeResult};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Equal-width bin edges over `[lower, upper]`.
///
/// Every bin is half-open `[e_i, e_{i+1})` except the last, which also
/// includes `upper`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramEdges {
    lower: f64,
    upper: f64,
    bin_count: usize,
}

impl HistogramEdges {
    /// Create edges over an explicit range.
    ///
    /// A degenerate range `[x, x]` is widened to `[x - 0.5, x + 0.5]`.
    pub fn new(lower: f64, upper: f64, bin_count: usize) -> WeResult<Self> {
        if bin_count == 0 {
            return Err(WeError::InvalidInput(
                "Histogram bin count must be at least 1".to_string(),
            ));
        }
        if !lower.is_finite() || !upper.is_finite() || lower > upper {
            return Err(WeError::InvalidInput(format!(
                "Invalid histogram range [{}, {}]",
                lower, upper
            )));
        }

        let (lower, upper) = if lower == upper {
            (lower - 0.5, upper + 0.5)
        } else {
            (lower, upper)
        };

        Ok(Self {
            lower,
            upper,
            bin_count,
        })
    }

    /// Edges spanning the range of a single sample set.
    pub fn from_samples(samples: &[f64], bin_count: usize) -> WeResult<Self> {
        Self::covering(&[samples], bin_count)
    }

    /// Edges spanning the union of the ranges of several sample sets.
    pub fn covering(sample_sets: &[&[f64]], bin_count: usize) -> WeResult<Self> {
        let mut lower = f64::INFINITY;
        let mut upper = f64::NEG_INFINITY;
        let mut n_samples = 0;

        for samples in sample_sets {
            for &x in samples.iter() {
                if !x.is_finite() {
                    return Err(WeError::InvalidInput(format!(
                        "Histogram samples must be finite, got {}",
                        x
                    )));
                }
                lower = lower.min(x);
                upper = upper.max(x);
                n_samples += 1;
            }
        }

        if n_samples == 0 {
            return Err(WeError::InvalidInput(
                "Cannot build a histogram from an empty set of samples".to_string(),
            ));
        }

        Self::new(lower, upper, bin_count)
    }

    pub fn bin_count(&self) -> usize {
        self.bin_count
    }

    pub fn lower(&self) -> f64 {
        self.lower
    }

    pub fn upper(&self) -> f64 {
        self.upper
    }

    pub fn width(&self) -> f64 {
        (self.upper - self.lower) / self.bin_count as f64
    }

    /// All `bin_count + 1` edge positions.
    pub fn edges(&self) -> Array1<f64> {
        Array1::linspace(self.lower, self.upper, self.bin_count + 1)
    }

    /// Bin centres.
    pub fn midpoints(&self) -> Array1<f64> {
        let width = self.width();
        Array1::from_iter((0..self.bin_count).map(|i| self.lower + (i as f64 + 0.5) * width))
    }

    /// Index of the bin containing `x`, or `None` when `x` lies outside the edges.
    pub fn index_of(&self, x: f64) -> Option<usize> {
        if !(self.lower..=self.upper).contains(&x) {
            return None;
        }
        if x == self.upper {
            return Some(self.bin_count - 1);
        }
        let position = (x - self.lower) / (self.upper - self.lower) * self.bin_count as f64;
        Some((position.floor() as usize).min(self.bin_count - 1))
    }
}

/// Histogram values together with the edges they were accumulated on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub edges: HistogramEdges,
    /// Per-bin counts, or probability densities when normalised
    pub values: Array1<f64>,
}

impl Histogram {
    /// Area under the histogram: `sum(values) * width`.
    pub fn integral(&self) -> f64 {
        self.values.sum() * self.edges.width()
    }
}

/// Bin `samples` into `bin_count` equal-width intervals spanning their range.
///
/// Each sample contributes its weight when `weights` is given, otherwise one.
/// With `normalize` the result is a probability density whose integral is 1.
///
/// ```rust
/// use weer_core::reweight::histogram::build_histogram;
///
/// let hist = build_histogram(&[1.0, 2.0, 2.0, 3.0], 2, None, true).unwrap();
/// assert_eq!(hist.values.to_vec(), vec![0.25, 0.75]);
/// assert!((hist.integral() - 1.0).abs() < 1e-12);
/// ```
pub fn build_histogram(
    samples: &[f64],
    bin_count: usize,
    weights: Option<&[f64]>,
    normalize: bool,
) -> WeResult<Histogram> {
    let edges = HistogramEdges::from_samples(samples, bin_count)?;
    build_histogram_with_edges(samples, &edges, weights, normalize)
}

/// Bin `samples` onto pre-computed `edges`.
///
/// Samples outside the edges are ignored, matching the usual behaviour of a
/// histogram with an explicit range.
pub fn build_histogram_with_edges(
    samples: &[f64],
    edges: &HistogramEdges,
    weights: Option<&[f64]>,
    normalize: bool,
) -> WeResult<Histogram> {
    if samples.is_empty() {
        return Err(WeError::InvalidInput(
            "Cannot build a histogram from an empty set of samples".to_string(),
        ));
    }
    if let Some(weights) = weights {
        if weights.len() != samples.len() {
            return Err(WeError::InvalidInput(format!(
                "Histogram weights length ({}) does not match samples length ({})",
                weights.len(),
                samples.len()
            )));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(WeError::InvalidInput(
                "Histogram weights must be finite and non-negative".to_string(),
            ));
        }
    }

    let mut values = Array1::zeros(edges.bin_count());
    for (i, &x) in samples.iter().enumerate() {
        if !x.is_finite() {
            return Err(WeError::InvalidInput(format!(
                "Histogram samples must be finite, got {}",
                x
            )));
        }
        if let Some(bin) = edges.index_of(x) {
            values[bin] += weights.map_or(1.0, |w| w[i]);
        }
    }

    if normalize {
        let total = values.sum();
        if total <= 0.0 {
            return Err(WeError::InvalidInput(
                "Cannot normalise a histogram with zero total weight".to_string(),
            ));
        }
        values /= total * edges.width();
    }

    Ok(Histogram {
        edges: *edges,
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use is_close::is_close;
    use ndarray::array;

    #[test]
    fn test_edges_validation() {
        assert!(HistogramEdges::new(0.0, 1.0, 0).is_err());
        assert!(HistogramEdges::new(1.0, 0.0, 4).is_err());
        assert!(HistogramEdges::new(f64::NAN, 1.0, 4).is_err());
        assert!(HistogramEdges::from_samples(&[], 4).is_err());
        assert!(HistogramEdges::from_samples(&[1.0, f64::NAN], 4).is_err());
    }

    #[test]
    fn test_degenerate_range_is_widened() {
        let edges = HistogramEdges::from_samples(&[2.0, 2.0], 4).unwrap();
        assert_eq!(edges.lower(), 1.5);
        assert_eq!(edges.upper(), 2.5);
        assert_eq!(edges.edges(), array![1.5, 1.75, 2.0, 2.25, 2.5]);
    }

    #[test]
    fn test_index_of_closes_last_bin() {
        let edges = HistogramEdges::new(0.0, 1.0, 4).unwrap();
        assert_eq!(edges.index_of(0.0), Some(0));
        assert_eq!(edges.index_of(0.25), Some(1));
        assert_eq!(edges.index_of(0.99), Some(3));
        assert_eq!(edges.index_of(1.0), Some(3));
        assert_eq!(edges.index_of(-0.01), None);
        assert_eq!(edges.index_of(1.01), None);
    }

    #[test]
    fn test_covering_uses_union_range() {
        let edges = HistogramEdges::covering(&[&[1.0, 2.0], &[0.5, 6.0]], 10).unwrap();
        assert_eq!(edges.lower(), 0.5);
        assert_eq!(edges.upper(), 6.0);
        assert!(is_close!(edges.width(), 0.55));
    }

    #[test]
    fn test_counts_without_normalisation() {
        let hist = build_histogram(&[0.0, 0.1, 0.6, 1.0], 2, None, false).unwrap();
        assert_eq!(hist.values, array![2.0, 2.0]);
    }

    #[test]
    fn test_weighted_density_integrates_to_one() {
        let samples = [1.0, 1.5, 2.0, 4.0, 5.0];
        let weights = [0.1, 0.1, 0.5, 0.2, 0.1];
        let hist = build_histogram(&samples, 8, Some(&weights), true).unwrap();

        assert!(is_close!(hist.integral(), 1.0));
        // 2.0 lands in bin 2 of [1, 5] split into 8 bins of width 0.5
        assert!(is_close!(hist.values[2], 0.5 / 0.5));
    }

    #[test]
    fn test_weights_must_match_samples() {
        let result = build_histogram(&[1.0, 2.0], 2, Some(&[1.0]), true);
        assert!(matches!(result, Err(WeError::InvalidInput(_))));

        let result = build_histogram(&[1.0, 2.0], 2, Some(&[1.0, -1.0]), true);
        assert!(matches!(result, Err(WeError::InvalidInput(_))));
    }

    #[test]
    fn test_empty_samples_fail() {
        let result = build_histogram(&[], 10, None, true);
        assert!(matches!(result, Err(WeError::InvalidInput(_))));
    }

    #[test]
    fn test_zero_weight_density_fails() {
        let result = build_histogram(&[1.0, 2.0], 2, Some(&[0.0, 0.0]), true);
        assert!(matches!(result, Err(WeError::InvalidInput(_))));
    }

    #[test]
    fn test_samples_outside_explicit_edges_are_ignored() {
        let edges = HistogramEdges::new(0.0, 1.0, 2).unwrap();
        let hist = build_histogram_with_edges(&[0.2, 0.7, 3.0], &edges, None, false).unwrap();
        assert_eq!(hist.values, array![1.0, 1.0]);
    }
}
