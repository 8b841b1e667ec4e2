//! Walkers and the two elementary resampling moves.
//!
//! A [`Walker`] is one trajectory segment of the current iteration: a
//! probability weight plus the progress coordinate sampled at every frame.
//! Splitting and merging are the only operations that change the number of
//! walkers, and both conserve weight exactly:
//!
//! - [`split_walker`] turns one walker of weight `w` into `m` copies of weight `w / m`
//! - [`merge_walkers`] combines walkers into one whose weight is their sum
//!
//! ```rust
//! use weer_core::walker::{split_walker, Walker};
//!
//! let walker = Walker::from_trajectory(0.3, vec![1.0, 1.5, 2.0]).unwrap();
//! let copies = split_walker(&walker, 3).unwrap();
//! assert_eq!(copies.len(), 3);
//! let total: f64 = copies.iter().map(|w| w.weight).sum();
//! assert!((total - 0.3).abs() < 1e-15);
//! ```

use crate::errors::{WeError, WeResult};
use ndarray::{Array2, ArrayView1, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Parent id used for walkers whose lineage is unknown to the core.
pub const UNKNOWN_PARENT: i64 = -1;

/// One simulated trajectory segment with a probability weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Walker {
    /// Probability mass carried by this walker
    pub weight: f64,
    /// Progress coordinate per frame: shape (n_frames, n_dims)
    pub pcoord: Array2<f64>,
    /// Lineage parent assigned by the surrounding framework
    pub parent_id: i64,
    /// Every segment that contributed weight to this walker
    pub weight_parent_ids: BTreeSet<i64>,
}

impl Walker {
    /// Create a walker from a weight and a (n_frames, n_dims) trajectory.
    pub fn new(weight: f64, pcoord: Array2<f64>) -> WeResult<Self> {
        if !weight.is_finite() || weight < 0.0 {
            return Err(WeError::InvalidInput(format!(
                "Walker weight must be finite and non-negative, got {}",
                weight
            )));
        }
        if pcoord.nrows() == 0 || pcoord.ncols() == 0 {
            return Err(WeError::InvalidInput(format!(
                "Walker trajectory must have at least one frame and one dimension, got shape {:?}",
                pcoord.dim()
            )));
        }
        if pcoord.iter().any(|v| !v.is_finite()) {
            return Err(WeError::InvalidInput(
                "Walker trajectory contains non-finite values".to_string(),
            ));
        }

        Ok(Self {
            weight,
            pcoord,
            parent_id: UNKNOWN_PARENT,
            weight_parent_ids: BTreeSet::new(),
        })
    }

    /// Create a walker with a one-dimensional progress coordinate.
    pub fn from_trajectory(weight: f64, trajectory: Vec<f64>) -> WeResult<Self> {
        let n_frames = trajectory.len();
        let pcoord = Array2::from_shape_vec((n_frames, 1), trajectory)
            .map_err(|e| WeError::InvalidInput(e.to_string()))?;
        Self::new(weight, pcoord)
    }

    /// Attach lineage information.
    ///
    /// The parent is also recorded as the only weight parent.
    pub fn with_parent(mut self, parent_id: i64) -> Self {
        self.parent_id = parent_id;
        self.weight_parent_ids = BTreeSet::from([parent_id]);
        self
    }

    pub fn n_frames(&self) -> usize {
        self.pcoord.nrows()
    }

    pub fn n_dims(&self) -> usize {
        self.pcoord.ncols()
    }

    /// Final frame of the trajectory, used for bin assignment.
    pub fn endpoint(&self) -> ArrayView1<'_, f64> {
        self.pcoord.row(self.n_frames() - 1)
    }

    /// The observable compared against a reference distribution.
    ///
    /// Only the first progress coordinate axis is used; higher dimensions are ignored.
    pub fn reference_axis(&self) -> ArrayView1<'_, f64> {
        self.pcoord.index_axis(Axis(1), 0)
    }
}

/// Order walkers by ascending weight.
///
/// Sorting with this comparator is stable, so walkers of equal weight keep
/// their relative order.
pub fn by_weight(a: &Walker, b: &Walker) -> Ordering {
    a.weight.total_cmp(&b.weight)
}

/// Sum of the weights of a set of walkers.
pub fn total_weight(walkers: &[Walker]) -> f64 {
    walkers.iter().map(|w| w.weight).sum()
}

/// Split a walker into `m` copies, each carrying `weight / m`.
pub fn split_walker(walker: &Walker, m: usize) -> WeResult<Vec<Walker>> {
    if m == 0 {
        return Err(WeError::InvalidInput(
            "Cannot split a walker into zero copies".to_string(),
        ));
    }

    let weight = walker.weight / m as f64;
    Ok((0..m)
        .map(|_| Walker {
            weight,
            ..walker.clone()
        })
        .collect())
}

/// Merge walkers into one, keeping the history of a weight-sampled representative.
///
/// A number `u` is drawn uniformly from `[0, total)` and the representative is
/// the first walker whose cumulative weight (in the given order) exceeds `u`.
/// The merged walker carries the summed weight, the representative's
/// trajectory and parent, and the union of every member's weight parents.
pub fn merge_walkers<R: Rng + ?Sized>(walkers: Vec<Walker>, rng: &mut R) -> WeResult<Walker> {
    if walkers.is_empty() {
        return Err(WeError::InvalidInput(
            "Cannot merge an empty set of walkers".to_string(),
        ));
    }

    let cumulative: Vec<f64> = walkers
        .iter()
        .scan(0.0, |acc, w| {
            *acc += w.weight;
            Some(*acc)
        })
        .collect();
    let total = cumulative[cumulative.len() - 1];

    let representative = if total > 0.0 {
        let u: f64 = rng.gen_range(0.0..total);
        cumulative
            .iter()
            .position(|&c| c > u)
            .unwrap_or(walkers.len() - 1)
    } else {
        0
    };

    let weight_parent_ids = walkers
        .iter()
        .flat_map(|w| w.weight_parent_ids.iter().copied())
        .collect();

    let mut walkers = walkers;
    let chosen = walkers.swap_remove(representative);
    Ok(Walker {
        weight: total,
        weight_parent_ids,
        ..chosen
    })
}
