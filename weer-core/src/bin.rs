//! Bins of progress-coordinate space and the set of bins for one iteration.

use crate::errors::{WeError, WeResult};
use crate::walker::{total_weight, Walker};
use ndarray::{s, Array1, Array3, ArrayView1, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

/// A region of progress-coordinate space with a desired walker count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bin {
    /// Number of walkers the bin should hold after resampling
    pub target_count: usize,
    /// Walkers currently assigned to the bin by endpoint
    pub walkers: Vec<Walker>,
}

impl Bin {
    pub fn new(target_count: usize) -> Self {
        Self {
            target_count,
            walkers: Vec::new(),
        }
    }

    pub fn with_walkers(target_count: usize, walkers: Vec<Walker>) -> Self {
        Self {
            target_count,
            walkers,
        }
    }

    pub fn len(&self) -> usize {
        self.walkers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.walkers.is_empty()
    }

    pub fn total_weight(&self) -> f64 {
        total_weight(&self.walkers)
    }

    /// The balancing point for split/merge decisions: `total weight / target count`.
    pub fn ideal_weight(&self) -> WeResult<f64> {
        if self.target_count == 0 {
            return Err(WeError::Configuration(
                "Cannot compute the ideal weight of a bin with a target count of 0".to_string(),
            ));
        }
        Ok(self.total_weight() / self.target_count as f64)
    }
}

/// All bins of one iteration.
///
/// When built with [`Binning::rectilinear`] walkers can be placed by the
/// first axis of their endpoint; otherwise bins are filled by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Binning {
    pub bins: Vec<Bin>,
    boundaries: Option<Vec<f64>>,
}

impl Binning {
    pub fn new(bins: Vec<Bin>) -> Self {
        Self {
            bins,
            boundaries: None,
        }
    }

    /// Create contiguous bins from sorted boundaries along the first pcoord axis.
    ///
    /// `n` boundaries give `n - 1` bins; bin `i` covers `[b[i], b[i + 1])`.
    pub fn rectilinear(boundaries: Vec<f64>, target_count: usize) -> WeResult<Self> {
        if boundaries.len() < 2 {
            return Err(WeError::Configuration(
                "At least two boundaries are required to define a bin".to_string(),
            ));
        }
        if boundaries.windows(2).any(|b| !(b[0] < b[1])) {
            return Err(WeError::Configuration(
                "Bin boundaries must be strictly increasing".to_string(),
            ));
        }

        let bins = (0..boundaries.len() - 1)
            .map(|_| Bin::new(target_count))
            .collect();
        Ok(Self {
            bins,
            boundaries: Some(boundaries),
        })
    }

    /// Assign a walker to the bin containing its endpoint, returning the bin index.
    pub fn place(&mut self, walker: Walker) -> WeResult<usize> {
        let boundaries = self.boundaries.as_ref().ok_or_else(|| {
            WeError::Configuration("Binning has no boundaries to place walkers by".to_string())
        })?;

        let x = walker.endpoint()[0];
        let index = boundaries
            .windows(2)
            .position(|b| b[0] <= x && x < b[1])
            .ok_or_else(|| {
                WeError::InvalidInput(format!(
                    "Walker endpoint {} lies outside the bin boundaries [{}, {})",
                    x,
                    boundaries[0],
                    boundaries[boundaries.len() - 1]
                ))
            })?;

        self.bins[index].walkers.push(walker);
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn n_walkers(&self) -> usize {
        self.bins.iter().map(Bin::len).sum()
    }

    pub fn total_weight(&self) -> f64 {
        self.bins.iter().map(Bin::total_weight).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bin> {
        self.bins.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Bin> {
        self.bins.iter_mut()
    }

    /// All walkers of the iteration, in bin order.
    pub fn walkers(&self) -> impl Iterator<Item = &Walker> {
        self.bins.iter().flat_map(|b| b.walkers.iter())
    }
}

/// Walkers of one iteration as flat per-walker arrays.
///
/// Every walker shares the same `(n_frames, n_dims)` trajectory shape, so the
/// progress coordinates stack into one `(n_walkers, n_frames, n_dims)` array.
#[derive(Debug, Clone, PartialEq)]
pub struct WalkerArrays {
    pub bin_index: Vec<usize>,
    pub weights: Array1<f64>,
    pub parent_ids: Vec<i64>,
    pub pcoord: Array3<f64>,
}

impl Binning {
    /// Build bins with the given target counts and fill them from flat walker arrays.
    pub fn from_arrays(
        target_counts: &[usize],
        bin_index: &[usize],
        weights: ArrayView1<f64>,
        pcoord: ArrayView3<f64>,
        parent_ids: &[i64],
    ) -> WeResult<Self> {
        let n_walkers = weights.len();
        if bin_index.len() != n_walkers
            || parent_ids.len() != n_walkers
            || pcoord.len_of(Axis(0)) != n_walkers
        {
            return Err(WeError::InvalidInput(format!(
                "Walker arrays disagree in length: {} weights, {} bin indices, {} parent ids, {} trajectories",
                n_walkers,
                bin_index.len(),
                parent_ids.len(),
                pcoord.len_of(Axis(0))
            )));
        }

        let mut bins: Vec<Bin> = target_counts.iter().map(|&t| Bin::new(t)).collect();
        for i in 0..n_walkers {
            let bin = bins.get_mut(bin_index[i]).ok_or_else(|| {
                WeError::InvalidInput(format!(
                    "Walker {} is assigned to bin {} but there are only {} bins",
                    i,
                    bin_index[i],
                    target_counts.len()
                ))
            })?;
            let walker = Walker::new(weights[i], pcoord.slice(s![i, .., ..]).to_owned())?
                .with_parent(parent_ids[i]);
            bin.walkers.push(walker);
        }
        Ok(Self::new(bins))
    }

    /// Flatten the walkers, in bin order, into per-walker arrays.
    ///
    /// `frame_shape` is used for the trajectory shape when there are no walkers.
    pub fn to_arrays(&self, frame_shape: (usize, usize)) -> WeResult<WalkerArrays> {
        let (n_frames, n_dims) = self
            .walkers()
            .next()
            .map(|w| (w.n_frames(), w.n_dims()))
            .unwrap_or(frame_shape);

        let mut bin_index = Vec::with_capacity(self.n_walkers());
        let mut weights = Vec::with_capacity(self.n_walkers());
        let mut parent_ids = Vec::with_capacity(self.n_walkers());
        let mut flat = Vec::with_capacity(self.n_walkers() * n_frames * n_dims);
        for (i, bin) in self.iter().enumerate() {
            for walker in &bin.walkers {
                if walker.pcoord.dim() != (n_frames, n_dims) {
                    return Err(WeError::InvalidInput(format!(
                        "Walker trajectory shape {:?} differs from {:?}",
                        walker.pcoord.dim(),
                        (n_frames, n_dims)
                    )));
                }
                bin_index.push(i);
                weights.push(walker.weight);
                parent_ids.push(walker.parent_id);
                flat.extend(walker.pcoord.iter().copied());
            }
        }

        let pcoord = Array3::from_shape_vec((weights.len(), n_frames, n_dims), flat)
            .map_err(|e| WeError::InvalidInput(e.to_string()))?;
        Ok(WalkerArrays {
            bin_index,
            weights: Array1::from(weights),
            parent_ids,
            pcoord,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use is_close::is_close;
    use ndarray::array;

    fn walker(weight: f64, x: f64) -> Walker {
        Walker::from_trajectory(weight, vec![0.0, x]).unwrap()
    }

    #[test]
    fn test_ideal_weight() {
        let bin = Bin::with_walkers(4, vec![walker(0.1, 1.0), walker(0.3, 1.0)]);
        assert!(is_close!(bin.ideal_weight().unwrap(), 0.1));

        let empty_target = Bin::with_walkers(0, vec![walker(0.1, 1.0)]);
        assert!(matches!(
            empty_target.ideal_weight(),
            Err(WeError::Configuration(_))
        ));
    }

    #[test]
    fn test_rectilinear_placement() {
        let mut binning = Binning::rectilinear(vec![0.0, 1.0, 2.0, 3.0], 4).unwrap();
        assert_eq!(binning.len(), 3);

        assert_eq!(binning.place(walker(0.25, 0.5)).unwrap(), 0);
        assert_eq!(binning.place(walker(0.25, 1.0)).unwrap(), 1);
        assert_eq!(binning.place(walker(0.5, 2.9)).unwrap(), 2);
        assert!(binning.place(walker(0.1, 3.0)).is_err());

        assert_eq!(binning.n_walkers(), 3);
        assert!(is_close!(binning.total_weight(), 1.0));
    }

    #[test]
    fn test_arrays_round_trip_through_bins() {
        let pcoord = Array3::from_shape_fn((3, 2, 1), |(i, f, _)| i as f64 + 0.5 * f as f64);
        let binning = Binning::from_arrays(
            &[2, 1],
            &[1, 0, 1],
            array![0.2, 0.5, 0.3].view(),
            pcoord.view(),
            &[7, 8, 9],
        )
        .unwrap();

        assert_eq!(binning.bins[0].len(), 1);
        assert_eq!(binning.bins[1].len(), 2);
        assert_eq!(binning.bins[0].target_count, 2);
        assert_eq!(binning.bins[1].walkers[1].parent_id, 9);

        let arrays = binning.to_arrays((2, 1)).unwrap();
        assert_eq!(arrays.bin_index, vec![0, 1, 1]);
        assert_eq!(arrays.parent_ids, vec![8, 7, 9]);
        assert_eq!(arrays.weights, array![0.5, 0.2, 0.3]);
        assert_eq!(arrays.pcoord.dim(), (3, 2, 1));
        assert_eq!(arrays.pcoord[[0, 1, 0]], 1.5);
    }

    #[test]
    fn test_arrays_validation() {
        let pcoord = Array3::zeros((2, 1, 1));
        let weights = array![0.5, 0.5];
        // Bin 1 does not exist
        assert!(
            Binning::from_arrays(&[1], &[0, 1], weights.view(), pcoord.view(), &[0, 1]).is_err()
        );
        assert!(Binning::from_arrays(&[1], &[0], weights.view(), pcoord.view(), &[0, 1]).is_err());

        let empty = Binning::new(vec![Bin::new(2)]).to_arrays((3, 2)).unwrap();
        assert_eq!(empty.pcoord.dim(), (0, 3, 2));
        assert!(empty.bin_index.is_empty());
    }

    #[test]
    fn test_rectilinear_validation() {
        assert!(Binning::rectilinear(vec![0.0], 4).is_err());
        assert!(Binning::rectilinear(vec![0.0, 0.0], 4).is_err());
        assert!(Binning::new(vec![Bin::new(1)]).place(walker(1.0, 0.0)).is_err());
    }
}
