//! Python bindings for reweighting and profile analysis.
//!
//! Exposed as `weer._lib.core`. Arrays cross the boundary as numpy arrays;
//! candidate trajectories are a 2-D array of shape `(n_walkers, n_frames)`.
//! The population controller takes full trajectories as a 3-D array of shape
//! `(n_walkers, n_frames, n_dims)`.

use crate::bin::Binning;
use crate::config::ResamplerConfig;
use crate::controller::{PopulationController, WeDriver};
use crate::errors::WeError;
use crate::observer::LogObserver;
use crate::pdist;
use crate::reweight::divergence::{self, CandidateSamples};
use crate::reweight::histogram;
use crate::reweight::{self, ReferenceDistribution, DEFAULT_BIN_COUNT, DEFAULT_EPSILON};
use numpy::{
    IntoPyArray, PyArray1, PyArray3, PyReadonlyArray1, PyReadonlyArray2, PyReadonlyArray3,
};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use std::sync::Arc;

impl From<WeError> for PyErr {
    fn from(e: WeError) -> Self {
        match e {
            WeError::InvalidInput(_) | WeError::Configuration(_) => {
                PyValueError::new_err(e.to_string())
            }
            WeError::Optimization { .. } | WeError::Consistency(_) => {
                PyRuntimeError::new_err(e.to_string())
            }
        }
    }
}

fn candidate_from_array(candidate: &PyReadonlyArray2<'_, f64>) -> PyResult<CandidateSamples> {
    let trajectories = candidate
        .as_array()
        .rows()
        .into_iter()
        .map(|row| row.to_vec())
        .collect();
    Ok(CandidateSamples::from_trajectories(trajectories)?)
}

/// Equal-width histogram of `samples`.
///
/// Returns `(values, edges)` like `numpy.histogram`.
#[pyfunction]
#[pyo3(signature = (samples, bin_count=DEFAULT_BIN_COUNT, weights=None, normalize=true))]
fn build_histogram<'py>(
    py: Python<'py>,
    samples: PyReadonlyArray1<'py, f64>,
    bin_count: usize,
    weights: Option<PyReadonlyArray1<'py, f64>>,
    normalize: bool,
) -> PyResult<(Bound<'py, PyArray1<f64>>, Bound<'py, PyArray1<f64>>)> {
    let samples = samples.as_array().to_vec();
    let weights = weights.map(|w| w.as_array().to_vec());
    let hist = histogram::build_histogram(&samples, bin_count, weights.as_deref(), normalize)?;
    Ok((
        hist.values.into_pyarray_bound(py),
        hist.edges.edges().into_pyarray_bound(py),
    ))
}

/// KL divergence of the weighted candidate from the reference.
#[pyfunction]
#[pyo3(signature = (weights, reference, candidate, bin_count=DEFAULT_BIN_COUNT, epsilon=DEFAULT_EPSILON))]
fn kl_divergence(
    weights: PyReadonlyArray1<'_, f64>,
    reference: PyReadonlyArray1<'_, f64>,
    candidate: PyReadonlyArray2<'_, f64>,
    bin_count: usize,
    epsilon: f64,
) -> PyResult<f64> {
    let candidate = candidate_from_array(&candidate)?;
    Ok(divergence::kl_divergence(
        &weights.as_array().to_vec(),
        &reference.as_array().to_vec(),
        &candidate,
        bin_count,
        epsilon,
    )?)
}

/// Weights on the probability simplex minimising the KL divergence.
///
/// Raises `RuntimeError` when the optimiser does not converge.
#[pyfunction]
#[pyo3(signature = (reference, initial_weights, candidate, bin_count=DEFAULT_BIN_COUNT, epsilon=DEFAULT_EPSILON))]
fn optimize_weights<'py>(
    py: Python<'py>,
    reference: PyReadonlyArray1<'py, f64>,
    initial_weights: PyReadonlyArray1<'py, f64>,
    candidate: PyReadonlyArray2<'py, f64>,
    bin_count: usize,
    epsilon: f64,
) -> PyResult<Bound<'py, PyArray1<f64>>> {
    let candidate = candidate_from_array(&candidate)?;
    let weights = reweight::optimize_weights(
        &reference.as_array().to_vec(),
        &initial_weights.as_array().to_vec(),
        &candidate,
        bin_count,
        epsilon,
    )?;
    Ok(weights.into_pyarray_bound(py))
}

/// Weighted probability distribution in kT: returns `(midpoints, free_energy)`.
#[pyfunction]
#[pyo3(signature = (pcoord, weights, bin_count=DEFAULT_BIN_COUNT))]
fn free_energy_profile<'py>(
    py: Python<'py>,
    pcoord: PyReadonlyArray2<'py, f64>,
    weights: PyReadonlyArray1<'py, f64>,
    bin_count: usize,
) -> PyResult<(Bound<'py, PyArray1<f64>>, Bound<'py, PyArray1<f64>>)> {
    let trajectories = candidate_from_array(&pcoord)?;
    let profile =
        pdist::free_energy_profile(&trajectories, &weights.as_array().to_vec(), bin_count)?;
    Ok((
        profile.midpoints.into_pyarray_bound(py),
        profile.values.into_pyarray_bound(py),
    ))
}

/// Population controller driven from flat per-walker arrays.
///
/// `config` is a TOML document as accepted by `ResamplerConfig`; defaults
/// apply when it is omitted. `reference` holds the reference samples used
/// when reweighting is enabled.
#[pyclass]
#[pyo3(name = "PopulationController")]
#[derive(Debug)]
pub struct PyPopulationController(pub PopulationController);

#[pymethods]
impl PyPopulationController {
    #[new]
    #[pyo3(signature = (config=None, reference=None))]
    fn new(config: Option<String>, reference: Option<PyReadonlyArray1<'_, f64>>) -> PyResult<Self> {
        let config = match config {
            Some(s) => ResamplerConfig::from_toml_str(&s)?,
            None => ResamplerConfig::default(),
        };
        let mut controller = PopulationController::new(config)?;
        if let Some(reference) = reference {
            let reference = ReferenceDistribution::new(reference.as_array().to_vec())?;
            controller = controller.with_reference(Arc::new(reference));
        }
        Ok(Self(controller))
    }

    /// The active configuration as TOML.
    #[getter]
    fn config(&self) -> PyResult<String> {
        Ok(self.0.config().to_toml_string()?)
    }

    /// Resample one iteration.
    ///
    /// Walker `i` has weight `weights[i]`, trajectory `pcoord[i]` of shape
    /// `(n_frames, n_dims)` and lives in bin `bin_index[i]`. Returns
    /// `(bin_index, weights, parent_ids, pcoord)` for the resampled walkers.
    #[allow(clippy::type_complexity)]
    fn run_iteration<'py>(
        &self,
        py: Python<'py>,
        target_counts: Vec<usize>,
        bin_index: Vec<usize>,
        weights: PyReadonlyArray1<'py, f64>,
        pcoord: PyReadonlyArray3<'py, f64>,
        parent_ids: Vec<i64>,
    ) -> PyResult<(
        Vec<usize>,
        Bound<'py, PyArray1<f64>>,
        Vec<i64>,
        Bound<'py, PyArray3<f64>>,
    )> {
        let pcoord = pcoord.as_array();
        let (_, n_frames, n_dims) = pcoord.dim();
        let mut binning = Binning::from_arrays(
            &target_counts,
            &bin_index,
            weights.as_array(),
            pcoord,
            &parent_ids,
        )?;
        self.0.run_iteration(&mut binning, &LogObserver)?;

        let arrays = binning.to_arrays((n_frames, n_dims))?;
        Ok((
            arrays.bin_index,
            arrays.weights.into_pyarray_bound(py),
            arrays.parent_ids,
            arrays.pcoord.into_pyarray_bound(py),
        ))
    }

    fn __repr__(&self) -> String {
        format!("{:?}", self.0.config())
    }
}

#[pymodule]
pub fn core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(build_histogram, m)?)?;
    m.add_function(wrap_pyfunction!(kl_divergence, m)?)?;
    m.add_function(wrap_pyfunction!(optimize_weights, m)?)?;
    m.add_function(wrap_pyfunction!(free_energy_profile, m)?)?;
    m.add_class::<PyPopulationController>()?;
    Ok(())
}
