//! Constrained minimisation over the probability simplex.
//!
//! Implements the spectral projected gradient method (Birgin, Martínez &
//! Raydan, 2000): each iteration takes a Barzilai–Borwein scaled gradient
//! step, projects it back onto the simplex and accepts it with an Armijo
//! backtracking line search. Every iterate satisfies `sum(w) = 1` and
//! `0 <= w_i <= 1`.
//!
//! # References
//!
//! Birgin, E. G., Martínez, J. M., & Raydan, M. (2000). Nonmonotone spectral
//! projected gradient methods on convex sets. SIAM Journal on Optimization,
//! 10(4), 1196-1211.
//!
//! Duchi, J., Shalev-Shwartz, S., Singer, Y., & Chandra, T. (2008). Efficient
//! projections onto the l1-ball for learning in high dimensions. ICML.

use crate::errors::{WeError, WeResult};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

const ARMIJO_FACTOR: f64 = 1e-4;
const MIN_STEP: f64 = 1e-10;
const MAX_STEP: f64 = 1e10;
const MAX_BACKTRACKS: usize = 60;

/// Euclidean projection of `v` onto `{w : w_i >= 0, sum(w) = 1}`.
///
/// ```rust
/// use ndarray::array;
/// use weer_core::reweight::optimizer::project_to_simplex;
///
/// let w = project_to_simplex(array![0.5, 1.5, -1.0].view());
/// assert_eq!(w, array![0.0, 1.0, 0.0]);
/// ```
pub fn project_to_simplex(v: ArrayView1<f64>) -> Array1<f64> {
    let n = v.len();
    if n == 0 {
        return Array1::zeros(0);
    }

    let mut sorted: Vec<f64> = v.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));

    let mut cumulative = 0.0;
    let mut theta = 0.0;
    for (j, &u) in sorted.iter().enumerate() {
        cumulative += u;
        let candidate = (cumulative - 1.0) / (j + 1) as f64;
        if u - candidate > 0.0 {
            theta = candidate;
        }
    }

    v.mapv(|x| (x - theta).max(0.0))
}

/// Result of a successful minimisation.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationOutcome {
    /// Minimiser on the simplex
    pub weights: Array1<f64>,
    /// Objective value at `weights`
    pub objective: f64,
    /// Number of accepted steps
    pub iterations: usize,
}

/// Spectral projected gradient minimiser on the probability simplex.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectedGradient {
    /// Maximum number of accepted steps before reporting non-convergence
    pub max_iterations: usize,
    /// Stationarity and relative objective-change tolerance
    pub tolerance: f64,
}

impl Default for ProjectedGradient {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            tolerance: 1e-9,
        }
    }
}

impl ProjectedGradient {
    pub fn new(max_iterations: usize, tolerance: f64) -> Self {
        Self {
            max_iterations,
            tolerance,
        }
    }

    /// Minimise `objective` over the simplex starting from `initial`.
    ///
    /// `initial` is projected onto the simplex first. Convergence is declared
    /// when the projected gradient `P(w - g) - w` vanishes (infinity norm at
    /// most `tolerance`), or when an accepted step changes the objective by
    /// less than `tolerance` relative to its magnitude.
    ///
    /// # Errors
    ///
    /// Returns [`WeError::Optimization`] when the objective is not finite at
    /// the starting point, the line search cannot find a decrease, or
    /// `max_iterations` steps are taken without converging.
    pub fn minimize<F, G>(
        &self,
        initial: ArrayView1<f64>,
        objective: F,
        gradient: G,
    ) -> WeResult<OptimizationOutcome>
    where
        F: Fn(ArrayView1<f64>) -> f64,
        G: Fn(ArrayView1<f64>) -> Array1<f64>,
    {
        if initial.is_empty() {
            return Err(WeError::InvalidInput(
                "Cannot optimise an empty weight vector".to_string(),
            ));
        }
        if initial.iter().any(|w| !w.is_finite()) {
            return Err(WeError::InvalidInput(
                "Initial weights must be finite".to_string(),
            ));
        }

        let mut x = project_to_simplex(initial);
        let mut fx = objective(x.view());
        let mut g = gradient(x.view());
        if !fx.is_finite() || g.iter().any(|v| !v.is_finite()) {
            return Err(WeError::Optimization {
                iterations: 0,
                reason: "objective is not finite at the initial point".to_string(),
            });
        }

        let mut step = 1.0;
        for iteration in 0..self.max_iterations {
            let stationarity = &project_to_simplex((&x - &g).view()) - &x;
            if inf_norm(stationarity.view()) <= self.tolerance {
                return Ok(OptimizationOutcome {
                    weights: x,
                    objective: fx,
                    iterations: iteration,
                });
            }

            let direction = &project_to_simplex((&x - &(&g * step)).view()) - &x;
            let slope = g.dot(&direction);
            // Predicted decrease is below what the tolerance can resolve
            if -slope <= self.tolerance * fx.abs().max(1.0) {
                return Ok(OptimizationOutcome {
                    weights: x,
                    objective: fx,
                    iterations: iteration,
                });
            }

            let mut lambda = 1.0;
            let mut accepted = None;
            for _ in 0..MAX_BACKTRACKS {
                let trial = &x + &(&direction * lambda);
                let f_trial = objective(trial.view());
                if f_trial.is_finite() && f_trial <= fx + ARMIJO_FACTOR * lambda * slope {
                    accepted = Some((trial, f_trial));
                    break;
                }
                lambda *= 0.5;
            }

            let (x_new, f_new) = accepted.ok_or_else(|| WeError::Optimization {
                iterations: iteration,
                reason: format!(
                    "line search failed to decrease the objective (projected gradient norm {:e})",
                    inf_norm(stationarity.view())
                ),
            })?;
            // Convex combinations of simplex points stay on the simplex up to rounding
            let x_new = project_to_simplex(x_new.view());
            let g_new = gradient(x_new.view());
            if g_new.iter().any(|v| !v.is_finite()) {
                return Err(WeError::Optimization {
                    iterations: iteration + 1,
                    reason: "gradient became non-finite".to_string(),
                });
            }

            let s = &x_new - &x;
            let y = &g_new - &g;
            let sy = s.dot(&y);
            step = if sy > 0.0 {
                (s.dot(&s) / sy).clamp(MIN_STEP, MAX_STEP)
            } else {
                MAX_STEP
            };

            let change = (fx - f_new).abs();
            x = x_new;
            g = g_new;
            let previous = fx;
            fx = f_new;

            if change <= self.tolerance * previous.abs().max(1.0) {
                return Ok(OptimizationOutcome {
                    weights: x,
                    objective: fx,
                    iterations: iteration + 1,
                });
            }
        }

        Err(WeError::Optimization {
            iterations: self.max_iterations,
            reason: format!(
                "did not converge (last objective {:e}, tolerance {:e})",
                fx, self.tolerance
            ),
        })
    }
}

fn inf_norm(v: ArrayView1<f64>) -> f64 {
    v.iter().fold(0.0, |acc: f64, x| acc.max(x.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use is_close::is_close;
    use ndarray::array;

    fn assert_on_simplex(w: &Array1<f64>) {
        assert!(w.iter().all(|&x| (0.0..=1.0).contains(&x)), "{:?}", w);
        assert!((w.sum() - 1.0).abs() < 1e-12, "sum {}", w.sum());
    }

    #[test]
    fn test_projection_of_simplex_point_is_identity() {
        let w = array![0.2, 0.3, 0.5];
        let p = project_to_simplex(w.view());
        for (a, b) in w.iter().zip(p.iter()) {
            assert!(is_close!(*a, *b));
        }
    }

    #[test]
    fn test_projection_shifts_uniformly() {
        let p = project_to_simplex(array![1.0, 1.0, 1.0, 1.0].view());
        assert_eq!(p, array![0.25, 0.25, 0.25, 0.25]);

        let p = project_to_simplex(array![0.9, 0.3, -5.0].view());
        assert!(is_close!(p[0], 0.8));
        assert!(is_close!(p[1], 0.2));
        assert_eq!(p[2], 0.0);
        assert_on_simplex(&p);
    }

    #[test]
    fn test_minimize_quadratic_interior() {
        // min |w - c|^2 with c on the simplex has the solution w = c
        let c = array![0.1, 0.6, 0.3];
        let outcome = ProjectedGradient::default()
            .minimize(
                array![1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0].view(),
                |w| (&w - &c).mapv(|d| d * d).sum(),
                |w| (&w - &c) * 2.0,
            )
            .unwrap();

        assert_on_simplex(&outcome.weights);
        for (a, b) in outcome.weights.iter().zip(c.iter()) {
            assert!((a - b).abs() < 1e-6, "{:?}", outcome.weights);
        }
    }

    #[test]
    fn test_minimize_linear_reaches_vertex() {
        let cost = array![3.0, 1.0, 2.0];
        let outcome = ProjectedGradient::default()
            .minimize(
                array![0.5, 0.25, 0.25].view(),
                |w| w.dot(&cost),
                |_| cost.clone(),
            )
            .unwrap();

        assert_on_simplex(&outcome.weights);
        assert!(is_close!(outcome.weights[1], 1.0));
        assert!(is_close!(outcome.objective, 1.0));
    }

    #[test]
    fn test_non_finite_start_fails() {
        let result = ProjectedGradient::default().minimize(
            array![0.5, 0.5].view(),
            |_| f64::INFINITY,
            |w| w.to_owned(),
        );
        assert!(matches!(result, Err(WeError::Optimization { iterations: 0, .. })));
    }

    #[test]
    fn test_iteration_budget_exhaustion_fails() {
        let c = array![0.1, 0.6, 0.3];
        let result = ProjectedGradient::new(0, 1e-12).minimize(
            array![1.0, 0.0, 0.0].view(),
            |w| (&w - &c).mapv(|d| d * d).sum(),
            |w| (&w - &c) * 2.0,
        );
        assert!(matches!(result, Err(WeError::Optimization { .. })));
    }

    #[test]
    fn test_empty_initial_weights() {
        let result = ProjectedGradient::default().minimize(
            Array1::<f64>::zeros(0).view(),
            |_| 0.0,
            |w| w.to_owned(),
        );
        assert!(matches!(result, Err(WeError::InvalidInput(_))));
    }
}
