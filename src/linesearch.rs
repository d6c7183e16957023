//! Line search on the merit function.
use crate::Real;
use itertools::iterate;
use log::{debug, warn};
use numeric_literals::replace_float_literals;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::fmt::Display;

/// Curvature test applied on top of the sufficient-decrease condition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CurvatureCondition {
    /// Sufficient decrease only (Armijo backtracking).
    None,
    /// `φ'(α) ≥ c2 φ'(0)`
    Wolfe,
    /// `|φ'(α)| ≤ c2 |φ'(0)|`
    StrongWolfe,
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineSearchSettings<T> {
    /// Sufficient-decrease constant `c1`.
    pub sufficient_decrease: T,
    /// Curvature constant `c2`.
    pub curvature_constant: T,
    pub condition: CurvatureCondition,
    /// Budget of merit-function evaluations for one search.
    pub max_evaluations: usize,
    /// On budget exhaustion, accept the last trial step instead of failing
    /// the iteration.
    pub accept_last_alpha: bool,
    /// Step lengths below this are treated as a failed search.
    pub min_step: T,
}

impl<T: Real> Default for LineSearchSettings<T> {
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    fn default() -> Self {
        Self {
            sufficient_decrease: 1e-4,
            curvature_constant: 0.9,
            condition: CurvatureCondition::StrongWolfe,
            max_evaluations: 20,
            accept_last_alpha: false,
            min_step: 1e-8,
        }
    }
}

#[derive(Debug)]
pub enum LineSearchError {
    /// No acceptable step length above the configured minimum.
    StepTooSmall,
    /// The evaluation budget ran out before an acceptable step was found.
    EvaluationBudgetExhausted { max_evaluations: usize },
}

impl Display for LineSearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            LineSearchError::StepTooSmall => {
                write!(f, "Failed to find an acceptable step length above the minimum step.")
            }
            LineSearchError::EvaluationBudgetExhausted { max_evaluations } => {
                write!(
                    f,
                    "Line search exhausted its evaluation budget ({}) without an acceptable step.",
                    max_evaluations
                )
            }
        }
    }
}

impl Error for LineSearchError {}

#[derive(Debug, Clone)]
pub struct LineSearchResult<T> {
    pub alpha: T,
    pub merit_value: T,
    pub num_value_evaluations: usize,
    pub num_gradient_evaluations: usize,
}

/// Backtracking search for a step length satisfying sufficient decrease and,
/// optionally, a Wolfe-type curvature condition on the merit function.
///
/// `phi` evaluates the merit function along the step, `dphi` its directional
/// derivative; `phi_zero`/`dphi_zero` are their values at `α = 0`. The step
/// lengths tried start near the full step and decrease slowly at first, then
/// geometrically.
#[replace_float_literals(T::from_f64(literal).unwrap())]
pub fn backtracking_merit_line_search<T: Real>(
    mut phi: impl FnMut(T) -> T,
    mut dphi: impl FnMut(T) -> T,
    phi_zero: T,
    dphi_zero: T,
    settings: &LineSearchSettings<T>,
) -> Result<LineSearchResult<T>, LineSearchError> {
    if dphi_zero >= T::zero() {
        warn!(
            "Merit directional derivative {} is non-negative; searching along a non-descent direction",
            dphi_zero
        );
    }

    let initial_alphas = [1.0, 0.75, 0.5];
    let mut alpha_iter = initial_alphas
        .iter()
        .copied()
        .chain(iterate(0.25, |alpha_i| 0.25 * *alpha_i));

    let mut num_value_evaluations = 0;
    let mut num_gradient_evaluations = 0;
    let mut last: Option<(T, T)> = None;

    loop {
        let alpha = alpha_iter.next().unwrap();

        if num_value_evaluations >= settings.max_evaluations {
            return match (settings.accept_last_alpha, last) {
                (true, Some((alpha, merit_value))) => {
                    warn!(
                        "Line search budget exhausted; accepting last trial step {} as configured",
                        alpha
                    );
                    Ok(LineSearchResult {
                        alpha,
                        merit_value,
                        num_value_evaluations,
                        num_gradient_evaluations,
                    })
                }
                _ => Err(LineSearchError::EvaluationBudgetExhausted {
                    max_evaluations: settings.max_evaluations,
                }),
            };
        }
        if alpha < settings.min_step {
            return Err(LineSearchError::StepTooSmall);
        }

        let merit_value = phi(alpha);
        num_value_evaluations += 1;
        last = Some((alpha, merit_value));

        let sufficient_decrease =
            merit_value <= phi_zero + settings.sufficient_decrease * alpha * dphi_zero;
        if !sufficient_decrease {
            continue;
        }

        let curvature_ok = match settings.condition {
            CurvatureCondition::None => true,
            CurvatureCondition::Wolfe => {
                let slope = dphi(alpha);
                num_gradient_evaluations += 1;
                slope >= settings.curvature_constant * dphi_zero
            }
            CurvatureCondition::StrongWolfe => {
                let slope = dphi(alpha);
                num_gradient_evaluations += 1;
                slope.abs() <= settings.curvature_constant * dphi_zero.abs()
            }
        };
        if curvature_ok {
            debug!("Line search accepted step length {}", alpha);
            return Ok(LineSearchResult {
                alpha,
                merit_value,
                num_value_evaluations,
                num_gradient_evaluations,
            });
        }
    }
}
