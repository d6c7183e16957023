//! Target-complexity mesh size fields and joint h-p adaptation.
//!
//! Given per-cell error indicators and cell measures, these routines produce
//! a per-cell target size field `h` whose induced complexity
//! `Σ ((p+1)/h)^dim · measure` matches a requested budget, optionally
//! adjusting the per-cell polynomial order as well. The discretization layer
//! is only represented through the plain per-cell slices it hands over.
use crate::Real;
use numeric_literals::replace_float_literals;
use rayon::prelude::*;
use std::error::Error;
use std::fmt;
use std::fmt::Display;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeFieldError {
    /// The bisection bracket does not contain a strict sign change.
    InvalidBracket,
    /// The iteration cap was reached before the residual met the tolerance.
    ToleranceNotReached { iterations: usize },
}

impl Display for SizeFieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            SizeFieldError::InvalidBracket => {
                write!(f, "Bisection requires a strict sign change over the given bracket.")
            }
            SizeFieldError::ToleranceNotReached { iterations } => {
                write!(
                    f,
                    "Bisection failed to reach tolerance within {} iterations.",
                    iterations
                )
            }
        }
    }
}

impl Error for SizeFieldError {}

/// Root finding by bisection with a strict sign-change precondition.
///
/// Converges when `|f(x)| < 1e-6`, with an iteration cap of 1000. Both the
/// bracket violation and cap exhaustion are internal errors: the complexity
/// function handed in by the size-field routines is monotone, so a valid
/// bracket always exists for attainable targets.
#[replace_float_literals(T::from_f64(literal).unwrap())]
pub fn bisection<T: Real>(
    mut func: impl FnMut(T) -> T,
    mut lower_bound: T,
    mut upper_bound: T,
) -> Result<T, SizeFieldError> {
    let mut f_lb = func(lower_bound);
    let f_ub = func(upper_bound);
    if !(f_lb * f_ub < 0.0) {
        return Err(SizeFieldError::InvalidBracket);
    }

    let tolerance = 1e-6;
    let max_iter = 1000;

    let mut x = (lower_bound + upper_bound) / 2.0;
    let mut f_x = func(x);

    let mut i = 0;
    while f_x.abs() > tolerance && i < max_iter {
        if f_x * f_lb < 0.0 {
            upper_bound = x;
        } else {
            lower_bound = x;
            f_lb = f_x;
        }

        x = (lower_bound + upper_bound) / 2.0;
        f_x = func(x);
        i += 1;
    }

    if f_x.abs() > tolerance {
        return Err(SizeFieldError::ToleranceNotReached { iterations: i });
    }
    Ok(x)
}

/// Size-field solver for a mesh of the given spatial dimension.
///
/// The error model is `e ~ |B|^q h^(dim·q·(p+1)/2)` with the fixed exponent
/// `q = 2` of the underlying a-priori estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct SizeField<T> {
    dim: usize,
    error_exponent: T,
}

impl<T: Real + Send + Sync> SizeField<T> {
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn new(dim: usize) -> Self {
        assert!((1..=3).contains(&dim));
        Self {
            dim,
            error_exponent: 2.0,
        }
    }

    fn dim_t(&self) -> T {
        T::from_usize(self.dim).unwrap()
    }

    /// Closed-form size field for a uniform polynomial degree.
    ///
    /// Normalizes the indicator field so the resulting complexity matches
    /// the target exactly; no root finding is needed in the uniform case.
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn isotropic_uniform(
        &self,
        complexity: T,
        indicators: &[T],
        measures: &[T],
        poly_degree: T,
        h_field: &mut [T],
    ) {
        assert_eq!(indicators.len(), measures.len());
        assert_eq!(indicators.len(), h_field.len());
        let q = self.error_exponent;
        let exponent = 2.0 / ((poly_degree + 1.0) * q + 2.0);

        let integral = indicators
            .par_iter()
            .zip(measures.par_iter())
            .map(|(b, measure)| b.powf(exponent) * *measure)
            .reduce(|| T::zero(), |a, c| a + c);
        // complexity per cell grows with the polynomial order
        let integral = integral * (poly_degree + 1.0).powi(self.dim as i32);

        let constant = complexity / integral;
        let inverse_dim = -1.0 / self.dim_t();
        h_field
            .par_iter_mut()
            .zip(indicators.par_iter())
            .for_each(|(h, b)| {
                *h = (constant * b.powf(exponent)).powf(inverse_dim);
            });
    }

    /// `Σ ((p+1)/h)^dim · measure` over all cells.
    pub fn evaluate_complexity(&self, h_field: &[T], p_field: &[T], measures: &[T]) -> T {
        assert_eq!(h_field.len(), p_field.len());
        assert_eq!(h_field.len(), measures.len());
        h_field
            .par_iter()
            .zip(p_field.par_iter())
            .zip(measures.par_iter())
            .map(|((h, p), measure)| ((*p + T::one()) / *h).powi(self.dim as i32) * *measure)
            .reduce(|| T::zero(), |a, c| a + c)
    }

    /// Per-cell optimal size for a given complexity multiplier `lambda`.
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn update_h_optimal(&self, lambda: T, indicators: &[T], h_field: &mut [T], p_field: &[T]) {
        assert_eq!(indicators.len(), h_field.len());
        assert_eq!(indicators.len(), p_field.len());
        let q = self.error_exponent;
        let dim = self.dim as i32;
        h_field
            .par_iter_mut()
            .zip(indicators.par_iter())
            .zip(p_field.par_iter())
            .for_each(|((h, b), p)| {
                let denom = q * (*p + 1.0) + 2.0;
                let exponent = -1.0 / denom;
                let component = q * (*p + 1.0) / denom * *b / (*p + 1.0).powi(dim);
                *h = lambda * component.powf(exponent);
            });
    }

    /// Size field for a fixed (possibly non-uniform) polynomial field,
    /// matching the target complexity through bisection on the multiplier.
    ///
    /// Returns the converged multiplier; `h_field` holds the final sizes.
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn isotropic_h(
        &self,
        complexity: T,
        indicators: &[T],
        measures: &[T],
        h_field: &mut [T],
        p_field: &[T],
    ) -> Result<T, SizeFieldError> {
        let objective = |lambda: T| {
            self.update_h_optimal(lambda, indicators, h_field, p_field);
            self.evaluate_complexity(h_field, p_field, measures) - complexity
        };
        let lambda = bisection(objective, 0.0, 1000.0)?;

        self.update_h_optimal(lambda, indicators, h_field, p_field);
        Ok(lambda)
    }

    /// Joint h-p adaptation: solve the size field at the current orders,
    /// then greedily move each cell to whichever of `p−1, p, p+1` predicts
    /// the smallest local error at fixed local complexity.
    ///
    /// `indicators_coarser`/`indicators_finer` are the error constants for
    /// the order below and above the current one.
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn isotropic_hp(
        &self,
        complexity: T,
        indicators_coarser: &[T],
        indicators: &[T],
        indicators_finer: &[T],
        measures: &[T],
        h_field: &mut [T],
        p_field: &mut [T],
    ) -> Result<T, SizeFieldError> {
        assert_eq!(indicators_coarser.len(), indicators.len());
        assert_eq!(indicators_finer.len(), indicators.len());
        let lambda = self.isotropic_h(complexity, indicators, measures, h_field, p_field)?;

        let q = self.error_exponent;
        let dim = self.dim as i32;
        let dim_t = self.dim_t();

        let decisions: Vec<(T, T)> = (0..h_field.len())
            .into_par_iter()
            .map(|i| {
                let h = h_field[i];
                let p = p_field[i];

                let e_ref = indicators[i].abs().powf(q) * h.powf(dim_t * q * (p + 1.0) / 2.0);

                // local complexity is held fixed while the order moves
                let local_complexity = ((p + 1.0) / h).powi(dim);
                let local_width = local_complexity.powf(1.0 / dim_t);
                let h_coarser = p / local_width;
                let h_finer = (p + 2.0) / local_width;

                let e_coarser =
                    indicators_coarser[i].abs().powf(q) * h_coarser.powf(dim_t * q * p / 2.0);
                let e_finer =
                    indicators_finer[i].abs().powf(q) * h_finer.powf(dim_t * q * (p + 2.0) / 2.0);

                if e_coarser < e_ref && e_coarser <= e_finer {
                    (h_coarser, p - 1.0)
                } else if e_finer < e_ref && e_finer <= e_coarser {
                    (h_finer, p + 1.0)
                } else {
                    (h, p)
                }
            })
            .collect();

        for (i, (h, p)) in decisions.into_iter().enumerate() {
            h_field[i] = h;
            p_field[i] = p;
        }
        Ok(lambda)
    }
}
