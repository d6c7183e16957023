//! Finite-difference helpers and first-order consistency checks.
//!
//! These are validation tools: they confirm that a constraint's hand-coded
//! Jacobian actions, adjoints and linearized solves agree with each other
//! and with finite differences, before that constraint is trusted inside a
//! KKT solve.
use crate::constraint::FlowConstraint;
use crate::vector::DesignVector;
use crate::Real;
use nalgebra::DVector;
use numeric_literals::replace_float_literals;
use std::error::Error;

/// Approximate the gradient of a scalar function over the design space with
/// central finite differences of resolution `h`.
#[replace_float_literals(T::from_f64(literal).unwrap())]
pub fn approximate_design_gradient_fd<T: Real>(
    mut f: impl FnMut(&DesignVector<T>) -> T,
    design: &DesignVector<T>,
    h: T,
) -> DesignVector<T> {
    let layout = design.layout();
    let mut gradient = DesignVector::zeros(layout);
    let mut perturbed = design.clone();

    for i in 0..layout.n_state {
        let base = perturbed.state()[i];
        perturbed.state_mut()[i] = base + h;
        let f_plus = f(&perturbed);
        perturbed.state_mut()[i] = base - h;
        let f_minus = f(&perturbed);
        perturbed.state_mut()[i] = base;
        gradient.state_mut()[i] = (f_plus - f_minus) / (2.0 * h);
    }
    for i in 0..layout.n_control {
        let base = perturbed.control()[i];
        perturbed.control_mut()[i] = base + h;
        let f_plus = f(&perturbed);
        perturbed.control_mut()[i] = base - h;
        let f_minus = f(&perturbed);
        perturbed.control_mut()[i] = base;
        gradient.control_mut()[i] = (f_plus - f_minus) / (2.0 * h);
    }
    gradient
}

/// Discrepancy `|w·(Jv) − v·(Jᵀw)|` between the Jacobian action and its
/// adjoint for the given probe vectors. Zero (to rounding) for a consistent
/// adjoint implementation.
pub fn check_adjoint_consistency_jacobian<T, C>(
    constraint: &C,
    design: &DesignVector<T>,
    v: &DesignVector<T>,
    w: &DVector<T>,
) -> T
where
    T: Real,
    C: FlowConstraint<T>,
{
    let mut jv = DVector::zeros(constraint.state_dimension());
    constraint.apply_jacobian(&mut jv, v, design);
    let mut jtw = DesignVector::zeros(design.layout());
    constraint.apply_adjoint_jacobian(&mut jtw, w, design);
    (w.dot(&jv) - v.dot(&jtw)).abs()
}

/// Relative round-trip defect `‖v − A⁻¹(A v)‖ / ‖v‖` of the linearized flow
/// Jacobian and its inverse solve.
pub fn check_inverse_jacobian_round_trip<T, C>(
    constraint: &C,
    design: &DesignVector<T>,
    v: &DVector<T>,
) -> Result<T, Box<dyn Error>>
where
    T: Real,
    C: FlowConstraint<T>,
{
    let mut av = DVector::zeros(constraint.state_dimension());
    constraint.apply_jacobian_state(&mut av, v, design);
    let mut round_trip = DVector::zeros(constraint.state_dimension());
    constraint.solve_linearized_flow(&mut round_trip, &av, design)?;
    round_trip -= v;
    Ok(round_trip.norm() / v.norm())
}

/// Relative round-trip defect of the adjoint pair `A⁻ᵀ(Aᵀ w)`.
pub fn check_adjoint_inverse_round_trip<T, C>(
    constraint: &C,
    design: &DesignVector<T>,
    w: &DVector<T>,
) -> Result<T, Box<dyn Error>>
where
    T: Real,
    C: FlowConstraint<T>,
{
    let mut atw = DVector::zeros(constraint.state_dimension());
    constraint.apply_adjoint_jacobian_state(&mut atw, w, design);
    let mut round_trip = DVector::zeros(constraint.state_dimension());
    constraint.solve_adjoint_flow(&mut round_trip, &atw, design)?;
    round_trip -= w;
    Ok(round_trip.norm() / w.norm())
}
