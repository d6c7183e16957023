//! Matrix-free KKT operator and its Schur-complement block preconditioner.
//!
//! One outer optimization iteration solves the symmetric indefinite system
//!
//! ```text
//! [ H   Jᵀ ] [Δdesign]   [-∇L]
//! [ J   0  ] [Δλ     ] = [-c ]
//! ```
//!
//! where `H` is the Hessian of the Lagrangian and `J` the constraint
//! Jacobian. Neither block is ever assembled; both operators below evaluate
//! their action purely through [`Functional`] and [`FlowConstraint`] calls
//! at a frozen `(w, x, λ)`.
use crate::constraint::FlowConstraint;
use crate::functional::Functional;
use crate::secant::LbfgsSecant;
use crate::vector::{BlockLayout, DesignVector, KktVector};
use crate::Real;
use nalgebra::{DVector, DVectorView, DVectorViewMut};
use skoll_krylov::LinearOperator;
use std::cell::Cell;
use std::error::Error;

/// Counters for the work done inside a KKT solve.
///
/// Passed by reference through the operator call chain instead of living in
/// process-wide state; read out through the accessors after a solve.
#[derive(Debug, Default)]
pub struct SolveMetrics {
    kkt_applications: Cell<usize>,
    preconditioner_applications: Cell<usize>,
    forward_flow_solves: Cell<usize>,
    adjoint_flow_solves: Cell<usize>,
}

impl SolveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kkt_applications(&self) -> usize {
        self.kkt_applications.get()
    }

    pub fn preconditioner_applications(&self) -> usize {
        self.preconditioner_applications.get()
    }

    pub fn forward_flow_solves(&self) -> usize {
        self.forward_flow_solves.get()
    }

    pub fn adjoint_flow_solves(&self) -> usize {
        self.adjoint_flow_solves.get()
    }

    pub(crate) fn record_kkt_application(&self) {
        self.kkt_applications.set(self.kkt_applications.get() + 1);
    }

    pub(crate) fn record_preconditioner_application(&self) {
        self.preconditioner_applications.set(self.preconditioner_applications.get() + 1);
    }

    pub(crate) fn record_forward_flow_solve(&self) {
        self.forward_flow_solves.set(self.forward_flow_solves.get() + 1);
    }

    pub(crate) fn record_adjoint_flow_solve(&self) {
        self.adjoint_flow_solves.set(self.adjoint_flow_solves.get() + 1);
    }
}

/// The saddle-point operator, applied matrix-free.
///
/// The design block of the output is
/// `∇²f · v + (∂²(R·λ)) · v + Jᵀ v_λ`, the multiplier block is `J v`.
pub struct KktOperator<'a, T: Real, F, C> {
    functional: &'a F,
    constraint: &'a C,
    design: &'a DesignVector<T>,
    multiplier: &'a DVector<T>,
    metrics: &'a SolveMetrics,
    layout: BlockLayout,
}

impl<'a, T, F, C> KktOperator<'a, T, F, C>
where
    T: Real,
    F: Functional<T>,
    C: FlowConstraint<T>,
{
    pub fn new(
        functional: &'a F,
        constraint: &'a C,
        design: &'a DesignVector<T>,
        multiplier: &'a DVector<T>,
        metrics: &'a SolveMetrics,
    ) -> Self {
        let layout = design.layout();
        assert_eq!(layout.n_state, constraint.state_dimension());
        assert_eq!(layout.n_control, constraint.control_dimension());
        assert_eq!(multiplier.len(), layout.n_state);
        Self {
            functional,
            constraint,
            design,
            multiplier,
            metrics,
            layout,
        }
    }
}

impl<'a, T, F, C> LinearOperator<T> for KktOperator<'a, T, F, C>
where
    T: Real,
    F: Functional<T>,
    C: FlowConstraint<T>,
{
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error>> {
        self.metrics.record_kkt_application();

        let mut src = KktVector::zeros(self.layout);
        self.layout.read_kkt(x, &mut src);
        let mut dst = KktVector::zeros(self.layout);
        let mut temp = DesignVector::zeros(self.layout);

        // Top block: Hessian of the Lagrangian times the design direction
        self.functional.hess_vec(dst.design_mut(), src.design(), self.design);
        self.constraint
            .apply_adjoint_hessian(&mut temp, self.multiplier, src.design(), self.design);
        dst.design_mut().axpy(T::one(), &temp);

        // Top block: adjoint Jacobian times the multiplier direction
        self.constraint
            .apply_adjoint_jacobian(&mut temp, src.multiplier(), self.design);
        dst.design_mut().axpy(T::one(), &temp);

        // Bottom block: Jacobian times the design direction (the zero block
        // contributes nothing)
        self.constraint
            .apply_jacobian(dst.multiplier_mut(), src.design(), self.design);

        self.layout.write_kkt(&dst, y);
        Ok(())
    }
}

/// Approximate inverse of the KKT operator by block elimination.
///
/// Eliminates the state and multiplier blocks through linearized flow solves
/// and applies the secant inverse-Hessian on the reduced (control) residual:
///
/// 1. adjoint solve `Aᵀ z = r_state` for the multiplier update,
/// 2. reduced residual `r_control − Bᵀ z`,
/// 3. secant action in place of the true reduced Hessian inverse,
/// 4. back-substitution `A Δw = r_constraint − B Δx` for the state update.
///
/// The elimination drops the Hessian cross terms, so even with an exact
/// reduced Hessian this is approximate. Because the secant model changes
/// between outer iterations and the inner solves may themselves be inexact,
/// the preconditioner is non-stationary and must be used inside a flexible
/// Krylov method.
pub struct SchurComplementPreconditioner<'a, T: Real, C> {
    constraint: &'a C,
    design: &'a DesignVector<T>,
    secant: &'a LbfgsSecant<T>,
    metrics: &'a SolveMetrics,
    layout: BlockLayout,
}

impl<'a, T, C> SchurComplementPreconditioner<'a, T, C>
where
    T: Real,
    C: FlowConstraint<T>,
{
    pub fn new(
        constraint: &'a C,
        design: &'a DesignVector<T>,
        secant: &'a LbfgsSecant<T>,
        metrics: &'a SolveMetrics,
    ) -> Self {
        let layout = design.layout();
        assert_eq!(layout.n_state, constraint.state_dimension());
        assert_eq!(layout.n_control, constraint.control_dimension());
        Self {
            constraint,
            design,
            secant,
            metrics,
            layout,
        }
    }
}

impl<'a, T, C> LinearOperator<T> for SchurComplementPreconditioner<'a, T, C>
where
    T: Real,
    C: FlowConstraint<T>,
{
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error>> {
        self.metrics.record_preconditioner_application();

        let mut src = KktVector::zeros(self.layout);
        self.layout.read_kkt(x, &mut src);
        let mut dst = KktVector::zeros(self.layout);

        // Multiplier update from the adjoint flow solve on the state residual
        let mut z = DVector::zeros(self.layout.n_state);
        self.constraint.solve_adjoint_flow(&mut z, src.design().state(), self.design)?;
        self.metrics.record_adjoint_flow_solve();

        // Reduced residual on the control space
        let mut reduced = DVector::zeros(self.layout.n_control);
        self.constraint
            .apply_adjoint_jacobian_control(&mut reduced, &z, self.design);
        reduced *= -T::one();
        reduced += src.design().control();

        // Secant inverse-Hessian stands in for the reduced Hessian inverse
        self.secant.apply_h(dst.design_mut().control_mut(), &reduced);

        // Back-substitute the state block through a forward flow solve on
        // the constraint-block right-hand side
        let mut state_rhs = src.multiplier().clone_owned();
        let mut jacobian_control_step = DVector::zeros(self.layout.n_state);
        self.constraint
            .apply_jacobian_control(&mut jacobian_control_step, dst.design().control(), self.design);
        state_rhs -= &jacobian_control_step;
        let mut state_step = DVector::zeros(self.layout.n_state);
        self.constraint
            .solve_linearized_flow(&mut state_step, &state_rhs, self.design)?;
        self.metrics.record_forward_flow_solve();
        dst.design_mut().state_mut().copy_from(&state_step);

        dst.multiplier_mut().copy_from(&z);

        self.layout.write_kkt(&dst, y);
        Ok(())
    }
}
