//! The flow-residual equality constraint `R(w, x) = 0`.
//!
//! The constraint Jacobian splits into a state block `A = ∂R/∂w` (assumed
//! invertible at every iterate the optimizer visits) and a control block
//! `B = ∂R/∂x`. All second-order information enters through the
//! adjoint-Hessian contraction with the current multiplier.
use crate::vector::DesignVector;
use crate::Real;
use nalgebra::DVector;
use std::error::Error;

pub trait FlowConstraint<T: Real> {
    fn state_dimension(&self) -> usize;

    fn control_dimension(&self) -> usize;

    /// Evaluate the flow residual `R(w, x)` into `residual`.
    fn value(&self, residual: &mut DVector<T>, design: &DesignVector<T>);

    /// `out = A v`
    fn apply_jacobian_state(&self, out: &mut DVector<T>, v: &DVector<T>, design: &DesignVector<T>);

    /// `out = B v`
    fn apply_jacobian_control(&self, out: &mut DVector<T>, v: &DVector<T>, design: &DesignVector<T>);

    /// `out = Aᵀ w`
    fn apply_adjoint_jacobian_state(&self, out: &mut DVector<T>, dual: &DVector<T>, design: &DesignVector<T>);

    /// `out = Bᵀ w`
    fn apply_adjoint_jacobian_control(&self, out: &mut DVector<T>, dual: &DVector<T>, design: &DesignVector<T>);

    /// Linearized forward flow solve `out = A⁻¹ rhs`.
    fn solve_linearized_flow(
        &self,
        out: &mut DVector<T>,
        rhs: &DVector<T>,
        design: &DesignVector<T>,
    ) -> Result<(), Box<dyn Error>>;

    /// Linearized adjoint flow solve `out = A⁻ᵀ rhs`.
    fn solve_adjoint_flow(
        &self,
        out: &mut DVector<T>,
        rhs: &DVector<T>,
        design: &DesignVector<T>,
    ) -> Result<(), Box<dyn Error>>;

    /// `out = (∂(Jᵀ multiplier)/∂design) · v`, the constraint second-order
    /// term contracted with a multiplier.
    fn apply_adjoint_hessian(
        &self,
        out: &mut DesignVector<T>,
        multiplier: &DVector<T>,
        v: &DesignVector<T>,
        design: &DesignVector<T>,
    );

    /// `out = J v = A v_state + B v_control`
    fn apply_jacobian(&self, out: &mut DVector<T>, v: &DesignVector<T>, design: &DesignVector<T>) {
        self.apply_jacobian_state(out, v.state(), design);
        let mut bv = DVector::zeros(self.state_dimension());
        self.apply_jacobian_control(&mut bv, v.control(), design);
        *out += &bv;
    }

    /// `out = Jᵀ w = (Aᵀ w, Bᵀ w)`
    fn apply_adjoint_jacobian(&self, out: &mut DesignVector<T>, dual: &DVector<T>, design: &DesignVector<T>) {
        self.apply_adjoint_jacobian_state(out.state_mut(), dual, design);
        self.apply_adjoint_jacobian_control(out.control_mut(), dual, design);
    }
}

impl<T, C> FlowConstraint<T> for &C
where
    T: Real,
    C: ?Sized + FlowConstraint<T>,
{
    fn state_dimension(&self) -> usize {
        C::state_dimension(self)
    }

    fn control_dimension(&self) -> usize {
        C::control_dimension(self)
    }

    fn value(&self, residual: &mut DVector<T>, design: &DesignVector<T>) {
        C::value(self, residual, design)
    }

    fn apply_jacobian_state(&self, out: &mut DVector<T>, v: &DVector<T>, design: &DesignVector<T>) {
        C::apply_jacobian_state(self, out, v, design)
    }

    fn apply_jacobian_control(&self, out: &mut DVector<T>, v: &DVector<T>, design: &DesignVector<T>) {
        C::apply_jacobian_control(self, out, v, design)
    }

    fn apply_adjoint_jacobian_state(&self, out: &mut DVector<T>, dual: &DVector<T>, design: &DesignVector<T>) {
        C::apply_adjoint_jacobian_state(self, out, dual, design)
    }

    fn apply_adjoint_jacobian_control(&self, out: &mut DVector<T>, dual: &DVector<T>, design: &DesignVector<T>) {
        C::apply_adjoint_jacobian_control(self, out, dual, design)
    }

    fn solve_linearized_flow(
        &self,
        out: &mut DVector<T>,
        rhs: &DVector<T>,
        design: &DesignVector<T>,
    ) -> Result<(), Box<dyn Error>> {
        C::solve_linearized_flow(self, out, rhs, design)
    }

    fn solve_adjoint_flow(
        &self,
        out: &mut DVector<T>,
        rhs: &DVector<T>,
        design: &DesignVector<T>,
    ) -> Result<(), Box<dyn Error>> {
        C::solve_adjoint_flow(self, out, rhs, design)
    }

    fn apply_adjoint_hessian(
        &self,
        out: &mut DesignVector<T>,
        multiplier: &DVector<T>,
        v: &DesignVector<T>,
        design: &DesignVector<T>,
    ) {
        C::apply_adjoint_hessian(self, out, multiplier, v, design)
    }
}
