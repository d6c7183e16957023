//! Augmented-Lagrangian merit function for globalizing the full-space step.
use crate::constraint::FlowConstraint;
use crate::functional::Functional;
use crate::vector::DesignVector;
use crate::Real;
use nalgebra::DVector;

/// `L_A(w, x) = f(w, x) + λ·R(w, x) + ρ/2 ‖R(w, x)‖²`
///
/// The multiplier estimate and penalty are frozen between `reset` calls, so
/// within one line search the merit function is a plain scalar function of
/// the design.
pub struct AugmentedLagrangian<'a, T: Real, F, C> {
    functional: &'a F,
    constraint: &'a C,
    multiplier: DVector<T>,
    penalty: T,
}

impl<'a, T, F, C> AugmentedLagrangian<'a, T, F, C>
where
    T: Real,
    F: Functional<T>,
    C: FlowConstraint<T>,
{
    pub fn new(functional: &'a F, constraint: &'a C, multiplier: DVector<T>, penalty: T) -> Self {
        assert_eq!(multiplier.len(), constraint.state_dimension());
        Self {
            functional,
            constraint,
            multiplier,
            penalty,
        }
    }

    /// Install a new multiplier estimate and penalty for the next search.
    pub fn reset(&mut self, multiplier: &DVector<T>, penalty: T) {
        self.multiplier.copy_from(multiplier);
        self.penalty = penalty;
    }

    pub fn penalty(&self) -> T {
        self.penalty
    }

    pub fn value(&self, design: &DesignVector<T>) -> T {
        let two = T::one() + T::one();
        let mut residual = DVector::zeros(self.constraint.state_dimension());
        self.constraint.value(&mut residual, design);
        self.functional.value(design)
            + self.multiplier.dot(&residual)
            + self.penalty * residual.norm_squared() / two
    }

    /// `∇L_A = ∇f + Jᵀ (λ + ρ R)`
    pub fn gradient(&self, gradient: &mut DesignVector<T>, design: &DesignVector<T>) {
        let mut residual = DVector::zeros(self.constraint.state_dimension());
        self.constraint.value(&mut residual, design);
        let mut scaled_dual = residual;
        scaled_dual *= self.penalty;
        scaled_dual += &self.multiplier;

        self.functional.gradient(gradient, design);
        let mut adjoint_term = DesignVector::zeros(design.layout());
        self.constraint.apply_adjoint_jacobian(&mut adjoint_term, &scaled_dual, design);
        gradient.axpy(T::one(), &adjoint_term);
    }

    /// Directional derivative of the merit function along a combined
    /// primal-dual step: the gradient paired with the design direction plus
    /// the residual paired with the multiplier direction.
    pub fn directional_derivative(
        &self,
        design: &DesignVector<T>,
        design_direction: &DesignVector<T>,
        multiplier_direction: &DVector<T>,
    ) -> T {
        let mut gradient = DesignVector::zeros(design.layout());
        self.gradient(&mut gradient, design);
        let mut residual = DVector::zeros(self.constraint.state_dimension());
        self.constraint.value(&mut residual, design);
        gradient.dot(design_direction) + residual.dot(multiplier_direction)
    }
}
