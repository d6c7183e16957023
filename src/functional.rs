//! Objective functionals over the design space.
use crate::vector::DesignVector;
use crate::Real;
use nalgebra::DVector;

/// A scalar output of the flow-and-shape system together with its first- and
/// second-order actions with respect to the design pair `(w, x)`.
///
/// Evaluations are pure with respect to the design; implementations that
/// cache intermediate results should do so behind interior mutability.
pub trait Functional<T: Real> {
    fn value(&self, design: &DesignVector<T>) -> T;

    fn gradient(&self, gradient: &mut DesignVector<T>, design: &DesignVector<T>);

    /// Hessian-vector product `out = ∇²f(design) · vector`.
    fn hess_vec(&self, out: &mut DesignVector<T>, vector: &DesignVector<T>, design: &DesignVector<T>);
}

impl<T, F> Functional<T> for &F
where
    T: Real,
    F: ?Sized + Functional<T>,
{
    fn value(&self, design: &DesignVector<T>) -> T {
        F::value(self, design)
    }

    fn gradient(&self, gradient: &mut DesignVector<T>, design: &DesignVector<T>) {
        F::gradient(self, gradient, design)
    }

    fn hess_vec(&self, out: &mut DesignVector<T>, vector: &DesignVector<T>, design: &DesignVector<T>) {
        F::hess_vec(self, out, vector, design)
    }
}

/// Tracking-type objective: mismatch against a target state plus Tikhonov
/// regularization of the control,
/// `f(w, x) = 1/2 ‖w − w̄‖² + α/2 ‖x − x̄‖²`.
///
/// This is the matching-pressure-distribution objective of inverse design,
/// with the regularization standing in for a shape-penalty term.
#[derive(Debug, Clone)]
pub struct TargetStateTracking<T: Real> {
    target_state: DVector<T>,
    control_reference: DVector<T>,
    regularization: T,
}

impl<T: Real> TargetStateTracking<T> {
    pub fn new(target_state: DVector<T>, control_reference: DVector<T>, regularization: T) -> Self {
        Self {
            target_state,
            control_reference,
            regularization,
        }
    }
}

impl<T: Real> Functional<T> for TargetStateTracking<T> {
    fn value(&self, design: &DesignVector<T>) -> T {
        let two = T::one() + T::one();
        let state_mismatch = (design.state() - &self.target_state).norm_squared();
        let control_deviation = (design.control() - &self.control_reference).norm_squared();
        (state_mismatch + self.regularization * control_deviation) / two
    }

    fn gradient(&self, gradient: &mut DesignVector<T>, design: &DesignVector<T>) {
        gradient.state_mut().copy_from(design.state());
        *gradient.state_mut() -= &self.target_state;
        gradient.control_mut().copy_from(design.control());
        *gradient.control_mut() -= &self.control_reference;
        *gradient.control_mut() *= self.regularization;
    }

    fn hess_vec(&self, out: &mut DesignVector<T>, vector: &DesignVector<T>, _design: &DesignVector<T>) {
        out.state_mut().copy_from(vector.state());
        out.control_mut().copy_from(vector.control());
        *out.control_mut() *= self.regularization;
    }
}
