//! Limited-memory quasi-Newton approximation of the reduced Hessian.
//!
//! The full-space step only ever needs curvature information on the control
//! (reduced) space, where it stands in for the reduced Hessian inside the
//! Schur-complement preconditioner. The approximation is the standard
//! limited-memory BFGS model: a bounded history of `(s, y)` pairs with the
//! two-loop recursion for the inverse action.
use crate::Real;
use log::debug;
use nalgebra::DVector;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
struct CurvaturePair<T> {
    s: DVector<T>,
    y: DVector<T>,
    rho: T,
}

#[derive(Debug, Clone)]
pub struct LbfgsSecant<T> {
    memory: usize,
    history: VecDeque<CurvaturePair<T>>,
}

impl<T: Real> LbfgsSecant<T> {
    pub fn new(memory: usize) -> Self {
        assert!(memory > 0, "secant memory must be positive");
        Self {
            memory,
            history: VecDeque::with_capacity(memory),
        }
    }

    /// Number of stored curvature pairs.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Drop all stored curvature pairs. The next `apply_h` acts as a scaled
    /// identity.
    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Apply the inverse-Hessian approximation, `out = H v`, via the
    /// two-loop recursion.
    ///
    /// With an empty history this is the identity; otherwise the initial
    /// matrix is scaled by `s·y / y·y` of the most recent pair.
    pub fn apply_h(&self, out: &mut DVector<T>, v: &DVector<T>) {
        assert_eq!(out.len(), v.len());
        out.copy_from(v);
        if self.history.is_empty() {
            return;
        }

        let mut alphas = Vec::with_capacity(self.history.len());
        for pair in self.history.iter().rev() {
            let alpha = pair.rho * pair.s.dot(out);
            out.axpy(-alpha, &pair.y, T::one());
            alphas.push(alpha);
        }

        let newest = self.history.back().unwrap();
        let gamma = newest.s.dot(&newest.y) / newest.y.dot(&newest.y);
        *out *= gamma;

        for (pair, alpha) in self.history.iter().zip(alphas.into_iter().rev()) {
            let beta = pair.rho * pair.y.dot(out);
            out.axpy(alpha - beta, &pair.s, T::one());
        }
    }

    /// Record the curvature observed over one accepted step on the reduced
    /// space.
    ///
    /// Pairs with insufficient curvature `s·y` are rejected rather than
    /// stored, since they would destroy positive definiteness of the model.
    #[allow(clippy::float_cmp)]
    pub fn update_storage(
        &mut self,
        gradient_new: &DVector<T>,
        gradient_old: &DVector<T>,
        step: &DVector<T>,
        iteration: usize,
    ) {
        assert_eq!(gradient_new.len(), gradient_old.len());
        assert_eq!(gradient_new.len(), step.len());

        let y = gradient_new - gradient_old;
        let sy = step.dot(&y);
        let curvature_floor = T::from_f64(1e-10).unwrap();
        if sy <= curvature_floor {
            debug!(
                "Skipping secant update at iteration {}: curvature s.y = {} below floor",
                iteration, sy
            );
            return;
        }

        if self.history.len() == self.memory {
            self.history.pop_front();
        }
        self.history.push_back(CurvaturePair {
            s: step.clone(),
            y,
            rho: T::one() / sy,
        });
    }
}
