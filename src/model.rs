//! A self-contained model flow problem.
//!
//! A 1-D steady advection–diffusion residual with a quadratic state
//! nonlinearity and a smooth, low-dimensional control-to-source map:
//!
//! ```text
//! R(w, x) = A₀ w + γ (w ∘ w) − S x − f₀
//! ```
//!
//! `A₀` is the upwinded advection–diffusion operator on a uniform interior
//! grid, `S` injects a handful of shape parameters into a dense source field
//! through smooth cosine bumps (the same few-controls-to-dense-field shape a
//! boundary parametrization has), and `γ` controls the strength of the
//! nonlinearity. Every [`FlowConstraint`] action has a closed form, which
//! makes the model the reference problem for the optimization tests.
use crate::constraint::FlowConstraint;
use crate::vector::{BlockLayout, DesignVector};
use crate::Real;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::ops::serial::spmm_csr_dense;
use nalgebra_sparse::ops::Op;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use numeric_literals::replace_float_literals;
use std::error::Error;

#[derive(Debug, Clone)]
pub struct ChannelFlowModel<T: Real> {
    n_state: usize,
    n_control: usize,
    nonlinearity: T,
    system: CsrMatrix<T>,
    system_adjoint: CsrMatrix<T>,
    source_basis: DMatrix<T>,
    baseline_forcing: DVector<T>,
}

impl<T: Real> ChannelFlowModel<T> {
    /// Build the model on `n_state` interior grid points with `n_control`
    /// source parameters.
    ///
    /// `advection` must be non-negative; the first-order term is upwinded
    /// against it.
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn new(n_state: usize, n_control: usize, diffusivity: T, advection: T, nonlinearity: T) -> Self {
        assert!(n_state > 1);
        assert!(n_control >= 1);
        assert!(advection >= 0.0);
        let h = 1.0 / T::from_usize(n_state + 1).unwrap();
        let diffusion_coeff = diffusivity / (h * h);
        let advection_coeff = advection / h;

        let mut coo = CooMatrix::new(n_state, n_state);
        for i in 0..n_state {
            coo.push(i, i, 2.0 * diffusion_coeff + advection_coeff);
            if i > 0 {
                coo.push(i, i - 1, -diffusion_coeff - advection_coeff);
            }
            if i + 1 < n_state {
                coo.push(i, i + 1, -diffusion_coeff);
            }
        }
        let system = CsrMatrix::from(&coo);
        let system_adjoint = system.transpose();

        // Smooth compactly-supported cosine bumps spread over the interior,
        // one per control parameter.
        let width = 1.5 / T::from_usize(n_control + 1).unwrap();
        let mut source_basis = DMatrix::zeros(n_state, n_control);
        for j in 0..n_control {
            let center = T::from_usize(j + 1).unwrap() / T::from_usize(n_control + 1).unwrap();
            for i in 0..n_state {
                let t = T::from_usize(i + 1).unwrap() * h;
                let distance = (t - center).abs();
                if distance < width {
                    source_basis[(i, j)] = 0.5 * (1.0 + (T::pi() * distance / width).cos());
                }
            }
        }

        let baseline_forcing = DVector::from_fn(n_state, |i, _| {
            let t = T::from_usize(i + 1).unwrap() * h;
            (T::pi() * t).sin()
        });

        Self {
            n_state,
            n_control,
            nonlinearity,
            system,
            system_adjoint,
            source_basis,
            baseline_forcing,
        }
    }

    pub fn layout(&self) -> BlockLayout {
        BlockLayout::new(self.n_state, self.n_control)
    }

    fn spmv(matrix: &CsrMatrix<T>, out: &mut DVector<T>, v: &DVector<T>) {
        spmm_csr_dense(T::zero(), &mut *out, T::one(), Op::NoOp(matrix), Op::NoOp(v));
    }

    /// Dense linearized operator `A(w) = A₀ + 2γ diag(w)`, assembled for the
    /// direct factorization path. The model dimensions are modest enough
    /// that an LU factorization per solve is the simplest honest stand-in
    /// for the linearized flow solver.
    fn linearized_matrix(&self, design: &DesignVector<T>) -> DMatrix<T> {
        let two = T::one() + T::one();
        let mut matrix = DMatrix::zeros(self.n_state, self.n_state);
        for (i, j, value) in self.system.triplet_iter() {
            matrix[(i, j)] = *value;
        }
        for i in 0..self.n_state {
            matrix[(i, i)] += two * self.nonlinearity * design.state()[i];
        }
        matrix
    }
}

impl<T: Real> FlowConstraint<T> for ChannelFlowModel<T> {
    fn state_dimension(&self) -> usize {
        self.n_state
    }

    fn control_dimension(&self) -> usize {
        self.n_control
    }

    fn value(&self, residual: &mut DVector<T>, design: &DesignVector<T>) {
        Self::spmv(&self.system, residual, design.state());
        *residual += &design.state().component_mul(design.state()) * self.nonlinearity;
        residual.gemv(-T::one(), &self.source_basis, design.control(), T::one());
        *residual -= &self.baseline_forcing;
    }

    fn apply_jacobian_state(&self, out: &mut DVector<T>, v: &DVector<T>, design: &DesignVector<T>) {
        let two = T::one() + T::one();
        Self::spmv(&self.system, out, v);
        *out += &design.state().component_mul(v) * (two * self.nonlinearity);
    }

    fn apply_jacobian_control(&self, out: &mut DVector<T>, v: &DVector<T>, _design: &DesignVector<T>) {
        out.gemv(-T::one(), &self.source_basis, v, T::zero());
    }

    fn apply_adjoint_jacobian_state(&self, out: &mut DVector<T>, dual: &DVector<T>, design: &DesignVector<T>) {
        let two = T::one() + T::one();
        Self::spmv(&self.system_adjoint, out, dual);
        *out += &design.state().component_mul(dual) * (two * self.nonlinearity);
    }

    fn apply_adjoint_jacobian_control(&self, out: &mut DVector<T>, dual: &DVector<T>, _design: &DesignVector<T>) {
        out.gemv_tr(-T::one(), &self.source_basis, dual, T::zero());
    }

    fn solve_linearized_flow(
        &self,
        out: &mut DVector<T>,
        rhs: &DVector<T>,
        design: &DesignVector<T>,
    ) -> Result<(), Box<dyn Error>> {
        match self.linearized_matrix(design).lu().solve(rhs) {
            Some(solution) => {
                out.copy_from(&solution);
                Ok(())
            }
            None => Err(Box::from("linearized flow operator is singular")),
        }
    }

    fn solve_adjoint_flow(
        &self,
        out: &mut DVector<T>,
        rhs: &DVector<T>,
        design: &DesignVector<T>,
    ) -> Result<(), Box<dyn Error>> {
        match self.linearized_matrix(design).transpose().lu().solve(rhs) {
            Some(solution) => {
                out.copy_from(&solution);
                Ok(())
            }
            None => Err(Box::from("adjoint flow operator is singular")),
        }
    }

    fn apply_adjoint_hessian(
        &self,
        out: &mut DesignVector<T>,
        multiplier: &DVector<T>,
        v: &DesignVector<T>,
        _design: &DesignVector<T>,
    ) {
        // Only ∂²R/∂w² is nonzero, and it is the constant diagonal 2γ
        let two = T::one() + T::one();
        out.state_mut()
            .copy_from(&(multiplier.component_mul(v.state()) * (two * self.nonlinearity)));
        out.control_mut().fill(T::zero());
    }
}
