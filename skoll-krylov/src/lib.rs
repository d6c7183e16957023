//! Matrix-free Krylov machinery for saddle-point and flow-solve systems.
//!
//! The solvers here operate on abstract [`LinearOperator`]s so that
//! applications can plug in operators whose action is only available through
//! collaborator calls (Jacobian-vector products, preconditioner sweeps)
//! without ever assembling a matrix.
use nalgebra::base::constraint::AreMultipliable;
use nalgebra::constraint::{DimEq, ShapeConstraint};
use nalgebra::storage::Storage;
use nalgebra::{ClosedAdd, ClosedMul, DVectorView, DVectorViewMut, Dim, Dyn, Matrix, RealField, Scalar, U1};
use nalgebra_sparse::ops::serial::spmm_csr_dense;
use nalgebra_sparse::ops::Op;
use nalgebra_sparse::CsrMatrix;
use num::{One, Zero};
use std::error::Error;

pub mod fgmres;

pub use fgmres::{FgmresOutput, FgmresWorkspace, FlexibleGmres, SolveError, SolveErrorKind};

/// The action `y = Ax` of a linear map, evaluated matrix-free.
pub trait LinearOperator<T: Scalar> {
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error>>;
}

impl<'a, T, A> LinearOperator<T> for &'a A
where
    T: Scalar,
    A: ?Sized + LinearOperator<T>,
{
    fn apply(&self, y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error>> {
        <A as LinearOperator<T>>::apply(self, y, x)
    }
}

impl<T, R, C, S> LinearOperator<T> for Matrix<T, R, C, S>
where
    T: Scalar + One + Zero + ClosedMul + ClosedAdd,
    R: Dim,
    C: Dim,
    S: Storage<T, R, C>,
    ShapeConstraint: DimEq<Dyn, R> + DimEq<C, Dyn> + AreMultipliable<R, C, Dyn, U1>,
{
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error>> {
        y.gemv(T::one(), self, &x, T::zero());
        Ok(())
    }
}

impl<T> LinearOperator<T> for CsrMatrix<T>
where
    T: Scalar + Zero + One + ClosedMul + ClosedAdd,
{
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error>> {
        spmm_csr_dense(T::zero(), &mut y, T::one(), Op::NoOp(self), Op::NoOp(&x));
        Ok(())
    }
}

pub struct IdentityOperator;

impl<T: Scalar> LinearOperator<T> for IdentityOperator {
    fn apply(&self, mut y: DVectorViewMut<T>, x: DVectorView<T>) -> Result<(), Box<dyn Error>> {
        y.copy_from(&x);
        Ok(())
    }
}

/// Convergence test for the (implicitly available) GMRES residual.
///
/// Unlike a stationary method, GMRES carries its residual norm as a scalar
/// by-product of the Givens least-squares update, so criteria are evaluated
/// against that scalar rather than a residual vector.
pub trait GmresStoppingCriterion<T: Scalar> {
    fn has_converged(&self, b_norm: T, iteration: usize, approx_residual_norm: T) -> Result<bool, SolveErrorKind>;
}

/// Relative residual tolerance `||r|| <= tol * ||b||`.
///
/// The residual used is GMRES' recurred residual norm. After many iterations
/// without restart the recurred value can drift from the true residual; for
/// the modest iteration counts of an outer optimization solve this is not a
/// concern in practice.
#[derive(Debug)]
pub struct RelativeResidualCriterion<T: Scalar> {
    tol: T,
}

impl<T: Scalar> RelativeResidualCriterion<T> {
    pub fn new(tol: T) -> Self {
        Self { tol }
    }
}

impl Default for RelativeResidualCriterion<f64> {
    fn default() -> Self {
        Self::new(1e-8)
    }
}

impl Default for RelativeResidualCriterion<f32> {
    fn default() -> Self {
        Self::new(1e-4)
    }
}

impl<T> GmresStoppingCriterion<T> for RelativeResidualCriterion<T>
where
    T: RealField,
{
    fn has_converged(&self, b_norm: T, _iteration: usize, approx_residual_norm: T) -> Result<bool, SolveErrorKind> {
        Ok(approx_residual_norm <= self.tol.clone() * b_norm)
    }
}
