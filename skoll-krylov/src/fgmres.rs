//! Flexible GMRES.
//!
//! Right-preconditioned GMRES in which the preconditioner may change from one
//! application to the next (Saad's FGMRES). This is the correct outer Krylov
//! method when the preconditioner itself contains inner iterative solves or a
//! quasi-Newton approximation whose action is not a fixed linear map.
use crate::{GmresStoppingCriterion, IdentityOperator, LinearOperator};
use core::fmt;
use nalgebra::{DVector, DVectorView, DVectorViewMut, RealField, Scalar};
use num::Zero;
use std::error::Error;
use std::ops::{Deref, DerefMut};

/// Reusable storage for the Arnoldi bases and small least-squares factors.
///
/// FGMRES keeps two bases: the orthonormal Krylov basis `V` and the
/// preconditioned directions `Z` the solution is assembled from.
#[derive(Debug, Clone)]
pub struct FgmresWorkspace<T: Scalar> {
    basis: Vec<DVector<T>>,
    precond_basis: Vec<DVector<T>>,
    hessenberg_cols: Vec<Vec<T>>,
    givens: Vec<(T, T)>,
    rhs_rot: Vec<T>,
    w: DVector<T>,
}

impl<T: Scalar + Zero> Default for FgmresWorkspace<T> {
    fn default() -> Self {
        Self {
            basis: Vec::new(),
            precond_basis: Vec::new(),
            hessenberg_cols: Vec::new(),
            givens: Vec::new(),
            rhs_rot: Vec::new(),
            w: DVector::zeros(0),
        }
    }
}

impl<T: Scalar + Zero> FgmresWorkspace<T> {
    fn clear(&mut self, dim: usize) {
        self.basis.clear();
        self.precond_basis.clear();
        self.hessenberg_cols.clear();
        self.givens.clear();
        self.rhs_rot.clear();
        self.w.resize_vertically_mut(dim, T::zero());
    }
}

#[derive(Debug)]
enum OwnedOrMutRef<'a, T> {
    Owned(T),
    MutRef(&'a mut T),
}

impl<'a, T> Deref for OwnedOrMutRef<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Owned(owned) => owned,
            Self::MutRef(mutref) => mutref,
        }
    }
}

impl<'a, T> DerefMut for OwnedOrMutRef<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Self::Owned(owned) => owned,
            Self::MutRef(mutref) => mutref,
        }
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum SolveErrorKind {
    OperatorError(Box<dyn Error>),
    PreconditionerError(Box<dyn Error>),
    StoppingCriterionError(Box<dyn Error>),
    /// The least-squares factor became singular, which indicates a singular
    /// or numerically rank-deficient operator.
    SingularOperator,
    MaxIterationsReached {
        max_iter: usize,
    },
}

impl fmt::Display for SolveErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OperatorError(err) => {
                write!(f, "Error applying operator: ")?;
                err.fmt(f)
            }
            Self::PreconditionerError(err) => {
                write!(f, "Error applying preconditioner: ")?;
                err.fmt(f)
            }
            Self::StoppingCriterionError(err) => {
                write!(f, "Error evaluating stopping criterion: ")?;
                err.fmt(f)
            }
            Self::SingularOperator => write!(f, "Operator appears to be singular."),
            Self::MaxIterationsReached { max_iter } => {
                write!(f, "Max iterations ({}) reached.", max_iter)
            }
        }
    }
}

#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct FgmresOutput<T> {
    /// Number of Arnoldi iterations, i.e. the dimension of the Krylov
    /// subspace the returned solution was assembled from.
    pub num_iterations: usize,
    /// The recurred residual norm associated with the returned solution.
    pub residual_norm: T,
}

#[non_exhaustive]
#[derive(Debug)]
pub struct SolveError<T> {
    /// Diagnostics for the best available iterate. On
    /// [`SolveErrorKind::MaxIterationsReached`] that iterate has already
    /// been written back to the solution vector, so callers may absorb the
    /// failure and proceed with it.
    pub output: FgmresOutput<T>,
    pub kind: SolveErrorKind,
}

impl<T> SolveError<T> {
    fn new(output: FgmresOutput<T>, kind: SolveErrorKind) -> Self {
        Self { output, kind }
    }
}

impl<T: fmt::Display> fmt::Display for SolveError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FGMRES solve failed after {} iterations. ", self.output.num_iterations)?;
        write!(f, "Error: {}", self.kind)
    }
}

impl<T: fmt::Debug + fmt::Display> std::error::Error for SolveError<T> {}

/// y = Ax
fn apply_operator<'a, T, A>(
    y: impl Into<DVectorViewMut<'a, T>>,
    a: &'a A,
    x: impl Into<DVectorView<'a, T>>,
) -> Result<(), Box<dyn Error>>
where
    T: Scalar,
    A: LinearOperator<T>,
{
    a.apply(y.into(), x.into())
}

/// Flexible GMRES solver with builder-style configuration.
///
/// ```
/// use skoll_krylov::{FlexibleGmres, RelativeResidualCriterion};
/// use nalgebra::{DMatrix, DVector};
///
/// let a = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
/// let b = DVector::from_column_slice(&[1.0, 2.0]);
/// let mut x = DVector::zeros(2);
/// FlexibleGmres::new()
///     .with_operator(&a)
///     .with_stopping_criterion(RelativeResidualCriterion::default())
///     .solve_with_guess(&b, &mut x)
///     .unwrap();
/// ```
#[derive(Debug)]
pub struct FlexibleGmres<'a, T, A, P, Criterion>
where
    T: Scalar,
{
    workspace: OwnedOrMutRef<'a, FgmresWorkspace<T>>,
    operator: A,
    preconditioner: P,
    stopping_criterion: Criterion,
    max_iter: Option<usize>,
}

impl<'a, T: Scalar + Zero> FlexibleGmres<'a, T, (), IdentityOperator, ()> {
    pub fn new() -> Self {
        Self {
            workspace: OwnedOrMutRef::Owned(FgmresWorkspace::default()),
            operator: (),
            preconditioner: IdentityOperator,
            stopping_criterion: (),
            max_iter: None,
        }
    }

    pub fn with_workspace(workspace: &'a mut FgmresWorkspace<T>) -> Self {
        Self {
            workspace: OwnedOrMutRef::MutRef(workspace),
            operator: (),
            preconditioner: IdentityOperator,
            stopping_criterion: (),
            max_iter: None,
        }
    }
}

impl<'a, T: Scalar, P, Criterion> FlexibleGmres<'a, T, (), P, Criterion> {
    pub fn with_operator<A>(self, operator: A) -> FlexibleGmres<'a, T, A, P, Criterion> {
        FlexibleGmres {
            workspace: self.workspace,
            operator,
            preconditioner: self.preconditioner,
            stopping_criterion: self.stopping_criterion,
            max_iter: self.max_iter,
        }
    }
}

impl<'a, T: Scalar, A, P, Criterion> FlexibleGmres<'a, T, A, P, Criterion> {
    pub fn with_preconditioner<P2>(self, preconditioner: P2) -> FlexibleGmres<'a, T, A, P2, Criterion> {
        FlexibleGmres {
            workspace: self.workspace,
            operator: self.operator,
            preconditioner,
            stopping_criterion: self.stopping_criterion,
            max_iter: self.max_iter,
        }
    }

    pub fn with_max_iter(self, max_iter: usize) -> Self {
        Self {
            max_iter: Some(max_iter),
            ..self
        }
    }
}

impl<'a, T: Scalar, A, P> FlexibleGmres<'a, T, A, P, ()> {
    pub fn with_stopping_criterion<Criterion>(
        self,
        stopping_criterion: Criterion,
    ) -> FlexibleGmres<'a, T, A, P, Criterion> {
        FlexibleGmres {
            workspace: self.workspace,
            operator: self.operator,
            preconditioner: self.preconditioner,
            stopping_criterion,
            max_iter: self.max_iter,
        }
    }
}

impl<'a, T, A, P, Criterion> FlexibleGmres<'a, T, A, P, Criterion>
where
    T: RealField + Copy,
    A: LinearOperator<T>,
    P: LinearOperator<T>,
    Criterion: GmresStoppingCriterion<T>,
{
    pub fn solve_with_guess<'b>(
        &mut self,
        b: impl Into<DVectorView<'b, T>>,
        x: impl Into<DVectorViewMut<'b, T>>,
    ) -> Result<FgmresOutput<T>, SolveError<T>> {
        self.solve_with_guess_(b.into(), x.into())
    }

    fn solve_with_guess_(&mut self, b: DVectorView<T>, mut x: DVectorViewMut<T>) -> Result<FgmresOutput<T>, SolveError<T>> {
        use SolveErrorKind::*;
        assert_eq!(b.len(), x.len());
        let dim = x.len();

        let mut output = FgmresOutput {
            num_iterations: 0,
            residual_norm: T::zero(),
        };

        let b_norm = b.norm();
        if b_norm == T::zero() {
            x.fill(T::zero());
            return Ok(output);
        }

        let ws = &mut *self.workspace;
        ws.clear(dim);

        // r = b - Ax
        if let Err(err) = apply_operator(&mut ws.w, &self.operator, &x) {
            return Err(SolveError::new(output, OperatorError(err)));
        }
        let mut r = b.clone_owned();
        r.axpy(-T::one(), &ws.w, T::one());

        let beta = r.norm();
        output.residual_norm = beta;
        match self.stopping_criterion.has_converged(b_norm, 0, beta) {
            Ok(true) => return Ok(output),
            Ok(false) => {}
            Err(kind) => return Err(SolveError::new(output, kind)),
        }

        r /= beta;
        ws.basis.push(r);
        ws.rhs_rot.push(beta);

        // The Krylov subspace of a `dim`-dimensional problem is exhausted
        // after `dim` iterations, so that bounds the solve when no explicit
        // cap is configured.
        let max_iter = self.max_iter.unwrap_or(dim).min(dim).max(1);

        loop {
            let j = output.num_iterations;

            // z_j = P v_j, w = A z_j
            let mut z = DVector::zeros(dim);
            if let Err(err) = apply_operator(&mut z, &self.preconditioner, &ws.basis[j]) {
                return Err(SolveError::new(output, PreconditionerError(err)));
            }
            if let Err(err) = apply_operator(&mut ws.w, &self.operator, &z) {
                return Err(SolveError::new(output, OperatorError(err)));
            }
            ws.precond_basis.push(z);

            // Modified Gram-Schmidt against the current basis
            let mut h_col = Vec::with_capacity(j + 2);
            for v_i in ws.basis.iter() {
                let h_ij = ws.w.dot(v_i);
                ws.w.axpy(-h_ij, v_i, T::one());
                h_col.push(h_ij);
            }
            let h_next = ws.w.norm();
            h_col.push(h_next);

            // Accumulated Givens rotations keep the factor triangular
            for (i, &(c, s)) in ws.givens.iter().enumerate() {
                let hi = h_col[i];
                let hi1 = h_col[i + 1];
                h_col[i] = c * hi + s * hi1;
                h_col[i + 1] = -s * hi + c * hi1;
            }
            let (c, s) = givens_rotation(h_col[j], h_col[j + 1]);
            h_col[j] = c * h_col[j] + s * h_col[j + 1];
            h_col[j + 1] = T::zero();
            ws.givens.push((c, s));

            let g_j = ws.rhs_rot[j];
            ws.rhs_rot[j] = c * g_j;
            ws.rhs_rot.push(-s * g_j);

            ws.hessenberg_cols.push(h_col);
            output.num_iterations = j + 1;
            output.residual_norm = ws.rhs_rot[j + 1].abs();

            let convergence = self
                .stopping_criterion
                .has_converged(b_norm, output.num_iterations, output.residual_norm);
            let has_converged = match convergence {
                Ok(converged) => converged,
                Err(kind) => return Err(SolveError::new(output, kind)),
            };

            // An exact invariant subspace (happy breakdown) leaves nothing
            // to extend the basis with; the assembled iterate is then exact.
            let breakdown = h_next == T::zero();

            if has_converged || breakdown {
                return match assemble_solution(ws, &mut x) {
                    Ok(()) => Ok(output),
                    Err(kind) => Err(SolveError::new(output, kind)),
                };
            }
            if output.num_iterations >= max_iter {
                // Write back the best least-squares iterate so the caller
                // can proceed with it despite the convergence failure.
                return match assemble_solution(ws, &mut x) {
                    Ok(()) => Err(SolveError::new(output, MaxIterationsReached { max_iter })),
                    Err(kind) => Err(SolveError::new(output, kind)),
                };
            }

            let v_next = &ws.w / h_next;
            ws.basis.push(v_next);
        }
    }
}

/// Back-substitute the triangular least-squares system and accumulate the
/// solution update `x += Z y`.
fn assemble_solution<T: RealField + Copy>(
    ws: &mut FgmresWorkspace<T>,
    x: &mut DVectorViewMut<T>,
) -> Result<(), SolveErrorKind> {
    let k = ws.hessenberg_cols.len();
    let mut y = vec![T::zero(); k];
    for i in (0..k).rev() {
        let mut sum = ws.rhs_rot[i];
        for j in (i + 1)..k {
            sum -= ws.hessenberg_cols[j][i] * y[j];
        }
        let diag = ws.hessenberg_cols[i][i];
        if diag == T::zero() {
            return Err(SolveErrorKind::SingularOperator);
        }
        y[i] = sum / diag;
    }
    for (y_j, z_j) in y.iter().zip(ws.precond_basis.iter()) {
        x.axpy(*y_j, z_j, T::one());
    }
    Ok(())
}

fn givens_rotation<T: RealField + Copy>(a: T, b: T) -> (T, T) {
    if b == T::zero() {
        (T::one(), T::zero())
    } else {
        let r = (a * a + b * b).sqrt();
        (a / r, b / r)
    }
}
