//! One full-space optimization iteration in the simultaneous-analysis-and-
//! design (Biros–Ghattas) manner.
//!
//! Each outer iteration performs exactly one inexact KKT solve for a
//! combined `(Δdesign, Δλ)` step, globalizes it with an augmented-Lagrangian
//! merit function and a line search, and advances the persistent design and
//! multiplier. State and control are never separated into nested solves; the
//! flow equations are only satisfied in the limit.
use crate::constraint::FlowConstraint;
use crate::driver::BoundConstraint;
use crate::functional::Functional;
use crate::kkt::{KktOperator, SchurComplementPreconditioner, SolveMetrics};
use crate::linesearch::{backtracking_merit_line_search, LineSearchError, LineSearchSettings};
use crate::merit::AugmentedLagrangian;
use crate::secant::LbfgsSecant;
use crate::vector::{DesignVector, KktVector};
use crate::Real;
use log::{debug, warn};
use nalgebra::{DVector, DVectorView};
use numeric_literals::replace_float_literals;
use serde::{Deserialize, Serialize};
use skoll_krylov::{FlexibleGmres, RelativeResidualCriterion, SolveErrorKind};
use std::error::Error;
use std::fmt;
use std::fmt::Display;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullSpaceSettings<T> {
    /// Relative residual tolerance for the inexact KKT solve.
    pub kkt_relative_tolerance: T,
    /// Iteration cap for the KKT solve. Exhausting it is not fatal; the
    /// iteration proceeds with the best available approximate step.
    pub kkt_max_iterations: usize,
    /// Offset added to the raw penalty so it strictly increases across
    /// iterations.
    pub penalty_offset: T,
    /// Number of curvature pairs retained by the reduced-space secant.
    pub secant_memory: usize,
    pub line_search: LineSearchSettings<T>,
}

impl<T: Real> Default for FullSpaceSettings<T> {
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    fn default() -> Self {
        Self {
            kkt_relative_tolerance: 1e-6,
            kkt_max_iterations: 200,
            penalty_offset: 1e-4,
            secant_memory: 10,
            line_search: LineSearchSettings::default(),
        }
    }
}

/// Running counters and norms for one optimization run.
#[derive(Debug, Clone, Serialize)]
pub struct AlgorithmState<T> {
    pub iteration: usize,
    pub objective_value: T,
    /// Norm of the Lagrangian gradient at the current iterate.
    pub gradient_norm: T,
    pub constraint_norm: T,
    pub step_norm: T,
    pub step_length: T,
    pub penalty: T,
    pub kkt_iterations: usize,
    pub kkt_residual_norm: T,
    pub num_objective_evaluations: usize,
    pub num_gradient_evaluations: usize,
}

impl<T: Real> AlgorithmState<T> {
    pub fn new() -> Self {
        Self {
            iteration: 0,
            objective_value: T::zero(),
            gradient_norm: T::zero(),
            constraint_norm: T::zero(),
            step_norm: T::zero(),
            step_length: T::zero(),
            penalty: T::one(),
            kkt_iterations: 0,
            kkt_residual_norm: T::zero(),
            num_objective_evaluations: 0,
            num_gradient_evaluations: 0,
        }
    }
}

impl<T: Real> Default for AlgorithmState<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub enum StepError {
    /// The KKT solve failed for a structural reason (as opposed to plain
    /// non-convergence, which is absorbed).
    KktSolveFailed(SolveErrorKind),
    /// A linearized flow solve outside the KKT iteration failed.
    FlowSolveFailed(Box<dyn Error>),
    /// The line search failed to produce an acceptable step.
    LineSearchFailed(LineSearchError),
}

impl Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            StepError::KktSolveFailed(kind) => {
                write!(f, "KKT solve failed. Error: {}", kind)
            }
            StepError::FlowSolveFailed(err) => {
                write!(f, "Linearized flow solve failed. Error: {}", err)
            }
            StepError::LineSearchFailed(err) => {
                write!(f, "Line search failed. Error: {}", err)
            }
        }
    }
}

impl Error for StepError {}

/// Penalty parameter for the augmented-Lagrangian merit function.
///
/// Biros and Ghattas 2005, Part II, equation (2.10), with one deliberate
/// deviation: the positive offset is applied outside the fraction. Near a
/// stationary point both the numerator and denominator can be small and
/// negative, and an offset inside the fraction can then yield a large
/// negative penalty; the merit parameter must instead stay positive and grow
/// toward infinity. A non-positive raw value falls back to `1.0`.
#[replace_float_literals(T::from_f64(literal).unwrap())]
pub fn compute_augmented_lagrangian_penalty<T, C>(
    search_direction: &DesignVector<T>,
    multiplier_direction: &DVector<T>,
    design: &DesignVector<T>,
    objective_gradient: &DesignVector<T>,
    constraint_value: &DVector<T>,
    adjoint_jacobian_multiplier: &DesignVector<T>,
    constraint: &C,
    offset: T,
) -> T
where
    T: Real,
    C: FlowConstraint<T>,
{
    let mut penalty = objective_gradient.dot(search_direction);
    penalty += adjoint_jacobian_multiplier.dot(search_direction);
    penalty += constraint_value.dot(multiplier_direction);

    let mut jacobian_search_direction = DVector::zeros(constraint.state_dimension());
    constraint.apply_jacobian(&mut jacobian_search_direction, search_direction, design);
    let denominator = jacobian_search_direction.dot(constraint_value);
    penalty /= denominator;

    if penalty > 0.0 {
        penalty += offset;
    } else {
        debug!("Non-positive raw penalty {}; falling back to 1.0", penalty);
        penalty = 1.0;
    }
    penalty
}

/// The full-space step object: owns the secant model, the penalty estimate
/// and the solve metrics that persist across outer iterations.
pub struct FullSpaceStep<T: Real> {
    settings: FullSpaceSettings<T>,
    secant: LbfgsSecant<T>,
    penalty: T,
    previous_reduced_gradient: Option<DVector<T>>,
    metrics: SolveMetrics,
}

impl<T: Real> FullSpaceStep<T> {
    pub fn new(settings: FullSpaceSettings<T>) -> Self {
        let secant = LbfgsSecant::new(settings.secant_memory);
        Self {
            settings,
            secant,
            penalty: T::one(),
            previous_reduced_gradient: None,
            metrics: SolveMetrics::new(),
        }
    }

    pub fn settings(&self) -> &FullSpaceSettings<T> {
        &self.settings
    }

    pub fn metrics(&self) -> &SolveMetrics {
        &self.metrics
    }

    pub fn penalty(&self) -> T {
        self.penalty
    }

    /// `out = Jᵀ λ + ∇f`
    fn lagrangian_gradient<C>(
        &self,
        out: &mut DesignVector<T>,
        design: &DesignVector<T>,
        multiplier: &DVector<T>,
        objective_gradient: &DesignVector<T>,
        constraint: &C,
    ) where
        C: FlowConstraint<T>,
    {
        constraint.apply_adjoint_jacobian(out, multiplier, design);
        out.axpy(T::one(), objective_gradient);
    }

    /// Evaluate the problem at the starting point and seed the run state.
    /// Clears the secant memory and resets the penalty.
    pub fn initialize<F, C>(
        &mut self,
        state: &mut AlgorithmState<T>,
        design: &DesignVector<T>,
        multiplier: &DVector<T>,
        functional: &F,
        constraint: &C,
    ) where
        F: Functional<T>,
        C: FlowConstraint<T>,
    {
        let layout = design.layout();
        self.secant.reset();
        self.penalty = T::one();

        state.iteration = 0;
        state.objective_value = functional.value(design);
        state.num_objective_evaluations += 1;

        let mut objective_gradient = DesignVector::zeros(layout);
        functional.gradient(&mut objective_gradient, design);
        state.num_gradient_evaluations += 1;

        let mut constraint_value = DVector::zeros(layout.n_state);
        constraint.value(&mut constraint_value, design);
        state.constraint_norm = constraint_value.norm();

        let mut lagrangian_gradient = DesignVector::zeros(layout);
        self.lagrangian_gradient(
            &mut lagrangian_gradient,
            design,
            multiplier,
            &objective_gradient,
            constraint,
        );
        state.num_gradient_evaluations += 1;
        state.gradient_norm = lagrangian_gradient.norm();
        state.penalty = self.penalty;

        self.previous_reduced_gradient = Some(lagrangian_gradient.control().clone_owned());
    }

    /// Adjoint-based initial multiplier estimate `λ₀ = −A⁻ᵀ ∇_w f`.
    pub fn compute_initial_multiplier<F, C>(
        &mut self,
        multiplier: &mut DVector<T>,
        design: &DesignVector<T>,
        functional: &F,
        constraint: &C,
    ) -> Result<(), StepError>
    where
        F: Functional<T>,
        C: FlowConstraint<T>,
    {
        let layout = design.layout();
        let mut objective_gradient = DesignVector::zeros(layout);
        functional.gradient(&mut objective_gradient, design);

        let mut rhs = objective_gradient.state().clone_owned();
        rhs *= -T::one();
        let mut estimate = DVector::zeros(layout.n_state);
        constraint
            .solve_adjoint_flow(&mut estimate, &rhs, design)
            .map_err(StepError::FlowSolveFailed)?;
        self.metrics.record_adjoint_flow_solve();
        multiplier.copy_from(&estimate);
        Ok(())
    }

    /// Compute one globalized full-space step.
    ///
    /// On return `direction` holds the scaled (and, with active bounds,
    /// projected) combined step; the persistent iterate is only mutated by
    /// [`FullSpaceStep::update`].
    pub fn compute<F, C>(
        &mut self,
        direction: &mut KktVector<T>,
        state: &mut AlgorithmState<T>,
        design: &DesignVector<T>,
        multiplier: &DVector<T>,
        functional: &F,
        constraint: &C,
        bounds: Option<&BoundConstraint<T>>,
    ) -> Result<(), StepError>
    where
        F: Functional<T>,
        C: FlowConstraint<T>,
    {
        let layout = design.layout();
        assert_eq!(direction.layout(), layout);

        // Objective gradient and the adjoint Jacobian applied to the current
        // multiplier; together they form the Lagrangian gradient.
        let mut objective_gradient = DesignVector::zeros(layout);
        functional.gradient(&mut objective_gradient, design);
        state.num_gradient_evaluations += 1;

        let mut adjoint_jacobian_multiplier = DesignVector::zeros(layout);
        constraint.apply_adjoint_jacobian(&mut adjoint_jacobian_multiplier, multiplier, design);

        // Right-hand side: negative Lagrangian gradient and negative
        // constraint value.
        let mut rhs = KktVector::zeros(layout);
        rhs.design_mut().set(&objective_gradient);
        rhs.design_mut().axpy(T::one(), &adjoint_jacobian_multiplier);
        rhs.design_mut().scale(-T::one());

        let mut constraint_value = DVector::zeros(layout.n_state);
        constraint.value(&mut constraint_value, design);
        rhs.multiplier_mut().copy_from(&constraint_value);
        *rhs.multiplier_mut() *= -T::one();

        // Inexact KKT solve, preconditioned by the Schur-complement block
        // elimination built on the secant model.
        let kkt_operator = KktOperator::new(functional, constraint, design, multiplier, &self.metrics);
        let preconditioner =
            SchurComplementPreconditioner::new(constraint, design, &self.secant, &self.metrics);
        let rhs_flat = rhs.to_flat();
        let mut lhs_flat = DVector::zeros(layout.kkt_len());
        let solve_result = FlexibleGmres::new()
            .with_operator(&kkt_operator)
            .with_preconditioner(&preconditioner)
            .with_stopping_criterion(RelativeResidualCriterion::new(self.settings.kkt_relative_tolerance))
            .with_max_iter(self.settings.kkt_max_iterations)
            .solve_with_guess(&rhs_flat, &mut lhs_flat);
        match solve_result {
            Ok(output) => {
                state.kkt_iterations = output.num_iterations;
                state.kkt_residual_norm = output.residual_norm;
            }
            Err(err) => match err.kind {
                SolveErrorKind::MaxIterationsReached { .. } => {
                    warn!(
                        "KKT solve stopped at iteration cap with residual norm {}; \
                         proceeding with the best available step",
                        err.output.residual_norm
                    );
                    state.kkt_iterations = err.output.num_iterations;
                    state.kkt_residual_norm = err.output.residual_norm;
                }
                kind => return Err(StepError::KktSolveFailed(kind)),
            },
        }
        layout.read_kkt(DVectorView::from(&lhs_flat), direction);

        // Refresh the merit function with the new penalty and the current
        // multiplier estimate.
        let penalty = compute_augmented_lagrangian_penalty(
            direction.design(),
            direction.multiplier(),
            design,
            &objective_gradient,
            &constraint_value,
            &adjoint_jacobian_multiplier,
            constraint,
            self.settings.penalty_offset,
        );
        self.penalty = penalty;
        state.penalty = penalty;
        debug!("Augmented Lagrangian penalty: {}", penalty);

        let merit = AugmentedLagrangian::new(functional, constraint, multiplier.clone_owned(), penalty);
        let phi_zero = merit.value(design);
        state.num_objective_evaluations += 1;
        let dphi_zero = merit.directional_derivative(design, direction.design(), direction.multiplier());
        state.num_gradient_evaluations += 1;
        debug!("Merit slope along the combined step: {}", dphi_zero);

        // Line search along the combined step; only the design moves in the
        // merit evaluations, the multiplier direction enters the slope term.
        let search = {
            let mut trial_value = DesignVector::zeros(layout);
            let mut trial_slope = DesignVector::zeros(layout);
            let phi = |alpha: T| {
                trial_value.set(design);
                trial_value.axpy(alpha, direction.design());
                merit.value(&trial_value)
            };
            let dphi = |alpha: T| {
                trial_slope.set(design);
                trial_slope.axpy(alpha, direction.design());
                merit.directional_derivative(&trial_slope, direction.design(), direction.multiplier())
            };
            backtracking_merit_line_search(phi, dphi, phi_zero, dphi_zero, &self.settings.line_search)
        };
        let search = search.map_err(StepError::LineSearchFailed)?;
        state.num_objective_evaluations += search.num_value_evaluations;
        state.num_gradient_evaluations += search.num_gradient_evaluations;
        state.step_length = search.alpha;

        // Scale both the design and multiplier directions by the accepted
        // step length.
        direction.scale(search.alpha);

        // With active bounds, project the stepped control into the feasible
        // box and recompute the effective step as a difference.
        if let Some(bounds) = bounds {
            let mut stepped = design.clone();
            stepped.axpy(T::one(), direction.design());
            bounds.project(stepped.control_mut());
            stepped.axpy(-T::one(), design);
            direction.design_mut().set(&stepped);
        }

        Ok(())
    }

    /// Advance the persistent iterate by the accepted step, re-evaluate the
    /// problem at the new point, and feed the secant the reduced gradient
    /// difference and the control-block step.
    pub fn update<F, C>(
        &mut self,
        state: &mut AlgorithmState<T>,
        design: &mut DesignVector<T>,
        multiplier: &mut DVector<T>,
        direction: &KktVector<T>,
        functional: &F,
        constraint: &C,
    ) where
        F: Functional<T>,
        C: FlowConstraint<T>,
    {
        let layout = design.layout();
        design.axpy(T::one(), direction.design());
        multiplier.axpy(T::one(), direction.multiplier(), T::one());

        state.objective_value = functional.value(design);
        state.num_objective_evaluations += 1;

        let mut objective_gradient = DesignVector::zeros(layout);
        functional.gradient(&mut objective_gradient, design);
        state.num_gradient_evaluations += 1;

        let mut constraint_value = DVector::zeros(layout.n_state);
        constraint.value(&mut constraint_value, design);

        let mut lagrangian_gradient = DesignVector::zeros(layout);
        self.lagrangian_gradient(
            &mut lagrangian_gradient,
            design,
            multiplier,
            &objective_gradient,
            constraint,
        );

        state.gradient_norm = lagrangian_gradient.norm();
        state.constraint_norm = constraint_value.norm();
        state.step_norm = direction.design().norm() + direction.multiplier().norm();

        // The secant models the reduced Hessian only: it sees the
        // control-block gradient difference and the control-block step.
        let reduced_gradient = lagrangian_gradient.control().clone_owned();
        if let Some(previous) = self.previous_reduced_gradient.take() {
            self.secant.update_storage(
                &reduced_gradient,
                &previous,
                direction.design().control(),
                state.iteration + 1,
            );
        }
        self.previous_reduced_gradient = Some(reduced_gradient);

        state.iteration += 1;
    }
}
