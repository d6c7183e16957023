//! Outer optimization loop, bound handling and run reporting.
use crate::constraint::FlowConstraint;
use crate::functional::Functional;
use crate::fullspace::{AlgorithmState, FullSpaceSettings, FullSpaceStep};
use crate::vector::{DesignVector, KktVector};
use crate::Real;
use log::{debug, info, warn};
use nalgebra::DVector;
use numeric_literals::replace_float_literals;
use serde::{Deserialize, Serialize};

/// Componentwise box on the control (shape) parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundConstraint<T: Real> {
    lower: DVector<T>,
    upper: DVector<T>,
}

impl<T: Real> BoundConstraint<T> {
    pub fn new(lower: DVector<T>, upper: DVector<T>) -> Self {
        assert_eq!(lower.len(), upper.len());
        assert!(
            lower.iter().zip(upper.iter()).all(|(l, u)| l <= u),
            "lower bounds must not exceed upper bounds"
        );
        Self { lower, upper }
    }

    /// Clamp the control vector into the feasible box.
    pub fn project(&self, control: &mut DVector<T>) {
        assert_eq!(control.len(), self.lower.len());
        for i in 0..control.len() {
            if control[i] < self.lower[i] {
                control[i] = self.lower[i];
            } else if control[i] > self.upper[i] {
                control[i] = self.upper[i];
            }
        }
    }

    pub fn contains(&self, control: &DVector<T>) -> bool {
        control
            .iter()
            .enumerate()
            .all(|(i, &c)| self.lower[i] <= c && c <= self.upper[i])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings<T> {
    pub max_iterations: usize,
    /// Convergence threshold on the Lagrangian-gradient norm.
    pub gradient_tolerance: T,
    /// Convergence threshold on the flow-residual norm.
    pub constraint_tolerance: T,
    /// When true, seed the multiplier with the adjoint estimate before the
    /// first iteration.
    pub initialize_multiplier: bool,
    pub step: FullSpaceSettings<T>,
}

impl<T: Real> Default for SolverSettings<T> {
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    fn default() -> Self {
        Self {
            max_iterations: 100,
            gradient_tolerance: 1e-6,
            constraint_tolerance: 1e-6,
            initialize_multiplier: true,
            step: FullSpaceSettings::default(),
        }
    }
}

/// Outcome of an optimization run. Anything but `Converged` is the non-zero
/// status flag of a failed or truncated run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizationStatus {
    Converged,
    MaxIterationsReached,
    /// A step failed fatally at the given iteration (flow solve breakdown or
    /// exhausted line search without `accept_last_alpha`).
    StepFailed { iteration: usize },
}

impl OptimizationStatus {
    pub fn is_converged(&self) -> bool {
        *self == OptimizationStatus::Converged
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord<T> {
    pub iteration: usize,
    pub objective_value: T,
    pub gradient_norm: T,
    pub constraint_norm: T,
    pub step_norm: T,
    pub step_length: T,
    pub penalty: T,
    pub kkt_iterations: usize,
    pub kkt_residual_norm: T,
}

impl<T: Real> IterationRecord<T> {
    fn from_state(state: &AlgorithmState<T>) -> Self {
        Self {
            iteration: state.iteration,
            objective_value: state.objective_value,
            gradient_norm: state.gradient_norm,
            constraint_norm: state.constraint_norm,
            step_norm: state.step_norm,
            step_length: state.step_length,
            penalty: state.penalty,
            kkt_iterations: state.kkt_iterations,
            kkt_residual_norm: state.kkt_residual_norm,
        }
    }
}

/// Work counters accumulated over a run, taken from the step's
/// [`crate::kkt::SolveMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub kkt_applications: usize,
    pub preconditioner_applications: usize,
    pub forward_flow_solves: usize,
    pub adjoint_flow_solves: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationReport<T> {
    pub status: OptimizationStatus,
    pub iterations: usize,
    pub objective_value: T,
    pub gradient_norm: T,
    pub constraint_norm: T,
    pub num_objective_evaluations: usize,
    pub num_gradient_evaluations: usize,
    pub metrics: MetricsSnapshot,
    pub history: Vec<IterationRecord<T>>,
}

/// Driver for the full-space optimization loop.
///
/// Owns the stopping tests and optional control bounds; everything inside an
/// iteration is delegated to [`FullSpaceStep`]. Algorithmic non-convergence
/// is reported through [`OptimizationStatus`], never panicked or returned as
/// an error.
pub struct FullSpaceSolver<T: Real> {
    settings: SolverSettings<T>,
    bounds: Option<BoundConstraint<T>>,
}

impl<T: Real> FullSpaceSolver<T> {
    pub fn new(settings: SolverSettings<T>) -> Self {
        Self { settings, bounds: None }
    }

    pub fn with_bounds(mut self, bounds: BoundConstraint<T>) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn settings(&self) -> &SolverSettings<T> {
        &self.settings
    }

    fn has_converged(&self, state: &AlgorithmState<T>) -> bool {
        state.gradient_norm <= self.settings.gradient_tolerance
            && state.constraint_norm <= self.settings.constraint_tolerance
    }

    /// Run the optimization from the given starting design and multiplier,
    /// mutating both toward the solution.
    pub fn run<F, C>(
        &self,
        design: &mut DesignVector<T>,
        multiplier: &mut DVector<T>,
        functional: &F,
        constraint: &C,
    ) -> OptimizationReport<T>
    where
        F: Functional<T>,
        C: FlowConstraint<T>,
    {
        let layout = design.layout();
        let mut step = FullSpaceStep::new(self.settings.step.clone());
        let mut state = AlgorithmState::new();

        if let Some(bounds) = &self.bounds {
            bounds.project(design.control_mut());
        }
        if self.settings.initialize_multiplier {
            if let Err(err) = step.compute_initial_multiplier(multiplier, design, functional, constraint) {
                warn!("Initial multiplier estimate failed: {}; continuing from the given multiplier", err);
            }
        }
        step.initialize(&mut state, design, multiplier, functional, constraint);
        info!(
            "Starting full-space optimization: objective {}, gradient norm {}, constraint norm {}",
            state.objective_value, state.gradient_norm, state.constraint_norm
        );

        let mut history = Vec::new();
        let mut status = OptimizationStatus::MaxIterationsReached;

        while state.iteration < self.settings.max_iterations {
            if self.has_converged(&state) {
                status = OptimizationStatus::Converged;
                break;
            }

            let mut direction = KktVector::zeros(layout);
            let computed = step.compute(
                &mut direction,
                &mut state,
                design,
                multiplier,
                functional,
                constraint,
                self.bounds.as_ref(),
            );
            if let Err(err) = computed {
                warn!("Iteration {} failed: {}", state.iteration, err);
                status = OptimizationStatus::StepFailed {
                    iteration: state.iteration,
                };
                break;
            }

            step.update(&mut state, design, multiplier, &direction, functional, constraint);
            debug!(
                "iter {:>3}  f = {}  |grad L| = {}  |c| = {}  alpha = {}  penalty = {}",
                state.iteration,
                state.objective_value,
                state.gradient_norm,
                state.constraint_norm,
                state.step_length,
                state.penalty
            );
            history.push(IterationRecord::from_state(&state));
        }

        if status == OptimizationStatus::MaxIterationsReached && self.has_converged(&state) {
            status = OptimizationStatus::Converged;
        }

        let metrics = step.metrics();
        let report = OptimizationReport {
            status,
            iterations: state.iteration,
            objective_value: state.objective_value,
            gradient_norm: state.gradient_norm,
            constraint_norm: state.constraint_norm,
            num_objective_evaluations: state.num_objective_evaluations,
            num_gradient_evaluations: state.num_gradient_evaluations,
            metrics: MetricsSnapshot {
                kkt_applications: metrics.kkt_applications(),
                preconditioner_applications: metrics.preconditioner_applications(),
                forward_flow_solves: metrics.forward_flow_solves(),
                adjoint_flow_solves: metrics.adjoint_flow_solves(),
            },
            history,
        };
        info!(
            "Optimization finished with status {:?} after {} iterations",
            report.status, report.iterations
        );
        report
    }
}
