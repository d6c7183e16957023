use matrixcompare::assert_scalar_eq;
use nalgebra::DVector;
use proptest::prelude::*;
use skoll::constraint::FlowConstraint;
use skoll::driver::{BoundConstraint, FullSpaceSolver, OptimizationStatus, SolverSettings};
use skoll::fullspace::{compute_augmented_lagrangian_penalty, FullSpaceSettings};
use skoll::functional::{Functional, TargetStateTracking};
use skoll::linesearch::{CurvatureCondition, LineSearchSettings};
use skoll::model::ChannelFlowModel;
use skoll::vector::DesignVector;

const PENALTY_OFFSET: f64 = 1e-4;

fn penalty_probe() -> (ChannelFlowModel<f64>, DesignVector<f64>, DesignVector<f64>, DVector<f64>) {
    let model = ChannelFlowModel::new(8, 2, 1.0, 0.2, 0.1);
    let layout = model.layout();
    let design = DesignVector::new(
        DVector::from_fn(layout.n_state, |i, _| 0.3 + (0.5 * i as f64).sin()),
        DVector::from_fn(layout.n_control, |i, _| 0.1 * (i as f64 + 1.0)),
    );
    let search_direction = DesignVector::new(
        DVector::from_fn(layout.n_state, |i, _| (0.4 * i as f64).cos()),
        DVector::from_fn(layout.n_control, |i, _| 0.5 - 0.2 * i as f64),
    );
    let mut constraint_value = DVector::zeros(layout.n_state);
    model.value(&mut constraint_value, &design);
    (model, design, search_direction, constraint_value)
}

/// Multiplier direction chosen so the raw penalty fraction equals `target`.
fn multiplier_direction_for_raw(
    target: f64,
    model: &ChannelFlowModel<f64>,
    design: &DesignVector<f64>,
    search_direction: &DesignVector<f64>,
    objective_gradient: &DesignVector<f64>,
    adjoint_jacobian_multiplier: &DesignVector<f64>,
    constraint_value: &DVector<f64>,
) -> DVector<f64> {
    let base = objective_gradient.dot(search_direction) + adjoint_jacobian_multiplier.dot(search_direction);
    let mut jv = DVector::zeros(model.state_dimension());
    model.apply_jacobian(&mut jv, search_direction, design);
    let denominator = jv.dot(constraint_value);
    let t = (target * denominator - base) / constraint_value.norm_squared();
    constraint_value * t
}

#[test]
fn penalty_applies_offset_outside_the_fraction() {
    let (model, design, search_direction, constraint_value) = penalty_probe();
    let layout = design.layout();
    let objective_gradient = DesignVector::new(
        DVector::from_element(layout.n_state, 0.2),
        DVector::from_element(layout.n_control, -0.1),
    );
    let adjoint_jacobian_multiplier = DesignVector::zeros(layout);

    // Multiplier direction tuned so the raw fraction is exactly 1
    let multiplier_direction = multiplier_direction_for_raw(
        1.0,
        &model,
        &design,
        &search_direction,
        &objective_gradient,
        &adjoint_jacobian_multiplier,
        &constraint_value,
    );
    let penalty = compute_augmented_lagrangian_penalty(
        &search_direction,
        &multiplier_direction,
        &design,
        &objective_gradient,
        &constraint_value,
        &adjoint_jacobian_multiplier,
        &model,
        PENALTY_OFFSET,
    );
    assert_scalar_eq!(penalty, 1.0 + PENALTY_OFFSET, comp = abs, tol = 1e-9);
}

#[test]
fn penalty_falls_back_to_one_for_nonpositive_fraction() {
    let (model, design, search_direction, constraint_value) = penalty_probe();
    let layout = design.layout();
    let objective_gradient = DesignVector::zeros(layout);
    let adjoint_jacobian_multiplier = DesignVector::zeros(layout);

    let multiplier_direction = multiplier_direction_for_raw(
        -1.0,
        &model,
        &design,
        &search_direction,
        &objective_gradient,
        &adjoint_jacobian_multiplier,
        &constraint_value,
    );
    let penalty = compute_augmented_lagrangian_penalty(
        &search_direction,
        &multiplier_direction,
        &design,
        &objective_gradient,
        &constraint_value,
        &adjoint_jacobian_multiplier,
        &model,
        PENALTY_OFFSET,
    );
    assert_eq!(penalty, 1.0);
}

proptest! {
    // The penalty must be strictly positive no matter what directions the
    // KKT solve produced
    #[test]
    fn penalty_is_always_strictly_positive(
        state_dir in proptest::collection::vec(-2.0f64..2.0, 8),
        control_dir in proptest::collection::vec(-2.0f64..2.0, 2),
        multiplier_dir in proptest::collection::vec(-2.0f64..2.0, 8),
    ) {
        let (model, design, _, constraint_value) = penalty_probe();
        let layout = design.layout();
        let search_direction = DesignVector::new(
            DVector::from_vec(state_dir),
            DVector::from_vec(control_dir),
        );
        let multiplier_direction = DVector::from_vec(multiplier_dir);
        let mut objective_gradient = DesignVector::zeros(layout);
        let functional = TargetStateTracking::new(
            DVector::zeros(layout.n_state),
            DVector::zeros(layout.n_control),
            1e-2,
        );
        functional.gradient(&mut objective_gradient, &design);
        let adjoint_jacobian_multiplier = DesignVector::zeros(layout);

        let penalty = compute_augmented_lagrangian_penalty(
            &search_direction,
            &multiplier_direction,
            &design,
            &objective_gradient,
            &constraint_value,
            &adjoint_jacobian_multiplier,
            &model,
            PENALTY_OFFSET,
        );
        prop_assert!(penalty > 0.0);
    }
}

/// Target state consistent with a known control, so the optimum is exactly
/// attainable with zero objective and zero multiplier.
fn attainable_target(model: &ChannelFlowModel<f64>, x_true: &DVector<f64>) -> DVector<f64> {
    let layout = model.layout();
    // Newton iteration on w ↦ R(w, x_true); one step suffices when the
    // residual is linear in the state
    let mut design = DesignVector::new(DVector::zeros(layout.n_state), x_true.clone());
    for _ in 0..25 {
        let mut residual = DVector::zeros(layout.n_state);
        model.value(&mut residual, &design);
        if residual.norm() < 1e-13 {
            break;
        }
        let mut update = DVector::zeros(layout.n_state);
        residual *= -1.0;
        model
            .solve_linearized_flow(&mut update, &residual, &design)
            .unwrap();
        *design.state_mut() += update;
    }
    design.state().clone_owned()
}

fn robust_settings() -> SolverSettings<f64> {
    SolverSettings {
        max_iterations: 50,
        gradient_tolerance: 1e-8,
        constraint_tolerance: 1e-8,
        initialize_multiplier: true,
        step: FullSpaceSettings {
            line_search: LineSearchSettings {
                condition: CurvatureCondition::None,
                accept_last_alpha: true,
                ..LineSearchSettings::default()
            },
            ..FullSpaceSettings::default()
        },
    }
}

#[test]
fn converges_on_linear_quadratic_problem() {
    let model = ChannelFlowModel::new(12, 3, 1.0, 0.4, 0.0);
    let layout = model.layout();
    let x_true = DVector::from_column_slice(&[0.5, -0.3, 0.8]);
    let target = attainable_target(&model, &x_true);
    let functional = TargetStateTracking::new(target, x_true.clone(), 1e-2);

    let mut design = DesignVector::zeros(layout);
    let mut multiplier = DVector::zeros(layout.n_state);

    let solver = FullSpaceSolver::new(robust_settings());
    let report = solver.run(&mut design, &mut multiplier, &functional, &model);

    assert!(
        report.status.is_converged(),
        "run did not converge: {:?}",
        report.status
    );
    assert!(report.constraint_norm < 1e-8);
    assert!(report.gradient_norm < 1e-8);
    assert!(report.objective_value < 1e-10);
    assert!((design.control() - &x_true).norm() < 1e-4);
    assert!(!report.history.is_empty());
    assert!(report.metrics.kkt_applications > 0);
    assert!(report.metrics.forward_flow_solves > 0);

    // Reports serialize for post-processing of optimization histories
    let serialized = serde_json::to_string(&report).unwrap();
    assert!(serialized.contains("\"status\""));
    assert!(serialized.contains("\"history\""));
}

#[test]
fn drives_norms_down_on_nonlinear_problem() {
    let model = ChannelFlowModel::new(12, 3, 1.0, 0.4, 0.08);
    let layout = model.layout();
    let x_true = DVector::from_column_slice(&[0.4, -0.2, 0.6]);
    let target = attainable_target(&model, &x_true);
    let functional = TargetStateTracking::new(target, x_true.clone(), 1e-2);

    let mut design = DesignVector::zeros(layout);
    let mut multiplier = DVector::zeros(layout.n_state);

    let solver = FullSpaceSolver::new(robust_settings());
    let report = solver.run(&mut design, &mut multiplier, &functional, &model);

    assert!(
        !matches!(report.status, OptimizationStatus::StepFailed { .. }),
        "step failed: {:?}",
        report.status
    );
    assert!(report.constraint_norm < 1e-6);
    assert!(report.gradient_norm < 1e-5);
}

#[test]
fn bound_projection_keeps_control_feasible() {
    let model = ChannelFlowModel::new(12, 3, 1.0, 0.4, 0.0);
    let layout = model.layout();
    // Unconstrained optimum lies outside the box, so the projection is active
    let x_true = DVector::from_column_slice(&[0.5, -0.3, 0.8]);
    let target = attainable_target(&model, &x_true);
    let functional = TargetStateTracking::new(target, x_true.clone(), 1e-2);

    let bounds = BoundConstraint::new(DVector::from_element(3, -0.2), DVector::from_element(3, 0.2));
    let mut design = DesignVector::zeros(layout);
    let mut multiplier = DVector::zeros(layout.n_state);

    let mut settings = robust_settings();
    settings.max_iterations = 20;
    let solver = FullSpaceSolver::new(settings).with_bounds(bounds.clone());
    let report = solver.run(&mut design, &mut multiplier, &functional, &model);

    assert!(bounds.contains(design.control()));
    assert!(report.iterations > 0);
}

#[test]
fn exhausted_line_search_surfaces_as_step_failure() {
    let model = ChannelFlowModel::new(12, 3, 1.0, 0.4, 0.0);
    let layout = model.layout();
    let functional = TargetStateTracking::new(
        DVector::from_element(layout.n_state, 1.0),
        DVector::zeros(layout.n_control),
        1e-2,
    );

    let mut settings = robust_settings();
    settings.step.line_search.max_evaluations = 0;
    settings.step.line_search.accept_last_alpha = false;

    let mut design = DesignVector::zeros(layout);
    let mut multiplier = DVector::zeros(layout.n_state);
    let solver = FullSpaceSolver::new(settings);
    let report = solver.run(&mut design, &mut multiplier, &functional, &model);

    assert_eq!(report.status, OptimizationStatus::StepFailed { iteration: 0 });
}
