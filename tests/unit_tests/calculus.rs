use matrixcompare::assert_scalar_eq;
use nalgebra::DVector;
use skoll::calculus::{
    approximate_design_gradient_fd, check_adjoint_consistency_jacobian, check_adjoint_inverse_round_trip,
    check_inverse_jacobian_round_trip,
};
use skoll::constraint::FlowConstraint;
use skoll::functional::{Functional, TargetStateTracking};
use skoll::merit::AugmentedLagrangian;
use skoll::model::ChannelFlowModel;
use skoll::vector::DesignVector;

fn model() -> ChannelFlowModel<f64> {
    ChannelFlowModel::new(12, 3, 1.0, 0.4, 0.1)
}

/// Deterministic probe vectors with no special structure.
fn probe_design(model: &ChannelFlowModel<f64>, seed: f64) -> DesignVector<f64> {
    let layout = model.layout();
    DesignVector::new(
        DVector::from_fn(layout.n_state, |i, _| (seed + 1.3 * i as f64).sin()),
        DVector::from_fn(layout.n_control, |i, _| (seed + 0.7 * i as f64).cos()),
    )
}

fn probe_dual(model: &ChannelFlowModel<f64>, seed: f64) -> DVector<f64> {
    DVector::from_fn(model.layout().n_state, |i, _| (seed + 2.1 * i as f64).cos())
}

#[test]
fn jacobian_adjoint_consistency() {
    let model = model();
    let design = probe_design(&model, 0.2);
    let v = probe_design(&model, 1.9);
    let w = probe_dual(&model, 0.5);

    let discrepancy = check_adjoint_consistency_jacobian(&model, &design, &v, &w);
    assert!(
        discrepancy < 1e-10,
        "adjoint inconsistency {} exceeds tolerance",
        discrepancy
    );
}

#[test]
fn inverse_jacobian_round_trip() {
    let model = model();
    let design = probe_design(&model, 0.8);
    let v = probe_dual(&model, 3.1);

    let defect = check_inverse_jacobian_round_trip(&model, &design, &v).unwrap();
    assert!(defect < 1e-10, "round-trip defect {} exceeds tolerance", defect);

    let adjoint_defect = check_adjoint_inverse_round_trip(&model, &design, &v).unwrap();
    assert!(adjoint_defect < 1e-10);
}

#[test]
fn tracking_functional_gradient_matches_finite_differences() {
    let model = model();
    let layout = model.layout();
    let functional = TargetStateTracking::new(
        DVector::from_fn(layout.n_state, |i, _| 0.1 * i as f64),
        DVector::zeros(layout.n_control),
        1e-2,
    );
    let design = probe_design(&model, 1.1);

    let mut gradient = DesignVector::zeros(layout);
    functional.gradient(&mut gradient, &design);
    let gradient_fd = approximate_design_gradient_fd(|d| functional.value(d), &design, 1e-4);

    let mut difference = gradient.clone();
    difference.axpy(-1.0, &gradient_fd);
    assert!(difference.norm() < 1e-6);
}

#[test]
fn merit_gradient_matches_finite_differences() {
    let model = model();
    let layout = model.layout();
    let functional = TargetStateTracking::new(
        DVector::from_fn(layout.n_state, |i, _| 0.05 * i as f64),
        DVector::zeros(layout.n_control),
        1e-2,
    );
    let multiplier = probe_dual(&model, 1.7);
    let merit = AugmentedLagrangian::new(&functional, &model, multiplier, 3.5);
    let design = probe_design(&model, 0.4);

    let mut gradient = DesignVector::zeros(layout);
    merit.gradient(&mut gradient, &design);
    let gradient_fd = approximate_design_gradient_fd(|d| merit.value(d), &design, 1e-5);

    let mut difference = gradient.clone();
    difference.axpy(-1.0, &gradient_fd);
    // Central differences on the nonlinear residual limit the attainable
    // agreement here
    assert!(difference.norm() < 1e-5);
}

#[test]
fn constraint_jacobian_matches_residual_finite_differences() {
    let model = model();
    let design = probe_design(&model, 2.3);
    let direction = probe_design(&model, 0.9);

    // Directional derivative of component k of the residual against J v
    let mut jv = DVector::zeros(model.state_dimension());
    model.apply_jacobian(&mut jv, &direction, &design);

    let h = 1e-6;
    let mut plus = design.clone();
    plus.axpy(h, &direction);
    let mut minus = design.clone();
    minus.axpy(-h, &direction);
    let mut r_plus = DVector::zeros(model.state_dimension());
    model.value(&mut r_plus, &plus);
    let mut r_minus = DVector::zeros(model.state_dimension());
    model.value(&mut r_minus, &minus);
    let jv_fd = (r_plus - r_minus) / (2.0 * h);

    assert_scalar_eq!((jv - jv_fd).norm(), 0.0, comp = abs, tol = 1e-6);
}
