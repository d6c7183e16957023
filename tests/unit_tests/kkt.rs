use nalgebra::{DMatrix, DVector, DVectorView, DVectorViewMut};
use skoll::kkt::{KktOperator, SchurComplementPreconditioner, SolveMetrics};
use skoll::krylov::{FlexibleGmres, LinearOperator, RelativeResidualCriterion};
use skoll::functional::TargetStateTracking;
use skoll::model::ChannelFlowModel;
use skoll::secant::LbfgsSecant;
use skoll::vector::DesignVector;

fn setup() -> (ChannelFlowModel<f64>, TargetStateTracking<f64>, DesignVector<f64>, DVector<f64>) {
    let model = ChannelFlowModel::new(10, 3, 1.0, 0.3, 0.05);
    let layout = model.layout();
    let functional = TargetStateTracking::new(
        DVector::from_fn(layout.n_state, |i, _| (0.3 * i as f64).sin()),
        DVector::zeros(layout.n_control),
        1e-2,
    );
    let design = DesignVector::new(
        DVector::from_fn(layout.n_state, |i, _| 0.1 + (0.9 * i as f64).cos()),
        DVector::from_fn(layout.n_control, |i, _| 0.2 * i as f64 - 0.1),
    );
    let multiplier = DVector::from_fn(layout.n_state, |i, _| (1.1 * i as f64).sin());
    (model, functional, design, multiplier)
}

fn assemble_dense(operator: &dyn LinearOperator<f64>, dim: usize) -> DMatrix<f64> {
    let mut matrix = DMatrix::zeros(dim, dim);
    let mut e = DVector::zeros(dim);
    let mut column = DVector::zeros(dim);
    for j in 0..dim {
        e.fill(0.0);
        e[j] = 1.0;
        operator
            .apply(DVectorViewMut::from(&mut column), DVectorView::from(&e))
            .unwrap();
        matrix.column_mut(j).copy_from(&column);
    }
    matrix
}

#[test]
fn kkt_operator_is_symmetric() {
    let (model, functional, design, multiplier) = setup();
    let metrics = SolveMetrics::new();
    let operator = KktOperator::new(&functional, &model, &design, &multiplier, &metrics);

    let dim = design.layout().kkt_len();
    let dense = assemble_dense(&operator, dim);
    let asymmetry = (&dense - dense.transpose()).norm();
    assert!(asymmetry < 1e-12, "KKT operator asymmetry {}", asymmetry);
    assert_eq!(metrics.kkt_applications(), dim);
}

#[test]
fn kkt_operator_zero_lower_right_block() {
    let (model, functional, design, multiplier) = setup();
    let metrics = SolveMetrics::new();
    let operator = KktOperator::new(&functional, &model, &design, &multiplier, &metrics);

    let layout = design.layout();
    let dense = assemble_dense(&operator, layout.kkt_len());
    // The multiplier-multiplier block of the saddle-point system is zero
    let block = dense
        .view((layout.design_len(), layout.design_len()), (layout.n_state, layout.n_state));
    assert_eq!(block.norm(), 0.0);
}

#[test]
fn preconditioned_solve_reduces_kkt_residual() {
    let (model, functional, design, multiplier) = setup();
    let metrics = SolveMetrics::new();
    let operator = KktOperator::new(&functional, &model, &design, &multiplier, &metrics);
    let secant = LbfgsSecant::new(10);
    let preconditioner = SchurComplementPreconditioner::new(&model, &design, &secant, &metrics);

    let dim = design.layout().kkt_len();
    let rhs = DVector::from_fn(dim, |i, _| (0.8 * i as f64).sin() + 0.1);
    let mut solution = DVector::zeros(dim);

    let tolerance = 1e-8;
    let output = FlexibleGmres::new()
        .with_operator(&operator)
        .with_stopping_criterion(RelativeResidualCriterion::new(tolerance))
        .with_preconditioner(&preconditioner)
        .with_max_iter(dim)
        .solve_with_guess(&rhs, &mut solution)
        .unwrap();

    // True residual of the returned iterate, evaluated through the operator
    let mut applied = DVector::zeros(dim);
    operator
        .apply(DVectorViewMut::from(&mut applied), DVectorView::from(&solution))
        .unwrap();
    let residual = (&rhs - applied).norm();
    assert!(
        residual <= 1e-6 * rhs.norm(),
        "KKT residual {} not reduced below tolerance",
        residual
    );
    assert!(output.num_iterations <= dim);
}

#[test]
fn preconditioner_bookkeeping_counts_inner_solves() {
    let (model, functional, design, multiplier) = setup();
    let metrics = SolveMetrics::new();
    let operator = KktOperator::new(&functional, &model, &design, &multiplier, &metrics);
    let secant = LbfgsSecant::new(10);
    let preconditioner = SchurComplementPreconditioner::new(&model, &design, &secant, &metrics);

    let dim = design.layout().kkt_len();
    let rhs = DVector::from_element(dim, 1.0);
    let mut solution = DVector::zeros(dim);
    FlexibleGmres::new()
        .with_operator(&operator)
        .with_stopping_criterion(RelativeResidualCriterion::new(1e-10))
        .with_preconditioner(&preconditioner)
        .with_max_iter(dim)
        .solve_with_guess(&rhs, &mut solution)
        .unwrap();

    assert!(metrics.kkt_applications() > 0);
    assert!(metrics.preconditioner_applications() > 0);
    // The block elimination performs exactly one forward and one adjoint
    // flow solve per application
    assert_eq!(metrics.forward_flow_solves(), metrics.preconditioner_applications());
    assert_eq!(metrics.adjoint_flow_solves(), metrics.preconditioner_applications());
}
