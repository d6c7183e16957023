use matrixcompare::assert_scalar_eq;
use nalgebra::{DVector, DVectorView, DVectorViewMut};
use skoll::vector::{BlockLayout, DesignVector, KktVector};

fn example_kkt_vector() -> KktVector<f64> {
    let design = DesignVector::new(
        DVector::from_column_slice(&[1.0, 2.0, 3.0]),
        DVector::from_column_slice(&[-1.0, 0.5]),
    );
    KktVector::new(design, DVector::from_column_slice(&[4.0, -2.0, 0.25]))
}

#[test]
fn flat_packing_round_trip() {
    let layout = BlockLayout::new(3, 2);
    let v = example_kkt_vector();

    let flat = v.to_flat();
    assert_eq!(flat.len(), layout.kkt_len());
    // [state, control, multiplier] packing order
    assert_eq!(
        flat,
        DVector::from_column_slice(&[1.0, 2.0, 3.0, -1.0, 0.5, 4.0, -2.0, 0.25])
    );

    let mut unpacked = KktVector::zeros(layout);
    layout.read_kkt(DVectorView::from(&flat), &mut unpacked);
    assert_eq!(unpacked, v);
}

#[test]
fn write_kkt_overwrites_all_blocks() {
    let layout = BlockLayout::new(3, 2);
    let v = example_kkt_vector();
    let mut flat = DVector::from_element(layout.kkt_len(), 99.0);
    layout.write_kkt(&v, DVectorViewMut::from(&mut flat));
    assert_eq!(flat, v.to_flat());
}

#[test]
fn composite_dot_and_norm_agree_with_flat() {
    let v = example_kkt_vector();
    let w = {
        let design = DesignVector::new(
            DVector::from_column_slice(&[0.5, -1.0, 2.0]),
            DVector::from_column_slice(&[3.0, 1.0]),
        );
        KktVector::new(design, DVector::from_column_slice(&[1.0, 1.0, -1.0]))
    };
    assert_scalar_eq!(v.dot(&w), v.to_flat().dot(&w.to_flat()), comp = abs, tol = 1e-14);
    assert_scalar_eq!(v.norm(), v.to_flat().norm(), comp = abs, tol = 1e-14);
}

#[test]
fn axpy_and_scale_act_blockwise() {
    let mut v = example_kkt_vector();
    let w = v.clone();
    v.axpy(2.0, &w);
    v.scale(0.5);
    // (v + 2v) / 2 = 1.5 v
    let mut expected = w.to_flat();
    expected *= 1.5;
    assert_eq!(v.to_flat(), expected);
}

#[test]
#[should_panic]
fn mismatched_layout_panics() {
    let layout = BlockLayout::new(2, 2);
    let v = example_kkt_vector();
    let mut flat = DVector::zeros(v.layout().kkt_len());
    // Wrong layout for this vector
    layout.write_kkt(&v, DVectorViewMut::from(&mut flat));
}
