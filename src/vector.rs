//! Composite vector types for the full-space optimization core.
//!
//! The design space is a product of flow-state unknowns and shape controls,
//! and the KKT system further appends a multiplier block. Both splits are
//! represented as tagged composites with typed block accessors, resolved at
//! construction. [`BlockLayout`] is the adaptor between these composites and
//! the flat vectors a Krylov solver iterates on.
use crate::Real;
use nalgebra::{DVector, DVectorView, DVectorViewMut, Scalar};

/// Dimensions of the state and control blocks.
///
/// The flat packing order is `[state, control, multiplier]`, with the
/// multiplier block sharing the state dimension (one multiplier per residual
/// component).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockLayout {
    pub n_state: usize,
    pub n_control: usize,
}

impl BlockLayout {
    pub fn new(n_state: usize, n_control: usize) -> Self {
        Self { n_state, n_control }
    }

    pub fn design_len(&self) -> usize {
        self.n_state + self.n_control
    }

    pub fn kkt_len(&self) -> usize {
        self.design_len() + self.n_state
    }

    /// Unpack a flat primal-dual vector into its typed composite.
    pub fn read_kkt<T: Real>(&self, flat: DVectorView<T>, out: &mut KktVector<T>) {
        assert_eq!(flat.len(), self.kkt_len());
        assert_eq!(out.layout(), *self);
        out.design
            .state
            .copy_from(&flat.rows(0, self.n_state));
        out.design
            .control
            .copy_from(&flat.rows(self.n_state, self.n_control));
        out.multiplier
            .copy_from(&flat.rows(self.design_len(), self.n_state));
    }

    /// Pack a typed primal-dual composite into a flat vector.
    pub fn write_kkt<T: Real>(&self, v: &KktVector<T>, mut flat: DVectorViewMut<T>) {
        assert_eq!(flat.len(), self.kkt_len());
        assert_eq!(v.layout(), *self);
        flat.rows_mut(0, self.n_state).copy_from(&v.design.state);
        flat.rows_mut(self.n_state, self.n_control)
            .copy_from(&v.design.control);
        flat.rows_mut(self.design_len(), self.n_state)
            .copy_from(&v.multiplier);
    }
}

/// The design variable pair `(w, x)`: flow state plus shape control.
///
/// Gradients with respect to the design live in the same product space under
/// the Euclidean identification, so a single type serves both primal and
/// dual roles; which one a value plays is determined by where it appears.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignVector<T: Scalar> {
    state: DVector<T>,
    control: DVector<T>,
}

impl<T: Real> DesignVector<T> {
    pub fn new(state: DVector<T>, control: DVector<T>) -> Self {
        Self { state, control }
    }

    pub fn zeros(layout: BlockLayout) -> Self {
        Self {
            state: DVector::zeros(layout.n_state),
            control: DVector::zeros(layout.n_control),
        }
    }

    pub fn layout(&self) -> BlockLayout {
        BlockLayout::new(self.state.len(), self.control.len())
    }

    pub fn state(&self) -> &DVector<T> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut DVector<T> {
        &mut self.state
    }

    pub fn control(&self) -> &DVector<T> {
        &self.control
    }

    pub fn control_mut(&mut self) -> &mut DVector<T> {
        &mut self.control
    }

    pub fn fill(&mut self, value: T) {
        self.state.fill(value);
        self.control.fill(value);
    }

    pub fn set(&mut self, other: &Self) {
        assert_eq!(self.layout(), other.layout());
        self.state.copy_from(&other.state);
        self.control.copy_from(&other.control);
    }

    /// `self += a * x`
    pub fn axpy(&mut self, a: T, x: &Self) {
        assert_eq!(self.layout(), x.layout());
        self.state.axpy(a, &x.state, T::one());
        self.control.axpy(a, &x.control, T::one());
    }

    pub fn scale(&mut self, a: T) {
        self.state *= a;
        self.control *= a;
    }

    pub fn dot(&self, other: &Self) -> T {
        assert_eq!(self.layout(), other.layout());
        self.state.dot(&other.state) + self.control.dot(&other.control)
    }

    pub fn norm_squared(&self) -> T {
        self.dot(self)
    }

    pub fn norm(&self) -> T {
        self.norm_squared().sqrt()
    }
}

/// A primal-dual vector for the KKT system: a design block plus the
/// Lagrange multiplier conjugate to the flow residual.
#[derive(Debug, Clone, PartialEq)]
pub struct KktVector<T: Scalar> {
    design: DesignVector<T>,
    multiplier: DVector<T>,
}

impl<T: Real> KktVector<T> {
    pub fn new(design: DesignVector<T>, multiplier: DVector<T>) -> Self {
        assert_eq!(design.layout().n_state, multiplier.len());
        Self { design, multiplier }
    }

    pub fn zeros(layout: BlockLayout) -> Self {
        Self {
            design: DesignVector::zeros(layout),
            multiplier: DVector::zeros(layout.n_state),
        }
    }

    pub fn layout(&self) -> BlockLayout {
        self.design.layout()
    }

    pub fn design(&self) -> &DesignVector<T> {
        &self.design
    }

    pub fn design_mut(&mut self) -> &mut DesignVector<T> {
        &mut self.design
    }

    pub fn multiplier(&self) -> &DVector<T> {
        &self.multiplier
    }

    pub fn multiplier_mut(&mut self) -> &mut DVector<T> {
        &mut self.multiplier
    }

    pub fn set(&mut self, other: &Self) {
        self.design.set(&other.design);
        self.multiplier.copy_from(&other.multiplier);
    }

    /// `self += a * x`
    pub fn axpy(&mut self, a: T, x: &Self) {
        self.design.axpy(a, &x.design);
        self.multiplier.axpy(a, &x.multiplier, T::one());
    }

    pub fn scale(&mut self, a: T) {
        self.design.scale(a);
        self.multiplier *= a;
    }

    pub fn dot(&self, other: &Self) -> T {
        self.design.dot(&other.design) + self.multiplier.dot(&other.multiplier)
    }

    pub fn norm(&self) -> T {
        self.dot(self).sqrt()
    }

    /// Pack into a freshly allocated flat vector in `[state, control,
    /// multiplier]` order.
    pub fn to_flat(&self) -> DVector<T> {
        let layout = self.layout();
        let mut flat = DVector::zeros(layout.kkt_len());
        layout.write_kkt(self, DVectorViewMut::from(&mut flat));
        flat
    }
}
