use nalgebra::RealField;

pub mod adaptation;
pub mod calculus;
pub mod constraint;
pub mod driver;
pub mod functional;
pub mod fullspace;
pub mod kkt;
pub mod linesearch;
pub mod merit;
pub mod model;
pub mod secant;
pub mod vector;

pub mod krylov {
    pub use skoll_krylov::*;
}

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;

/// Scalar type used throughout `skoll`.
///
/// A trait alias for the bounds generic optimization routines need.
pub trait Real: RealField + Copy {}

impl<T> Real for T where T: RealField + Copy {}
