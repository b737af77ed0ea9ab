//! vicalign-solver: sparse nonlinear least-squares kernel
//!
//! Forward-mode automatic differentiation ([`Jet`]) over residual functions
//! written generically against the [`Real`] trait, plus a sparse
//! Levenberg-Marquardt loop ([`SparseLm`]) that factors the normal equations
//! with LDL^T and supports manifold retraction between iterations.

pub mod jet;
pub mod lie;
pub mod lm;

pub use jet::{Jet, Real};
pub use lm::{inverse_blocks, SparseLm, SolveReport, StopReason};

// Re-export nalgebra so downstream crates agree on the version.
pub use nalgebra;
