//! Residual library.
//!
//! Every residual is written once, generically over [`vicalign_solver::Real`],
//! and evaluated with jets during optimization so the Jacobians are exact.
//! Whitening by the measurement square-root information happens at the
//! assembly layer.

pub mod bias;
pub mod imu;
pub mod vicon;

pub use bias::{bias_walk_residual, BiasWalkWeights};
pub use imu::preintegration_residual;
pub use vicon::{vicon_residual, ViconObservation};
