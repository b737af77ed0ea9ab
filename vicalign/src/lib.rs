//! Batch estimation of the rigid-body alignment between a motion-capture
//! stream and an IMU, together with the full state trajectory.
//!
//! Three asynchronous inputs (IMU samples, capture poses with covariance,
//! reference timestamps) go in; a maximum-a-posteriori trajectory
//! (orientation, position, velocity, IMU biases per reference time) plus
//! calibration (extrinsic rotation, gravity in the capture frame, time
//! offset) with marginal covariances come out.
//!
//! The pipeline: [`Propagator`] preintegrates the IMU between reference
//! times, [`Interpolator`] answers pose queries on the capture stream, and
//! [`GraphSolver`] binds both into a factor graph solved by sparse
//! Levenberg-Marquardt on the manifold.

pub mod config;
pub mod error;
pub mod factors;
pub mod gravity;
pub mod graph;
pub mod interpolator;
pub mod output;
pub mod preintegration;
pub mod propagator;
pub mod sim;
pub mod types;

pub use config::{EstimatorConfig, ImuNoise};
pub use error::{Error, Result};
pub use graph::{CalibrationEstimate, EstimationResult, GraphSolver};
pub use interpolator::{InterpolatedPose, Interpolator};
pub use preintegration::Preintegrated;
pub use propagator::Propagator;
pub use types::{ImuSample, NavState, PoseSample};
