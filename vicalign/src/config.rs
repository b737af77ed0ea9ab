//! Estimator configuration.
//!
//! Every noise and behavior knob flows through [`EstimatorConfig`]; there is
//! no process-wide state.

use crate::error::{Error, Result};
use nalgebra::{UnitQuaternion, Vector3};

/// Continuous-time IMU noise densities.
///
/// `gyro_noise_density` / `accel_noise_density` are white-noise densities in
/// rad/s/sqrt(Hz) and m/s^2/sqrt(Hz); the random-walk entries drive the bias
/// processes.
#[derive(Debug, Clone)]
pub struct ImuNoise {
    pub gyro_noise_density: f64,
    pub accel_noise_density: f64,
    pub gyro_random_walk: f64,
    pub accel_random_walk: f64,
}

impl Default for ImuNoise {
    fn default() -> Self {
        Self {
            gyro_noise_density: 1.6968e-4,
            accel_noise_density: 2.0e-3,
            gyro_random_walk: 1.9393e-5,
            accel_random_walk: 3.0e-3,
        }
    }
}

impl ImuNoise {
    /// Noise-free variant for synthetic tests.
    pub fn zero() -> Self {
        Self {
            gyro_noise_density: 0.0,
            accel_noise_density: 0.0,
            gyro_random_walk: 0.0,
            accel_random_walk: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    pub imu_noise: ImuNoise,

    /// Fallback pose sigmas `[rx, ry, rz, x, y, z]` used by adapters for
    /// samples that carry no covariance.
    pub vicon_sigmas: [f64; 6],
    /// When set, adapters replace every sample covariance with
    /// `vicon_sigmas`.
    pub use_manual_sigmas: bool,

    /// Estimate the Vicon->IMU time offset.
    pub estimate_time_offset: bool,
    /// Estimate the body-level extrinsic rotation.
    pub estimate_extrinsic_rotation: bool,
    /// Estimate the gravity direction in the capture frame.
    pub estimate_gravity: bool,

    /// Marker-to-IMU position arm, expressed in the IMU body frame.
    /// Held fixed; zero by default.
    pub position_arm: Vector3<f64>,

    /// Prior for the extrinsic rotation (identity by default).
    pub init_extrinsic_rotation: UnitQuaternion<f64>,
    /// Prior for the time offset, seconds.
    pub init_time_offset: f64,
    /// Prior for gravity in the capture frame. When unset, gravity is
    /// initialized by a coarse alignment of accelerometer averages.
    pub init_gravity: Option<Vector3<f64>>,

    pub max_iterations: usize,
    pub relative_cost_tol: f64,
    pub relative_step_tol: f64,

    /// Outer rounds of re-preintegration around the inner solver.
    pub max_relinearizations: usize,
    /// L-inf gyro-bias drift from the linearization point that forces
    /// re-preintegration (rad/s).
    pub bias_relin_gyro: f64,
    /// L-inf accel-bias drift that forces re-preintegration (m/s^2).
    pub bias_relin_accel: f64,

    /// Below this node count all calibration unknowns are held fixed.
    pub min_nodes_for_calibration: usize,
    /// Minimum integrated rotation over the window (rad) for calibration
    /// observability.
    pub min_rotation_excitation: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            imu_noise: ImuNoise::default(),
            vicon_sigmas: [1e-4, 1e-4, 1e-4, 1e-5, 1e-5, 1e-5],
            use_manual_sigmas: false,
            estimate_time_offset: true,
            estimate_extrinsic_rotation: true,
            estimate_gravity: true,
            position_arm: Vector3::zeros(),
            init_extrinsic_rotation: UnitQuaternion::identity(),
            init_time_offset: 0.0,
            init_gravity: None,
            max_iterations: 100,
            relative_cost_tol: 1e-6,
            relative_step_tol: 1e-7,
            max_relinearizations: 3,
            bias_relin_gyro: 0.03,
            bias_relin_accel: 0.1,
            min_nodes_for_calibration: 5,
            min_rotation_excitation: 0.5,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<()> {
        let noise = &self.imu_noise;
        for (name, value) in [
            ("gyroscope_noise_density", noise.gyro_noise_density),
            ("accelerometer_noise_density", noise.accel_noise_density),
            ("gyroscope_random_walk", noise.gyro_random_walk),
            ("accelerometer_random_walk", noise.accel_random_walk),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Config(format!("{name} must be >= 0, got {value}")));
            }
        }
        if self.vicon_sigmas.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(Error::Config(format!(
                "vicon_sigmas must be positive, got {:?}",
                self.vicon_sigmas
            )));
        }
        if self.max_iterations == 0 {
            return Err(Error::Config("max_iterations must be at least 1".into()));
        }
        if !(self.relative_cost_tol > 0.0) || !(self.relative_step_tol > 0.0) {
            return Err(Error::Config("relative tolerances must be positive".into()));
        }
        if self.max_relinearizations == 0 {
            return Err(Error::Config(
                "max_relinearizations must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
