//! Measurement and state value types.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use vicalign_solver::lie::exp_so3;

/// A single IMU reading: body-frame angular rate and specific force.
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    /// Timestamp in seconds (IMU clock).
    pub t: f64,
    /// Angular velocity (rad/s).
    pub gyro: Vector3<f64>,
    /// Linear acceleration (m/s^2), gravity included.
    pub accel: Vector3<f64>,
}

impl ImuSample {
    pub fn new(t: f64, gyro: Vector3<f64>, accel: Vector3<f64>) -> Self {
        Self { t, gyro, accel }
    }

    /// Synthesize a sample at `t` between `a` and `b` by linear
    /// interpolation of the raw readings.
    pub fn lerp(a: &ImuSample, b: &ImuSample, t: f64) -> Self {
        let lambda = (t - a.t) / (b.t - a.t);
        Self {
            t,
            gyro: (1.0 - lambda) * a.gyro + lambda * b.gyro,
            accel: (1.0 - lambda) * a.accel + lambda * b.accel,
        }
    }
}

/// A motion-capture pose reading with per-sample covariance.
#[derive(Debug, Clone)]
pub struct PoseSample {
    /// Timestamp in seconds (Vicon clock).
    pub t: f64,
    /// Body orientation in the capture frame.
    pub rot: UnitQuaternion<f64>,
    /// Body position in the capture frame (m).
    pub pos: Vector3<f64>,
    /// Orientation covariance (tangent space, rad^2).
    pub cov_rot: Matrix3<f64>,
    /// Position covariance (m^2).
    pub cov_pos: Matrix3<f64>,
}

/// One state node: orientation, position, velocity and IMU biases.
///
/// This is the manifold value the solver retracts onto; the orientation
/// lives on SO(3) and everything else is Euclidean. The tangent ordering is
/// `[dtheta, dp, dv, dbg, dba]`, fifteen numbers per node.
#[derive(Debug, Clone)]
pub struct NavState {
    /// IMU body orientation in the capture frame.
    pub rot: UnitQuaternion<f64>,
    /// IMU position in the capture frame (m).
    pub pos: Vector3<f64>,
    /// IMU velocity in the capture frame (m/s).
    pub vel: Vector3<f64>,
    /// Gyroscope bias (rad/s).
    pub gyro_bias: Vector3<f64>,
    /// Accelerometer bias (m/s^2).
    pub accel_bias: Vector3<f64>,
}

/// Tangent dimension of a [`NavState`].
pub const NODE_DOF: usize = 15;

impl NavState {
    pub fn identity() -> Self {
        Self {
            rot: UnitQuaternion::identity(),
            pos: Vector3::zeros(),
            vel: Vector3::zeros(),
            gyro_bias: Vector3::zeros(),
            accel_bias: Vector3::zeros(),
        }
    }

    /// Apply a tangent delta: right-multiplicative on the rotation,
    /// additive on the rest. The quaternion is renormalized on write.
    pub fn retract(&self, delta: &[f64]) -> Self {
        debug_assert!(delta.len() >= NODE_DOF);
        let dtheta = Vector3::new(delta[0], delta[1], delta[2]);
        let mut rot = self.rot
            * UnitQuaternion::from_rotation_matrix(&nalgebra::Rotation3::from_matrix_unchecked(
                exp_so3(&dtheta),
            ));
        rot.renormalize();
        Self {
            rot,
            pos: self.pos + Vector3::new(delta[3], delta[4], delta[5]),
            vel: self.vel + Vector3::new(delta[6], delta[7], delta[8]),
            gyro_bias: self.gyro_bias + Vector3::new(delta[9], delta[10], delta[11]),
            accel_bias: self.accel_bias + Vector3::new(delta[12], delta[13], delta[14]),
        }
    }

    /// Rotation as a matrix (body to capture frame).
    pub fn rot_matrix(&self) -> Matrix3<f64> {
        self.rot.to_rotation_matrix().into_inner()
    }
}

impl Default for NavState {
    fn default() -> Self {
        Self::identity()
    }
}
