//! IMU preintegration between two reference timestamps.
//!
//! On-manifold preintegration in the style of Forster et al. (TRO 2017):
//! the relative motion (dR, dv, dp) over an interval is accumulated once at
//! a bias linearization point, together with bias Jacobians for first-order
//! correction and a full 15x15 covariance over
//! `[dtheta, dv, dp, bg, ba]`.
//!
//! Integration scheme: midpoint. Each sub-interval uses the average of its
//! endpoint gyro/accel readings, and the acceleration is rotated by the
//! mid-interval orientation.

use crate::config::ImuNoise;
use crate::error::{Error, Result};
use nalgebra::{Matrix3, SMatrix, UnitQuaternion, Vector3};
use vicalign_solver::lie::{exp_so3, right_jacobian, skew};

pub type Matrix15 = SMatrix<f64, 15, 15>;
pub type Matrix9 = SMatrix<f64, 9, 9>;

/// Preintegrated relative motion, immutable for a given bias linearization.
#[derive(Debug, Clone)]
pub struct Preintegrated {
    /// Relative rotation over the interval (body at t1 to body at t2).
    pub delta_rot: UnitQuaternion<f64>,
    /// Velocity delta in the start body frame (m/s).
    pub delta_vel: Vector3<f64>,
    /// Position delta in the start body frame (m).
    pub delta_pos: Vector3<f64>,
    /// Total integration time (s).
    pub dt: f64,

    /// Covariance over `[dtheta, dv, dp, bg, ba]`.
    pub covariance: Matrix15,

    // Bias Jacobians, accumulated in the same recursion.
    pub d_rot_d_bg: Matrix3<f64>,
    pub d_vel_d_bg: Matrix3<f64>,
    pub d_vel_d_ba: Matrix3<f64>,
    pub d_pos_d_bg: Matrix3<f64>,
    pub d_pos_d_ba: Matrix3<f64>,

    /// Gyro bias linearization point.
    pub bg_lin: Vector3<f64>,
    /// Accel bias linearization point.
    pub ba_lin: Vector3<f64>,
}

impl Preintegrated {
    pub fn new(bg_lin: Vector3<f64>, ba_lin: Vector3<f64>) -> Self {
        Self {
            delta_rot: UnitQuaternion::identity(),
            delta_vel: Vector3::zeros(),
            delta_pos: Vector3::zeros(),
            dt: 0.0,
            covariance: Matrix15::zeros(),
            d_rot_d_bg: Matrix3::zeros(),
            d_vel_d_bg: Matrix3::zeros(),
            d_vel_d_ba: Matrix3::zeros(),
            d_pos_d_bg: Matrix3::zeros(),
            d_pos_d_ba: Matrix3::zeros(),
            bg_lin,
            ba_lin,
        }
    }

    /// Integrate one sub-interval with averaged readings `gyro_bar` and
    /// `accel_bar` over `dt` seconds.
    pub fn integrate(
        &mut self,
        gyro_bar: &Vector3<f64>,
        accel_bar: &Vector3<f64>,
        dt: f64,
        noise: &ImuNoise,
    ) {
        if dt <= 0.0 {
            return;
        }

        let gyro = gyro_bar - self.bg_lin;
        let accel = accel_bar - self.ba_lin;

        let rot_prev = self.delta_rot.to_rotation_matrix().into_inner();
        let step = exp_so3(&(gyro * dt));
        let rot_mid = rot_prev * exp_so3(&(gyro * (0.5 * dt)));
        let accel_mid = rot_mid * accel;

        // Mean propagation.
        self.delta_pos += self.delta_vel * dt + 0.5 * accel_mid * dt * dt;
        self.delta_vel += accel_mid * dt;
        let mut rot_new = self.delta_rot
            * UnitQuaternion::from_rotation_matrix(&nalgebra::Rotation3::from_matrix_unchecked(
                step,
            ));
        rot_new.renormalize();
        self.delta_rot = rot_new;

        // Bias Jacobian recursion (uses the pre-update values).
        let jr = right_jacobian(&(gyro * dt));
        let accel_skew = rot_prev * skew(&accel);
        let prev_dr_dbg = self.d_rot_d_bg;
        let prev_dv_dbg = self.d_vel_d_bg;
        let prev_dv_dba = self.d_vel_d_ba;

        self.d_rot_d_bg = step.transpose() * prev_dr_dbg - jr * dt;
        self.d_vel_d_bg -= accel_skew * prev_dr_dbg * dt;
        self.d_vel_d_ba -= rot_prev * dt;
        self.d_pos_d_bg += prev_dv_dbg * dt - 0.5 * accel_skew * prev_dr_dbg * dt * dt;
        self.d_pos_d_ba += prev_dv_dba * dt - 0.5 * rot_prev * dt * dt;

        // Discrete covariance propagation: Sigma <- F Sigma F^T + G Q G^T
        // over [dtheta, dv, dp, bg, ba].
        let eye = Matrix3::identity();
        let mut f = Matrix15::identity();
        f.fixed_view_mut::<3, 3>(0, 0).copy_from(&step.transpose());
        f.fixed_view_mut::<3, 3>(0, 9).copy_from(&(-jr * dt));
        f.fixed_view_mut::<3, 3>(3, 0).copy_from(&(-accel_skew * dt));
        f.fixed_view_mut::<3, 3>(3, 12).copy_from(&(-rot_prev * dt));
        f.fixed_view_mut::<3, 3>(6, 0)
            .copy_from(&(-0.5 * accel_skew * dt * dt));
        f.fixed_view_mut::<3, 3>(6, 3).copy_from(&(eye * dt));
        f.fixed_view_mut::<3, 3>(6, 12)
            .copy_from(&(-0.5 * rot_prev * dt * dt));

        let mut g = SMatrix::<f64, 15, 12>::zeros();
        g.fixed_view_mut::<3, 3>(0, 0).copy_from(&(jr * dt));
        g.fixed_view_mut::<3, 3>(3, 3).copy_from(&(rot_prev * dt));
        g.fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(0.5 * rot_prev * dt * dt));
        g.fixed_view_mut::<3, 3>(9, 6).copy_from(&eye);
        g.fixed_view_mut::<3, 3>(12, 9).copy_from(&eye);

        // White-noise densities are divided by dt when discretized; the
        // random-walk terms are multiplied by it.
        let mut q = SMatrix::<f64, 12, 12>::zeros();
        let qg = noise.gyro_noise_density.powi(2) / dt;
        let qa = noise.accel_noise_density.powi(2) / dt;
        let qwg = noise.gyro_random_walk.powi(2) * dt;
        let qwa = noise.accel_random_walk.powi(2) * dt;
        for i in 0..3 {
            q[(i, i)] = qg;
            q[(i + 3, i + 3)] = qa;
            q[(i + 6, i + 6)] = qwg;
            q[(i + 9, i + 9)] = qwa;
        }

        self.covariance = f * self.covariance * f.transpose() + g * q * g.transpose();
        self.dt += dt;
    }

    /// First-order bias-corrected measurement at biases `(bg, ba)`:
    /// rotation as a tangent vector, then velocity and position deltas.
    pub fn corrected(
        &self,
        bg: &Vector3<f64>,
        ba: &Vector3<f64>,
    ) -> (Vector3<f64>, Vector3<f64>, Vector3<f64>) {
        let dbg = bg - self.bg_lin;
        let dba = ba - self.ba_lin;
        let theta = self.delta_rot.scaled_axis() + self.d_rot_d_bg * dbg;
        let vel = self.delta_vel + self.d_vel_d_bg * dbg + self.d_vel_d_ba * dba;
        let pos = self.delta_pos + self.d_pos_d_bg * dbg + self.d_pos_d_ba * dba;
        (theta, vel, pos)
    }

    /// Whether the first-order correction is stale for the given bias
    /// estimate (L-inf thresholds).
    pub fn bias_stale(
        &self,
        bg: &Vector3<f64>,
        ba: &Vector3<f64>,
        gyro_threshold: f64,
        accel_threshold: f64,
    ) -> bool {
        let dbg = (bg - self.bg_lin).amax();
        let dba = (ba - self.ba_lin).amax();
        dbg > gyro_threshold || dba > accel_threshold
    }

    /// Inverse lower Cholesky factor of the leading 9x9 covariance block
    /// (`[dtheta, dv, dp]`), used to whiten the preintegration residual.
    pub fn sqrt_information(&self) -> Result<Matrix9> {
        let mut sigma: Matrix9 = self.covariance.fixed_view::<9, 9>(0, 0).into_owned();
        // Keep the factorization well-posed for very short or noise-free
        // intervals.
        sigma += Matrix9::identity() * 1e-16;
        let chol = nalgebra::Cholesky::new(sigma).ok_or_else(|| {
            Error::NumericalFailure("preintegration covariance is not positive definite".into())
        })?;
        chol.l()
            .solve_lower_triangular(&Matrix9::identity())
            .ok_or_else(|| {
                Error::NumericalFailure("preintegration covariance whitening failed".into())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn noise() -> ImuNoise {
        ImuNoise::default()
    }

    #[test]
    fn zero_motion_stays_at_identity() {
        // gyro == bias, accel == bias: bias-corrected inputs are zero.
        let bg = Vector3::new(0.01, -0.02, 0.005);
        let ba = Vector3::new(0.1, 0.05, -0.02);
        let mut preint = Preintegrated::new(bg, ba);
        for _ in 0..200 {
            preint.integrate(&bg, &ba, 0.005, &noise());
        }
        assert_abs_diff_eq!(preint.delta_rot.angle(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(preint.delta_vel.norm(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(preint.delta_pos.norm(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(preint.dt, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn covariance_grows_linearly_for_zero_motion() {
        // White noise only; the random-walk coupling adds a cubic term.
        let white_only = ImuNoise {
            gyro_random_walk: 0.0,
            accel_random_walk: 0.0,
            ..ImuNoise::default()
        };
        let mut preint = Preintegrated::new(Vector3::zeros(), Vector3::zeros());
        for _ in 0..100 {
            preint.integrate(&Vector3::zeros(), &Vector3::zeros(), 0.005, &white_only);
        }
        let half = preint.covariance[(0, 0)];
        for _ in 0..100 {
            preint.integrate(&Vector3::zeros(), &Vector3::zeros(), 0.005, &white_only);
        }
        let full = preint.covariance[(0, 0)];
        assert_abs_diff_eq!(full / half, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn constant_acceleration_kinematics() {
        let mut preint = Preintegrated::new(Vector3::zeros(), Vector3::zeros());
        let accel = Vector3::new(1.0, 0.0, 0.0);
        let dt = 0.005;
        let steps = 200;
        for _ in 0..steps {
            preint.integrate(&Vector3::zeros(), &accel, dt, &noise());
        }
        let total = dt * steps as f64;
        assert_abs_diff_eq!(preint.delta_vel.x, total, epsilon = 1e-9);
        assert_abs_diff_eq!(preint.delta_pos.x, 0.5 * total * total, epsilon = 1e-9);
    }

    #[test]
    fn composition_matches_single_pass() {
        // Smooth synthetic signal, integrated [0,1]+[1,2] vs [0,2].
        let signal = |t: f64| {
            (
                Vector3::new(0.3 * (0.5 * t).sin(), 0.2 * (0.3 * t).cos(), 0.1),
                Vector3::new(0.5 * (0.7 * t).cos(), -0.3, 0.2 * t),
            )
        };
        let dt = 1e-3;

        let integrate_range = |t0: f64, t1: f64| {
            let mut p = Preintegrated::new(Vector3::zeros(), Vector3::zeros());
            let mut t = t0;
            while t < t1 - 1e-12 {
                let (w0, a0) = signal(t);
                let (w1, a1) = signal(t + dt);
                p.integrate(&((w0 + w1) * 0.5), &((a0 + a1) * 0.5), dt, &noise());
                t += dt;
            }
            p
        };

        let first = integrate_range(0.0, 1.0);
        let second = integrate_range(1.0, 2.0);
        let whole = integrate_range(0.0, 2.0);

        // Compose: R = R1 R2, v = v1 + R1 dv2, p = p1 + v1 dt2 + R1 dp2
        let r1 = first.delta_rot.to_rotation_matrix().into_inner();
        let rot_composed = first.delta_rot * second.delta_rot;
        let vel_composed = first.delta_vel + r1 * second.delta_vel;
        let pos_composed =
            first.delta_pos + first.delta_vel * second.dt + r1 * second.delta_pos;

        assert_abs_diff_eq!(
            rot_composed.angle_to(&whole.delta_rot),
            0.0,
            epsilon = 1e-9
        );
        assert_abs_diff_eq!((vel_composed - whole.delta_vel).norm(), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!((pos_composed - whole.delta_pos).norm(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn bias_correction_is_first_order_accurate() {
        let mut preint = Preintegrated::new(Vector3::zeros(), Vector3::zeros());
        let gyro = Vector3::new(0.2, -0.1, 0.3);
        let accel = Vector3::new(0.5, 0.2, -9.6);
        for _ in 0..100 {
            preint.integrate(&gyro, &accel, 0.005, &noise());
        }

        // Re-integrate at a shifted bias and compare with the first-order
        // prediction from the stored Jacobians.
        let dbg = Vector3::new(2e-3, -1e-3, 1.5e-3);
        let dba = Vector3::new(5e-3, 1e-2, -5e-3);
        let mut shifted = Preintegrated::new(dbg, dba);
        for _ in 0..100 {
            shifted.integrate(&gyro, &accel, 0.005, &noise());
        }

        let (theta_pred, vel_pred, pos_pred) = preint.corrected(&dbg, &dba);
        assert_abs_diff_eq!(
            (theta_pred - shifted.delta_rot.scaled_axis()).norm(),
            0.0,
            epsilon = 1e-5
        );
        assert_abs_diff_eq!((vel_pred - shifted.delta_vel).norm(), 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!((pos_pred - shifted.delta_pos).norm(), 0.0, epsilon = 1e-4);
    }

    #[test]
    fn covariance_is_symmetric_psd() {
        let mut preint = Preintegrated::new(Vector3::zeros(), Vector3::zeros());
        for i in 0..400 {
            let t = i as f64 * 0.005;
            preint.integrate(
                &Vector3::new(0.1 * t.sin(), 0.05, -0.02),
                &Vector3::new(0.3, -0.1 * t.cos(), 9.8),
                0.005,
                &noise(),
            );
        }
        let cov = preint.covariance;
        assert_abs_diff_eq!((cov - cov.transpose()).norm(), 0.0, epsilon = 1e-12);
        let eigen = nalgebra::SymmetricEigen::new(cov);
        assert!(eigen.eigenvalues.iter().all(|&e| e >= -1e-15));
    }

    #[test]
    fn sqrt_information_whitens() {
        let mut preint = Preintegrated::new(Vector3::zeros(), Vector3::zeros());
        for _ in 0..50 {
            preint.integrate(&Vector3::new(0.1, 0.0, 0.0), &Vector3::new(0.0, 0.0, 9.8), 0.005, &noise());
        }
        let w = preint.sqrt_information().unwrap();
        let sigma: Matrix9 = preint.covariance.fixed_view::<9, 9>(0, 0).into_owned();
        let should_be_identity = w * sigma * w.transpose();
        assert_abs_diff_eq!(
            (should_be_identity - Matrix9::identity()).norm(),
            0.0,
            epsilon = 1e-6
        );
    }
}
