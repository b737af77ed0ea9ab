//! Interpolated-pose factor.
//!
//! Each factor stores the bracketing pose pair around its query time and
//! re-interpolates *inside* the residual at the current time offset. The
//! interpolation fraction is a function of the time-offset parameter, so a
//! jet evaluation produces the exact Jacobian with respect to the offset
//! through the spline derivative.
//!
//! Clock convention: `IMU_time = Vicon_time + t_off`. The factor's query
//! time `t` is on the IMU clock, so the pose buffer is read at `t - t_off`.

use crate::types::NavState;
use nalgebra::{Matrix3, Matrix6, UnitQuaternion, Vector3};
use vicalign_solver::jet::Real;
use vicalign_solver::lie::{log_so3, so3_exp, so3_log, M3, V3};

/// Residual rows of one pose factor: rotation, position.
pub const VICON_RESIDUAL_DOF: usize = 6;

/// Frozen bracketing measurement for one reference time.
#[derive(Debug, Clone)]
pub struct ViconObservation {
    /// Query time on the IMU clock.
    pub t: f64,
    pub t0: f64,
    pub t1: f64,
    pub rot0: Matrix3<f64>,
    pub rot1: Matrix3<f64>,
    pub pos0: Vector3<f64>,
    pub pos1: Vector3<f64>,
    /// `Log(rot0^T rot1)`, precomputed.
    pub log01: Vector3<f64>,
    /// Inverse lower Cholesky factor of the interpolated 6x6 covariance at
    /// the linearization offset.
    pub sqrt_info: Matrix6<f64>,
}

/// 6-dof interpolated-pose residual
/// `(Log(R_meas^T R_k R_IV), p_k + R_k arm - p_meas)`.
///
/// `delta_pose` are the first six tangent entries of the node
/// (`[dtheta, dp]`), `riv_delta` the tangent of the extrinsic rotation, and
/// `toff_delta` the offset from `toff_host`.
pub fn vicon_residual<T: Real>(
    host: &NavState,
    delta_pose: &[T],
    riv_host: &UnitQuaternion<f64>,
    riv_delta: &[T],
    toff_host: f64,
    toff_delta: T,
    arm: &Vector3<f64>,
    obs: &ViconObservation,
) -> [T; VICON_RESIDUAL_DOF] {
    // lambda(t_off) = (t - t_off - t0) / (t1 - t0)
    let lambda = (T::from_f64(obs.t - toff_host - obs.t0) - toff_delta)
        / T::from_f64(obs.t1 - obs.t0);
    let one = T::one();

    let rot_meas = M3::lift(&obs.rot0) * so3_exp(V3::lift(&obs.log01).scale(lambda));
    let pos_meas = V3::lift(&obs.pos0).scale(one - lambda) + V3::lift(&obs.pos1).scale(lambda);

    let rot_k = M3::lift(&host.rot_matrix())
        * so3_exp(V3::new(delta_pose[0], delta_pose[1], delta_pose[2]));
    let pos_k = V3::lift(&host.pos) + V3::new(delta_pose[3], delta_pose[4], delta_pose[5]);

    let riv = M3::lift(&riv_host.to_rotation_matrix().into_inner())
        * so3_exp(V3::new(riv_delta[0], riv_delta[1], riv_delta[2]));

    let r_rot = so3_log(&(rot_meas.transpose() * (rot_k * riv)));
    let r_pos = pos_k + rot_k.mul_vec(V3::lift(arm)) - pos_meas;

    [r_rot.x, r_rot.y, r_rot.z, r_pos.x, r_pos.y, r_pos.z]
}

impl ViconObservation {
    /// Build an observation from a bracketing pair, without whitening.
    pub fn from_bracket(
        t: f64,
        t0: f64,
        rot0: &UnitQuaternion<f64>,
        pos0: Vector3<f64>,
        t1: f64,
        rot1: &UnitQuaternion<f64>,
        pos1: Vector3<f64>,
    ) -> Self {
        let rot0 = rot0.to_rotation_matrix().into_inner();
        let rot1 = rot1.to_rotation_matrix().into_inner();
        let log01 = log_so3(&(rot0.transpose() * rot1));
        Self {
            t,
            t0,
            t1,
            rot0,
            rot1,
            pos0,
            pos1,
            log01,
            sqrt_info: Matrix6::identity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use vicalign_solver::Jet;

    type Jet10 = Jet<10>;

    fn fixture() -> (NavState, UnitQuaternion<f64>, ViconObservation) {
        let riv = UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.0, 0.26));
        let rot0 = UnitQuaternion::from_scaled_axis(Vector3::new(0.1, 0.0, 0.3));
        let rot1 = UnitQuaternion::from_scaled_axis(Vector3::new(0.12, 0.02, 0.36));
        let obs = ViconObservation::from_bracket(
            0.505,
            0.5,
            &rot0,
            Vector3::new(1.0, 0.0, 0.0),
            0.51,
            &rot1,
            Vector3::new(1.0, 0.05, 0.0),
        );
        // State consistent with the measurement at lambda = 0.5 (toff = 0):
        // R_k = R_meas R_IV^T, p_k = p_meas.
        let rot_meas = obs.rot0 * vicalign_solver::lie::exp_so3(&(0.5 * obs.log01));
        let pos_meas = 0.5 * (obs.pos0 + obs.pos1);
        let state = NavState {
            rot: UnitQuaternion::from_rotation_matrix(
                &nalgebra::Rotation3::from_matrix_unchecked(
                    rot_meas * riv.to_rotation_matrix().into_inner().transpose(),
                ),
            ),
            pos: pos_meas,
            ..NavState::identity()
        };
        (state, riv, obs)
    }

    #[test]
    fn residual_vanishes_on_consistent_state() {
        let (state, riv, obs) = fixture();
        let res = vicon_residual::<f64>(
            &state,
            &[0.0; 6],
            &riv,
            &[0.0; 3],
            0.0,
            0.0,
            &Vector3::zeros(),
            &obs,
        );
        for r in res {
            assert_abs_diff_eq!(r, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn position_arm_shifts_the_position_residual() {
        let (state, riv, obs) = fixture();
        let arm = Vector3::new(0.1, 0.0, 0.0);
        let res = vicon_residual::<f64>(
            &state,
            &[0.0; 6],
            &riv,
            &[0.0; 3],
            0.0,
            0.0,
            &arm,
            &obs,
        );
        let expected = state.rot_matrix() * arm;
        assert_abs_diff_eq!(res[3], expected.x, epsilon = 1e-12);
        assert_abs_diff_eq!(res[4], expected.y, epsilon = 1e-12);
        assert_abs_diff_eq!(res[5], expected.z, epsilon = 1e-12);
    }

    #[test]
    fn time_offset_jacobian_matches_spline_derivative() {
        let (state, riv, obs) = fixture();
        let arm = Vector3::zeros();

        // Jet evaluation with toff as variable 9.
        let deltas: [Jet10; 6] = std::array::from_fn(|_| Jet10::constant(0.0));
        let riv_deltas: [Jet10; 3] = std::array::from_fn(|_| Jet10::constant(0.0));
        let jet_res = vicon_residual(
            &state,
            &deltas,
            &riv,
            &riv_deltas,
            0.0,
            Jet10::variable(0.0, 9),
            &arm,
            &obs,
        );

        // Finite difference in the offset.
        let h = 1e-7;
        let base = vicon_residual::<f64>(&state, &[0.0; 6], &riv, &[0.0; 3], 0.0, 0.0, &arm, &obs);
        let plus = vicon_residual::<f64>(&state, &[0.0; 6], &riv, &[0.0; 3], 0.0, h, &arm, &obs);
        for row in 0..VICON_RESIDUAL_DOF {
            let fd = (plus[row] - base[row]) / h;
            assert_abs_diff_eq!(jet_res[row].grad[9], fd, epsilon = 1e-5);
        }

        // The position rows must see exactly the blend slope
        // d p_meas / d toff = (p0 - p1) / (t1 - t0), negated into the
        // residual.
        let slope = (obs.pos0 - obs.pos1) / (obs.t1 - obs.t0);
        assert_abs_diff_eq!(jet_res[4].grad[9], -slope.y, epsilon = 1e-9);
    }

    #[test]
    fn pose_and_extrinsic_jacobians_match_finite_differences() {
        let (state, riv, obs) = fixture();
        let arm = Vector3::new(0.02, -0.01, 0.03);

        let deltas: [Jet10; 6] = std::array::from_fn(|k| Jet10::variable(0.0, k));
        let riv_deltas: [Jet10; 3] = std::array::from_fn(|k| Jet10::variable(0.0, 6 + k));
        let jet_res = vicon_residual(
            &state,
            &deltas,
            &riv,
            &riv_deltas,
            0.0,
            Jet10::constant(0.0),
            &arm,
            &obs,
        );

        let h = 1e-6;
        let base = vicon_residual::<f64>(&state, &[0.0; 6], &riv, &[0.0; 3], 0.0, 0.0, &arm, &obs);
        for var in 0..9 {
            let mut dp = [0.0f64; 6];
            let mut dr = [0.0f64; 3];
            if var < 6 {
                dp[var] = h;
            } else {
                dr[var - 6] = h;
            }
            let plus = vicon_residual::<f64>(&state, &dp, &riv, &dr, 0.0, 0.0, &arm, &obs);
            for row in 0..VICON_RESIDUAL_DOF {
                let fd = (plus[row] - base[row]) / h;
                assert_abs_diff_eq!(jet_res[row].grad[var], fd, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn sign_flipped_bracket_quaternion_changes_nothing() {
        // Rotation matrices are insensitive to the quaternion double cover;
        // two observations built from q and -q are identical.
        let rot = UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.0, 1.2));
        let flipped = UnitQuaternion::from_quaternion(-*rot.quaternion());
        let a = ViconObservation::from_bracket(
            0.5,
            0.4,
            &rot,
            Vector3::zeros(),
            0.6,
            &flipped,
            Vector3::zeros(),
        );
        let b = ViconObservation::from_bracket(
            0.5,
            0.4,
            &rot,
            Vector3::zeros(),
            0.6,
            &rot,
            Vector3::zeros(),
        );
        assert_abs_diff_eq!((a.log01 - b.log01).norm(), 0.0, epsilon = 1e-12);
    }
}
