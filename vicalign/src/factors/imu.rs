//! Preintegration factor between two consecutive state nodes.

use crate::preintegration::Preintegrated;
use crate::types::NavState;
use nalgebra::Vector3;
use vicalign_solver::jet::Real;
use vicalign_solver::lie::{so3_exp, so3_log, M3, V3};

/// Residual rows of one preintegration factor: rotation, velocity, position.
pub const IMU_RESIDUAL_DOF: usize = 9;

/// 9-dof preintegration residual.
///
/// Both nodes are parameterized as host states plus tangent deltas
/// `[dtheta, dp, dv, dbg, dba]` (15 each). The stored measurement is
/// corrected to the node-i bias estimate at first order using the
/// preintegration Jacobians, so bias deltas flow through the residual.
/// `gravity` is the gravity vector in the capture frame, which is also the
/// world frame of the state trajectory.
pub fn preintegration_residual<T: Real>(
    host_i: &NavState,
    delta_i: &[T],
    host_j: &NavState,
    delta_j: &[T],
    preint: &Preintegrated,
    gravity: &V3<T>,
) -> [T; IMU_RESIDUAL_DOF] {
    let rot_i = M3::lift(&host_i.rot_matrix())
        * so3_exp(V3::new(delta_i[0], delta_i[1], delta_i[2]));
    let pos_i = V3::lift(&host_i.pos) + V3::new(delta_i[3], delta_i[4], delta_i[5]);
    let vel_i = V3::lift(&host_i.vel) + V3::new(delta_i[6], delta_i[7], delta_i[8]);
    let bg_i = V3::lift(&host_i.gyro_bias) + V3::new(delta_i[9], delta_i[10], delta_i[11]);
    let ba_i = V3::lift(&host_i.accel_bias) + V3::new(delta_i[12], delta_i[13], delta_i[14]);

    let rot_j = M3::lift(&host_j.rot_matrix())
        * so3_exp(V3::new(delta_j[0], delta_j[1], delta_j[2]));
    let pos_j = V3::lift(&host_j.pos) + V3::new(delta_j[3], delta_j[4], delta_j[5]);
    let vel_j = V3::lift(&host_j.vel) + V3::new(delta_j[6], delta_j[7], delta_j[8]);

    // First-order bias correction of the stored measurement.
    let dbg = bg_i - V3::lift(&preint.bg_lin);
    let dba = ba_i - V3::lift(&preint.ba_lin);
    let theta = V3::lift(&preint.delta_rot.scaled_axis()) + M3::lift(&preint.d_rot_d_bg).mul_vec(dbg);
    let delta_rot = so3_exp(theta);
    let delta_vel = V3::lift(&preint.delta_vel)
        + M3::lift(&preint.d_vel_d_bg).mul_vec(dbg)
        + M3::lift(&preint.d_vel_d_ba).mul_vec(dba);
    let delta_pos = V3::lift(&preint.delta_pos)
        + M3::lift(&preint.d_pos_d_bg).mul_vec(dbg)
        + M3::lift(&preint.d_pos_d_ba).mul_vec(dba);

    let dt = T::from_f64(preint.dt);
    let half_dt_sq = T::from_f64(0.5 * preint.dt * preint.dt);
    let rot_i_inv = rot_i.transpose();

    // r_R = Log(dR^T R_i^T R_j)
    let r_rot = so3_log(&(delta_rot.transpose() * (rot_i_inv * rot_j)));

    // r_v = R_i^T (v_j - v_i - g dt) - dv
    let vel_diff = vel_j - vel_i - gravity.scale(dt);
    let r_vel = rot_i_inv.mul_vec(vel_diff) - delta_vel;

    // r_p = R_i^T (p_j - p_i - v_i dt - 1/2 g dt^2) - dp
    let pos_diff = pos_j - pos_i - vel_i.scale(dt) - gravity.scale(half_dt_sq);
    let r_pos = rot_i_inv.mul_vec(pos_diff) - delta_pos;

    [
        r_rot.x, r_rot.y, r_rot.z, r_vel.x, r_vel.y, r_vel.z, r_pos.x, r_pos.y, r_pos.z,
    ]
}

/// Predict the node-j state from node i and a preintegrated measurement;
/// used by tests to build consistent fixtures.
pub fn propagate_state(
    state_i: &NavState,
    preint: &Preintegrated,
    gravity: &Vector3<f64>,
) -> NavState {
    let rot_i = state_i.rot_matrix();
    let (theta, dvel, dpos) = preint.corrected(&state_i.gyro_bias, &state_i.accel_bias);
    let delta_rot = vicalign_solver::lie::exp_so3(&theta);
    let dt = preint.dt;
    NavState {
        rot: nalgebra::UnitQuaternion::from_rotation_matrix(
            &nalgebra::Rotation3::from_matrix_unchecked(rot_i * delta_rot),
        ),
        pos: state_i.pos + state_i.vel * dt + 0.5 * gravity * dt * dt + rot_i * dpos,
        vel: state_i.vel + gravity * dt + rot_i * dvel,
        gyro_bias: state_i.gyro_bias,
        accel_bias: state_i.accel_bias,
    }
}
