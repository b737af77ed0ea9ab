//! Result file writers: the per-node states CSV and the calibration info
//! text file.

use crate::graph::EstimationResult;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// One row per reference timestamp:
/// `t, qx, qy, qz, qw, px, py, pz, vx, vy, vz, bgx, bgy, bgz, bax, bay, baz`
/// with time at nanosecond precision and everything else at micro scale.
pub fn write_states_csv(path: &Path, result: &EstimationResult) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(
        out,
        "# t, qx, qy, qz, qw, px, py, pz, vx, vy, vz, bgx, bgy, bgz, bax, bay, baz"
    )?;
    for (state, &t) in result.states.iter().zip(&result.times) {
        let q = state.rot.quaternion();
        write!(out, "{:.9},", t)?;
        write!(out, "{:.6},{:.6},{:.6},{:.6},", q.i, q.j, q.k, q.w)?;
        write!(
            out,
            "{:.6},{:.6},{:.6},",
            state.pos.x, state.pos.y, state.pos.z
        )?;
        write!(
            out,
            "{:.6},{:.6},{:.6},",
            state.vel.x, state.vel.y, state.vel.z
        )?;
        write!(
            out,
            "{:.6},{:.6},{:.6},",
            state.gyro_bias.x, state.gyro_bias.y, state.gyro_bias.z
        )?;
        writeln!(
            out,
            "{:.6},{:.6},{:.6}",
            state.accel_bias.x, state.accel_bias.y, state.accel_bias.z
        )?;
    }
    out.flush()
}

/// Calibration results, their marginal standard deviations, and run
/// statistics.
pub fn write_info(path: &Path, result: &EstimationResult) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    let calib = &result.calibration;
    let q = calib.extrinsic_rotation.quaternion();
    let rot = calib.extrinsic_rotation.to_rotation_matrix();

    writeln!(out, "extrinsic rotation (quaternion xyzw):")?;
    writeln!(out, "  {:.9} {:.9} {:.9} {:.9}", q.i, q.j, q.k, q.w)?;
    writeln!(out, "extrinsic rotation (matrix):")?;
    for r in 0..3 {
        writeln!(
            out,
            "  {:.9} {:.9} {:.9}",
            rot[(r, 0)],
            rot[(r, 1)],
            rot[(r, 2)]
        )?;
    }
    match calib.extrinsic_rotation_std {
        Some(std) => writeln!(
            out,
            "extrinsic rotation std (rad): {:.9} {:.9} {:.9}",
            std.x, std.y, std.z
        )?,
        None => writeln!(out, "extrinsic rotation: held fixed")?,
    }
    writeln!(
        out,
        "position arm (m, fixed): {:.9} {:.9} {:.9}",
        calib.position_arm.x, calib.position_arm.y, calib.position_arm.z
    )?;

    writeln!(
        out,
        "gravity in capture frame: {:.9} {:.9} {:.9}",
        calib.gravity.x, calib.gravity.y, calib.gravity.z
    )?;
    match calib.gravity_std {
        Some(std) => writeln!(out, "gravity tangent std (rad): {:.9} {:.9}", std[0], std[1])?,
        None => writeln!(out, "gravity: held fixed")?,
    }

    writeln!(out, "time offset (s): {:.9}", calib.time_offset)?;
    match calib.time_offset_std {
        Some(std) => writeln!(out, "time offset std (s): {:.9}", std)?,
        None => writeln!(out, "time offset: held fixed")?,
    }

    writeln!(out)?;
    writeln!(out, "calibration observable: {}", result.calibration_observable)?;
    writeln!(out, "iterations: {}", result.iterations)?;
    writeln!(out, "converged: {}", result.converged)?;
    writeln!(out, "cancelled: {}", result.cancelled)?;
    writeln!(out, "final cost: {:.6e}", result.final_cost)?;
    writeln!(
        out,
        "pose residual chi2 / dof: {:.3} / {}",
        result.vicon_chi2, result.vicon_dof
    )?;
    writeln!(out)?;
    writeln!(out, "imu samples: {}", result.imu_count)?;
    writeln!(out, "pose samples: {}", result.pose_count)?;
    writeln!(
        out,
        "reference timestamps: {} used, {} dropped",
        result.reference_count, result.dropped_reference
    )?;
    out.flush()
}
