//! CSV-file adapter around the estimator.
//!
//! Reads three CSV streams and writes the states CSV and calibration info
//! file:
//! * `--imu`: rows `t, wx, wy, wz, ax, ay, az`
//! * `--vicon`: rows `t, qx, qy, qz, qw, px, py, pz` with an optional
//!   trailing 6x6 row-major covariance (rotation block first); odometry
//!   exports with extra twist columns are accepted and normalized to the
//!   pose shape
//! * `--times`: one reference timestamp per row
//!
//! Exit codes: 0 success, 1 insufficient data, 2 interpolation out of
//! range, 3 optimizer failure, 4 configuration error.

use anyhow::{Context, Result};
use clap::Parser;
use nalgebra::{Matrix3, Quaternion, Vector3};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};
use vicalign::{output, Error, EstimatorConfig, GraphSolver, Interpolator, Propagator};

#[derive(Parser, Debug)]
#[command(version, about = "Estimate a state trajectory and Vicon-IMU calibration from CSV streams")]
struct Args {
    /// IMU stream CSV.
    #[arg(long)]
    imu: PathBuf,

    /// Pose stream CSV.
    #[arg(long)]
    vicon: PathBuf,

    /// Reference timestamps CSV.
    #[arg(long)]
    times: PathBuf,

    /// Output states CSV.
    #[arg(long, default_value = "gt_states.csv")]
    states_out: PathBuf,

    /// Output calibration info file.
    #[arg(long, default_value = "vicalign_info.txt")]
    info_out: PathBuf,

    /// Process only data with `t >= start_time`.
    #[arg(long, default_value_t = f64::NEG_INFINITY)]
    start_time: f64,

    /// Process at most this many seconds of data (negative: everything).
    #[arg(long, default_value_t = -1.0)]
    duration: f64,

    #[arg(long, default_value_t = 1.6968e-4)]
    gyroscope_noise_density: f64,
    #[arg(long, default_value_t = 2.0e-3)]
    accelerometer_noise_density: f64,
    #[arg(long, default_value_t = 1.9393e-5)]
    gyroscope_random_walk: f64,
    #[arg(long, default_value_t = 3.0e-3)]
    accelerometer_random_walk: f64,

    /// Pose sigmas `rx,ry,rz,x,y,z` for samples without covariance.
    #[arg(long, value_delimiter = ',')]
    vicon_sigmas: Option<Vec<f64>>,

    /// Replace every sample covariance with `--vicon-sigmas`.
    #[arg(long)]
    use_manual_sigmas: bool,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    estimate_time_offset: bool,
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    estimate_extrinsic_rotation: bool,
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    estimate_gravity: bool,

    #[arg(long, default_value_t = 100)]
    max_iterations: usize,
    #[arg(long, default_value_t = 1e-6)]
    relative_tol: f64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<Error>() {
        Some(Error::InsufficientData(_)) => 1,
        Some(Error::OutOfRange { .. }) => 2,
        Some(Error::NumericalFailure(_)) | Some(Error::Diverged(_)) => 3,
        Some(Error::Config(_)) => 4,
        _ => 1,
    }
}

fn run(args: &Args) -> Result<()> {
    let mut config = EstimatorConfig::default();
    config.imu_noise.gyro_noise_density = args.gyroscope_noise_density;
    config.imu_noise.accel_noise_density = args.accelerometer_noise_density;
    config.imu_noise.gyro_random_walk = args.gyroscope_random_walk;
    config.imu_noise.accel_random_walk = args.accelerometer_random_walk;
    if let Some(sigmas) = &args.vicon_sigmas {
        if sigmas.len() != 6 {
            return Err(Error::Config(format!(
                "--vicon-sigmas expects 6 values, got {}",
                sigmas.len()
            ))
            .into());
        }
        config.vicon_sigmas = [
            sigmas[0], sigmas[1], sigmas[2], sigmas[3], sigmas[4], sigmas[5],
        ];
    }
    config.use_manual_sigmas = args.use_manual_sigmas;
    config.estimate_time_offset = args.estimate_time_offset;
    config.estimate_extrinsic_rotation = args.estimate_extrinsic_rotation;
    config.estimate_gravity = args.estimate_gravity;
    config.max_iterations = args.max_iterations;
    config.relative_cost_tol = args.relative_tol;

    let t_end = if args.duration < 0.0 {
        f64::INFINITY
    } else {
        args.start_time + args.duration
    };
    let in_window = |t: f64| t >= args.start_time && t < t_end;

    // IMU stream.
    let mut propagator = Propagator::new(config.imu_noise.clone());
    let mut imu_dropped = 0usize;
    for row in read_rows(&args.imu).context("reading IMU stream")? {
        if row.len() < 7 {
            warn!(fields = row.len(), "skipping short IMU row");
            continue;
        }
        if !in_window(row[0]) {
            continue;
        }
        let gyro = Vector3::new(row[1], row[2], row[3]);
        let accel = Vector3::new(row[4], row[5], row[6]);
        if let Err(err) = propagator.feed_imu(row[0], gyro, accel) {
            warn!(%err, "dropping IMU sample");
            imu_dropped += 1;
        }
    }

    // Pose stream: pose rows, odometry rows, with or without covariance.
    let manual_cov_rot = Matrix3::from_diagonal(&Vector3::new(
        config.vicon_sigmas[0].powi(2),
        config.vicon_sigmas[1].powi(2),
        config.vicon_sigmas[2].powi(2),
    ));
    let manual_cov_pos = Matrix3::from_diagonal(&Vector3::new(
        config.vicon_sigmas[3].powi(2),
        config.vicon_sigmas[4].powi(2),
        config.vicon_sigmas[5].powi(2),
    ));
    let mut interpolator = Interpolator::new();
    let mut pose_dropped = 0usize;
    for row in read_rows(&args.vicon).context("reading pose stream")? {
        if row.len() < 8 {
            warn!(fields = row.len(), "skipping short pose row");
            continue;
        }
        if !in_window(row[0]) {
            continue;
        }
        let q = Quaternion::new(row[4], row[1], row[2], row[3]); // w, x, y, z
        let p = Vector3::new(row[5], row[6], row[7]);
        // A trailing 6x6 row-major covariance (rotation block first) wins
        // over the manual sigmas unless overridden.
        let (mut cov_rot, mut cov_pos) = (manual_cov_rot, manual_cov_pos);
        if row.len() >= 8 + 36 {
            let cov = &row[row.len() - 36..];
            for r in 0..3 {
                for c in 0..3 {
                    cov_rot[(r, c)] = cov[6 * r + c];
                    cov_pos[(r, c)] = cov[6 * (r + 3) + (c + 3)];
                }
            }
        }
        if config.use_manual_sigmas {
            cov_rot = manual_cov_rot;
            cov_pos = manual_cov_pos;
        }
        if let Err(err) = interpolator.feed_pose(row[0], q, p, cov_rot, cov_pos) {
            warn!(%err, "dropping pose sample");
            pose_dropped += 1;
        }
    }

    // Reference timestamps.
    let mut reference_times = Vec::new();
    for row in read_rows(&args.times).context("reading reference timestamps")? {
        if !row.is_empty() && in_window(row[0]) {
            reference_times.push(row[0]);
        }
    }

    info!(
        imu = propagator.len(),
        imu_dropped,
        poses = interpolator.len(),
        pose_dropped,
        reference = reference_times.len(),
        "loaded input streams"
    );

    let mut solver = GraphSolver::new(config)?;
    solver.set_reference_times(reference_times);
    let result = solver.build_and_solve(&propagator, &interpolator)?;

    if !result.converged && !result.cancelled {
        warn!(
            iterations = result.iterations,
            cost = result.final_cost,
            "iteration cap reached before tolerances; results written anyway"
        );
    }
    info!(
        iterations = result.iterations,
        cost = result.final_cost,
        time_offset = result.calibration.time_offset,
        "estimation finished"
    );

    output::write_states_csv(&args.states_out, &result)
        .with_context(|| format!("writing {}", args.states_out.display()))?;
    output::write_info(&args.info_out, &result)
        .with_context(|| format!("writing {}", args.info_out.display()))?;
    info!(
        states = %args.states_out.display(),
        info = %args.info_out.display(),
        "wrote output artifacts"
    );
    Ok(())
}

/// Numeric CSV rows; `#` comments and blank lines are skipped.
fn read_rows(path: &Path) -> Result<Vec<Vec<f64>>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut rows = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut row = Vec::new();
        let mut bad = false;
        for field in line.split(',') {
            match field.trim().parse::<f64>() {
                Ok(v) => row.push(v),
                Err(_) => {
                    bad = true;
                    break;
                }
            }
        }
        if bad {
            warn!(line = lineno + 1, file = %path.display(), "skipping unparsable row");
            continue;
        }
        rows.push(row);
    }
    Ok(rows)
}
