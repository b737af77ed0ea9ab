//! Canned synthetic scenarios.
//!
//! Shared between the `simulate` binary and the end-to-end tests: each
//! constructor returns a trajectory and the injected truth for a 10-second
//! run at 200 Hz IMU / 100 Hz capture with reference times every 50 ms.

use super::{
    feed, simulate, ConstantVelocity, Excited, Scenario, SimData, SineAccel, Stationary,
    Trajectory,
};
use crate::config::{EstimatorConfig, ImuNoise};
use crate::error::Result;
use crate::graph::{EstimationResult, GraphSolver};
use crate::interpolator::Interpolator;
use crate::propagator::Propagator;
use nalgebra::{UnitQuaternion, Vector3};

/// No motion, no biases.
pub fn stationary() -> (Box<dyn Trajectory>, Scenario) {
    (Box::new(Stationary), Scenario::default())
}

/// Constant 0.3 rad/s yaw with a 15-degree injected extrinsic rotation.
///
/// Carries some translational excitation: spinning in place about a single
/// axis leaves the yaw of the trajectory, the gravity tilt and the
/// extrinsic rotation coupled along an unobservable direction.
pub fn constant_yaw() -> (Box<dyn Trajectory>, Scenario) {
    let axis = Vector3::new(0.2, -0.4, 1.0).normalize();
    let scenario = Scenario {
        extrinsic_rotation: UnitQuaternion::from_scaled_axis(axis * 15.0_f64.to_radians()),
        ..Scenario::default()
    };
    let trajectory = Excited {
        yaw_rate: 0.3,
        rock_amplitude: 0.0,
        rock_frequency: 0.0,
        translation_amplitude: Vector3::new(0.5, 0.3, 0.2),
        translation_frequency: Vector3::new(0.4, 0.3, 0.5),
    };
    (Box::new(trajectory), scenario)
}

/// 1 m/s^2 peak sinusoidal acceleration at 0.5 Hz, no rotation.
pub fn sine_acceleration() -> (Box<dyn Trajectory>, Scenario) {
    (
        Box::new(SineAccel {
            peak: 1.0,
            frequency: 0.5,
        }),
        Scenario::default(),
    )
}

/// Well-excited trajectory with a 7 ms injected time offset.
pub fn injected_time_offset() -> (Box<dyn Trajectory>, Scenario) {
    let scenario = Scenario {
        time_offset: 0.007,
        ..Scenario::default()
    };
    (Box::new(Excited::default()), scenario)
}

/// Well-excited trajectory with sensor noise at the configured densities.
pub fn noisy() -> (Box<dyn Trajectory>, Scenario) {
    let scenario = Scenario {
        imu_noise: ImuNoise::default(),
        // Capture sigmas loose enough that the inertial chain, not the
        // capture stream, pins the trajectory.
        vicon_sigma_rot: 5e-4,
        vicon_sigma_pos: 1e-4,
        inject_vicon_noise: true,
        gyro_bias: Vector3::new(0.004, -0.002, 0.003),
        accel_bias: Vector3::new(0.02, 0.01, -0.015),
        seed: 7,
        ..Scenario::default()
    };
    (Box::new(Excited::default()), scenario)
}

/// Straight-line motion without rotation: calibration is unobservable.
pub fn straight_line() -> (Box<dyn Trajectory>, Scenario) {
    (
        Box::new(ConstantVelocity {
            vel: Vector3::new(0.5, 0.2, 0.0),
        }),
        Scenario::default(),
    )
}

/// Generate, feed, and solve one scenario.
pub fn run(
    trajectory: &dyn Trajectory,
    scenario: &Scenario,
    config: EstimatorConfig,
) -> Result<(EstimationResult, SimData)> {
    let data = simulate(trajectory, scenario);
    run_data(&data, config).map(|result| (result, data))
}

/// Feed an existing dataset and solve.
pub fn run_data(data: &SimData, config: EstimatorConfig) -> Result<EstimationResult> {
    let mut propagator = Propagator::new(config.imu_noise.clone());
    let mut interpolator = Interpolator::new();
    feed(data, &mut propagator, &mut interpolator)?;
    let mut solver = GraphSolver::new(config)?;
    solver.set_reference_times(data.reference_times.clone());
    solver.build_and_solve(&propagator, &interpolator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn rotation_rms(result: &EstimationResult, data: &SimData) -> f64 {
        let n = result.states.len();
        let sum: f64 = result
            .states
            .iter()
            .zip(&data.truth)
            .map(|(est, truth)| est.rot.angle_to(&truth.rot).powi(2))
            .sum();
        (sum / n as f64).sqrt()
    }

    fn position_rms(result: &EstimationResult, data: &SimData) -> f64 {
        let n = result.states.len();
        let sum: f64 = result
            .states
            .iter()
            .zip(&data.truth)
            .map(|(est, truth)| (est.pos - truth.pos).norm_squared())
            .sum();
        (sum / n as f64).sqrt()
    }

    fn velocity_rms(result: &EstimationResult, data: &SimData) -> f64 {
        let n = result.states.len();
        let sum: f64 = result
            .states
            .iter()
            .zip(&data.truth)
            .map(|(est, truth)| (est.vel - truth.vel).norm_squared())
            .sum();
        (sum / n as f64).sqrt()
    }

    #[test]
    fn s1_stationary_recovers_rest() {
        let (trajectory, scenario) = stationary();
        let (result, data) = run(
            trajectory.as_ref(),
            &scenario,
            EstimatorConfig::default(),
        )
        .unwrap();

        for state in &result.states {
            assert!(state.rot.angle() < 1e-5, "orientation should stay identity");
            assert!(state.pos.norm() < 1e-5);
            assert!(state.vel.norm() < 1e-5);
            assert!(state.gyro_bias.norm() < 1e-4);
            assert!(state.accel_bias.norm() < 1e-4);
        }
        let _ = data;

        // Gravity within 0.1 degrees of -z.
        let g = result.calibration.gravity;
        let cos = -g.z / g.norm();
        assert!(cos.acos() < 0.1_f64.to_radians(), "gravity tilt too large");
    }

    #[test]
    fn s2_constant_yaw_recovers_extrinsic_rotation() {
        let (trajectory, scenario) = constant_yaw();
        let (result, data) = run(
            trajectory.as_ref(),
            &scenario,
            EstimatorConfig::default(),
        )
        .unwrap();

        assert!(result.calibration_observable);
        assert!(
            rotation_rms(&result, &data) < 1e-4,
            "orientation RMS {} too large",
            rotation_rms(&result, &data)
        );
        let riv_error = result
            .calibration
            .extrinsic_rotation
            .angle_to(&scenario.extrinsic_rotation);
        assert!(
            riv_error < 0.05_f64.to_radians(),
            "extrinsic rotation error {} rad",
            riv_error
        );
    }

    #[test]
    fn s3_sinusoidal_acceleration_tracks_position() {
        let (trajectory, scenario) = sine_acceleration();
        let (result, data) = run(
            trajectory.as_ref(),
            &scenario,
            EstimatorConfig::default(),
        )
        .unwrap();

        assert!(
            position_rms(&result, &data) < 2e-3,
            "position RMS {}",
            position_rms(&result, &data)
        );
        assert!(
            velocity_rms(&result, &data) < 5e-3,
            "velocity RMS {}",
            velocity_rms(&result, &data)
        );
    }

    #[test]
    fn s4_recovers_injected_time_offset() {
        let (trajectory, scenario) = injected_time_offset();
        let (result, _) = run(
            trajectory.as_ref(),
            &scenario,
            EstimatorConfig::default(),
        )
        .unwrap();

        assert!(result.calibration_observable);
        let error = (result.calibration.time_offset - scenario.time_offset).abs();
        assert!(error < 2e-4, "time offset error {} s", error);
    }

    #[test]
    fn s5_noisy_inputs_are_statistically_consistent() {
        let (trajectory, scenario) = noisy();
        let (result, data) = run(
            trajectory.as_ref(),
            &scenario,
            EstimatorConfig::default(),
        )
        .unwrap();

        // Chi-square of the whitened capture residuals.
        let dof = result.vicon_dof as f64;
        assert!(
            result.vicon_chi2 > 0.8 * dof && result.vicon_chi2 < 1.2 * dof,
            "vicon chi2 {} for {} dof",
            result.vicon_chi2,
            dof
        );

        // Per-axis position residuals against the noisy measurements are
        // zero-mean within 3 sigma of the sample mean.
        let mut interpolator = Interpolator::new();
        for pose in &data.vicon {
            interpolator
                .feed_pose(
                    pose.t,
                    *pose.rot.quaternion(),
                    pose.pos,
                    pose.cov_rot,
                    pose.cov_pos,
                )
                .unwrap();
        }
        let toff = result.calibration.time_offset;
        let mut mean = Vector3::zeros();
        let n = result.states.len();
        for (state, &t) in result.states.iter().zip(&result.times) {
            let meas = interpolator.interpolate(t - toff).unwrap();
            mean += state.pos - meas.pos;
        }
        mean /= n as f64;
        let limit = 3.0 * scenario.vicon_sigma_pos / (n as f64).sqrt();
        for axis in 0..3 {
            assert!(
                mean[axis].abs() < limit,
                "axis {} residual mean {} exceeds {}",
                axis,
                mean[axis],
                limit
            );
        }

        // Biases recovered near truth.
        let mid = &result.states[n / 2];
        assert!((mid.gyro_bias - scenario.gyro_bias).norm() < 2e-3);
        assert!((mid.accel_bias - scenario.accel_bias).norm() < 2e-2);
    }

    #[test]
    fn s6_straight_line_holds_calibration_fixed() {
        let (trajectory, scenario) = straight_line();
        let (result, _) = run(
            trajectory.as_ref(),
            &scenario,
            EstimatorConfig::default(),
        )
        .unwrap();

        assert!(!result.calibration_observable);
        assert!(result.calibration.extrinsic_rotation_std.is_none());
        assert!(result.calibration.time_offset_std.is_none());
        // Extrinsic rotation untouched from its prior.
        assert_abs_diff_eq!(
            result.calibration.extrinsic_rotation.angle(),
            0.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn gradient_vanishes_when_initialized_at_truth() {
        // Stationary, exactly consistent data: the initializer lands on the
        // truth, so the first linearization must already be stationary.
        // Moderate information weights keep the check above the
        // floating-point noise floor of the whitened residuals.
        let (trajectory, mut scenario) = stationary();
        scenario.vicon_sigma_rot = 1e-2;
        scenario.vicon_sigma_pos = 1e-2;
        let mut config = EstimatorConfig::default();
        config.imu_noise = ImuNoise {
            gyro_noise_density: 1e-2,
            accel_noise_density: 1e-1,
            gyro_random_walk: 1e-3,
            accel_random_walk: 1e-2,
        };
        let (result, _) = run(trajectory.as_ref(), &scenario, config).unwrap();
        assert!(
            result.initial_gradient_norm <= 1e-6,
            "gradient at truth {}",
            result.initial_gradient_norm
        );
    }

    #[test]
    fn converges_from_perturbed_initialization() {
        let (trajectory, scenario) = injected_time_offset();
        let data = simulate(trajectory.as_ref(), &scenario);

        // Perturb the truth states: +-10 degrees, +-0.5 m, +-0.1 rad/s.
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let mut unit = || rng.gen_range(-1.0..1.0);
        let perturbed: Vec<_> = data
            .truth
            .iter()
            .map(|state| {
                let dtheta =
                    Vector3::new(unit(), unit(), unit()).normalize() * 10.0_f64.to_radians();
                let mut delta = [0.0; crate::types::NODE_DOF];
                delta[0] = dtheta.x;
                delta[1] = dtheta.y;
                delta[2] = dtheta.z;
                for i in 3..6 {
                    delta[i] = 0.5 * unit();
                }
                for i in 6..9 {
                    delta[i] = 0.2 * unit();
                }
                for i in 9..12 {
                    delta[i] = 0.1 * unit();
                }
                for i in 12..15 {
                    delta[i] = 0.1 * unit();
                }
                state.retract(&delta)
            })
            .collect();

        let config = EstimatorConfig::default();
        let mut propagator = Propagator::new(config.imu_noise.clone());
        let mut interpolator = Interpolator::new();
        feed(&data, &mut propagator, &mut interpolator).unwrap();
        let mut solver = GraphSolver::new(config).unwrap();
        solver.set_reference_times(data.reference_times.clone());
        solver.set_initial_states(perturbed);
        let result = solver.build_and_solve(&propagator, &interpolator).unwrap();

        assert!(result.iterations <= 50, "{} iterations", result.iterations);
        assert!(
            position_rms(&result, &data) < 1e-3,
            "position RMS {}",
            position_rms(&result, &data)
        );
        assert!(
            rotation_rms(&result, &data) < 1e-3,
            "rotation RMS {}",
            rotation_rms(&result, &data)
        );
    }

    #[test]
    fn exported_covariances_are_symmetric_psd() {
        let (trajectory, scenario) = injected_time_offset();
        let (result, _) = run(
            trajectory.as_ref(),
            &scenario,
            EstimatorConfig::default(),
        )
        .unwrap();
        for cov in result.state_covariances.iter().step_by(20) {
            assert_abs_diff_eq!((cov - cov.transpose()).norm(), 0.0, epsilon = 1e-12);
            let eigen = nalgebra::SymmetricEigen::new(*cov);
            assert!(eigen.eigenvalues.iter().all(|&e| e >= -1e-12));
        }
    }

    #[test]
    fn cancellation_flags_the_result() {
        let (trajectory, scenario) = injected_time_offset();
        let data = simulate(trajectory.as_ref(), &scenario);
        let config = EstimatorConfig::default();
        let mut propagator = Propagator::new(config.imu_noise.clone());
        let mut interpolator = Interpolator::new();
        feed(&data, &mut propagator, &mut interpolator).unwrap();
        let mut solver = GraphSolver::new(config).unwrap();
        solver.set_reference_times(data.reference_times.clone());
        solver.set_cancel_callback(Box::new(|| true));
        let result = solver.build_and_solve(&propagator, &interpolator).unwrap();
        assert!(result.cancelled);
    }
}
