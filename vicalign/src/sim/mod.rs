//! Synthetic data generation.
//!
//! Continuous trajectories with analytic derivatives produce IMU and
//! motion-capture streams with injected calibration truth (extrinsic
//! rotation, time offset, biases) and optional seeded noise, for end-to-end
//! validation of the estimator.

pub mod scenarios;

use crate::config::ImuNoise;
use crate::error::Result;
use crate::interpolator::Interpolator;
use crate::propagator::Propagator;
use crate::types::{ImuSample, NavState, PoseSample};
use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use vicalign_solver::lie::{exp_so3, log_so3};

/// Step used by the default finite-difference derivatives.
const DIFF_STEP: f64 = 1e-5;

/// A continuous rigid-body trajectory of the IMU in the capture frame.
///
/// `rotation`/`position` must be smooth; the derivative methods have
/// finite-difference defaults and analytic overrides where available.
pub trait Trajectory {
    /// Body-to-capture rotation at time `t`.
    fn rotation(&self, t: f64) -> Matrix3<f64>;

    /// Position in the capture frame at time `t` (m).
    fn position(&self, t: f64) -> Vector3<f64>;

    /// Linear velocity in the capture frame (m/s).
    fn velocity(&self, t: f64) -> Vector3<f64> {
        (self.position(t + DIFF_STEP) - self.position(t - DIFF_STEP)) / (2.0 * DIFF_STEP)
    }

    /// Linear acceleration in the capture frame (m/s^2).
    fn acceleration(&self, t: f64) -> Vector3<f64> {
        (self.velocity(t + DIFF_STEP) - self.velocity(t - DIFF_STEP)) / (2.0 * DIFF_STEP)
    }

    /// Body-frame angular velocity (rad/s).
    fn angular_velocity(&self, t: f64) -> Vector3<f64> {
        let r0 = self.rotation(t - DIFF_STEP);
        let r1 = self.rotation(t + DIFF_STEP);
        log_so3(&(r0.transpose() * r1)) / (2.0 * DIFF_STEP)
    }

    /// Ground-truth state at time `t`, with the given constant biases.
    fn state(&self, t: f64, gyro_bias: Vector3<f64>, accel_bias: Vector3<f64>) -> NavState {
        NavState {
            rot: UnitQuaternion::from_rotation_matrix(
                &nalgebra::Rotation3::from_matrix_unchecked(self.rotation(t)),
            ),
            pos: self.position(t),
            vel: self.velocity(t),
            gyro_bias,
            accel_bias,
        }
    }
}

/// No motion at the origin.
pub struct Stationary;

impl Trajectory for Stationary {
    fn rotation(&self, _t: f64) -> Matrix3<f64> {
        Matrix3::identity()
    }
    fn position(&self, _t: f64) -> Vector3<f64> {
        Vector3::zeros()
    }
    fn velocity(&self, _t: f64) -> Vector3<f64> {
        Vector3::zeros()
    }
    fn acceleration(&self, _t: f64) -> Vector3<f64> {
        Vector3::zeros()
    }
    fn angular_velocity(&self, _t: f64) -> Vector3<f64> {
        Vector3::zeros()
    }
}

/// Constant rotation rate about z, fixed position.
pub struct ConstantYaw {
    pub rate: f64,
}

impl Trajectory for ConstantYaw {
    fn rotation(&self, t: f64) -> Matrix3<f64> {
        exp_so3(&Vector3::new(0.0, 0.0, self.rate * t))
    }
    fn position(&self, _t: f64) -> Vector3<f64> {
        Vector3::zeros()
    }
    fn velocity(&self, _t: f64) -> Vector3<f64> {
        Vector3::zeros()
    }
    fn acceleration(&self, _t: f64) -> Vector3<f64> {
        Vector3::zeros()
    }
    fn angular_velocity(&self, _t: f64) -> Vector3<f64> {
        Vector3::new(0.0, 0.0, self.rate)
    }
}

/// Sinusoidal translation along x with a given peak acceleration, no
/// rotation.
pub struct SineAccel {
    /// Peak acceleration (m/s^2).
    pub peak: f64,
    /// Oscillation frequency (Hz).
    pub frequency: f64,
}

impl SineAccel {
    fn omega(&self) -> f64 {
        2.0 * std::f64::consts::PI * self.frequency
    }
}

impl Trajectory for SineAccel {
    fn rotation(&self, _t: f64) -> Matrix3<f64> {
        Matrix3::identity()
    }
    fn position(&self, t: f64) -> Vector3<f64> {
        let w = self.omega();
        Vector3::new(-self.peak / (w * w) * (w * t).sin(), 0.0, 0.0)
    }
    fn velocity(&self, t: f64) -> Vector3<f64> {
        let w = self.omega();
        Vector3::new(-self.peak / w * (w * t).cos(), 0.0, 0.0)
    }
    fn acceleration(&self, t: f64) -> Vector3<f64> {
        let w = self.omega();
        Vector3::new(self.peak * (w * t).sin(), 0.0, 0.0)
    }
    fn angular_velocity(&self, _t: f64) -> Vector3<f64> {
        Vector3::zeros()
    }
}

/// Straight-line constant-velocity motion, no rotation.
pub struct ConstantVelocity {
    pub vel: Vector3<f64>,
}

impl Trajectory for ConstantVelocity {
    fn rotation(&self, _t: f64) -> Matrix3<f64> {
        Matrix3::identity()
    }
    fn position(&self, t: f64) -> Vector3<f64> {
        self.vel * t
    }
    fn velocity(&self, _t: f64) -> Vector3<f64> {
        self.vel
    }
    fn acceleration(&self, _t: f64) -> Vector3<f64> {
        Vector3::zeros()
    }
    fn angular_velocity(&self, _t: f64) -> Vector3<f64> {
        Vector3::zeros()
    }
}

/// Yaw rate plus roll/pitch rocking and sinusoidal translation; the
/// general-purpose trajectory with enough excitation for every calibration
/// unknown.
pub struct Excited {
    pub yaw_rate: f64,
    pub rock_amplitude: f64,
    pub rock_frequency: f64,
    pub translation_amplitude: Vector3<f64>,
    pub translation_frequency: Vector3<f64>,
}

impl Default for Excited {
    fn default() -> Self {
        Self {
            yaw_rate: 0.3,
            rock_amplitude: 0.25,
            rock_frequency: 0.4,
            translation_amplitude: Vector3::new(0.4, 0.3, 0.15),
            translation_frequency: Vector3::new(0.5, 0.35, 0.6),
        }
    }
}

impl Trajectory for Excited {
    fn rotation(&self, t: f64) -> Matrix3<f64> {
        let wr = 2.0 * std::f64::consts::PI * self.rock_frequency;
        exp_so3(&Vector3::new(0.0, 0.0, self.yaw_rate * t))
            * exp_so3(&Vector3::new(self.rock_amplitude * (wr * t).sin(), 0.0, 0.0))
            * exp_so3(&Vector3::new(0.0, self.rock_amplitude * (wr * t).cos(), 0.0))
    }

    fn position(&self, t: f64) -> Vector3<f64> {
        let two_pi = 2.0 * std::f64::consts::PI;
        Vector3::new(
            self.translation_amplitude.x * (two_pi * self.translation_frequency.x * t).sin(),
            self.translation_amplitude.y * (two_pi * self.translation_frequency.y * t).sin(),
            self.translation_amplitude.z * (two_pi * self.translation_frequency.z * t).sin(),
        )
    }

    fn velocity(&self, t: f64) -> Vector3<f64> {
        let two_pi = 2.0 * std::f64::consts::PI;
        let w = self.translation_frequency * two_pi;
        Vector3::new(
            self.translation_amplitude.x * w.x * (w.x * t).cos(),
            self.translation_amplitude.y * w.y * (w.y * t).cos(),
            self.translation_amplitude.z * w.z * (w.z * t).cos(),
        )
    }

    fn acceleration(&self, t: f64) -> Vector3<f64> {
        let two_pi = 2.0 * std::f64::consts::PI;
        let w = self.translation_frequency * two_pi;
        Vector3::new(
            -self.translation_amplitude.x * w.x * w.x * (w.x * t).sin(),
            -self.translation_amplitude.y * w.y * w.y * (w.y * t).sin(),
            -self.translation_amplitude.z * w.z * w.z * (w.z * t).sin(),
        )
    }
}

/// Injected truth and sampling setup for a synthetic run.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub duration: f64,
    pub imu_rate: f64,
    pub vicon_rate: f64,
    pub reference_dt: f64,
    /// Truth extrinsic rotation.
    pub extrinsic_rotation: UnitQuaternion<f64>,
    /// Truth time offset (`IMU_time = Vicon_time + time_offset`).
    pub time_offset: f64,
    /// Truth gravity in the capture frame.
    pub gravity: Vector3<f64>,
    pub gyro_bias: Vector3<f64>,
    pub accel_bias: Vector3<f64>,
    /// Injected IMU noise densities (zero for noise-free runs).
    pub imu_noise: ImuNoise,
    /// Reported (and optionally injected) pose sigmas.
    pub vicon_sigma_rot: f64,
    pub vicon_sigma_pos: f64,
    pub inject_vicon_noise: bool,
    pub seed: u64,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            duration: 10.0,
            imu_rate: 200.0,
            vicon_rate: 100.0,
            reference_dt: 0.05,
            extrinsic_rotation: UnitQuaternion::identity(),
            time_offset: 0.0,
            gravity: Vector3::new(0.0, 0.0, -crate::gravity::GRAVITY_MAGNITUDE),
            gyro_bias: Vector3::zeros(),
            accel_bias: Vector3::zeros(),
            imu_noise: ImuNoise::zero(),
            vicon_sigma_rot: 1e-4,
            vicon_sigma_pos: 1e-5,
            inject_vicon_noise: false,
            seed: 42,
        }
    }
}

/// A generated dataset plus the truth it was sampled from.
pub struct SimData {
    pub imu: Vec<ImuSample>,
    pub vicon: Vec<PoseSample>,
    pub reference_times: Vec<f64>,
    pub truth: Vec<NavState>,
}

/// Sample a trajectory into IMU/pose streams per the scenario.
pub fn simulate(trajectory: &dyn Trajectory, scenario: &Scenario) -> SimData {
    let mut rng = ChaCha8Rng::seed_from_u64(scenario.seed);
    let unit = Normal::new(0.0, 1.0).expect("unit normal");

    // IMU stream (IMU clock == physical time).
    let imu_dt = 1.0 / scenario.imu_rate;
    let gyro_sigma = scenario.imu_noise.gyro_noise_density / imu_dt.sqrt();
    let accel_sigma = scenario.imu_noise.accel_noise_density / imu_dt.sqrt();
    let n_imu = (scenario.duration * scenario.imu_rate) as usize;
    let mut imu = Vec::with_capacity(n_imu + 1);
    for i in 0..=n_imu {
        let t = i as f64 * imu_dt;
        let rot = trajectory.rotation(t);
        let gyro = trajectory.angular_velocity(t)
            + scenario.gyro_bias
            + gyro_sigma * sample3(&mut rng, &unit);
        // Specific force: a_m = R^T (a_world - g) + b_a + noise
        let accel = rot.transpose() * (trajectory.acceleration(t) - scenario.gravity)
            + scenario.accel_bias
            + accel_sigma * sample3(&mut rng, &unit);
        imu.push(ImuSample::new(t, gyro, accel));
    }

    // Pose stream: marker body pose, stamped on the Vicon clock.
    let riv = scenario.extrinsic_rotation.to_rotation_matrix().into_inner();
    let vicon_dt = 1.0 / scenario.vicon_rate;
    let n_vicon = (scenario.duration * scenario.vicon_rate) as usize;
    let mut vicon = Vec::with_capacity(n_vicon + 1);
    for i in 0..=n_vicon {
        let t_phys = i as f64 * vicon_dt;
        let mut rot = trajectory.rotation(t_phys) * riv;
        let mut pos = trajectory.position(t_phys);
        if scenario.inject_vicon_noise {
            rot *= exp_so3(&(scenario.vicon_sigma_rot * sample3(&mut rng, &unit)));
            pos += scenario.vicon_sigma_pos * sample3(&mut rng, &unit);
        }
        vicon.push(PoseSample {
            t: t_phys - scenario.time_offset,
            rot: UnitQuaternion::from_rotation_matrix(
                &nalgebra::Rotation3::from_matrix_unchecked(rot),
            ),
            pos,
            cov_rot: Matrix3::identity() * scenario.vicon_sigma_rot.powi(2),
            cov_pos: Matrix3::identity() * scenario.vicon_sigma_pos.powi(2),
        });
    }

    // Reference grid, kept away from the stream edges so every node has
    // bounding IMU data and a pose bracket even with a nonzero offset.
    let margin = 0.1;
    let mut reference_times = Vec::new();
    let mut truth = Vec::new();
    let mut t = margin;
    while t <= scenario.duration - margin + 1e-9 {
        reference_times.push(t);
        truth.push(trajectory.state(t, scenario.gyro_bias, scenario.accel_bias));
        t += scenario.reference_dt;
    }

    SimData {
        imu,
        vicon,
        reference_times,
        truth,
    }
}

/// Feed a generated dataset into fresh buffers.
pub fn feed(
    data: &SimData,
    propagator: &mut Propagator,
    interpolator: &mut Interpolator,
) -> Result<()> {
    for sample in &data.imu {
        propagator.feed_imu(sample.t, sample.gyro, sample.accel)?;
    }
    for pose in &data.vicon {
        interpolator.feed_pose(
            pose.t,
            *pose.rot.quaternion(),
            pose.pos,
            pose.cov_rot,
            pose.cov_pos,
        )?;
    }
    Ok(())
}

fn sample3<R: rand::Rng>(rng: &mut R, normal: &Normal<f64>) -> Vector3<f64> {
    Vector3::new(
        normal.sample(rng),
        normal.sample(rng),
        normal.sample(rng),
    )
}
