//! Batch factor-graph solver.
//!
//! One state node per reference timestamp, bound to its neighbors by
//! preintegration and bias random-walk factors and to the motion-capture
//! stream by interpolated-pose factors, jointly with the calibration
//! unknowns (extrinsic rotation, gravity direction, time offset).
//!
//! Parameters are laid out node-by-node in time order with the calibration
//! unknowns last, so the normal equations stay banded with a small dense
//! border and the LDL^T factorization fills in predictably.
//!
//! An outer loop re-preintegrates whenever the bias estimate drifts beyond
//! the configured linearization thresholds, or the time-offset estimate
//! walks out of a factor's stored interpolation bracket.

use std::cell::RefCell;

use nalgebra::{DVector, Matrix6, UnitQuaternion, Vector3};
use tracing::{debug, info};

use crate::config::EstimatorConfig;
use crate::error::{Error, Result};
use crate::factors::bias::{bias_walk_residual, BiasWalkWeights, BIAS_RESIDUAL_DOF};
use crate::factors::imu::{preintegration_residual, IMU_RESIDUAL_DOF};
use crate::factors::vicon::{vicon_residual, ViconObservation, VICON_RESIDUAL_DOF};
use crate::gravity::GravityChart;
use crate::interpolator::Interpolator;
use crate::preintegration::{Matrix15, Matrix9, Preintegrated};
use crate::propagator::Propagator;
use crate::types::{NavState, NODE_DOF};
use vicalign_solver::{Jet, SparseLm, StopReason};

/// Jet width of the preintegration factor: two nodes plus the gravity
/// tangent.
const IMU_JET: usize = 2 * NODE_DOF + 2;
/// Jet width of the pose factor: node pose, extrinsic rotation, time
/// offset.
const VICON_JET: usize = 10;

type JetImu = Jet<IMU_JET>;
type JetVicon = Jet<VICON_JET>;

/// Rows contributed by one consecutive-node pair.
const PAIR_ROWS: usize = IMU_RESIDUAL_DOF + BIAS_RESIDUAL_DOF;

/// Calibration estimate with marginal standard deviations for whichever
/// unknowns were estimated.
#[derive(Debug, Clone)]
pub struct CalibrationEstimate {
    /// Body-level extrinsic rotation (marker body to IMU body alignment).
    pub extrinsic_rotation: UnitQuaternion<f64>,
    /// Marker-to-IMU position arm, held fixed at its configured value.
    pub position_arm: Vector3<f64>,
    /// Gravity in the capture frame (fixed 9.81 magnitude).
    pub gravity: Vector3<f64>,
    /// Time offset, seconds; `IMU_time = Vicon_time + time_offset`.
    pub time_offset: f64,
    pub extrinsic_rotation_std: Option<Vector3<f64>>,
    /// Standard deviations of the two gravity tangent coordinates.
    pub gravity_std: Option<[f64; 2]>,
    pub time_offset_std: Option<f64>,
}

/// Everything `build_and_solve` produces.
#[derive(Debug, Clone)]
pub struct EstimationResult {
    pub times: Vec<f64>,
    pub states: Vec<NavState>,
    /// Per-node 15x15 marginal covariance over
    /// `[dtheta, dp, dv, dbg, dba]`.
    pub state_covariances: Vec<Matrix15>,
    pub calibration: CalibrationEstimate,
    /// False when the observability guard held the calibration fixed.
    pub calibration_observable: bool,
    pub iterations: usize,
    pub final_cost: f64,
    pub initial_gradient_norm: f64,
    /// False when the iteration cap was hit before the tolerances.
    pub converged: bool,
    /// True when the cooperative stop callback fired; the best state found
    /// so far is returned.
    pub cancelled: bool,
    /// Sum of squared whitened pose residuals at the solution.
    pub vicon_chi2: f64,
    pub vicon_dof: usize,
    pub imu_count: usize,
    pub pose_count: usize,
    pub reference_count: usize,
    pub dropped_reference: usize,
}

/// Mutable linearization state: manifold hosts for every unknown.
struct Hosts {
    nodes: Vec<NavState>,
    riv: UnitQuaternion<f64>,
    gravity: GravityChart,
    toff: f64,
}

/// Column/row bookkeeping for one assembly.
#[derive(Debug, Clone, Copy)]
struct Layout {
    n_nodes: usize,
    est_riv: bool,
    est_grav: bool,
    est_toff: bool,
    riv_col: usize,
    grav_col: usize,
    toff_col: usize,
    n_params: usize,
    n_rows: usize,
    vicon_row_start: usize,
}

impl Layout {
    fn new(n_nodes: usize, est_riv: bool, est_grav: bool, est_toff: bool) -> Self {
        let mut col = n_nodes * NODE_DOF;
        let riv_col = col;
        if est_riv {
            col += 3;
        }
        let grav_col = col;
        if est_grav {
            col += 2;
        }
        let toff_col = col;
        if est_toff {
            col += 1;
        }
        let vicon_row_start = (n_nodes - 1) * PAIR_ROWS;
        Self {
            n_nodes,
            est_riv,
            est_grav,
            est_toff,
            riv_col,
            grav_col,
            toff_col,
            n_params: col,
            n_rows: vicon_row_start + n_nodes * VICON_RESIDUAL_DOF,
            vicon_row_start,
        }
    }

    fn node_col(&self, k: usize) -> usize {
        k * NODE_DOF
    }

    fn pair_row(&self, k: usize) -> usize {
        k * PAIR_ROWS
    }

    fn vicon_row(&self, k: usize) -> usize {
        self.vicon_row_start + k * VICON_RESIDUAL_DOF
    }
}

/// Frozen factor data for one linearization round.
struct Assembly {
    layout: Layout,
    preints: Vec<Preintegrated>,
    imu_sqrt_info: Vec<Matrix9>,
    bias_weights: Vec<BiasWalkWeights>,
    vicon: Vec<ViconObservation>,
    arm: Vector3<f64>,
}

impl Assembly {
    /// Sparsity entries in `(row, col)` order, matching exactly the
    /// sequence `evaluate` writes Jacobian values in.
    fn entries(&self) -> Vec<(usize, usize)> {
        let l = &self.layout;
        let mut entries = Vec::new();

        for k in 0..l.n_nodes - 1 {
            let ci = l.node_col(k);
            let cj = l.node_col(k + 1);
            for r in 0..IMU_RESIDUAL_DOF {
                let row = l.pair_row(k) + r;
                for c in 0..NODE_DOF {
                    entries.push((row, ci + c));
                }
                for c in 0..NODE_DOF {
                    entries.push((row, cj + c));
                }
                if l.est_grav {
                    entries.push((row, l.grav_col));
                    entries.push((row, l.grav_col + 1));
                }
            }
            for r in 0..BIAS_RESIDUAL_DOF {
                let row = l.pair_row(k) + IMU_RESIDUAL_DOF + r;
                for c in 9..NODE_DOF {
                    entries.push((row, ci + c));
                }
                for c in 9..NODE_DOF {
                    entries.push((row, cj + c));
                }
            }
        }

        for k in 0..l.n_nodes {
            let c0 = l.node_col(k);
            for r in 0..VICON_RESIDUAL_DOF {
                let row = l.vicon_row(k) + r;
                for c in 0..6 {
                    entries.push((row, c0 + c));
                }
                if l.est_riv {
                    for c in 0..3 {
                        entries.push((row, l.riv_col + c));
                    }
                }
                if l.est_toff {
                    entries.push((row, l.toff_col));
                }
            }
        }

        entries
    }

    /// Fill residuals and Jacobian values at the given tangent parameters.
    fn evaluate(
        &self,
        hosts: &Hosts,
        params: &DVector<f64>,
        residuals: &mut [f64],
        jac: &mut [f64],
    ) {
        let l = &self.layout;
        let mut cursor = 0usize;

        for k in 0..l.n_nodes - 1 {
            let ci = l.node_col(k);
            let cj = l.node_col(k + 1);

            // Preintegration residual via jets.
            let di: [JetImu; NODE_DOF] =
                std::array::from_fn(|m| JetImu::variable(params[ci + m], m));
            let dj: [JetImu; NODE_DOF] =
                std::array::from_fn(|m| JetImu::variable(params[cj + m], NODE_DOF + m));
            let (g1, g2) = if l.est_grav {
                (
                    JetImu::variable(params[l.grav_col], 2 * NODE_DOF),
                    JetImu::variable(params[l.grav_col + 1], 2 * NODE_DOF + 1),
                )
            } else {
                (JetImu::constant(0.0), JetImu::constant(0.0))
            };
            let gravity = hosts.gravity.gravity_generic(g1, g2);
            let raw = preintegration_residual(
                &hosts.nodes[k],
                &di,
                &hosts.nodes[k + 1],
                &dj,
                &self.preints[k],
                &gravity,
            );

            let w = &self.imu_sqrt_info[k];
            let row0 = l.pair_row(k);
            for r in 0..IMU_RESIDUAL_DOF {
                let mut acc = JetImu::constant(0.0);
                for c in 0..IMU_RESIDUAL_DOF {
                    acc = acc + JetImu::constant(w[(r, c)]) * raw[c];
                }
                residuals[row0 + r] = acc.value;
                for m in 0..NODE_DOF {
                    jac[cursor] = acc.grad[m];
                    cursor += 1;
                }
                for m in 0..NODE_DOF {
                    jac[cursor] = acc.grad[NODE_DOF + m];
                    cursor += 1;
                }
                if l.est_grav {
                    jac[cursor] = acc.grad[2 * NODE_DOF];
                    cursor += 1;
                    jac[cursor] = acc.grad[2 * NODE_DOF + 1];
                    cursor += 1;
                }
            }

            // Bias random walk, analytic.
            let weights = &self.bias_weights[k];
            let bg_i = hosts.nodes[k].gyro_bias
                + Vector3::new(params[ci + 9], params[ci + 10], params[ci + 11]);
            let ba_i = hosts.nodes[k].accel_bias
                + Vector3::new(params[ci + 12], params[ci + 13], params[ci + 14]);
            let bg_j = hosts.nodes[k + 1].gyro_bias
                + Vector3::new(params[cj + 9], params[cj + 10], params[cj + 11]);
            let ba_j = hosts.nodes[k + 1].accel_bias
                + Vector3::new(params[cj + 12], params[cj + 13], params[cj + 14]);
            let res = bias_walk_residual(&bg_i, &ba_i, &bg_j, &ba_j, weights);
            for r in 0..BIAS_RESIDUAL_DOF {
                residuals[row0 + IMU_RESIDUAL_DOF + r] = res[r];
                let weight = if r < 3 { weights.gyro } else { weights.accel };
                for c in 0..BIAS_RESIDUAL_DOF {
                    jac[cursor] = if c == r { -weight } else { 0.0 };
                    cursor += 1;
                }
                for c in 0..BIAS_RESIDUAL_DOF {
                    jac[cursor] = if c == r { weight } else { 0.0 };
                    cursor += 1;
                }
            }
        }

        for k in 0..l.n_nodes {
            let c0 = l.node_col(k);
            let dp: [JetVicon; 6] = std::array::from_fn(|m| JetVicon::variable(params[c0 + m], m));
            let dr: [JetVicon; 3] = if l.est_riv {
                std::array::from_fn(|m| JetVicon::variable(params[l.riv_col + m], 6 + m))
            } else {
                std::array::from_fn(|_| JetVicon::constant(0.0))
            };
            let dtoff = if l.est_toff {
                JetVicon::variable(params[l.toff_col], 9)
            } else {
                JetVicon::constant(0.0)
            };
            let raw = vicon_residual(
                &hosts.nodes[k],
                &dp,
                &hosts.riv,
                &dr,
                hosts.toff,
                dtoff,
                &self.arm,
                &self.vicon[k],
            );

            let w = &self.vicon[k].sqrt_info;
            let row0 = l.vicon_row(k);
            for r in 0..VICON_RESIDUAL_DOF {
                let mut acc = JetVicon::constant(0.0);
                for c in 0..VICON_RESIDUAL_DOF {
                    acc = acc + JetVicon::constant(w[(r, c)]) * raw[c];
                }
                residuals[row0 + r] = acc.value;
                for m in 0..6 {
                    jac[cursor] = acc.grad[m];
                    cursor += 1;
                }
                if l.est_riv {
                    for m in 0..3 {
                        jac[cursor] = acc.grad[6 + m];
                        cursor += 1;
                    }
                }
                if l.est_toff {
                    jac[cursor] = acc.grad[9];
                    cursor += 1;
                }
            }
        }

        debug_assert_eq!(cursor, jac.len());
    }
}

/// The batch estimator front door.
pub struct GraphSolver {
    config: EstimatorConfig,
    reference_times: Vec<f64>,
    cancel: Option<Box<dyn Fn() -> bool>>,
    warm_start: Option<Vec<NavState>>,
}

impl GraphSolver {
    pub fn new(config: EstimatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            reference_times: Vec::new(),
            cancel: None,
            warm_start: None,
        })
    }

    /// Warm-start the trajectory from caller-provided states (one per
    /// reference timestamp surviving the cleaning pass) instead of the
    /// interpolated capture stream.
    pub fn set_initial_states(&mut self, states: Vec<NavState>) {
        self.warm_start = Some(states);
    }

    /// Reference timestamps (IMU clock). Sorted and deduplicated.
    pub fn set_reference_times(&mut self, mut times: Vec<f64>) {
        times.sort_by(f64::total_cmp);
        times.dedup();
        self.reference_times = times;
    }

    /// Cooperative cancellation, polled between iterations.
    pub fn set_cancel_callback(&mut self, cancel: Box<dyn Fn() -> bool>) {
        self.cancel = Some(cancel);
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Build the factor graph over the fed buffers and optimize it.
    pub fn build_and_solve(
        &self,
        propagator: &Propagator,
        interpolator: &Interpolator,
    ) -> Result<EstimationResult> {
        if self.reference_times.is_empty() {
            return Err(Error::InsufficientData(
                "no reference timestamps set".into(),
            ));
        }
        if propagator.len() < 2 {
            return Err(Error::InsufficientData(format!(
                "{} IMU samples fed, need at least 2",
                propagator.len()
            )));
        }
        if interpolator.len() < 2 {
            return Err(Error::InsufficientData(format!(
                "{} pose samples fed, need at least 2",
                interpolator.len()
            )));
        }

        let config = &self.config;
        let (times, dropped) = self.clean_reference_times(propagator, interpolator);
        if times.len() < 2 {
            return Err(Error::InsufficientData(format!(
                "{} of {} reference timestamps usable after cleaning",
                times.len(),
                self.reference_times.len()
            )));
        }
        let n_nodes = times.len();
        info!(
            nodes = n_nodes,
            dropped, "constructing graph over reference timestamps"
        );

        // Observability guard: with too few nodes or too little rotation
        // the calibration unknowns are not recoverable and stay fixed.
        let excitation = propagator.rotation_excitation(times[0], times[n_nodes - 1]);
        let observable = n_nodes >= config.min_nodes_for_calibration
            && excitation >= config.min_rotation_excitation;
        if !observable {
            info!(
                excitation,
                nodes = n_nodes,
                "holding calibration fixed (insufficient excitation)"
            );
        }
        let est_riv = config.estimate_extrinsic_rotation && observable;
        let est_grav = config.estimate_gravity && observable;
        let est_toff = config.estimate_time_offset && observable;

        let hosts = RefCell::new(self.initialize(&times, propagator, interpolator)?);
        let layout = Layout::new(n_nodes, est_riv, est_grav, est_toff);

        let mut total_iterations = 0usize;
        let mut initial_gradient_norm = None;
        let mut cancelled = false;
        let mut converged = false;
        let mut final_cost = f64::INFINITY;

        let mut assembly = self.assemble(&times, propagator, interpolator, &hosts.borrow(), layout)?;

        for round in 0..config.max_relinearizations {
            let entries = assembly.entries();
            let mut lm = SparseLm::new(layout.n_rows, layout.n_params, &entries)
                .with_max_iterations(config.max_iterations)
                .with_tolerances(config.relative_cost_tol, config.relative_step_tol);

            let cost_fn = |params: &DVector<f64>, residuals: &mut [f64], jac: &mut [f64]| {
                assembly.evaluate(&hosts.borrow(), params, residuals, jac);
            };
            let retract_fn = |params: &mut DVector<f64>| {
                retract_all(&mut hosts.borrow_mut(), params, &layout);
            };
            let stop_fn = || self.cancel.as_ref().map_or(false, |f| f());

            let (mut params, report) =
                lm.solve(DVector::zeros(layout.n_params), cost_fn, retract_fn, stop_fn);
            // Node, extrinsic, and offset deltas are folded into the hosts
            // on every accepted step. Gravity tangent coordinates persist
            // until the chart-swap threshold, so fold whatever remains
            // before the next linearization reads the hosts.
            fold_gravity(&mut hosts.borrow_mut(), &mut params, &layout);
            debug_assert!(params.amax() == 0.0);

            total_iterations += report.iterations;
            initial_gradient_norm.get_or_insert(report.initial_gradient_norm);
            final_cost = report.final_cost;
            converged = report.converged();

            match report.stop {
                StopReason::NumericalFailure => {
                    return Err(Error::NumericalFailure(
                        "repeated factorization failures with escalating damping".into(),
                    ));
                }
                StopReason::Diverged => {
                    return Err(Error::Diverged(format!(
                        "damping exploded after {} iterations",
                        report.iterations
                    )));
                }
                StopReason::Cancelled => {
                    cancelled = true;
                    break;
                }
                _ => {}
            }

            if round + 1 >= config.max_relinearizations {
                break;
            }
            if !self.needs_relinearization(&assembly, &hosts.borrow()) {
                break;
            }
            debug!(round, "re-linearizing preintegrations and pose brackets");
            assembly = self.assemble(&times, propagator, interpolator, &hosts.borrow(), layout)?;
        }

        // Final statistics at the converged linearization point.
        let entries = assembly.entries();
        let mut lm = SparseLm::new(layout.n_rows, layout.n_params, &entries);
        let mut cost_fn = |params: &DVector<f64>, residuals: &mut [f64], jac: &mut [f64]| {
            assembly.evaluate(&hosts.borrow(), params, residuals, jac);
        };
        let zeros = DVector::zeros(layout.n_params);
        lm.refresh(&zeros, &mut cost_fn);
        let residuals = lm.residuals();
        let vicon_chi2: f64 = residuals
            .as_slice()
            .iter()
            .skip(layout.vicon_row_start)
            .map(|r| r * r)
            .sum();
        final_cost = residuals.norm_squared();

        let (state_covariances, calibration) =
            self.marginals(&lm, &layout, &hosts.borrow())?;

        let hosts = hosts.into_inner();
        Ok(EstimationResult {
            times: times.clone(),
            states: hosts.nodes,
            state_covariances,
            calibration,
            calibration_observable: observable,
            iterations: total_iterations,
            final_cost,
            initial_gradient_norm: initial_gradient_norm.unwrap_or(0.0),
            converged,
            cancelled,
            vicon_chi2,
            vicon_dof: VICON_RESIDUAL_DOF * n_nodes,
            imu_count: propagator.len(),
            pose_count: interpolator.len(),
            reference_count: n_nodes,
            dropped_reference: dropped,
        })
    }

    /// Drop reference timestamps that lack bounding IMU data or a pose
    /// bracket at the initial time offset.
    fn clean_reference_times(
        &self,
        propagator: &Propagator,
        interpolator: &Interpolator,
    ) -> (Vec<f64>, usize) {
        let toff = self.config.init_time_offset;
        let range = interpolator.time_range();
        let mut dropped = 0usize;
        let times: Vec<f64> = self
            .reference_times
            .iter()
            .copied()
            .filter(|&t| {
                let imu_ok = propagator.has_bounding(t);
                let pose_ok = range
                    .map(|(lo, hi)| t - toff >= lo && t - toff <= hi)
                    .unwrap_or(false);
                if !(imu_ok && pose_ok) {
                    debug!(t, imu_ok, pose_ok, "dropping reference timestamp");
                    dropped += 1;
                }
                imu_ok && pose_ok
            })
            .collect();
        (times, dropped)
    }

    /// Initial hosts: poses from the interpolated capture stream rotated by
    /// the extrinsic prior, velocities by finite differences, biases zero,
    /// gravity from a coarse accelerometer alignment.
    fn initialize(
        &self,
        times: &[f64],
        propagator: &Propagator,
        interpolator: &Interpolator,
    ) -> Result<Hosts> {
        let config = &self.config;
        let riv0 = config.init_extrinsic_rotation;
        let riv0_mat = riv0.to_rotation_matrix().into_inner();
        let toff0 = config.init_time_offset;

        let n = times.len();
        let mut nodes;
        if let Some(warm) = &self.warm_start {
            if warm.len() != n {
                return Err(Error::Config(format!(
                    "{} warm-start states for {} reference timestamps",
                    warm.len(),
                    n
                )));
            }
            nodes = warm.clone();
        } else {
            nodes = Vec::with_capacity(n);
            let mut positions = Vec::with_capacity(n);
            for &t in times {
                let pose = interpolator.interpolate(t - toff0)?;
                let rot = pose.rot.to_rotation_matrix().into_inner() * riv0_mat.transpose();
                let pos = pose.pos - rot * config.position_arm;
                positions.push(pos);
                nodes.push(NavState {
                    rot: UnitQuaternion::from_rotation_matrix(
                        &nalgebra::Rotation3::from_matrix_unchecked(rot),
                    ),
                    pos,
                    vel: Vector3::zeros(),
                    gyro_bias: Vector3::zeros(),
                    accel_bias: Vector3::zeros(),
                });
            }

            // Velocities by finite differences of the interpolated
            // positions.
            for k in 0..n {
                let (a, b) = if k == 0 {
                    (0, 1)
                } else if k == n - 1 {
                    (n - 2, n - 1)
                } else {
                    (k - 1, k + 1)
                };
                nodes[k].vel = (positions[b] - positions[a]) / (times[b] - times[a]);
            }
        }

        // Coarse gravity alignment: the average specific force, rotated
        // into the capture frame by the nearest node orientation, points
        // opposite to gravity.
        let gravity = if let Some(g) = config.init_gravity {
            g
        } else {
            let mut sum = Vector3::zeros();
            for sample in propagator.samples() {
                if sample.t < times[0] || sample.t > times[n - 1] {
                    continue;
                }
                let k = times.partition_point(|&t| t <= sample.t).saturating_sub(1);
                sum += nodes[k].rot_matrix() * sample.accel;
            }
            if sum.norm() < 1e-6 {
                Vector3::new(0.0, 0.0, -crate::gravity::GRAVITY_MAGNITUDE)
            } else {
                -crate::gravity::GRAVITY_MAGNITUDE * sum.normalize()
            }
        };

        Ok(Hosts {
            nodes,
            riv: riv0,
            gravity: GravityChart::from_gravity(&gravity),
            toff: toff0,
        })
    }

    /// Freeze preintegrations, whitening matrices, and pose brackets at the
    /// current linearization point.
    fn assemble(
        &self,
        times: &[f64],
        propagator: &Propagator,
        interpolator: &Interpolator,
        hosts: &Hosts,
        layout: Layout,
    ) -> Result<Assembly> {
        let n = times.len();
        let mut preints = Vec::with_capacity(n - 1);
        let mut imu_sqrt_info = Vec::with_capacity(n - 1);
        let mut bias_weights = Vec::with_capacity(n - 1);
        for k in 0..n - 1 {
            let node = &hosts.nodes[k];
            let preint = propagator.preintegrate(
                times[k],
                times[k + 1],
                &node.gyro_bias,
                &node.accel_bias,
            )?;
            imu_sqrt_info.push(preint.sqrt_information()?);
            bias_weights.push(BiasWalkWeights::new(
                &self.config.imu_noise,
                times[k + 1] - times[k],
            ));
            preints.push(preint);
        }

        let (lo, hi) = interpolator
            .time_range()
            .ok_or_else(|| Error::InsufficientData("pose buffer is empty".into()))?;
        let mut vicon = Vec::with_capacity(n);
        for &t in times {
            // Clamp so a drifting offset near the buffer edge degrades to
            // mild extrapolation within the last bracket instead of
            // failing.
            let query = (t - hosts.toff).clamp(lo, hi);
            let (a, b) = interpolator.bracket(query)?;
            let mut obs =
                ViconObservation::from_bracket(t, a.t, &a.rot, a.pos, b.t, &b.rot, b.pos);
            let interp = interpolator.interpolate(query)?;
            obs.sqrt_info = whiten6(&interp.cov6())?;
            vicon.push(obs);
        }

        Ok(Assembly {
            layout,
            preints,
            imu_sqrt_info,
            bias_weights,
            vicon,
            arm: self.config.position_arm,
        })
    }

    /// Whether the current estimate has drifted outside the linearization
    /// assumptions of the frozen assembly.
    fn needs_relinearization(&self, assembly: &Assembly, hosts: &Hosts) -> bool {
        let config = &self.config;
        let bias_stale = assembly.preints.iter().enumerate().any(|(k, preint)| {
            preint.bias_stale(
                &hosts.nodes[k].gyro_bias,
                &hosts.nodes[k].accel_bias,
                config.bias_relin_gyro,
                config.bias_relin_accel,
            )
        });
        let bracket_stale = assembly.vicon.iter().any(|obs| {
            let lambda = (obs.t - hosts.toff - obs.t0) / (obs.t1 - obs.t0);
            !(0.0..=1.0).contains(&lambda)
        });
        bias_stale || bracket_stale
    }

    /// Marginal covariances from the undamped normal matrix.
    fn marginals(
        &self,
        lm: &SparseLm,
        layout: &Layout,
        hosts: &Hosts,
    ) -> Result<(Vec<Matrix15>, CalibrationEstimate)> {
        let jtj = lm.normal_matrix();
        let mut blocks: Vec<(usize, usize)> = (0..layout.n_nodes)
            .map(|k| (layout.node_col(k), NODE_DOF))
            .collect();
        if layout.est_riv {
            blocks.push((layout.riv_col, 3));
        }
        if layout.est_grav {
            blocks.push((layout.grav_col, 2));
        }
        if layout.est_toff {
            blocks.push((layout.toff_col, 1));
        }

        let inverses = vicalign_solver::inverse_blocks(&jtj, &blocks).ok_or_else(|| {
            Error::NumericalFailure("marginal covariance extraction failed".into())
        })?;

        let mut state_covariances = Vec::with_capacity(layout.n_nodes);
        for block in inverses.iter().take(layout.n_nodes) {
            let mut cov = Matrix15::zeros();
            for r in 0..NODE_DOF {
                for c in 0..NODE_DOF {
                    cov[(r, c)] = block[(r, c)];
                }
            }
            state_covariances.push(cov);
        }

        let mut next = layout.n_nodes;
        let extrinsic_rotation_std = if layout.est_riv {
            let block = &inverses[next];
            next += 1;
            Some(Vector3::new(
                block[(0, 0)].max(0.0).sqrt(),
                block[(1, 1)].max(0.0).sqrt(),
                block[(2, 2)].max(0.0).sqrt(),
            ))
        } else {
            None
        };
        let gravity_std = if layout.est_grav {
            let block = &inverses[next];
            next += 1;
            Some([
                block[(0, 0)].max(0.0).sqrt(),
                block[(1, 1)].max(0.0).sqrt(),
            ])
        } else {
            None
        };
        let time_offset_std = if layout.est_toff {
            let block = &inverses[next];
            Some(block[(0, 0)].max(0.0).sqrt())
        } else {
            None
        };

        Ok((
            state_covariances,
            CalibrationEstimate {
                extrinsic_rotation: hosts.riv,
                position_arm: self.config.position_arm,
                gravity: hosts.gravity.gravity(0.0, 0.0),
                time_offset: hosts.toff,
                extrinsic_rotation_std,
                gravity_std,
                time_offset_std,
            },
        ))
    }
}

/// Fold node, extrinsic, and offset deltas into their hosts and zero those
/// entries. Gravity keeps its tangent coordinates until the chart-swap
/// threshold is crossed.
fn retract_all(hosts: &mut Hosts, params: &mut DVector<f64>, layout: &Layout) {
    for k in 0..layout.n_nodes {
        let c = layout.node_col(k);
        let delta: [f64; NODE_DOF] = std::array::from_fn(|m| params[c + m]);
        hosts.nodes[k] = hosts.nodes[k].retract(&delta);
        for m in 0..NODE_DOF {
            params[c + m] = 0.0;
        }
    }
    if layout.est_riv {
        let delta = Vector3::new(
            params[layout.riv_col],
            params[layout.riv_col + 1],
            params[layout.riv_col + 2],
        );
        let mut riv = hosts.riv * UnitQuaternion::from_scaled_axis(delta);
        riv.renormalize();
        hosts.riv = riv;
        for m in 0..3 {
            params[layout.riv_col + m] = 0.0;
        }
    }
    if layout.est_grav {
        let (d1, d2) = (params[layout.grav_col], params[layout.grav_col + 1]);
        // Small corrections stay in the tangent coordinates; the chart is
        // swapped once the estimate strays too far from its pole.
        if hosts.gravity.needs_swap(d1, d2) {
            hosts.gravity = hosts.gravity.recenter(d1, d2);
            params[layout.grav_col] = 0.0;
            params[layout.grav_col + 1] = 0.0;
        }
    }
    if layout.est_toff {
        hosts.toff += params[layout.toff_col];
        params[layout.toff_col] = 0.0;
    }
}

/// Fold any remaining gravity tangent into the chart pole.
fn fold_gravity(hosts: &mut Hosts, params: &mut DVector<f64>, layout: &Layout) {
    if !layout.est_grav {
        return;
    }
    let (d1, d2) = (params[layout.grav_col], params[layout.grav_col + 1]);
    if d1 != 0.0 || d2 != 0.0 {
        hosts.gravity = hosts.gravity.recenter(d1, d2);
        params[layout.grav_col] = 0.0;
        params[layout.grav_col + 1] = 0.0;
    }
}

/// Inverse lower Cholesky factor of a 6x6 covariance.
fn whiten6(cov: &Matrix6<f64>) -> Result<Matrix6<f64>> {
    let jittered = cov + Matrix6::identity() * 1e-16;
    let chol = nalgebra::Cholesky::new(jittered).ok_or_else(|| {
        Error::NumericalFailure("pose covariance is not positive definite".into())
    })?;
    chol.l()
        .solve_lower_triangular(&Matrix6::identity())
        .ok_or_else(|| Error::NumericalFailure("pose covariance whitening failed".into()))
}
