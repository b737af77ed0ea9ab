//! Pose buffer with on-manifold interpolation and covariance propagation.

use crate::error::{Error, Result};
use crate::types::PoseSample;
use nalgebra::{Matrix3, Matrix6, Quaternion, UnitQuaternion, Vector3};
use vicalign_solver::lie::{exp_so3, log_so3, right_jacobian, right_jacobian_inv};

/// Quaternion norm deviation that is silently renormalized; beyond it the
/// sample is rejected.
const QUAT_NORM_TOL: f64 = 1e-6;

/// An interpolated pose with its covariance and time-derivative.
///
/// The derivative fields describe the motion of the interpolant itself:
/// `omega` is the body-frame angular velocity of the geodesic and `vel` the
/// linear velocity of the position blend. They let a caller form Jacobians
/// with respect to a shifted query time analytically.
#[derive(Debug, Clone)]
pub struct InterpolatedPose {
    pub t: f64,
    pub rot: UnitQuaternion<f64>,
    pub pos: Vector3<f64>,
    pub cov_rot: Matrix3<f64>,
    pub cov_pos: Matrix3<f64>,
    /// Body-frame angular velocity of the interpolant (rad/s).
    pub omega: Vector3<f64>,
    /// Linear velocity of the interpolant (m/s).
    pub vel: Vector3<f64>,
}

impl InterpolatedPose {
    /// Stacked `[rotation, position]` covariance.
    pub fn cov6(&self) -> Matrix6<f64> {
        let mut cov = Matrix6::zeros();
        cov.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.cov_rot);
        cov.fixed_view_mut::<3, 3>(3, 3).copy_from(&self.cov_pos);
        cov
    }
}

/// Owns the ordered pose stream and answers interpolation queries.
pub struct Interpolator {
    samples: Vec<PoseSample>,
}

impl Interpolator {
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
        }
    }

    /// Append one pose sample.
    ///
    /// Rejects non-monotone timestamps. A quaternion whose norm is within
    /// 1e-6 of unit is silently renormalized; anything further off is
    /// rejected.
    pub fn feed_pose(
        &mut self,
        t: f64,
        q: Quaternion<f64>,
        p: Vector3<f64>,
        cov_rot: Matrix3<f64>,
        cov_pos: Matrix3<f64>,
    ) -> Result<()> {
        if let Some(last) = self.samples.last() {
            if t <= last.t {
                return Err(Error::IngestionOrder {
                    stream: "pose",
                    t,
                    last: last.t,
                });
            }
        }
        let norm = q.norm();
        if (norm - 1.0).abs() > QUAT_NORM_TOL {
            return Err(Error::NonUnitQuaternion { t, norm });
        }
        self.samples.push(PoseSample {
            t,
            rot: UnitQuaternion::from_quaternion(q),
            pos: p,
            cov_rot,
            cov_pos,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[PoseSample] {
        &self.samples
    }

    pub fn time_range(&self) -> Option<(f64, f64)> {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => Some((first.t, last.t)),
            _ => None,
        }
    }

    /// The bracketing sample pair for `t` (binary search). `t` must lie
    /// inside the buffer range; no extrapolation.
    pub fn bracket(&self, t: f64) -> Result<(&PoseSample, &PoseSample)> {
        let (min, max) = self
            .time_range()
            .ok_or_else(|| Error::InsufficientData("pose buffer is empty".into()))?;
        if self.samples.len() < 2 {
            return Err(Error::InsufficientData(
                "pose buffer needs at least two samples to bracket".into(),
            ));
        }
        if t < min || t > max {
            return Err(Error::OutOfRange { t, min, max });
        }
        let upper = self
            .samples
            .partition_point(|s| s.t <= t)
            .clamp(1, self.samples.len() - 1);
        Ok((&self.samples[upper - 1], &self.samples[upper]))
    }

    /// Interpolate the pose at `t` with propagated covariance.
    ///
    /// Orientation follows the geodesic `R(t) = R_a Exp(lambda Log(R_a^T
    /// R_b))`; position is the linear blend. A query exactly on a sample
    /// returns that sample's pose and covariance unchanged.
    pub fn interpolate(&self, t: f64) -> Result<InterpolatedPose> {
        let (min, max) = self
            .time_range()
            .ok_or_else(|| Error::InsufficientData("pose buffer is empty".into()))?;
        if t < min || t > max {
            return Err(Error::OutOfRange { t, min, max });
        }

        // Exact hit: hand back the sample, with the derivative taken from
        // the adjacent pair when one exists.
        if let Some(idx) = self.samples.iter().position(|s| s.t == t) {
            let sample = &self.samples[idx];
            let (omega, vel) = if self.samples.len() >= 2 {
                let (a, b) = if idx + 1 < self.samples.len() {
                    (&self.samples[idx], &self.samples[idx + 1])
                } else {
                    (&self.samples[idx - 1], &self.samples[idx])
                };
                pair_rates(a, b)
            } else {
                (Vector3::zeros(), Vector3::zeros())
            };
            return Ok(InterpolatedPose {
                t,
                rot: sample.rot,
                pos: sample.pos,
                cov_rot: sample.cov_rot,
                cov_pos: sample.cov_pos,
                omega,
                vel,
            });
        }

        let (a, b) = self.bracket(t)?;
        let lambda = (t - a.t) / (b.t - a.t);

        let rot_a = a.rot.to_rotation_matrix().into_inner();
        let rot_b = b.rot.to_rotation_matrix().into_inner();
        let r_ab = log_so3(&(rot_a.transpose() * rot_b));
        let rot = rot_a * exp_so3(&(lambda * r_ab));
        let pos = (1.0 - lambda) * a.pos + lambda * b.pos;

        // Covariance through the interpolation linearization, right
        // perturbations on both endpoints:
        //   H_a = Exp(lambda r)^T - lambda Jr(lambda r) Jl(r)^-1
        //   H_b = lambda Jr(lambda r) Jr(r)^-1
        // with Jl(r)^-1 = Jr(-r)^-1. H_a -> I, H_b -> 0 at lambda = 0 and
        // vice versa at lambda = 1, so endpoint covariances are recovered
        // exactly.
        let jr_lam = right_jacobian(&(lambda * r_ab));
        let h_a = exp_so3(&(lambda * r_ab)).transpose() - lambda * jr_lam * right_jacobian_inv(&(-r_ab));
        let h_b = lambda * jr_lam * right_jacobian_inv(&r_ab);
        let cov_rot = h_a * a.cov_rot * h_a.transpose() + h_b * b.cov_rot * h_b.transpose();
        let cov_pos =
            (1.0 - lambda) * (1.0 - lambda) * a.cov_pos + lambda * lambda * b.cov_pos;

        let (omega, vel) = pair_rates(a, b);

        Ok(InterpolatedPose {
            t,
            rot: UnitQuaternion::from_rotation_matrix(&nalgebra::Rotation3::from_matrix_unchecked(
                rot,
            )),
            pos,
            cov_rot,
            cov_pos,
            omega,
            vel,
        })
    }
}

impl Default for Interpolator {
    fn default() -> Self {
        Self::new()
    }
}

/// Constant rates of the geodesic / linear blend between two samples.
fn pair_rates(a: &PoseSample, b: &PoseSample) -> (Vector3<f64>, Vector3<f64>) {
    let dt = b.t - a.t;
    let rot_a = a.rot.to_rotation_matrix().into_inner();
    let rot_b = b.rot.to_rotation_matrix().into_inner();
    let omega = log_so3(&(rot_a.transpose() * rot_b)) / dt;
    let vel = (b.pos - a.pos) / dt;
    (omega, vel)
}
