//! Small 3D types generic over [`Real`], plus SO(3) maps.
//!
//! The generic layer ([`V3`], [`M3`], [`so3_exp`], [`so3_log`]) is what the
//! residual library is written against, so the same code runs with `f64` or
//! with jets. The f64 layer at the bottom provides the `nalgebra`-typed
//! Rodrigues exponential, logarithm, and right-Jacobians used by covariance
//! propagation.

use crate::Real;
use nalgebra::{Matrix3, Vector3};
use std::ops::{Add, Mul, Neg, Sub};

/// Angle below which SO(3) maps switch to their Taylor expansions.
pub const SMALL_ANGLE: f64 = 1e-7;

// ---------------------------------------------------------------------------
// Generic layer
// ---------------------------------------------------------------------------

/// 3-vector over any [`Real`] scalar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct V3<T> {
    pub x: T,
    pub y: T,
    pub z: T,
}

impl<T: Real> V3<T> {
    pub fn new(x: T, y: T, z: T) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self::new(T::zero(), T::zero(), T::zero())
    }

    /// Lift an f64 vector into the scalar type as constants.
    pub fn lift(v: &Vector3<f64>) -> Self {
        Self::new(T::from_f64(v.x), T::from_f64(v.y), T::from_f64(v.z))
    }

    pub fn dot(self, other: Self) -> T {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn norm_squared(self) -> T {
        self.dot(self)
    }

    pub fn norm(self) -> T {
        self.norm_squared().sqrt()
    }

    pub fn cross(self, other: Self) -> Self {
        Self::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    pub fn scale(self, s: T) -> Self {
        Self::new(self.x * s, self.y * s, self.z * s)
    }

    /// Value-only view (derivatives stripped).
    pub fn scalar(self) -> Vector3<f64> {
        Vector3::new(self.x.scalar(), self.y.scalar(), self.z.scalar())
    }
}

impl<T: Real> Add for V3<T> {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl<T: Real> Sub for V3<T> {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl<T: Real> Neg for V3<T> {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

/// Row-major 3x3 matrix over any [`Real`] scalar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct M3<T> {
    pub rows: [[T; 3]; 3],
}

impl<T: Real> M3<T> {
    pub fn identity() -> Self {
        let o = T::one();
        let z = T::zero();
        Self {
            rows: [[o, z, z], [z, o, z], [z, z, o]],
        }
    }

    /// Lift an f64 matrix into the scalar type as constants.
    pub fn lift(m: &Matrix3<f64>) -> Self {
        Self {
            rows: [
                [
                    T::from_f64(m[(0, 0)]),
                    T::from_f64(m[(0, 1)]),
                    T::from_f64(m[(0, 2)]),
                ],
                [
                    T::from_f64(m[(1, 0)]),
                    T::from_f64(m[(1, 1)]),
                    T::from_f64(m[(1, 2)]),
                ],
                [
                    T::from_f64(m[(2, 0)]),
                    T::from_f64(m[(2, 1)]),
                    T::from_f64(m[(2, 2)]),
                ],
            ],
        }
    }

    pub fn transpose(self) -> Self {
        Self {
            rows: [
                [self.rows[0][0], self.rows[1][0], self.rows[2][0]],
                [self.rows[0][1], self.rows[1][1], self.rows[2][1]],
                [self.rows[0][2], self.rows[1][2], self.rows[2][2]],
            ],
        }
    }

    pub fn trace(self) -> T {
        self.rows[0][0] + self.rows[1][1] + self.rows[2][2]
    }

    pub fn mul_vec(self, v: V3<T>) -> V3<T> {
        V3::new(
            self.rows[0][0] * v.x + self.rows[0][1] * v.y + self.rows[0][2] * v.z,
            self.rows[1][0] * v.x + self.rows[1][1] * v.y + self.rows[1][2] * v.z,
            self.rows[2][0] * v.x + self.rows[2][1] * v.y + self.rows[2][2] * v.z,
        )
    }

    pub fn scale(self, s: T) -> Self {
        let mut rows = self.rows;
        for row in rows.iter_mut() {
            for e in row.iter_mut() {
                *e = *e * s;
            }
        }
        Self { rows }
    }
}

impl<T: Real> Add for M3<T> {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        let mut rows = self.rows;
        for (r, row) in rows.iter_mut().enumerate() {
            for (c, e) in row.iter_mut().enumerate() {
                *e = *e + rhs.rows[r][c];
            }
        }
        Self { rows }
    }
}

impl<T: Real> Mul for M3<T> {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        let z = T::zero();
        let mut rows = [[z; 3]; 3];
        for r in 0..3 {
            for c in 0..3 {
                rows[r][c] = self.rows[r][0] * rhs.rows[0][c]
                    + self.rows[r][1] * rhs.rows[1][c]
                    + self.rows[r][2] * rhs.rows[2][c];
            }
        }
        Self { rows }
    }
}

/// Skew-symmetric (hat) operator, generic.
pub fn so3_hat<T: Real>(w: V3<T>) -> M3<T> {
    let z = T::zero();
    M3 {
        rows: [[z, -w.z, w.y], [w.z, z, -w.x], [-w.y, w.x, z]],
    }
}

/// SO(3) exponential via Rodrigues, with the Taylor fallback below
/// [`SMALL_ANGLE`]. The branch is taken on the stripped value so jets follow
/// the same series as their f64 evaluation.
pub fn so3_exp<T: Real>(w: V3<T>) -> M3<T> {
    let theta_sq = w.norm_squared();
    let k = so3_hat(w);
    let kk = k * k;

    let (a, b) = if theta_sq.scalar().sqrt() < SMALL_ANGLE {
        // sin(t)/t = 1 - t^2/6, (1 - cos(t))/t^2 = 1/2 - t^2/24
        let sixth = T::from_f64(1.0 / 6.0);
        let half = T::from_f64(0.5);
        let t24 = T::from_f64(1.0 / 24.0);
        (T::one() - theta_sq * sixth, half - theta_sq * t24)
    } else {
        let theta = theta_sq.sqrt();
        let a = theta.sin() / theta;
        // 1 - cos(t) = 2 sin^2(t/2), stable near zero
        let sin_half = (theta * T::from_f64(0.5)).sin();
        let b = (T::from_f64(2.0) * sin_half * sin_half) / theta_sq;
        (a, b)
    };

    M3::identity() + k.scale(a) + kk.scale(b)
}

/// SO(3) logarithm (principal branch), generic.
///
/// Valid away from the pi shell; every caller in this workspace feeds it
/// small relative rotations (residuals, adjacent interpolation brackets).
pub fn so3_log<T: Real>(m: &M3<T>) -> V3<T> {
    // w = vee(R - R^T) / 2 = sin(theta) * axis
    let w = V3::new(
        (m.rows[2][1] - m.rows[1][2]) * T::from_f64(0.5),
        (m.rows[0][2] - m.rows[2][0]) * T::from_f64(0.5),
        (m.rows[1][0] - m.rows[0][1]) * T::from_f64(0.5),
    );
    let s = w.norm();
    let c = (m.trace() - T::one()) * T::from_f64(0.5);
    let theta = s.atan2(c);

    let scale = if s.scalar() < SMALL_ANGLE {
        // theta / sin(theta) = 1 + theta^2/6 for small angles
        T::one() + theta * theta * T::from_f64(1.0 / 6.0)
    } else {
        theta / s
    };
    w.scale(scale)
}

// ---------------------------------------------------------------------------
// f64 layer (nalgebra-typed)
// ---------------------------------------------------------------------------

/// Skew-symmetric matrix of an f64 vector.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Rodrigues exponential on f64 vectors.
pub fn exp_so3(w: &Vector3<f64>) -> Matrix3<f64> {
    let generic: M3<f64> = so3_exp(V3::new(w.x, w.y, w.z));
    m3_to_nalgebra(&generic)
}

/// SO(3) logarithm on f64 matrices.
pub fn log_so3(r: &Matrix3<f64>) -> Vector3<f64> {
    let generic = so3_log(&M3::<f64>::lift(r));
    Vector3::new(generic.x, generic.y, generic.z)
}

/// Right Jacobian of SO(3): Exp(w + dw) ~= Exp(w) Exp(Jr(w) dw).
pub fn right_jacobian(w: &Vector3<f64>) -> Matrix3<f64> {
    let theta_sq = w.norm_squared();
    let k = skew(w);
    let kk = k * k;

    let (a, b) = if theta_sq.sqrt() < 1e-4 {
        // a = (1 - cos t)/t^2, b = (t - sin t)/t^3, expanded to avoid
        // cancellation
        let t4 = theta_sq * theta_sq;
        (
            0.5 - theta_sq / 24.0 + t4 / 720.0,
            1.0 / 6.0 - theta_sq / 120.0 + t4 / 5040.0,
        )
    } else {
        let theta = theta_sq.sqrt();
        let sin_half = (0.5 * theta).sin();
        let a = (2.0 * sin_half * sin_half) / theta_sq;
        let b = (theta - theta.sin()) / (theta_sq * theta);
        (a, b)
    };

    Matrix3::identity() - a * k + b * kk
}

/// Inverse of the right Jacobian.
pub fn right_jacobian_inv(w: &Vector3<f64>) -> Matrix3<f64> {
    let theta_sq = w.norm_squared();
    let k = skew(w);
    let kk = k * k;

    let b = if theta_sq.sqrt() < 1e-4 {
        1.0 / 12.0 + theta_sq / 720.0
    } else {
        let theta = theta_sq.sqrt();
        (1.0 / theta_sq) - (1.0 + theta.cos()) / (2.0 * theta * theta.sin())
    };

    Matrix3::identity() + 0.5 * k + b * kk
}

/// Convert a generic f64 matrix back to nalgebra.
pub fn m3_to_nalgebra(m: &M3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        m.rows[0][0],
        m.rows[0][1],
        m.rows[0][2],
        m.rows[1][0],
        m.rows[1][1],
        m.rows[1][2],
        m.rows[2][0],
        m.rows[2][1],
        m.rows[2][2],
    )
}
