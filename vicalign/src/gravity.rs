//! Gravity direction on the unit sphere.
//!
//! The gravity vector in the capture frame has fixed magnitude 9.81; only
//! its direction is estimated, through a two-parameter chart
//! `g(d) = 9.81 * Exp(d1 e1 + d2 e2) * u0` where `u0` is the chart pole and
//! `(e1, e2)` an orthonormal tangent basis. Chart distortion grows with the
//! angle from the pole, so a chart is only valid within [`CHART_LIMIT`];
//! the solver swaps to a chart re-centered on the current direction when
//! the tangent estimate crosses that limit, and folds whatever tangent
//! remains into the pole once an optimization round finishes.

use nalgebra::{Matrix3x2, Vector3};
use vicalign_solver::jet::Real;
use vicalign_solver::lie::{exp_so3, so3_exp, V3};

/// Fixed gravity magnitude (m/s^2).
pub const GRAVITY_MAGNITUDE: f64 = 9.81;

/// Maximum angular distance from the chart pole before a swap (70 degrees).
pub const CHART_LIMIT: f64 = 70.0 * std::f64::consts::PI / 180.0;

#[derive(Debug, Clone)]
pub struct GravityChart {
    pole: Vector3<f64>,
    e1: Vector3<f64>,
    e2: Vector3<f64>,
}

impl GravityChart {
    /// Chart centered on the given (not necessarily unit) direction.
    pub fn from_direction(direction: &Vector3<f64>) -> Self {
        let pole = direction.normalize();
        // Orthonormal complement: cross against the axis least aligned with
        // the pole.
        let seed = if pole.x.abs() <= pole.y.abs() && pole.x.abs() <= pole.z.abs() {
            Vector3::x()
        } else if pole.y.abs() <= pole.z.abs() {
            Vector3::y()
        } else {
            Vector3::z()
        };
        let e1 = pole.cross(&seed).normalize();
        let e2 = pole.cross(&e1);
        Self { pole, e1, e2 }
    }

    /// Chart centered on the given gravity vector.
    pub fn from_gravity(gravity: &Vector3<f64>) -> Self {
        Self::from_direction(gravity)
    }

    /// Unit direction at tangent coordinates `(d1, d2)`.
    pub fn direction(&self, d1: f64, d2: f64) -> Vector3<f64> {
        exp_so3(&(d1 * self.e1 + d2 * self.e2)) * self.pole
    }

    /// Gravity vector at tangent coordinates `(d1, d2)`.
    pub fn gravity(&self, d1: f64, d2: f64) -> Vector3<f64> {
        GRAVITY_MAGNITUDE * self.direction(d1, d2)
    }

    /// Gravity vector with generic scalars, for use inside residuals.
    pub fn gravity_generic<T: Real>(&self, d1: T, d2: T) -> V3<T> {
        let w = V3::lift(&self.e1).scale(d1) + V3::lift(&self.e2).scale(d2);
        let rot = so3_exp(w);
        rot.mul_vec(V3::lift(&self.pole)).scale(T::from_f64(GRAVITY_MAGNITUDE))
    }

    /// Whether `(d1, d2)` has left the chart's validity region.
    pub fn needs_swap(&self, d1: f64, d2: f64) -> bool {
        (d1 * d1 + d2 * d2).sqrt() > CHART_LIMIT
    }

    /// Fold tangent coordinates into the pole, producing the re-centered
    /// chart at the same direction.
    pub fn recenter(&self, d1: f64, d2: f64) -> Self {
        Self::from_direction(&self.direction(d1, d2))
    }

    /// Tangent basis as a 3x2 matrix, for mapping chart-space covariances
    /// into the capture frame.
    pub fn tangent_basis(&self) -> Matrix3x2<f64> {
        Matrix3x2::from_columns(&[self.e1, self.e2])
    }

    pub fn pole(&self) -> Vector3<f64> {
        self.pole
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn zero_coordinates_return_the_pole() {
        let chart = GravityChart::from_gravity(&Vector3::new(0.0, 0.0, -9.81));
        let g = chart.gravity(0.0, 0.0);
        assert_abs_diff_eq!((g - Vector3::new(0.0, 0.0, -9.81)).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn magnitude_is_fixed_everywhere() {
        let chart = GravityChart::from_direction(&Vector3::new(0.3, -0.5, -1.0));
        for (d1, d2) in [(0.0, 0.0), (0.2, -0.1), (0.7, 0.7), (-1.0, 0.4)] {
            assert_abs_diff_eq!(chart.gravity(d1, d2).norm(), GRAVITY_MAGNITUDE, epsilon = 1e-12);
        }
    }

    #[test]
    fn basis_is_orthonormal() {
        for dir in [
            Vector3::new(0.0, 0.0, -1.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.2, 0.9, -0.3),
        ] {
            let chart = GravityChart::from_direction(&dir);
            let basis = chart.tangent_basis();
            let e1 = basis.column(0);
            let e2 = basis.column(1);
            assert_abs_diff_eq!(e1.dot(&e2), 0.0, epsilon = 1e-12);
            assert_abs_diff_eq!(e1.dot(&chart.pole()), 0.0, epsilon = 1e-12);
            assert_abs_diff_eq!(e1.norm(), 1.0, epsilon = 1e-12);
            assert_abs_diff_eq!(e2.norm(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn tangent_steps_move_the_direction_to_first_order() {
        // d/dd1 Exp(d1 e1) u0 = e1 x u0 at d1 = 0
        let chart = GravityChart::from_direction(&Vector3::new(0.0, 0.0, -1.0));
        let eps = 1e-6;
        let moved = (chart.direction(eps, 0.0) - chart.pole()) / eps;
        let expected = chart.e1.cross(&chart.pole());
        assert_abs_diff_eq!((moved - expected).norm(), 0.0, epsilon = 1e-5);
    }

    #[test]
    fn swap_threshold_at_seventy_degrees() {
        let chart = GravityChart::from_direction(&Vector3::new(0.0, 0.0, -1.0));
        let just_under = CHART_LIMIT - 1e-3;
        let just_over = CHART_LIMIT + 1e-3;
        assert!(!chart.needs_swap(just_under, 0.0));
        assert!(chart.needs_swap(0.0, just_over));
    }

    #[test]
    fn recenter_preserves_the_direction() {
        let chart = GravityChart::from_direction(&Vector3::new(0.1, 0.2, -1.0));
        let (d1, d2) = (0.3, -0.4);
        let before = chart.direction(d1, d2);
        let swapped = chart.recenter(d1, d2);
        assert_abs_diff_eq!((swapped.direction(0.0, 0.0) - before).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn generic_evaluation_matches_f64() {
        use vicalign_solver::Jet;
        let chart = GravityChart::from_direction(&Vector3::new(0.2, -0.3, -0.9));
        let (d1, d2) = (0.11, -0.07);
        let direct = chart.gravity(d1, d2);
        let jets = chart.gravity_generic(Jet::<2>::variable(d1, 0), Jet::<2>::variable(d2, 1));
        assert_abs_diff_eq!(jets.x.value, direct.x, epsilon = 1e-13);
        assert_abs_diff_eq!(jets.y.value, direct.y, epsilon = 1e-13);
        assert_abs_diff_eq!(jets.z.value, direct.z, epsilon = 1e-13);

        // Derivative check against finite differences.
        let h = 1e-7;
        let fd = (chart.gravity(d1 + h, d2) - direct) / h;
        assert_abs_diff_eq!(jets.x.grad[0], fd.x, epsilon = 1e-5);
        assert_abs_diff_eq!(jets.z.grad[0], fd.z, epsilon = 1e-5);
    }
}
