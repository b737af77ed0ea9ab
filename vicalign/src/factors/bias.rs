//! Bias random-walk factor between consecutive nodes.
//!
//! The residual is linear in the biases, so its Jacobian is written
//! analytically (+/- the whitening weight on the matching entry) rather
//! than through jets.

use crate::config::ImuNoise;
use nalgebra::Vector3;

/// Residual rows: gyro-bias walk, accel-bias walk.
pub const BIAS_RESIDUAL_DOF: usize = 6;

/// Whitening weights `1 / (sigma sqrt(dt))` for one interval.
#[derive(Debug, Clone, Copy)]
pub struct BiasWalkWeights {
    pub gyro: f64,
    pub accel: f64,
}

impl BiasWalkWeights {
    pub fn new(noise: &ImuNoise, dt: f64) -> Self {
        // Floors keep the weights finite for noise-free synthetic runs.
        let sqrt_dt = dt.sqrt().max(1e-6);
        Self {
            gyro: 1.0 / (noise.gyro_random_walk.max(1e-9) * sqrt_dt),
            accel: 1.0 / (noise.accel_random_walk.max(1e-9) * sqrt_dt),
        }
    }
}

/// Whitened residual `w * (b_j - b_i)` for both bias chains.
pub fn bias_walk_residual(
    gyro_bias_i: &Vector3<f64>,
    accel_bias_i: &Vector3<f64>,
    gyro_bias_j: &Vector3<f64>,
    accel_bias_j: &Vector3<f64>,
    weights: &BiasWalkWeights,
) -> [f64; BIAS_RESIDUAL_DOF] {
    let dg = (gyro_bias_j - gyro_bias_i) * weights.gyro;
    let da = (accel_bias_j - accel_bias_i) * weights.accel;
    [dg.x, dg.y, dg.z, da.x, da.y, da.z]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn constant_bias_gives_zero_residual() {
        let bg = Vector3::new(0.01, 0.02, 0.03);
        let ba = Vector3::new(0.1, 0.2, 0.3);
        let weights = BiasWalkWeights::new(&ImuNoise::default(), 0.05);
        let res = bias_walk_residual(&bg, &ba, &bg, &ba, &weights);
        for r in res {
            assert_abs_diff_eq!(r, 0.0, epsilon = 1e-15);
        }
    }

    #[test]
    fn weight_scales_with_interval_and_density() {
        let noise = ImuNoise::default();
        let short = BiasWalkWeights::new(&noise, 0.01);
        let long = BiasWalkWeights::new(&noise, 0.04);
        // Doubling sqrt(dt) halves the weight.
        assert_abs_diff_eq!(short.gyro / long.gyro, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(
            short.gyro,
            1.0 / (noise.gyro_random_walk * 0.1),
            epsilon = 1e-6
        );
    }

    #[test]
    fn drift_is_whitened() {
        let weights = BiasWalkWeights::new(&ImuNoise::default(), 0.05);
        let bg_i = Vector3::zeros();
        let bg_j = Vector3::new(1e-5, 0.0, 0.0);
        let res = bias_walk_residual(&bg_i, &Vector3::zeros(), &bg_j, &Vector3::zeros(), &weights);
        assert_abs_diff_eq!(res[0], 1e-5 * weights.gyro, epsilon = 1e-12);
        assert_abs_diff_eq!(res[3], 0.0, epsilon = 1e-15);
    }

    #[test]
    fn zero_densities_stay_finite() {
        let weights = BiasWalkWeights::new(&ImuNoise::zero(), 0.05);
        assert!(weights.gyro.is_finite());
        assert!(weights.accel.is_finite());
    }
}
