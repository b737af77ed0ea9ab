//! IMU sample buffer and interval preintegration.

use crate::config::ImuNoise;
use crate::error::{Error, Result};
use crate::preintegration::Preintegrated;
use crate::types::ImuSample;
use nalgebra::Vector3;
use tracing::debug;

/// Sub-intervals shorter than this are merged away; they would blow up the
/// discretized noise covariance.
const MIN_STEP: f64 = 1e-9;

/// Owns the ordered IMU stream and produces preintegrated relative motion
/// over requested intervals.
pub struct Propagator {
    noise: ImuNoise,
    samples: Vec<ImuSample>,
}

impl Propagator {
    pub fn new(noise: ImuNoise) -> Self {
        Self {
            noise,
            samples: Vec::new(),
        }
    }

    /// Append one IMU sample. Timestamps must be strictly increasing; a
    /// sample at or before the last accepted one is dropped and reported.
    pub fn feed_imu(&mut self, t: f64, gyro: Vector3<f64>, accel: Vector3<f64>) -> Result<()> {
        if let Some(last) = self.samples.last() {
            if t <= last.t {
                return Err(Error::IngestionOrder {
                    stream: "imu",
                    t,
                    last: last.t,
                });
            }
        }
        self.samples.push(ImuSample::new(t, gyro, accel));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[ImuSample] {
        &self.samples
    }

    pub fn noise(&self) -> &ImuNoise {
        &self.noise
    }

    /// Whether the buffer has samples on both sides of `t`.
    pub fn has_bounding(&self, t: f64) -> bool {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => first.t <= t && t <= last.t,
            _ => false,
        }
    }

    /// Integrated `|gyro| dt` over `[t1, t2]`, the rotation-excitation
    /// measure behind the calibration observability guard.
    pub fn rotation_excitation(&self, t1: f64, t2: f64) -> f64 {
        let mut total = 0.0;
        for pair in self.samples.windows(2) {
            let lo = pair[0].t.max(t1);
            let hi = pair[1].t.min(t2);
            if hi > lo {
                total += 0.5 * (pair[0].gyro.norm() + pair[1].gyro.norm()) * (hi - lo);
            }
        }
        total
    }

    /// Preintegrate `[t1, t2]` at the given bias linearization point.
    ///
    /// The buffer is sliced to the interval; when an endpoint falls between
    /// samples a boundary sample is synthesized by linear interpolation of
    /// the raw readings. Fails with `InsufficientData` when the buffer does
    /// not straddle the interval.
    pub fn preintegrate(
        &self,
        t1: f64,
        t2: f64,
        bg: &Vector3<f64>,
        ba: &Vector3<f64>,
    ) -> Result<Preintegrated> {
        if self.samples.len() < 2 {
            return Err(Error::InsufficientData(format!(
                "{} IMU samples buffered, need at least 2",
                self.samples.len()
            )));
        }
        if t2 <= t1 {
            return Err(Error::InsufficientData(format!(
                "empty preintegration interval [{t1:.9}, {t2:.9}]"
            )));
        }
        if !self.has_bounding(t1) || !self.has_bounding(t2) {
            return Err(Error::InsufficientData(format!(
                "IMU buffer [{:.9}, {:.9}] does not straddle [{t1:.9}, {t2:.9}]",
                self.samples[0].t,
                self.samples[self.samples.len() - 1].t,
            )));
        }

        let sliced = self.slice(t1, t2);
        if sliced.len() < 2 {
            return Err(Error::InsufficientData(format!(
                "fewer than two usable IMU samples in [{t1:.9}, {t2:.9}]"
            )));
        }

        let mut preint = Preintegrated::new(*bg, *ba);
        for pair in sliced.windows(2) {
            let dt = pair[1].t - pair[0].t;
            let gyro_bar = 0.5 * (pair[0].gyro + pair[1].gyro);
            let accel_bar = 0.5 * (pair[0].accel + pair[1].accel);
            preint.integrate(&gyro_bar, &accel_bar, dt, &self.noise);
        }
        Ok(preint)
    }

    /// Samples covering `[t1, t2]`, with synthesized boundary samples when
    /// the endpoints fall between readings and zero-length steps pruned.
    fn slice(&self, t1: f64, t2: f64) -> Vec<ImuSample> {
        let mut out: Vec<ImuSample> = Vec::new();

        // Last sample at or before t1; `has_bounding` guarantees one exists.
        let start = self.samples.partition_point(|s| s.t <= t1) - 1;
        if (self.samples[start].t - t1).abs() <= MIN_STEP {
            out.push(self.samples[start]);
        } else {
            out.push(ImuSample::lerp(
                &self.samples[start],
                &self.samples[start + 1],
                t1,
            ));
        }

        for sample in &self.samples[start + 1..] {
            if sample.t >= t2 {
                break;
            }
            if sample.t > t1 {
                out.push(*sample);
            }
        }

        let last_kept = out[out.len() - 1].t;
        if (t2 - last_kept).abs() > MIN_STEP {
            let end = self.samples.partition_point(|s| s.t < t2);
            out.push(ImuSample::lerp(
                &self.samples[end - 1],
                &self.samples[end.min(self.samples.len() - 1)],
                t2,
            ));
        }

        // Prune degenerate steps.
        let mut pruned: Vec<ImuSample> = Vec::with_capacity(out.len());
        for sample in out {
            match pruned.last() {
                Some(prev) if sample.t - prev.t < MIN_STEP => {
                    debug!(t = sample.t, "dropping zero-dt IMU step");
                }
                _ => pruned.push(sample),
            }
        }
        pruned
    }
}
