//! Error model.
//!
//! Structural problems (ordering, missing data, out-of-range queries)
//! surface immediately through these variants. Numerical hiccups inside the
//! optimizer are first absorbed by damping escalation and only become
//! [`Error::NumericalFailure`] after repeated strikes. Hitting the iteration
//! cap is *not* an error; it is reported as a flag on the result.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A sample arrived with a timestamp at or before the last accepted one.
    /// The sample is dropped and the buffer left unchanged.
    #[error("non-monotonic {stream} timestamp {t:.9} (last accepted {last:.9})")]
    IngestionOrder {
        stream: &'static str,
        t: f64,
        last: f64,
    },

    /// Pose sample quaternion too far from unit norm to silently fix.
    #[error("pose quaternion at t={t:.9} has norm {norm} (tolerance 1e-6)")]
    NonUnitQuaternion { t: f64, norm: f64 },

    /// Interpolation query outside the buffer; no extrapolation.
    #[error("query time {t:.9} outside buffer range [{min:.9}, {max:.9}]")]
    OutOfRange { t: f64, min: f64, max: f64 },

    /// Empty streams, or an interval without enough IMU coverage.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// Factorization failed even after repeated damping escalation, or a
    /// covariance could not be whitened.
    #[error("numerical failure: {0}")]
    NumericalFailure(String),

    /// The optimizer's damping parameter left any useful range.
    #[error("optimizer diverged: {0}")]
    Diverged(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
