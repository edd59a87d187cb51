use std::io;

use thiserror::Error;

/// Errors surfaced by the engine.
///
/// Recoverable conditions (an unavailable GPU, a failed GPU backward on one
/// sample, integer saturation) never reach the caller as errors; they are
/// handled with a logged fallback. Everything here leaves the network unchanged.
#[derive(Debug, Error)]
pub enum NetError {
    /// Layer descriptor or option is inconsistent.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A grid does not have the shape of the layer it is applied to.
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// GPU initialisation failed; the network keeps running on CPU.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A value supplied as a bound or produced by conversion does not fit the scalar type.
    #[error("numeric overflow: {0}")]
    NumericOverflow(String),

    /// Encoded network is corrupt or incompatible.
    #[error("invalid serialized network: {0}")]
    SerializationInvalid(String),

    /// Topology cannot be inverted by the requested method.
    #[error("inverse infeasible: {0}")]
    InverseInfeasible(String),

    /// Three-way equivalence failed.
    #[error("verification diverged: max deviation {max_deviation:e} exceeds tolerance {tolerance:e}")]
    VerificationDivergence { max_deviation: f64, tolerance: f64 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, NetError>;

impl NetError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        NetError::ConfigInvalid(msg.into())
    }

    pub(crate) fn shape(expected: (usize, usize), actual: (usize, usize)) -> Self {
        NetError::ShapeMismatch {
            expected: format!("{}x{}", expected.0, expected.1),
            actual: format!("{}x{}", actual.0, actual.1),
        }
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        NetError::SerializationInvalid(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_error_formats_dimensions() {
        let e = NetError::shape((28, 28), (27, 28));
        assert_eq!(e.to_string(), "shape mismatch: expected 28x28, got 27x28");
    }

    #[test]
    fn io_errors_convert() {
        let e: NetError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(e, NetError::Io(_)));
    }
}
