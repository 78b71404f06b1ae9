//! Error types for the DPLR recurrence.

use thiserror::Error;

/// Errors surfaced by the recurrent scan entry points.
///
/// Shape and segment errors are input-contract violations detected before any
/// timestep is computed; the scan never returns partial output.
#[derive(Error, Debug)]
pub enum DplrError {
    /// An input or the initial state has dimensions inconsistent with the rest.
    #[error("shape mismatch for `{name}`: expected {expected}, got {actual}")]
    ShapeMismatch {
        name: &'static str,
        expected: String,
        actual: String,
    },

    /// Malformed `cu_seqlens`.
    #[error("invalid cu_seqlens: {reason}")]
    InvalidSegmentDescriptor { reason: String },

    /// Sequence streams must be floating point.
    #[error("unsupported dtype for `{name}`: {dtype:?}, expected a float type")]
    UnsupportedDType {
        name: &'static str,
        dtype: candle_core::DType,
    },

    /// Underlying tensor operation failed (dtype or device mismatch, ...).
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl DplrError {
    pub(crate) fn shape(name: &'static str, expected: impl ToString, actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            name,
            expected: expected.to_string(),
            actual: format!("{actual:?}"),
        }
    }

    pub(crate) fn unsupported_dtype(name: &'static str, dtype: candle_core::DType) -> Self {
        Self::UnsupportedDType { name, dtype }
    }

    pub(crate) fn segments(reason: impl Into<String>) -> Self {
        Self::InvalidSegmentDescriptor {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DplrError>;
