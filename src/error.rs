//! Error types for tensr

use crate::dtype::DType;
use thiserror::Error;

/// Result type alias using tensr's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tensr operations
///
/// Shape, alias, select, and domain errors are detected at the dispatch
/// boundary before any backend call; device errors surface as-is from the
/// backend. Resource errors are aggregated during scope release and never
/// mask a primary error.
#[derive(Error, Debug)]
pub enum Error {
    /// Shape/stride incompatibility, failed reshape, or gemm mismatch
    #[error("shape error in '{op}': {reason}")]
    Shape {
        /// The operation name
        op: &'static str,
        /// What went wrong
        reason: String,
    },

    /// Disallowed aliasing between operation arguments
    #[error("arguments of '{op}' alias the destination")]
    Alias {
        /// The operation name
        op: &'static str,
    },

    /// Non-monotonic or non-contiguous select indices
    #[error("invalid selection: {reason}")]
    Select {
        /// What made the selection illegal
        reason: String,
    },

    /// Out-of-range numeric conversion under checked semantics,
    /// or an argument outside an operation's numeric domain
    #[error("domain error for {dtype}: {reason}")]
    Domain {
        /// The dtype involved
        dtype: DType,
        /// What was out of domain
        reason: String,
    },

    /// Backend-raised failure (OOM, kernel fault); carries the backend message
    #[error("device error: {message}")]
    Device {
        /// Backend-provided description
        message: String,
    },

    /// Operation spans two drivers
    #[error("operation spans drivers '{src}' and '{dst}'")]
    CrossDriver {
        /// Driver of the first argument
        src: String,
        /// Driver of the second argument
        dst: String,
    },

    /// Required context field missing
    #[error("no {field} selected in the current context")]
    NoContext {
        /// The missing field
        field: &'static str,
    },

    /// Driver registry miss
    #[error("unknown driver '{name}'")]
    UnknownDriver {
        /// The requested driver name
        name: String,
    },

    /// Failure during scope release; releases are attempted for every
    /// tracked resource and the first failure is reported here
    #[error("{failed} resource release(s) failed; first: {first}")]
    Resource {
        /// Description of the first failure
        first: String,
        /// Total number of failed releases
        failed: usize,
    },
}

impl Error {
    /// Shorthand for a device error with a formatted message
    pub fn device(message: impl Into<String>) -> Self {
        Self::Device {
            message: message.into(),
        }
    }
}
