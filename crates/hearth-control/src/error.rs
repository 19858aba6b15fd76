//! Error types for the control engine.
//!
//! Most abnormal conditions in a control cycle are recovered locally (an
//! unreachable target, a missing sensor value, a failed state write) and
//! surface as [`ControlEvent`](crate::events::ControlEvent)s rather than
//! errors. The variants here are the ones that cross a function boundary
//! before being turned into a fallback. All errors implement
//! `std::error::Error` via `thiserror`.

/// Result alias for control engine operations.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Primary error type for control engine operations.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The thermal coefficients cannot produce a meaningful prediction
    /// (e.g. `outlet_effectiveness + heat_loss_coefficient <= 0`, or a
    /// non-finite intermediate result).
    #[error("invalid physics state: {detail}")]
    InvalidPhysicsState {
        /// Human-readable explanation.
        detail: String,
    },

    /// The outlet search exhausted its iteration budget before its interval
    /// collapsed below the configured resolution.
    #[error(
        "outlet search did not converge after {iterations} iterations (interval width {interval_width:.3}, best candidate {best_outlet:.2})"
    )]
    SearchNonConvergence {
        /// Iterations executed before the budget ran out.
        iterations: usize,
        /// Width of the remaining search interval in °C.
        interval_width: f64,
        /// Best outlet temperature found so far.
        best_outlet: f64,
    },

    /// The caller supplied invalid configuration or input.
    #[error("invalid input: {0}")]
    InvalidInput(#[from] ValidationError),

    /// The durable state store rejected a read or write.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// I/O error from a file-backed store or config loader.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Validation errors for configuration and coefficient sets.
///
/// Raised eagerly, before a controller is built, so that a bad deployment
/// fails at startup.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// A value is NaN or infinite where a finite number is required.
    #[error("non-finite value detected: {0}")]
    NonFiniteValue(String),

    /// A parameter is outside its valid range.
    #[error("parameter out of range: {name} = {value} (expected {expected})")]
    ParameterOutOfRange {
        /// Name of the parameter.
        name: String,
        /// The invalid value (as a string for flexibility).
        value: String,
        /// Human-readable description of the valid range.
        expected: String,
    },

    /// A lower bound is not strictly below its upper bound.
    #[error("bounds for {name} are inverted or empty: [{lower}, {upper}]")]
    InvertedBounds {
        /// Name of the bounded quantity.
        name: String,
        /// Configured lower bound.
        lower: f64,
        /// Configured upper bound.
        upper: f64,
    },

    /// A controller identity is empty or unusable as a store key.
    #[error("invalid controller id: {0:?}")]
    InvalidControllerId(String),
}

impl ControlError {
    /// Shorthand for an [`InvalidPhysicsState`](Self::InvalidPhysicsState).
    pub(crate) fn physics(detail: impl Into<String>) -> Self {
        ControlError::InvalidPhysicsState {
            detail: detail.into(),
        }
    }
}
