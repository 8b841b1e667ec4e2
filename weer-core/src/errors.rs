use thiserror::Error;

/// Error type for invalid resampling and reweighting operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WeError {
    /// Malformed or empty sample arrays, or mismatched dimensions.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// Settings that make the resampling problem ill-posed.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// The constrained minimiser did not reach a stationary point.
    #[error("Optimization failed after {iterations} iterations: {reason}")]
    Optimization { iterations: usize, reason: String },
    /// State after resampling breaks an ensemble invariant.
    #[error("Consistency check failed: {0}")]
    Consistency(String),
}

impl WeError {
    /// Whether the caller may recover from this error by keeping prior weights.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, WeError::Optimization { .. })
    }
}

/// Convenience type for `Result<T, WeError>`.
pub type WeResult<T> = Result<T, WeError>;
