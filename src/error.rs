//! shardr error types

/// shardr result type
pub type Result<T> = std::result::Result<T, Error>;

/// shardr errors
///
/// Gradient overflow is deliberately *not* represented here: an overflowed
/// step is skipped and the loss scale backs off, but training continues
/// (see [`StepOutcome`]). Merely inefficient configurations are reported
/// through `log::warn!` rather than an error.
///
/// [`StepOutcome`]: crate::optimizer::StepOutcome
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or unsupported configuration, rejected at construction
    #[error("configuration error: {reason}")]
    Configuration {
        /// Description of what went wrong
        reason: String,
    },

    /// Collective communication misuse (length/kind mismatch between members)
    #[error("communication error: {reason}")]
    Communication {
        /// Description of what went wrong
        reason: String,
    },

    /// Checkpoint shard payload decode or validation failure
    #[error("checkpoint error: {reason}")]
    Checkpoint {
        /// Description of what went wrong
        reason: String,
    },

    /// Step-protocol misuse (unknown parameter, missing hook, wrong phase)
    #[error("training error: {reason}")]
    Training {
        /// Description of what went wrong
        reason: String,
    },
}

impl Error {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Error::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn comm(reason: impl Into<String>) -> Self {
        Error::Communication {
            reason: reason.into(),
        }
    }
}
