//! Error types for fan-out and downstream relay

use std::{error::Error as StdError, fmt};

/// Errors raised by the hub, the relay manager and the controller
#[derive(Debug)]
pub enum DispatchError {
    /// A forward attempt to a downstream target failed
    Delivery {
        /// Target identifier
        target: String,
        /// Transport-level failure message
        message: String,
    },

    /// A target exhausted its retries and is disabled until an operator
    /// re-enables it
    ExhaustedRetry {
        /// Target identifier
        target: String,
        /// Consecutive failures at the point of disablement
        failures: u32,
    },

    /// No target with the given identifier is configured
    UnknownTarget {
        /// Target identifier
        target: String,
    },

    /// An underlying engine error
    Core(callrelay_core::Error),
}

/// Result type alias using `DispatchError`
pub type Result<T> = std::result::Result<T, DispatchError>;

impl DispatchError {
    /// Create a new delivery error
    #[must_use]
    pub fn delivery<T: Into<String>, M: Into<String>>(target: T, message: M) -> Self {
        Self::Delivery {
            target: target.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivery { target, message } => {
                write!(f, "Delivery to {target} failed: {message}")
            }
            Self::ExhaustedRetry { target, failures } => {
                write!(f, "Target {target} disabled after {failures} consecutive failures")
            }
            Self::UnknownTarget { target } => write!(f, "Unknown target: {target}"),
            Self::Core(err) => write!(f, "{err}"),
        }
    }
}

impl StdError for DispatchError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Core(err) => Some(err),
            _ => None,
        }
    }
}

impl From<callrelay_core::Error> for DispatchError {
    fn from(err: callrelay_core::Error) -> Self {
        Self::Core(err)
    }
}
