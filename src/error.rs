//! Typed failures for every device operation
//!
//! Nothing in the transport, driver or discovery layers panics or hangs on a
//! device fault; every failure is one of these variants and is handed back to
//! the caller for display or retry decisions.

use std::time::Duration;

/// Failure taxonomy shared by all drivers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    /// Refused, unreachable, connect timeout, or connection lost.
    #[error("connectivity error ({address}): {reason}")]
    Connectivity { address: String, reason: String },

    /// Malformed, unparseable or negative response. `raw` keeps the frame text.
    #[error("protocol error: {reason} (raw: {raw:?})")]
    Protocol { reason: String, raw: String },

    /// No matching response before the command deadline.
    #[error("command timed out after {}ms", .after.as_millis())]
    CommandTimeout { after: Duration },

    /// Value outside the hardware-defined range; rejected before any I/O.
    #[error("invalid value: {0}")]
    DomainValidation(String),

    /// The device reports the requested capability switched off.
    #[error("feature disabled on device: {0}")]
    FeatureDisabled(String),
}

impl DeviceError {
    pub fn connectivity(address: impl Into<String>, reason: impl ToString) -> Self {
        DeviceError::Connectivity {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    pub fn protocol(reason: impl Into<String>, raw: impl Into<String>) -> Self {
        DeviceError::Protocol {
            reason: reason.into(),
            raw: raw.into(),
        }
    }

    /// Transient failures that a bounded retry policy may attempt again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeviceError::Connectivity { .. } | DeviceError::CommandTimeout { .. }
        )
    }

    /// Failures that mean the link itself is gone (as opposed to one bad command).
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, DeviceError::Connectivity { .. })
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;
