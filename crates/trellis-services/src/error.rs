//! # Error Types
//!
//! Errors raised by service handles and the registry. Handle errors are
//! `Clone` because every caller joined on a single in-flight attempt
//! observes the same outcome.

use std::time::Duration;

use thiserror::Error;
use trellis_core::Capability;

use crate::handle::ServiceState;

/// Boxed error returned by connector implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error from a service handle operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The connector reported a failure.
    #[error("{capability} connection failed: {message}")]
    ConnectFailed {
        capability: Capability,
        message: String,
    },

    /// The connect attempt did not finish within the connect timeout.
    #[error("{capability} connection timed out after {timeout:?}")]
    Timeout {
        capability: Capability,
        timeout: Duration,
    },

    /// A health ping against a Ready client failed.
    #[error("{capability} health check failed: {message}")]
    HealthCheckFailed {
        capability: Capability,
        message: String,
    },

    /// Client access while the first connection is still in flight, with
    /// strict client access enabled.
    #[error("{capability} is still connecting")]
    Connecting { capability: Capability },

    /// The handle has been closed by shutdown.
    #[error("{capability} has been closed")]
    Closed { capability: Capability },

    /// The capability is not enabled in this process.
    #[error("{capability} is not enabled")]
    NotEnabled { capability: Capability },

    /// The capability is enabled but currently Degraded.
    #[error("{capability} is temporarily unavailable")]
    Unavailable { capability: Capability },

    /// The lifecycle operation is not allowed from the current state.
    #[error("{capability} cannot {operation} while {state}")]
    InvalidTransition {
        capability: Capability,
        operation: &'static str,
        state: ServiceState,
    },

    /// A client operation (query, cache read, object upload) failed.
    #[error("{capability} operation failed: {message}")]
    Operation {
        capability: Capability,
        message: String,
    },
}

impl ServiceError {
    pub fn capability(&self) -> Capability {
        match self {
            Self::ConnectFailed { capability, .. }
            | Self::Timeout { capability, .. }
            | Self::HealthCheckFailed { capability, .. }
            | Self::Connecting { capability }
            | Self::Closed { capability }
            | Self::NotEnabled { capability }
            | Self::Unavailable { capability }
            | Self::InvalidTransition { capability, .. }
            | Self::Operation { capability, .. } => *capability,
        }
    }

    pub(crate) fn operation(capability: Capability, err: impl std::fmt::Display) -> Self {
        Self::Operation {
            capability,
            message: err.to_string(),
        }
    }
}

/// Error while building or starting the service registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Two handles were registered for the same capability.
    #[error("{0} is registered more than once")]
    DuplicateCapability(Capability),

    /// A capability with the fatal startup policy failed to connect.
    #[error("startup aborted: {0}")]
    Fatal(#[source] ServiceError),

    /// A connector could not be built from its settings.
    #[error("{capability} is misconfigured: {message}")]
    Misconfigured {
        capability: Capability,
        message: String,
    },
}
