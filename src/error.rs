//! Error types for capflow.
//!
//! All errors are strongly typed using thiserror. This enables
//! pattern matching on specific error conditions and keeps the
//! delivery path free of unwinding: a sink that cannot accept a
//! value returns an `Err` instead of panicking.

use thiserror::Error;

use crate::registry::{PublicationId, SubscriptionId};

/// Errors raised while constructing a program or a query.
///
/// Construction errors fail fast, synchronously, at build time.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Query needs at least a filter fragment or a capability type")]
    EmptyQuery,

    #[error("Malformed filter expression: {reason}")]
    MalformedFilter {
        reason: String,
    },
}

/// Errors raised while delivering a value through a running pipeline.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// A probe pipe was invoked before any downstream composition ran.
    #[error("Probe pipe is not connected")]
    ProbeDisconnected,

    /// A sink or user callback refused the value.
    #[error("Value rejected: {reason}")]
    Rejected {
        reason: String,
    },

    /// A downstream stage failed while processing the value.
    #[error("Downstream failure: {message}")]
    Downstream {
        message: String,
    },
}

/// Errors surfaced by a capability registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Registry is closed")]
    Closed,

    #[error("Unknown subscription: {id}")]
    UnknownSubscription {
        id: SubscriptionId,
    },

    #[error("Unknown publication: {id}")]
    UnknownPublication {
        id: PublicationId,
    },
}

/// Top-level error type for capflow.
///
/// This enum encompasses all possible errors that can occur when
/// building or running a program.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl FlowError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a delivery rejection, the usual way a user sink fails.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Delivery(DeliveryError::Rejected {
            reason: reason.into(),
        })
    }

    /// Returns true if this is a construction error.
    #[must_use]
    pub const fn is_build(&self) -> bool {
        matches!(self, Self::Build(_))
    }

    /// Returns true if this is a delivery error.
    #[must_use]
    pub const fn is_delivery(&self) -> bool {
        matches!(self, Self::Delivery(_))
    }

    /// Returns true if this is a registry error.
    #[must_use]
    pub const fn is_registry(&self) -> bool {
        matches!(self, Self::Registry(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }
}

/// Result type alias for capflow operations.
pub type FlowResult<T> = Result<T, FlowError>;
