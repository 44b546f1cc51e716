//! The registry contract this engine consumes.
//!
//! Implementations must deliver notifications synchronously on the calling
//! thread and may do so from several threads at once; the engine's
//! combinators are written for exactly that model. `subscribe` must deliver
//! every currently-matching publication to the observer before it returns;
//! that guarantee is what lets a started execution rely on initial delivery.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capability::Capability;
use crate::error::FlowResult;
use crate::query::Query;

/// Identifies one registered interest in a filtered set of capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(uuid::Uuid);

impl SubscriptionId {
    /// Creates a new random subscription ID.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one capability instance issued into a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicationId(uuid::Uuid);

impl PublicationId {
    /// Creates a new random publication ID.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for PublicationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PublicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receives add/remove notifications for a subscription.
pub trait RegistryObserver: Send + Sync {
    /// A matching capability appeared.
    ///
    /// An `Err` tells the registry the observer could not absorb the value;
    /// the registry decides the policy (the in-memory backend logs and
    /// counts, it never unwinds into other observers).
    fn added(&self, capability: &Capability) -> FlowResult<()>;

    /// A previously announced capability disappeared.
    fn removed(&self, capability: &Capability);
}

/// External source of add/remove notifications and target for publications.
pub trait CapabilityRegistry: Send + Sync {
    /// Registers interest in capabilities matching `query`.
    ///
    /// Every publication matching the query at subscription time is
    /// delivered through `observer.added` before this returns.
    fn subscribe(
        &self,
        query: &Query,
        observer: Arc<dyn RegistryObserver>,
    ) -> FlowResult<SubscriptionId>;

    /// Drops a subscription. Notifications already in flight on other
    /// threads may still arrive after this returns.
    fn unsubscribe(&self, subscription: SubscriptionId) -> FlowResult<()>;

    /// Issues a capability instance, notifying matching subscribers.
    fn publish(&self, capability: Capability) -> FlowResult<PublicationId>;

    /// Retracts a publication, notifying matching subscribers.
    fn unpublish(&self, publication: PublicationId) -> FlowResult<()>;
}

/// Shared handle to a registry, the context every program runs against.
pub type RegistryRef = Arc<dyn CapabilityRegistry>;
