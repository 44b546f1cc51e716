//! In-memory registry backend.
//!
//! Thread-safe reference implementation of [`CapabilityRegistry`] for
//! embedded usage and tests. Notifications run synchronously on the calling
//! thread, outside the registry lock, so observers may publish back into the
//! registry from inside a notification.
//!
//! Observer failures are fail-closed: logged, counted in
//! [`delivery_failures`](InMemoryRegistry::delivery_failures), and never
//! allowed to disturb delivery to other observers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::capability::{Capability, CapabilityId};
use crate::error::{FlowResult, RegistryError};
use crate::query::{Filter, Query};
use crate::registry::traits::{
    CapabilityRegistry, PublicationId, RegistryObserver, SubscriptionId,
};

#[derive(Debug, Clone)]
struct PublicationRecord {
    capability: Capability,
    published_at: DateTime<Utc>,
}

struct SubscriptionRecord {
    filter: Filter,
    observer: Arc<dyn RegistryObserver>,
}

#[derive(Default)]
struct RegistryState {
    closed: bool,
    publications: HashMap<PublicationId, PublicationRecord>,
    publication_order: Vec<PublicationId>,
    subscriptions: HashMap<SubscriptionId, SubscriptionRecord>,
}

/// Thread-safe in-memory capability registry.
pub struct InMemoryRegistry {
    state: RwLock<RegistryState>,
    delivery_failures: AtomicU64,
}

impl InMemoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            delivery_failures: AtomicU64::new(0),
        }
    }

    /// Number of observer notifications that returned an error and were
    /// dropped fail-closed.
    #[must_use]
    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    /// Number of live publications.
    #[must_use]
    pub fn publication_count(&self) -> usize {
        self.read().publications.len()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.read().subscriptions.len()
    }

    /// When the given publication was issued, if it is still live.
    #[must_use]
    pub fn published_at(&self, publication: PublicationId) -> Option<DateTime<Utc>> {
        self.read()
            .publications
            .get(&publication)
            .map(|record| record.published_at)
    }

    /// Looks up the capability id behind a live publication.
    #[must_use]
    pub fn capability_id(&self, publication: PublicationId) -> Option<CapabilityId> {
        self.read()
            .publications
            .get(&publication)
            .map(|record| record.capability.id)
    }

    /// Rejects further subscriptions and publications and drops all
    /// subscriptions. Existing publications stay readable.
    pub fn close(&self) {
        let mut state = self.write();
        state.closed = true;
        state.subscriptions.clear();
        tracing::debug!("registry closed");
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_added(&self, observer: &Arc<dyn RegistryObserver>, capability: &Capability) {
        if let Err(err) = observer.added(capability) {
            self.delivery_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(capability = %capability.id, error = %err, "observer rejected capability");
        }
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("InMemoryRegistry")
            .field("publications", &state.publications.len())
            .field("subscriptions", &state.subscriptions.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl CapabilityRegistry for InMemoryRegistry {
    fn subscribe(
        &self,
        query: &Query,
        observer: Arc<dyn RegistryObserver>,
    ) -> FlowResult<SubscriptionId> {
        let filter = query.filter()?;

        // Registration and the initial-match snapshot are atomic: a publish
        // linearized before us is in the snapshot, one after us sees the
        // subscription. Either way each capability is delivered exactly once.
        let (id, initial) = {
            let mut state = self.write();
            if state.closed {
                return Err(RegistryError::Closed.into());
            }

            let id = SubscriptionId::new();
            let initial: Vec<Capability> = state
                .publication_order
                .iter()
                .filter_map(|pub_id| state.publications.get(pub_id))
                .filter(|record| filter.matches(&record.capability))
                .map(|record| record.capability.clone())
                .collect();

            state.subscriptions.insert(
                id,
                SubscriptionRecord {
                    filter,
                    observer: Arc::clone(&observer),
                },
            );
            (id, initial)
        };

        tracing::debug!(subscription = %id, query = %query, matches = initial.len(), "subscribed");

        for capability in &initial {
            self.notify_added(&observer, capability);
        }

        Ok(id)
    }

    fn unsubscribe(&self, subscription: SubscriptionId) -> FlowResult<()> {
        let removed = self.write().subscriptions.remove(&subscription);
        if removed.is_none() {
            return Err(RegistryError::UnknownSubscription { id: subscription }.into());
        }
        tracing::debug!(subscription = %subscription, "unsubscribed");
        Ok(())
    }

    fn publish(&self, capability: Capability) -> FlowResult<PublicationId> {
        let (id, targets) = {
            let mut state = self.write();
            if state.closed {
                return Err(RegistryError::Closed.into());
            }

            let id = PublicationId::new();
            let targets: Vec<Arc<dyn RegistryObserver>> = state
                .subscriptions
                .values()
                .filter(|sub| sub.filter.matches(&capability))
                .map(|sub| Arc::clone(&sub.observer))
                .collect();

            state.publications.insert(
                id,
                PublicationRecord {
                    capability: capability.clone(),
                    published_at: Utc::now(),
                },
            );
            state.publication_order.push(id);
            (id, targets)
        };

        tracing::debug!(publication = %id, capability = %capability.id, observers = targets.len(), "published");

        for observer in &targets {
            self.notify_added(observer, &capability);
        }

        Ok(id)
    }

    fn unpublish(&self, publication: PublicationId) -> FlowResult<()> {
        let (record, targets) = {
            let mut state = self.write();
            let Some(record) = state.publications.remove(&publication) else {
                return Err(RegistryError::UnknownPublication { id: publication }.into());
            };
            state.publication_order.retain(|id| *id != publication);

            let targets: Vec<Arc<dyn RegistryObserver>> = state
                .subscriptions
                .values()
                .filter(|sub| sub.filter.matches(&record.capability))
                .map(|sub| Arc::clone(&sub.observer))
                .collect();
            (record, targets)
        };

        tracing::debug!(publication = %publication, observers = targets.len(), "unpublished");

        for observer in &targets {
            observer.removed(&record.capability);
        }

        Ok(())
    }
}
