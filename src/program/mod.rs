//! Programs: declarative pipelines over dynamic capability collections.
//!
//! A [`Program<T>`] is an immutable description of how to transform, filter,
//! join, route, or recover over a collection whose members appear and
//! disappear asynchronously. Programs are inert until [`run`](Program::run);
//! running yields an [`Execution`] that owns every resource the live
//! pipeline allocates and releases all of them at close.
//!
//! Combinators compose by wrapping: each one captures the inner program and
//! runs it against a transformed sink. The sink contract is the foundation:
//! a sink accepts a value and answers with the [`Terminator`] that undoes
//! the acceptance.

mod apply_to;
mod combinators;
mod fanout;

pub use apply_to::{transformer, Transform};
pub use fanout::{branch, Branch};

use std::sync::{Arc, Mutex, PoisonError};

use crate::capability::Capability;
use crate::error::FlowResult;
use crate::execution::Execution;
use crate::query::Query;
use crate::registry::{PublicationId, RegistryObserver, RegistryRef};
use crate::terminator::{Terminator, TerminatorLedger};

/// A sink accepts a value now and returns the action that retracts it.
pub type Sink<T> = Arc<dyn Fn(T) -> FlowResult<Terminator> + Send + Sync>;

type ProgramOp<T> = dyn Fn(&RegistryRef, Sink<T>) -> FlowResult<Execution> + Send + Sync;

/// An immutable, reusable pipeline description.
pub struct Program<T> {
    op: Arc<ProgramOp<T>>,
}

impl<T> Clone for Program<T> {
    fn clone(&self) -> Self {
        Self {
            op: Arc::clone(&self.op),
        }
    }
}

impl<T> std::fmt::Debug for Program<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Program<T> {
    /// Wraps a run closure into a program.
    pub(crate) fn from_op(
        op: impl Fn(&RegistryRef, Sink<T>) -> FlowResult<Execution> + Send + Sync + 'static,
    ) -> Self {
        Self { op: Arc::new(op) }
    }

    /// Runs the program against an explicit sink, without starting it.
    ///
    /// This is the raw form combinators compose over; most callers want
    /// [`run`](Self::run) / [`run_with`](Self::run_with), which start the
    /// chain and pair it with a terminal sink. With `run_raw` the caller
    /// owns the sink contract: every accepted value's terminator must
    /// eventually be invoked exactly once.
    pub fn run_raw(&self, registry: &RegistryRef, sink: Sink<T>) -> FlowResult<Execution> {
        (self.op)(registry, sink)
    }

    /// Runs and starts the program, discarding produced values.
    ///
    /// The returned execution is live; close it to retract everything the
    /// program published.
    pub fn run(&self, registry: &RegistryRef) -> FlowResult<Execution> {
        self.run_with(registry, |_| {})
    }

    /// Runs and starts the program, handing every produced value to
    /// `on_value`.
    ///
    /// The terminal sink never fails and needs no retraction; all pairing of
    /// effects with retractions happens inside the chain.
    pub fn run_with(
        &self,
        registry: &RegistryRef,
        on_value: impl Fn(T) + Send + Sync + 'static,
    ) -> FlowResult<Execution> {
        let terminal: Sink<T> = Arc::new(move |value| {
            on_value(value);
            Ok(Terminator::noop())
        });

        let execution = self.run_raw(registry, terminal)?;
        execution.start()?;
        Ok(execution)
    }

    /// A program that emits nothing and owns nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_op(|_registry, _sink| Ok(Execution::noop()))
    }
}

impl<T: Clone + Send + Sync + 'static> Program<T> {
    /// A program that emits exactly one value at start and retracts it at
    /// close.
    #[must_use]
    pub fn just(value: T) -> Self {
        Self::from_op(move |_registry, sink| {
            let value = value.clone();
            let pending: Arc<Mutex<Option<Terminator>>> = Arc::new(Mutex::new(None));

            let start_pending = Arc::clone(&pending);
            let start = move || {
                let terminator = sink(value)?;
                *start_pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(terminator);
                Ok(())
            };
            let close = move || {
                if let Some(terminator) =
                    pending.lock().unwrap_or_else(PoisonError::into_inner).take()
                {
                    terminator.invoke();
                }
            };

            Ok(Execution::new(start, close))
        })
    }
}

/// A program producing every capability matching `query`, live.
///
/// Members enter the collection when the registry announces them and leave
/// when the registry retracts them; closing the execution retracts all
/// members still present, most recent first.
#[must_use]
pub fn capabilities(query: Query) -> Program<Capability> {
    Program::from_op(move |registry, sink| {
        let registry = Arc::clone(registry);
        let query = query.clone();
        let ledger: Arc<TerminatorLedger<crate::capability::CapabilityId>> =
            Arc::new(TerminatorLedger::new());
        let subscription: Arc<Mutex<Option<crate::registry::SubscriptionId>>> =
            Arc::new(Mutex::new(None));

        let observer = Arc::new(SourceObserver {
            sink,
            ledger: Arc::clone(&ledger),
        });

        let start_registry = Arc::clone(&registry);
        let start_subscription = Arc::clone(&subscription);
        let start = move || {
            let id = start_registry.subscribe(&query, observer)?;
            *start_subscription
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(id);
            Ok(())
        };

        let close = move || {
            // Unsubscribe before draining so no new acceptances race the
            // retraction sweep; anything that slips through bounces off the
            // sealed ledger and is retracted by the notifier itself.
            if let Some(id) = subscription
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                let _ = registry.unsubscribe(id);
            }
            for terminator in ledger.seal_and_drain() {
                terminator.invoke();
            }
        };

        Ok(Execution::new(start, close))
    })
}

struct SourceObserver {
    sink: Sink<Capability>,
    ledger: Arc<TerminatorLedger<crate::capability::CapabilityId>>,
}

impl RegistryObserver for SourceObserver {
    fn added(&self, capability: &Capability) -> FlowResult<()> {
        let terminator = (self.sink)(capability.clone())?;
        if let Some(bounced) = self.ledger.insert(capability.id, terminator) {
            // The owning execution closed while we were delivering.
            bounced.invoke();
        }
        Ok(())
    }

    fn removed(&self, capability: &Capability) {
        if let Some(terminator) = self.ledger.take(&capability.id) {
            terminator.invoke();
        }
    }
}

/// A program that issues `capability` into the registry for the lifetime of
/// its execution and emits the resulting [`PublicationId`] downstream.
#[must_use]
pub fn provide(capability: Capability) -> Program<PublicationId> {
    Program::from_op(move |registry, sink| {
        let registry = Arc::clone(registry);
        let capability = capability.clone();
        let pending: Arc<Mutex<Option<(PublicationId, Terminator)>>> = Arc::new(Mutex::new(None));

        let start_registry = Arc::clone(&registry);
        let start_pending = Arc::clone(&pending);
        let start = move || {
            let publication = start_registry.publish(capability)?;
            match sink(publication) {
                Ok(terminator) => {
                    *start_pending.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some((publication, terminator));
                    Ok(())
                }
                Err(err) => {
                    // Downstream refused the handle; take the capability
                    // back out so nothing dangles.
                    let _ = start_registry.unpublish(publication);
                    Err(err)
                }
            }
        };

        let close = move || {
            if let Some((publication, terminator)) =
                pending.lock().unwrap_or_else(PoisonError::into_inner).take()
            {
                terminator.invoke();
                let _ = registry.unpublish(publication);
            }
        };

        Ok(Execution::new(start, close))
    })
}
