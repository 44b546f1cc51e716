//! # capflow - reactive pipelines over dynamic capability registries
//!
//! capflow builds, runs, and tears down declarative pipelines over
//! collections whose members appear and disappear asynchronously: the
//! capability instances of an external registry. A pipeline is a
//! [`Program`]; running one yields an [`Execution`] that pairs every
//! downstream effect with exactly one eventual retraction, no matter how
//! the inputs churn.
//!
//! ## Core Concepts
//!
//! - **Program**: an immutable description of a dynamic-collection
//!   computation, inert until run
//! - **Sink / Terminator**: a sink accepts a value and answers with the
//!   action that retracts it
//! - **Execution**: a running instance; owns its subscriptions and
//!   publications, lifecycle `Created → Started → Closed`
//! - **Capability / Query**: what registries hold and how programs select
//!   from them
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use capflow::{capabilities, InMemoryRegistry, Query, RegistryRef};
//!
//! let registry: RegistryRef = Arc::new(InMemoryRegistry::new());
//!
//! // Mirror every Sensor capability's unit property, live.
//! let execution = capabilities(Query::of_type("Sensor")?)
//!     .filter(|cap| cap.property("unit").is_some())
//!     .map(|cap| cap.type_name)
//!     .run_with(&registry, |name| println!("sensor online: {name}"))?;
//!
//! // ... later: retract everything the pipeline published.
//! execution.close();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Foundations
pub mod active_set;
pub mod capability;
pub mod error;
pub mod execution;
pub mod query;
pub mod terminator;

// Pipelines
pub mod probe;
pub mod program;
pub mod registry;

// Re-export primary types at crate root for convenience
pub use active_set::{ActiveSet, EntryHandle};
pub use capability::{Capability, CapabilityId, PropValue};
pub use error::{BuildError, DeliveryError, FlowError, FlowResult, RegistryError};
pub use execution::Execution;
pub use probe::Probe;
pub use program::{
    branch, capabilities, provide, transformer, Branch, Program, Sink, Transform,
};
pub use query::{Filter, Query};
pub use registry::{
    CapabilityRegistry, InMemoryRegistry, PublicationId, RegistryObserver, RegistryRef,
    SubscriptionId,
};
pub use terminator::{Terminator, TerminatorLedger};
