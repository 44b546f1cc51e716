//! Deferred program stand-ins.
//!
//! A [`Probe`] lets a downstream pipeline be constructed before its upstream
//! source exists. It has two faces: `program()` is the composable upstream
//! face handed to a pipeline builder, and `pipe()` is the sink the probe's
//! owner pushes values through once the built pipeline has run. The pipe is
//! not connected until some downstream composition has executed once;
//! pushing earlier yields [`DeliveryError::ProbeDisconnected`].

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{DeliveryError, FlowResult};
use crate::execution::Execution;
use crate::program::{Program, Sink};
use crate::registry::RegistryRef;

/// A program stand-in whose values are pushed in by hand.
pub struct Probe<T> {
    slot: Arc<Mutex<Option<Sink<T>>>>,
}

impl<T: Send + 'static> Probe<T> {
    /// Creates a disconnected probe.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// The upstream face: a program that, when run, connects this probe's
    /// pipe to the sink it was run against.
    #[must_use]
    pub fn program(&self) -> Program<T> {
        let slot = Arc::clone(&self.slot);
        Program::from_op(move |_registry, sink| {
            *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
            Ok(Execution::noop())
        })
    }

    /// The downstream face: a sink forwarding into whatever pipeline was
    /// built on top of `program()`.
    #[must_use]
    pub fn pipe(&self) -> Sink<T> {
        let slot = Arc::clone(&self.slot);
        Arc::new(move |value: T| {
            let sink = slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            match sink {
                Some(sink) => sink(value),
                None => Err(DeliveryError::ProbeDisconnected.into()),
            }
        })
    }
}

impl<T: Send + 'static> Default for Probe<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a branch pipeline through a probe.
///
/// Runs `build(probe.program())` against `sink` and hands back the connected
/// pipe together with the branch's (unstarted) execution.
pub(crate) fn probe_pipe<T: Send + 'static, S: Send + 'static>(
    build: &(dyn Fn(Program<T>) -> Program<S> + Send + Sync),
    registry: &RegistryRef,
    sink: Sink<S>,
) -> FlowResult<(Sink<T>, Execution)> {
    let probe = Probe::new();
    let branch = build(probe.program());
    let execution = branch.run_raw(registry, sink)?;
    Ok((probe.pipe(), execution))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::registry::InMemoryRegistry;
    use crate::terminator::Terminator;

    fn test_registry() -> RegistryRef {
        Arc::new(InMemoryRegistry::new())
    }

    #[test]
    fn test_pipe_before_composition_is_disconnected() {
        let probe: Probe<u32> = Probe::new();
        let err = (probe.pipe())(7).unwrap_err();
        assert!(matches!(
            err,
            crate::FlowError::Delivery(DeliveryError::ProbeDisconnected)
        ));
    }

    #[test]
    fn test_pipe_forwards_after_composition_ran() {
        let registry = test_registry();
        let probe: Probe<u32> = Probe::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let s = Arc::clone(&seen);
        let sink: Sink<u32> = Arc::new(move |v| {
            s.fetch_add(v as usize, Ordering::SeqCst);
            Ok(Terminator::noop())
        });

        let execution = probe.program().run_raw(&registry, sink).unwrap();
        execution.start().unwrap();

        (probe.pipe())(5).unwrap().invoke();
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_probe_pipe_builds_composed_branch() {
        let registry = test_registry();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        let sink: Sink<String> = Arc::new(move |v| {
            s.lock().unwrap().push(v);
            Ok(Terminator::noop())
        });

        let build = |inner: Program<u32>| inner.map(|v| format!("value-{v}"));
        let (pipe, execution) = probe_pipe(&build, &registry, sink).unwrap();
        execution.start().unwrap();

        pipe(3).unwrap().invoke();
        pipe(4).unwrap().invoke();
        assert_eq!(*seen.lock().unwrap(), vec!["value-3", "value-4"]);
    }
}
