//! Running program instances.
//!
//! An [`Execution`] is what `run` hands back: the owner of every resource a
//! program allocates when it goes live. Its lifecycle is
//! `Created → Started → Closed`; `Closed` is terminal. Close is idempotent
//! and safe to call concurrently with an in-flight `start()`; the closing
//! caller blocks until the start settles and the teardown has run.

use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crate::error::FlowResult;

type StartFn = Box<dyn FnOnce() -> FlowResult<()> + Send>;
type CloseFn = Box<dyn FnOnce() + Send>;

enum State {
    Created { start: StartFn, close: CloseFn },
    /// `start()` is running on some thread.
    Starting,
    /// `close()` arrived mid-start; the starting thread performs the close.
    CloseRequested,
    Started { close: CloseFn },
    /// Teardown is running on some thread; concurrent closers wait on it.
    Closing,
    Closed,
}

/// A running (or runnable) instance of a program.
///
/// Clones share the same lifecycle; closing one closes them all.
#[derive(Clone)]
pub struct Execution {
    shared: Arc<(Mutex<State>, Condvar)>,
}

impl Execution {
    /// Builds an execution from its start and close actions.
    ///
    /// The start action must either complete fully or release everything it
    /// already allocated before returning an error; the close action tears
    /// down whatever start built, in reverse order.
    pub(crate) fn new(
        start: impl FnOnce() -> FlowResult<()> + Send + 'static,
        close: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            shared: Arc::new((
                Mutex::new(State::Created {
                    start: Box::new(start),
                    close: Box::new(close),
                }),
                Condvar::new(),
            )),
        }
    }

    /// An execution that does nothing on start and nothing on close.
    pub(crate) fn noop() -> Self {
        Self::new(|| Ok(()), || {})
    }

    /// Chains executions: started first-to-last, closed last-to-first.
    ///
    /// A start failure closes the members already started, in reverse, before
    /// surfacing.
    pub(crate) fn sequence(members: Vec<Execution>) -> Self {
        let starters = members.clone();
        let closers = members;
        Self::new(
            move || {
                for (idx, member) in starters.iter().enumerate() {
                    if let Err(err) = member.start() {
                        for started in starters[..idx].iter().rev() {
                            started.close();
                        }
                        return Err(err);
                    }
                }
                Ok(())
            },
            move || {
                for member in closers.iter().rev() {
                    member.close();
                }
            },
        )
    }

    /// Activates the chain.
    ///
    /// Nested starts complete before this returns, so every value already
    /// matching upstream has been delivered at least once by then. Calling
    /// `start` on an already started or closed execution is a no-op.
    pub fn start(&self) -> FlowResult<()> {
        let (lock, condvar) = &*self.shared;

        let (start, close) = {
            let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *state, State::Starting) {
                State::Created { start, close } => (start, close),
                other => {
                    *state = other;
                    return Ok(());
                }
            }
        };

        let outcome = start();

        let close_now = {
            let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
            match (&outcome, std::mem::replace(&mut *state, State::Closing)) {
                (Ok(()), State::Starting) => {
                    *state = State::Started { close };
                    None
                }
                // close() raced the start, or the start failed: tear down
                // whatever the start action left standing.
                _ => Some(close),
            }
        };

        if let Some(close) = close_now {
            close();
            let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
            *state = State::Closed;
            condvar.notify_all();
            tracing::trace!("execution closed during start");
        }

        outcome
    }

    /// Tears the chain down, retracting every value accepted so far in an
    /// order consistent with reverse-of-acceptance.
    ///
    /// Idempotent: later calls (and concurrent calls) perform no terminator
    /// invocations. When this returns, no further terminators for this
    /// execution's values fire spontaneously.
    pub fn close(&self) {
        let (lock, condvar) = &*self.shared;

        let close = {
            let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *state, State::Closing) {
                State::Created { close, .. } | State::Started { close } => Some(close),
                State::Starting => {
                    // The starting thread owns the close action; park until
                    // it has finished the teardown.
                    *state = State::CloseRequested;
                    while !matches!(*state, State::Closed) {
                        state = condvar
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    None
                }
                // Some other thread is already tearing down; wait so this
                // call's postcondition (everything retracted) holds too.
                waiting @ (State::CloseRequested | State::Closing) => {
                    *state = waiting;
                    while !matches!(*state, State::Closed) {
                        state = condvar
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    None
                }
                State::Closed => {
                    *state = State::Closed;
                    None
                }
            }
        };

        if let Some(close) = close {
            close();
            let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
            *state = State::Closed;
            condvar.notify_all();
            tracing::trace!("execution closed");
        }
    }

    /// Returns true once the execution reached its terminal state.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(
            *self.shared.0.lock().unwrap_or_else(PoisonError::into_inner),
            State::Closed
        )
    }
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.0.lock().unwrap_or_else(PoisonError::into_inner);
        let name = match *state {
            State::Created { .. } => "created",
            State::Starting => "starting",
            State::CloseRequested => "close-requested",
            State::Started { .. } => "started",
            State::Closing => "closing",
            State::Closed => "closed",
        };
        f.debug_struct("Execution").field("state", &name).finish()
    }
}
