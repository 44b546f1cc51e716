//! Retraction actions paired with accepted values.
//!
//! Every value a sink accepts is answered with a [`Terminator`]: the action
//! that undoes the acceptance. Invoking a terminator consumes it, so
//! "exactly once" is enforced by ownership rather than by runtime flags.
//! Components that accept many values over time keep their terminators in a
//! [`TerminatorLedger`] and drain it in reverse order of acceptance at close.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

/// A nullary retraction action, invoked exactly once per accepted value.
pub struct Terminator(Option<Box<dyn FnOnce() + Send>>);

impl Terminator {
    /// Wraps a retraction action.
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(action)))
    }

    /// A terminator that does nothing, used for values that produced no
    /// downstream effect (e.g. filtered out).
    #[must_use]
    pub fn noop() -> Self {
        Self(None)
    }

    /// Composes a batch into one terminator that invokes the members in
    /// reverse order, innermost effect first.
    #[must_use]
    pub fn all(terminators: Vec<Terminator>) -> Self {
        if terminators.is_empty() {
            return Self::noop();
        }
        Self::new(move || {
            for terminator in terminators.into_iter().rev() {
                terminator.invoke();
            }
        })
    }

    /// Runs the retraction. Consuming `self` makes a second invocation
    /// unrepresentable.
    pub fn invoke(mut self) {
        if let Some(action) = self.0.take() {
            action();
        }
    }
}

impl std::fmt::Debug for Terminator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Terminator")
            .field(&self.0.as_ref().map_or("noop", |_| "pending"))
            .finish()
    }
}

/// Keyed store of pending terminators, drained in reverse acceptance order.
///
/// Sources use this to pair a registry's remove notification with the
/// terminator formed when the same capability was added. `take` and
/// `drain_reverse` race safely: whichever runs first gets the terminator,
/// the other sees nothing.
pub struct TerminatorLedger<K> {
    state: Mutex<LedgerState<K>>,
}

struct LedgerState<K> {
    next_seq: u64,
    sealed: bool,
    by_key: HashMap<K, u64>,
    entries: Vec<(u64, K, Terminator)>,
}

impl<K: Eq + Hash + Clone> TerminatorLedger<K> {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                next_seq: 0,
                sealed: false,
                by_key: HashMap::new(),
                entries: Vec::new(),
            }),
        }
    }

    /// Records the terminator for a newly accepted key.
    ///
    /// Returns the terminator back when the ledger has already been sealed:
    /// the caller must retract immediately, since nobody will drain it later.
    /// A key accepted twice keeps both terminators; `take` returns the most
    /// recent one.
    #[must_use]
    pub fn insert(&self, key: K, terminator: Terminator) -> Option<Terminator> {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.sealed {
            return Some(terminator);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.by_key.insert(key.clone(), seq);
        state.entries.push((seq, key, terminator));
        None
    }

    /// Removes and returns the terminator recorded for `key`, if any.
    pub fn take(&self, key: &K) -> Option<Terminator> {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let seq = state.by_key.remove(key)?;
        let idx = state
            .entries
            .iter()
            .rposition(|(s, _, _)| *s == seq)?;
        Some(state.entries.swap_remove(idx).2)
    }

    /// Seals the ledger and removes every pending terminator, most recently
    /// accepted first. Subsequent `insert` calls bounce their terminator
    /// back to the caller.
    pub fn seal_and_drain(&self) -> Vec<Terminator> {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.sealed = true;
        state.by_key.clear();
        let mut entries = std::mem::take(&mut state.entries);
        entries.sort_by_key(|(seq, _, _)| *seq);
        entries.into_iter().rev().map(|(_, _, t)| t).collect()
    }

    /// Number of pending terminators.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entries
            .len()
    }

    /// Returns true if no terminators are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for TerminatorLedger<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> std::fmt::Debug for TerminatorLedger<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entries
            .len();
        f.debug_struct("TerminatorLedger").field("pending", &len).finish()
    }
}
