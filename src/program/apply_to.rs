//! Dynamic cartesian product of values and functions.
//!
//! `apply_to` pairs two independently time-varying collections: every live
//! value against every live function. Both sides keep their members in an
//! [`ActiveSet`]; one pairing lock makes each arrival's insert-and-snapshot
//! atomic, so a value and a function arriving concurrently form their
//! pairing exactly once, on whichever side wins the lock second.
//!
//! Every pairing's terminator is recorded in a shared table indexed by both
//! sides. Whichever side departs first retracts the pairing; the table's
//! remove is the linearization point, so a pairing can never be retracted
//! twice.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::active_set::ActiveSet;
use crate::error::FlowResult;
use crate::execution::Execution;
use crate::program::{Program, Sink};
use crate::terminator::Terminator;

/// A dynamically published function applied to live values.
pub type Transform<T, S> = Arc<dyn Fn(&T) -> S + Send + Sync>;

/// Wraps a closure into a publishable [`Transform`].
pub fn transformer<T, S>(f: impl Fn(&T) -> S + Send + Sync + 'static) -> Transform<T, S> {
    Arc::new(f)
}

#[derive(Default)]
struct PairTable {
    next_key: u64,
    pairs: HashMap<u64, Terminator>,
    by_value: HashMap<u64, Vec<u64>>,
    by_fun: HashMap<u64, Vec<u64>>,
}

impl PairTable {
    fn fresh_key(&mut self) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    fn record(&mut self, value_key: u64, fun_key: u64, terminator: Terminator) {
        let pair_id = self.fresh_key();
        self.pairs.insert(pair_id, terminator);
        self.by_value.entry(value_key).or_default().push(pair_id);
        self.by_fun.entry(fun_key).or_default().push(pair_id);
    }

    /// Takes the still-live terminators for the given pair ids, in reverse
    /// formation order. Ids already retracted by the other side are skipped.
    fn take_pairs(&mut self, pair_ids: &[u64]) -> Vec<Terminator> {
        pair_ids
            .iter()
            .rev()
            .filter_map(|id| self.pairs.remove(id))
            .collect()
    }

    fn take_for_value(&mut self, value_key: u64) -> Vec<Terminator> {
        let ids = self.by_value.remove(&value_key).unwrap_or_default();
        self.take_pairs(&ids)
    }

    fn take_for_fun(&mut self, fun_key: u64) -> Vec<Terminator> {
        let ids = self.by_fun.remove(&fun_key).unwrap_or_default();
        self.take_pairs(&ids)
    }
}

type Shared<T, S> = Arc<PairState<T, S>>;

struct PairState<T, S> {
    values: ActiveSet<(u64, Arc<T>)>,
    funs: ActiveSet<(u64, Transform<T, S>)>,
    table: Mutex<PairTable>,
}

impl<T, S> PairState<T, S> {
    fn new() -> Shared<T, S> {
        Arc::new(Self {
            values: ActiveSet::new(),
            funs: ActiveSet::new(),
            table: Mutex::new(PairTable::default()),
        })
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, PairTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send + Sync + 'static> Program<T> {
    /// Applies every live function from `functions` to every live value of
    /// `self`, publishing each result downstream.
    ///
    /// Exactly one pairing is published per live `(value, function)`
    /// combination, and exactly one terminator is formed for it. A value's
    /// departure retracts every pairing involving that value; symmetrically
    /// for a function. Close retracts whatever is left.
    #[must_use]
    pub fn apply_to<S: Send + 'static>(self, functions: Program<Transform<T, S>>) -> Program<S> {
        Program::from_op(move |registry, sink: Sink<S>| {
            let state: Shared<T, S> = PairState::new();

            let value_sink: Sink<T> = {
                let state = Arc::clone(&state);
                let sink = Arc::clone(&sink);
                Arc::new(move |value: T| {
                    let value = Arc::new(value);

                    // Insert-and-snapshot is atomic under the table lock: a
                    // concurrently arriving function either sees this value
                    // in its snapshot or is in ours, never both or neither.
                    let (value_key, handle, snapshot) = {
                        let mut table = state.lock_table();
                        let value_key = table.fresh_key();
                        let handle = state.values.add_last((value_key, Arc::clone(&value)));
                        (value_key, handle, state.funs.snapshot())
                    };

                    for (fun_key, fun) in snapshot {
                        publish_pairing(&state, &sink, value_key, fun_key, &fun, &value)
                            .map_err(|err| {
                                handle.remove();
                                retract_value(&state, value_key);
                                err
                            })?;
                    }

                    let state = Arc::clone(&state);
                    Ok(Terminator::new(move || {
                        handle.remove();
                        retract_value(&state, value_key);
                    }))
                })
            };

            let fun_sink: Sink<Transform<T, S>> = {
                let state = Arc::clone(&state);
                let sink = Arc::clone(&sink);
                Arc::new(move |fun: Transform<T, S>| {
                    let (fun_key, handle, snapshot) = {
                        let mut table = state.lock_table();
                        let fun_key = table.fresh_key();
                        let handle = state.funs.add_last((fun_key, Arc::clone(&fun)));
                        (fun_key, handle, state.values.snapshot())
                    };

                    for (value_key, value) in snapshot {
                        publish_pairing(&state, &sink, value_key, fun_key, &fun, &value)
                            .map_err(|err| {
                                handle.remove();
                                retract_fun(&state, fun_key);
                                err
                            })?;
                    }

                    let state = Arc::clone(&state);
                    Ok(Terminator::new(move || {
                        handle.remove();
                        retract_fun(&state, fun_key);
                    }))
                })
            };

            let value_execution = self.run_raw(registry, value_sink)?;
            let fun_execution = functions.run_raw(registry, fun_sink)?;
            Ok(Execution::sequence(vec![value_execution, fun_execution]))
        })
    }
}

/// Publishes one `(value, function)` pairing downstream and records its
/// terminator under both sides. The publish itself runs outside the table
/// lock so downstream stages may re-enter the registry.
fn publish_pairing<T, S>(
    state: &Shared<T, S>,
    sink: &Sink<S>,
    value_key: u64,
    fun_key: u64,
    fun: &Transform<T, S>,
    value: &Arc<T>,
) -> FlowResult<()> {
    let terminator = sink(fun(value))?;
    state.lock_table().record(value_key, fun_key, terminator);
    Ok(())
}

fn retract_value<T, S>(state: &Shared<T, S>, value_key: u64) {
    let terminators = state.lock_table().take_for_value(value_key);
    for terminator in terminators {
        terminator.invoke();
    }
}

fn retract_fun<T, S>(state: &Shared<T, S>, fun_key: u64) {
    let terminators = state.lock_table().take_for_fun(fun_key);
    for terminator in terminators {
        terminator.invoke();
    }
}
