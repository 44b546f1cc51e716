//! Routing combinators: choose, distribute, and per-key splitting.
//!
//! All three build their downstream pipes once per run through a probe, then
//! route each accepted value. The branch pipelines belong to the outer
//! execution: started before the inner program goes live, closed after it
//! stops.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use crate::execution::Execution;
use crate::probe::{probe_pipe, Probe};
use crate::program::{Program, Sink};
use crate::terminator::Terminator;

/// A pipeline builder used as one arm of [`Program::distribute`].
pub type Branch<T, S> = Box<dyn Fn(Program<T>) -> Program<S> + Send + Sync>;

/// Boxes a pipeline builder into a [`Branch`].
pub fn branch<T, S>(build: impl Fn(Program<T>) -> Program<S> + Send + Sync + 'static) -> Branch<T, S> {
    Box::new(build)
}

struct Partitions<K, T> {
    pipes: HashMap<K, Sink<T>>,
    order: Vec<Execution>,
}

impl<K, T> Default for Partitions<K, T> {
    fn default() -> Self {
        Self {
            pipes: HashMap::new(),
            order: Vec::new(),
        }
    }
}

impl<T: Send + 'static> Program<T> {
    /// Routes each value to exactly one of two branch pipelines, decided
    /// solely by the predicate.
    #[must_use]
    pub fn choose<S: Send + 'static>(
        self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
        on_true: impl Fn(Program<T>) -> Program<S> + Send + Sync + 'static,
        on_false: impl Fn(Program<T>) -> Program<S> + Send + Sync + 'static,
    ) -> Program<S> {
        let predicate = Arc::new(predicate);
        let on_true = Arc::new(on_true);
        let on_false = Arc::new(on_false);

        Program::from_op(move |registry, sink: Sink<S>| {
            let (true_pipe, true_execution) =
                probe_pipe(&*on_true, registry, Arc::clone(&sink))?;
            let (false_pipe, false_execution) = probe_pipe(&*on_false, registry, sink)?;

            let predicate = Arc::clone(&predicate);
            let routed: Sink<T> = Arc::new(move |value| {
                if predicate(&value) {
                    true_pipe(value)
                } else {
                    false_pipe(value)
                }
            });

            let inner = self.run_raw(registry, routed)?;
            Ok(Execution::sequence(vec![
                true_execution,
                false_execution,
                inner,
            ]))
        })
    }

    /// Partitions values by key into lazily created sub-pipelines.
    ///
    /// The first value bearing an unseen key instantiates `fun` over a probe
    /// and starts it; every value with that key, first included, flows
    /// through the key's pipe. At most one sub-pipeline exists per key for
    /// the outer execution's lifetime: creation is atomic under the
    /// partition lock, so concurrent first-sightings of one key cannot
    /// double-instantiate. Sub-pipelines are closed only by the outer close,
    /// newest key first.
    #[must_use]
    pub fn split_by<K, S>(
        self,
        mapper: impl Fn(&T) -> K + Send + Sync + 'static,
        fun: impl Fn(Program<T>) -> Program<S> + Send + Sync + 'static,
    ) -> Program<S>
    where
        K: Eq + Hash + Clone + Send + 'static,
        S: Send + 'static,
    {
        let mapper = Arc::new(mapper);
        let fun = Arc::new(fun);

        Program::from_op(move |registry, sink: Sink<S>| {
            let partitions: Arc<Mutex<Partitions<K, T>>> =
                Arc::new(Mutex::new(Partitions::default()));

            let mapper = Arc::clone(&mapper);
            let fun = Arc::clone(&fun);
            let registry_for_values = Arc::clone(registry);
            let route_partitions = Arc::clone(&partitions);
            let routed: Sink<T> = Arc::new(move |value: T| {
                let key = mapper(&value);

                let pipe = {
                    let mut parts = route_partitions
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    match parts.pipes.get(&key).cloned() {
                        Some(pipe) => pipe,
                        None => {
                            let probe = Probe::new();
                            let instance = fun(probe.program());
                            let execution =
                                instance.run_raw(&registry_for_values, Arc::clone(&sink))?;
                            execution.start()?;
                            tracing::debug!(
                                partitions = parts.pipes.len() + 1,
                                "split_by instantiated a sub-pipeline"
                            );

                            let pipe = probe.pipe();
                            parts.pipes.insert(key, Arc::clone(&pipe));
                            parts.order.push(execution);
                            pipe
                        }
                    }
                };

                // Forward outside the lock; only creation must be atomic.
                pipe(value)
            });

            let inner = self.run_raw(registry, routed)?;

            let start_inner = inner.clone();
            let close_partitions = Arc::clone(&partitions);
            Ok(Execution::new(
                move || start_inner.start(),
                move || {
                    inner.close();
                    let drained: Vec<Execution> = {
                        let mut parts = close_partitions
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner);
                        parts.pipes.clear();
                        parts.order.drain(..).collect()
                    };
                    for execution in drained.into_iter().rev() {
                        execution.close();
                    }
                },
            ))
        })
    }
}

impl<T: Clone + Send + 'static> Program<T> {
    /// Broadcasts each value to every branch pipeline.
    ///
    /// The value's terminator runs all per-branch terminators, last branch
    /// first. Terminators are infallible, so one branch's retraction can
    /// never starve the others. A branch *sink* failing mid-broadcast
    /// retracts the branches already reached, then surfaces.
    #[must_use]
    pub fn distribute<S: Send + 'static>(self, branches: Vec<Branch<T, S>>) -> Program<S> {
        let branches = Arc::new(branches);

        Program::from_op(move |registry, sink: Sink<S>| {
            let mut pipes = Vec::with_capacity(branches.len());
            let mut executions = Vec::with_capacity(branches.len() + 1);
            for build in branches.iter() {
                let (pipe, execution) = probe_pipe(&**build, registry, Arc::clone(&sink))?;
                pipes.push(pipe);
                executions.push(execution);
            }

            let broadcast: Sink<T> = Arc::new(move |value: T| {
                let mut terminators = Vec::with_capacity(pipes.len());
                for pipe in &pipes {
                    match pipe(value.clone()) {
                        Ok(terminator) => terminators.push(terminator),
                        Err(err) => {
                            for terminator in terminators.into_iter().rev() {
                                terminator.invoke();
                            }
                            return Err(err);
                        }
                    }
                }
                Ok(Terminator::all(terminators))
            });

            let inner = self.run_raw(registry, broadcast)?;
            executions.push(inner);
            Ok(Execution::sequence(executions))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::registry::{CapabilityRegistry, InMemoryRegistry, RegistryRef};
    use crate::{capabilities, Capability, Query};

    fn test_registry() -> (Arc<InMemoryRegistry>, RegistryRef) {
        let concrete = Arc::new(InMemoryRegistry::new());
        let dynamic: RegistryRef = Arc::clone(&concrete) as RegistryRef;
        (concrete, dynamic)
    }

    fn channel_of(cap: &Capability) -> i64 {
        match cap.property("channel") {
            Some(crate::PropValue::Int(v)) => *v,
            _ => -1,
        }
    }

    #[test]
    fn test_choose_routes_each_value_to_exactly_one_branch() {
        let (concrete, registry) = test_registry();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let high = Arc::clone(&seen);
        let low = Arc::clone(&seen);
        let program = capabilities(Query::of_type("Sensor").unwrap()).choose(
            |cap| channel_of(cap) >= 10,
            move |p| {
                let high = Arc::clone(&high);
                p.for_each(move |cap| {
                    high.lock().unwrap().push(format!("high-{}", channel_of(cap)));
                })
            },
            move |p| {
                let low = Arc::clone(&low);
                p.for_each(move |cap| {
                    low.lock().unwrap().push(format!("low-{}", channel_of(cap)));
                })
            },
        );

        let execution = program.run(&registry).unwrap();
        concrete
            .publish(Capability::new("Sensor").with("channel", 3i64))
            .unwrap();
        concrete
            .publish(Capability::new("Sensor").with("channel", 12i64))
            .unwrap();

        let mut routed = seen.lock().unwrap().clone();
        routed.sort();
        assert_eq!(routed, vec!["high-12", "low-3"]);
        execution.close();
    }

    #[test]
    fn test_distribute_broadcasts_and_retracts_all_branches() {
        let (concrete, registry) = test_registry();
        let outstanding = Arc::new(AtomicUsize::new(0));
        let branch_for = |label: &'static str, outstanding: &Arc<AtomicUsize>| {
            let outstanding = Arc::clone(outstanding);
            branch(move |p: Program<Capability>| {
                let added = Arc::clone(&outstanding);
                let removed = Arc::clone(&outstanding);
                p.effects(
                    move |_| {
                        added.fetch_add(1, Ordering::SeqCst);
                    },
                    move |_| {
                        removed.fetch_sub(1, Ordering::SeqCst);
                    },
                )
                .map(move |_| label)
            })
        };

        let program = capabilities(Query::of_type("Sensor").unwrap()).distribute(vec![
            branch_for("a", &outstanding),
            branch_for("b", &outstanding),
            branch_for("c", &outstanding),
        ]);

        let execution = program.run(&registry).unwrap();
        let publication = concrete.publish(Capability::new("Sensor")).unwrap();
        assert_eq!(outstanding.load(Ordering::SeqCst), 3);

        // One registry retraction runs all three branch terminators.
        concrete.unpublish(publication).unwrap();
        assert_eq!(outstanding.load(Ordering::SeqCst), 0);

        concrete.publish(Capability::new("Sensor")).unwrap();
        assert_eq!(outstanding.load(Ordering::SeqCst), 3);
        execution.close();
        assert_eq!(outstanding.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_split_by_instantiates_once_per_key() {
        let (concrete, registry) = test_registry();
        let instantiations = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&instantiations);
        let sink_counter = Arc::clone(&seen);
        let program = capabilities(Query::of_type("Sensor").unwrap()).split_by(
            channel_of,
            move |p| {
                counter.fetch_add(1, Ordering::SeqCst);
                let sink_counter = Arc::clone(&sink_counter);
                p.for_each(move |_| {
                    sink_counter.fetch_add(1, Ordering::SeqCst);
                })
            },
        );

        let execution = program.run(&registry).unwrap();
        for channel in [1i64, 1, 2, 1, 2] {
            concrete
                .publish(Capability::new("Sensor").with("channel", channel))
                .unwrap();
        }

        assert_eq!(instantiations.load(Ordering::SeqCst), 2);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
        execution.close();
    }

    #[test]
    fn test_split_by_outer_close_closes_sub_pipelines() {
        let (concrete, registry) = test_registry();
        let outstanding = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&outstanding);
        let program = capabilities(Query::of_type("Sensor").unwrap()).split_by(
            channel_of,
            move |p| {
                let added = Arc::clone(&counter);
                let removed = Arc::clone(&counter);
                p.effects(
                    move |_| {
                        added.fetch_add(1, Ordering::SeqCst);
                    },
                    move |_| {
                        removed.fetch_sub(1, Ordering::SeqCst);
                    },
                )
                .ignore()
            },
        );

        let execution = program.run(&registry).unwrap();
        concrete
            .publish(Capability::new("Sensor").with("channel", 1i64))
            .unwrap();
        concrete
            .publish(Capability::new("Sensor").with("channel", 2i64))
            .unwrap();
        assert_eq!(outstanding.load(Ordering::SeqCst), 2);

        execution.close();
        assert_eq!(outstanding.load(Ordering::SeqCst), 0);
    }
}
