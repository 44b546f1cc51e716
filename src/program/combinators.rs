//! Value-wise combinators: transform, filter, observe, flatten, recover.

use std::sync::Arc;

use crate::program::{Program, Sink};
use crate::terminator::Terminator;

impl<T: Send + 'static> Program<T> {
    /// Transforms each value; the terminator passes through unchanged.
    ///
    /// The mapping function is total by construction. A fallible mapping
    /// belongs behind [`recover`](Self::recover) on the downstream side.
    #[must_use]
    pub fn map<S: Send + 'static>(
        self,
        f: impl Fn(T) -> S + Send + Sync + 'static,
    ) -> Program<S> {
        let f = Arc::new(f);
        Program::from_op(move |registry, sink: Sink<S>| {
            let f = Arc::clone(&f);
            let mapped: Sink<T> = Arc::new(move |value| sink(f(value)));
            self.run_raw(registry, mapped)
        })
    }

    /// Drops values failing the predicate.
    ///
    /// A dropped value never reaches the sink and is never retracted.
    #[must_use]
    pub fn filter(self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Program<T> {
        let predicate = Arc::new(predicate);
        Program::from_op(move |registry, sink: Sink<T>| {
            let predicate = Arc::clone(&predicate);
            let filtered: Sink<T> = Arc::new(move |value| {
                if predicate(&value) {
                    sink(value)
                } else {
                    Ok(Terminator::noop())
                }
            });
            self.run_raw(registry, filtered)
        })
    }

    /// Discards the value type, keeping the collection's dynamics.
    #[must_use]
    pub fn ignore(self) -> Program<()> {
        self.map(|_| ())
    }

    /// Chains into `next`, once per value of `self`.
    ///
    /// Each value of `self` runs its own live instance of `next`; the
    /// value's retraction closes that instance.
    #[must_use]
    pub fn then<S: Send + 'static>(self, next: Program<S>) -> Program<S> {
        self.flat_map(move |_| next.clone())
    }

    /// For each value, instantiates `fun(value)` into the same downstream
    /// collection; the value's terminator closes the instance, retracting
    /// everything it published.
    #[must_use]
    pub fn flat_map<S: Send + 'static>(
        self,
        fun: impl Fn(T) -> Program<S> + Send + Sync + 'static,
    ) -> Program<S> {
        let fun = Arc::new(fun);
        Program::from_op(move |registry, sink: Sink<S>| {
            let fun = Arc::clone(&fun);
            let registry_for_values = Arc::clone(registry);
            let flattened: Sink<T> = Arc::new(move |value| {
                let instance = fun(value);
                let execution = instance.run_raw(&registry_for_values, Arc::clone(&sink))?;
                execution.start()?;
                Ok(Terminator::new(move || execution.close()))
            });
            self.run_raw(registry, flattened)
        })
    }

    /// Generic sink transformation: runs `self` against `fun(sink)`.
    ///
    /// This is the raw form every other combinator is a special case of.
    #[must_use]
    pub fn transform<S: Send + 'static>(
        self,
        fun: impl Fn(Sink<S>) -> Sink<T> + Send + Sync + 'static,
    ) -> Program<S> {
        let fun = Arc::new(fun);
        Program::from_op(move |registry, sink: Sink<S>| self.run_raw(registry, fun(sink)))
    }
}

impl<T: Clone + Send + Sync + 'static> Program<T> {
    /// Runs symmetric side effects around each value's lifetime.
    ///
    /// `on_added` runs before the value enters the inner sink. If the inner
    /// sink fails, `on_removed` runs before the error surfaces, so the pair
    /// stays balanced. Otherwise `on_removed` runs at retraction, before the
    /// inner terminator.
    #[must_use]
    pub fn effects(
        self,
        on_added: impl Fn(&T) + Send + Sync + 'static,
        on_removed: impl Fn(&T) + Send + Sync + 'static,
    ) -> Program<T> {
        let on_added = Arc::new(on_added);
        let on_removed = Arc::new(on_removed);
        Program::from_op(move |registry, sink: Sink<T>| {
            let on_added = Arc::clone(&on_added);
            let on_removed = Arc::clone(&on_removed);
            let observed: Sink<T> = Arc::new(move |value: T| {
                on_added(&value);

                let retained = value.clone();
                match sink(value) {
                    Ok(inner) => {
                        let on_removed = Arc::clone(&on_removed);
                        Ok(Terminator::new(move || {
                            on_removed(&retained);
                            inner.invoke();
                        }))
                    }
                    Err(err) => {
                        on_removed(&retained);
                        Err(err)
                    }
                }
            });
            self.run_raw(registry, observed)
        })
    }

    /// Observes each value's arrival, discarding the value type.
    #[must_use]
    pub fn for_each(self, on_added: impl Fn(&T) + Send + Sync + 'static) -> Program<()> {
        self.for_each_with(on_added, |_| {})
    }

    /// Observes each value's arrival and departure, discarding the value
    /// type.
    #[must_use]
    pub fn for_each_with(
        self,
        on_added: impl Fn(&T) + Send + Sync + 'static,
        on_removed: impl Fn(&T) + Send + Sync + 'static,
    ) -> Program<()> {
        self.effects(on_added, on_removed).ignore()
    }

    /// Retries each failed delivery once with a substituted value.
    ///
    /// When the downstream sink fails on `t`, the sink is retried with
    /// `on_error(t, error)` exactly once. A failure of the retry surfaces
    /// unchanged; there is no second substitution.
    #[must_use]
    pub fn recover(
        self,
        on_error: impl Fn(T, crate::FlowError) -> T + Send + Sync + 'static,
    ) -> Program<T> {
        let on_error = Arc::new(on_error);
        Program::from_op(move |registry, sink: Sink<T>| {
            let on_error = Arc::clone(&on_error);
            let recovering: Sink<T> = Arc::new(move |value: T| {
                let attempt = value.clone();
                match sink(attempt) {
                    Ok(terminator) => Ok(terminator),
                    Err(err) => sink(on_error(value, err)),
                }
            });
            self.run_raw(registry, recovering)
        })
    }

    /// Substitutes a live fallback pipeline for each failed delivery.
    ///
    /// When the downstream sink fails on `t`, `on_error(t, error)` supplies
    /// a fallback program; it runs immediately against the same downstream
    /// sink, and closing the fallback becomes the value's terminator. A
    /// failure while running the fallback surfaces unchanged.
    #[must_use]
    pub fn recover_with(
        self,
        on_error: impl Fn(T, crate::FlowError) -> Program<T> + Send + Sync + 'static,
    ) -> Program<T> {
        let on_error = Arc::new(on_error);
        Program::from_op(move |registry, sink: Sink<T>| {
            let on_error = Arc::clone(&on_error);
            let registry_for_values = Arc::clone(registry);
            let recovering: Sink<T> = Arc::new(move |value: T| {
                let attempt = value.clone();
                match sink(attempt) {
                    Ok(terminator) => Ok(terminator),
                    Err(err) => {
                        let fallback = on_error(value, err);
                        let execution =
                            fallback.run_raw(&registry_for_values, Arc::clone(&sink))?;
                        execution.start()?;
                        Ok(Terminator::new(move || execution.close()))
                    }
                }
            });
            self.run_raw(registry, recovering)
        })
    }
}
