use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;

use capflow::{
    capabilities, transformer, Capability, CapabilityRegistry, InMemoryRegistry, Program, Query,
    RegistryRef, Sink, Terminator, Transform,
};

fn registry_pair() -> (Arc<InMemoryRegistry>, RegistryRef) {
    let concrete = Arc::new(InMemoryRegistry::new());
    let dynamic: RegistryRef = Arc::clone(&concrete) as RegistryRef;
    (concrete, dynamic)
}

/// Counts live and total pairings published downstream.
fn pairing_sink<T: Send + 'static>(
    outstanding: &Arc<AtomicUsize>,
    total: &Arc<AtomicUsize>,
) -> Sink<T> {
    let outstanding = Arc::clone(outstanding);
    let total = Arc::clone(total);
    Arc::new(move |_| {
        outstanding.fetch_add(1, Ordering::SeqCst);
        total.fetch_add(1, Ordering::SeqCst);
        let outstanding = Arc::clone(&outstanding);
        Ok(Terminator::new(move || {
            outstanding.fetch_sub(1, Ordering::SeqCst);
        }))
    })
}

fn doubler_program() -> Program<Transform<Capability, u64>> {
    capabilities(Query::of_type("Doubler").unwrap()).map(|_| transformer(|_: &Capability| 2u64))
}

#[test]
fn two_values_one_function_yields_two_pairings() {
    let (registry, ctx) = registry_pair();
    let outstanding = Arc::new(AtomicUsize::new(0));
    let total = Arc::new(AtomicUsize::new(0));

    let program = capabilities(Query::of_type("Sensor").unwrap()).apply_to(doubler_program());
    let execution = program
        .run_raw(&ctx, pairing_sink(&outstanding, &total))
        .unwrap();
    execution.start().unwrap();

    let t1 = registry.publish(Capability::new("Sensor")).unwrap();
    let _t2 = registry.publish(Capability::new("Sensor")).unwrap();
    registry.publish(Capability::new("Doubler")).unwrap();

    assert_eq!(total.load(Ordering::SeqCst), 2);
    assert_eq!(outstanding.load(Ordering::SeqCst), 2);

    // Closing t1 retracts only (t1, f); (t2, f) stays intact.
    registry.unpublish(t1).unwrap();
    assert_eq!(outstanding.load(Ordering::SeqCst), 1);

    execution.close();
    assert_eq!(outstanding.load(Ordering::SeqCst), 0);
}

#[test]
fn arrival_order_does_not_change_the_pairings() {
    for function_first in [true, false] {
        let (registry, ctx) = registry_pair();
        let outstanding = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));

        let program =
            capabilities(Query::of_type("Sensor").unwrap()).apply_to(doubler_program());
        let execution = program
            .run_raw(&ctx, pairing_sink(&outstanding, &total))
            .unwrap();
        execution.start().unwrap();

        if function_first {
            registry.publish(Capability::new("Doubler")).unwrap();
            registry.publish(Capability::new("Sensor")).unwrap();
            registry.publish(Capability::new("Sensor")).unwrap();
        } else {
            registry.publish(Capability::new("Sensor")).unwrap();
            registry.publish(Capability::new("Sensor")).unwrap();
            registry.publish(Capability::new("Doubler")).unwrap();
        }

        assert_eq!(total.load(Ordering::SeqCst), 2);
        execution.close();
        assert_eq!(outstanding.load(Ordering::SeqCst), 0);
    }
}

#[test]
fn concurrent_value_and_function_arrival_pairs_exactly_once() {
    const ROUNDS: usize = 50;

    for _ in 0..ROUNDS {
        let (registry, ctx) = registry_pair();
        let outstanding = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));

        let program =
            capabilities(Query::of_type("Sensor").unwrap()).apply_to(doubler_program());
        let execution = program
            .run_raw(&ctx, pairing_sink(&outstanding, &total))
            .unwrap();
        execution.start().unwrap();

        let (go_tx, go_rx) = bounded::<()>(0);

        let value_thread = {
            let registry = Arc::clone(&registry);
            let go_rx = go_rx.clone();
            thread::spawn(move || {
                go_rx.recv().unwrap();
                registry.publish(Capability::new("Sensor")).unwrap();
            })
        };
        let function_thread = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                go_rx.recv().unwrap();
                registry.publish(Capability::new("Doubler")).unwrap();
            })
        };

        go_tx.send(()).unwrap();
        go_tx.send(()).unwrap();
        value_thread.join().unwrap();
        function_thread.join().unwrap();

        // No ordering guarantee on which side won, but exactly one pairing
        // was published and exactly one terminator formed for it.
        assert_eq!(total.load(Ordering::SeqCst), 1);
        assert_eq!(outstanding.load(Ordering::SeqCst), 1);

        execution.close();
        assert_eq!(outstanding.load(Ordering::SeqCst), 0);
    }
}

#[test]
fn function_departure_retracts_every_pairing_involving_it() {
    let (registry, ctx) = registry_pair();
    let outstanding = Arc::new(AtomicUsize::new(0));
    let total = Arc::new(AtomicUsize::new(0));

    let program = capabilities(Query::of_type("Sensor").unwrap()).apply_to(doubler_program());
    let execution = program
        .run_raw(&ctx, pairing_sink(&outstanding, &total))
        .unwrap();
    execution.start().unwrap();

    // One pairing formed by the function's arrival, one by a later value's.
    registry.publish(Capability::new("Sensor")).unwrap();
    let f = registry.publish(Capability::new("Doubler")).unwrap();
    registry.publish(Capability::new("Sensor")).unwrap();
    assert_eq!(outstanding.load(Ordering::SeqCst), 2);

    // Both die with the function, no matter which side formed them.
    registry.unpublish(f).unwrap();
    assert_eq!(outstanding.load(Ordering::SeqCst), 0);

    // New values find no live function to pair with.
    registry.publish(Capability::new("Sensor")).unwrap();
    assert_eq!(total.load(Ordering::SeqCst), 2);

    execution.close();
    assert_eq!(outstanding.load(Ordering::SeqCst), 0);
}
