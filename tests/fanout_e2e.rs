use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::bounded;

use capflow::{
    branch, capabilities, Capability, CapabilityRegistry, InMemoryRegistry, Program, Query,
    RegistryRef,
};

fn registry_pair() -> (Arc<InMemoryRegistry>, RegistryRef) {
    let concrete = Arc::new(InMemoryRegistry::new());
    let dynamic: RegistryRef = Arc::clone(&concrete) as RegistryRef;
    (concrete, dynamic)
}

fn channel_of(cap: &Capability) -> i64 {
    match cap.property("channel") {
        Some(capflow::PropValue::Int(v)) => *v,
        _ => -1,
    }
}

#[test]
fn choose_routes_on_predicate_never_both() {
    let (registry, ctx) = registry_pair();
    let routed = Arc::new(Mutex::new(Vec::new()));

    let evens = Arc::clone(&routed);
    let odds = Arc::clone(&routed);
    let program = capabilities(Query::of_type("Sensor").unwrap()).choose(
        |cap| channel_of(cap) % 2 == 0,
        move |p| {
            let evens = Arc::clone(&evens);
            p.for_each(move |cap| evens.lock().unwrap().push(("even", channel_of(cap))))
        },
        move |p| {
            let odds = Arc::clone(&odds);
            p.for_each(move |cap| odds.lock().unwrap().push(("odd", channel_of(cap))))
        },
    );

    let execution = program.run(&ctx).unwrap();
    for channel in 0..6i64 {
        registry
            .publish(Capability::new("Sensor").with("channel", channel))
            .unwrap();
    }

    let mut seen = routed.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(
        seen,
        vec![
            ("even", 0),
            ("even", 2),
            ("even", 4),
            ("odd", 1),
            ("odd", 3),
            ("odd", 5),
        ],
    );
    execution.close();
}

#[test]
fn distribute_runs_every_branch_terminator_on_close() {
    let (registry, ctx) = registry_pair();
    let closed_branches = Arc::new(Mutex::new(Vec::new()));

    let branches = (0..3)
        .map(|idx| {
            let closed = Arc::clone(&closed_branches);
            branch(move |p: Program<Capability>| {
                let closed = Arc::clone(&closed);
                p.for_each_with(|_| {}, move |_| closed.lock().unwrap().push(idx))
            })
        })
        .collect();

    let execution = capabilities(Query::of_type("Sensor").unwrap())
        .distribute(branches)
        .run(&ctx)
        .unwrap();

    registry.publish(Capability::new("Sensor")).unwrap();
    assert!(closed_branches.lock().unwrap().is_empty());

    execution.close();
    // All three branch terminators ran, last branch first.
    assert_eq!(*closed_branches.lock().unwrap(), vec![2, 1, 0]);
}

#[test]
fn split_by_concurrent_same_key_instantiates_once() {
    let (registry, ctx) = registry_pair();
    let instantiations = Arc::new(AtomicUsize::new(0));
    let deliveries = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&instantiations);
    let seen = Arc::clone(&deliveries);
    let program = capabilities(Query::of_type("Sensor").unwrap()).split_by(
        channel_of,
        move |p| {
            counter.fetch_add(1, Ordering::SeqCst);
            let seen = Arc::clone(&seen);
            p.for_each(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
        },
    );

    let execution = program.run(&ctx).unwrap();

    // Several notifier threads race first-sightings of the same two keys.
    const WORKERS: usize = 4;
    const PER_WORKER: usize = 32;
    let (go_tx, go_rx) = bounded::<()>(0);
    let workers: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let registry = Arc::clone(&registry);
            let go_rx = go_rx.clone();
            thread::spawn(move || {
                go_rx.recv().unwrap();
                for i in 0..PER_WORKER {
                    let key = i64::try_from((worker + i) % 2).unwrap();
                    registry
                        .publish(Capability::new("Sensor").with("channel", key))
                        .unwrap();
                }
            })
        })
        .collect();

    for _ in 0..WORKERS {
        go_tx.send(()).unwrap();
    }
    for worker in workers {
        worker.join().unwrap();
    }

    // Two distinct keys, two sub-pipelines, no duplicates under the race.
    assert_eq!(instantiations.load(Ordering::SeqCst), 2);
    assert_eq!(deliveries.load(Ordering::SeqCst), WORKERS * PER_WORKER);

    execution.close();
}

#[test]
fn split_by_sub_pipelines_survive_member_retraction() {
    let (registry, ctx) = registry_pair();
    let instantiations = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&instantiations);
    let program = capabilities(Query::of_type("Sensor").unwrap()).split_by(
        channel_of,
        move |p| {
            counter.fetch_add(1, Ordering::SeqCst);
            p.ignore()
        },
    );

    let execution = program.run(&ctx).unwrap();

    let p1 = registry
        .publish(Capability::new("Sensor").with("channel", 7i64))
        .unwrap();
    registry.unpublish(p1).unwrap();

    // The key's sub-pipeline is not closed by the member leaving; the next
    // same-key member reuses it.
    registry
        .publish(Capability::new("Sensor").with("channel", 7i64))
        .unwrap();
    assert_eq!(instantiations.load(Ordering::SeqCst), 1);

    execution.close();
}
