/// Scenario tests: the runtime end to end, and keyed reconciliation over it
use crate::{
    Computed, Effect, KeyedStore, Reconciler, Scope, Signal, Transaction, flush_effects,
    on_cleanup, reconcile,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

type Store = Arc<KeyedStore<&'static str, i32>>;

/// A store, a reconciler over it, and what the handler and hooks saw
struct Fixture {
    store: Store,
    reconciler: Reconciler<Store>,
    handled: Arc<Mutex<Vec<&'static str>>>,
    disposed: Arc<Mutex<Vec<&'static str>>>,
}

impl Fixture {
    fn new(entries: &[(&'static str, i32)]) -> Self {
        let store: Store = Arc::new(KeyedStore::from_entries(entries.iter().copied()));
        let handled = Arc::new(Mutex::new(Vec::new()));
        let disposed = Arc::new(Mutex::new(Vec::new()));

        let handled_clone = handled.clone();
        let disposed_clone = disposed.clone();
        let reconciler = reconcile(store.clone(), move |key: &&'static str| {
            let key = *key;
            handled_clone.lock().push(key);
            let disposed = disposed_clone.clone();
            on_cleanup(move || disposed.lock().push(key))?;
            Ok(())
        });

        Self {
            store,
            reconciler,
            handled,
            disposed,
        }
    }

    fn handled(&self) -> Vec<&'static str> {
        self.handled.lock().clone()
    }

    fn disposed(&self) -> Vec<&'static str> {
        self.disposed.lock().clone()
    }
}

// ============================================================================
// Keyed reconciliation scenarios
// ============================================================================

#[test]
fn scenario_initial_key_gets_a_scope() {
    let fixture = Fixture::new(&[("a", 1)]);

    assert_eq!(fixture.handled(), vec!["a"]);
    assert_eq!(fixture.reconciler.keys(), vec!["a"]);
}

#[test]
fn scenario_added_key_is_handled_alone() {
    let fixture = Fixture::new(&[("a", 1)]);

    fixture.store.insert("b", 2);

    assert_eq!(fixture.handled(), vec!["a", "b"]);
    assert_eq!(fixture.reconciler.keys(), vec!["a", "b"]);
}

#[test]
fn scenario_removed_key_is_disposed() {
    let fixture = Fixture::new(&[("a", 1), ("b", 2)]);

    fixture.store.remove(&"a");

    assert_eq!(fixture.disposed(), vec!["a"]);
    assert_eq!(fixture.reconciler.keys(), vec!["b"]);
}

#[test]
fn scenario_emptied_source_disposes_everything() {
    let fixture = Fixture::new(&[("a", 1), ("b", 2)]);

    fixture.store.clear();

    assert_eq!(fixture.disposed(), vec!["a", "b"]);
    assert!(fixture.reconciler.is_empty());
    assert_eq!(fixture.handled(), vec!["a", "b"]);

    fixture.store.insert("c", 3);
    assert_eq!(fixture.handled(), vec!["a", "b", "c"]);
}

#[test]
fn scenario_remove_and_readd_in_one_transaction_is_a_noop() {
    let fixture = Fixture::new(&[("a", 1)]);
    let original = fixture.reconciler.scope(&"a");

    Transaction::run(|| {
        fixture.store.remove(&"a");
        fixture.store.insert("a", 1);
    });

    assert_eq!(fixture.reconciler.scope(&"a"), original);
    assert!(fixture.disposed().is_empty());
    assert_eq!(fixture.handled(), vec!["a"]);
}

#[test]
fn scenario_remove_and_readd_separately_gives_a_new_scope() {
    let fixture = Fixture::new(&[("a", 1)]);
    let original = fixture.reconciler.scope(&"a").unwrap();

    let marker = Arc::new(AtomicUsize::new(0));
    let marker_clone = marker.clone();
    original
        .on_dispose(move || {
            marker_clone.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

    fixture.store.remove(&"a");
    fixture.store.insert("a", 1);

    let replacement = fixture.reconciler.scope(&"a").unwrap();
    assert_ne!(replacement, original);
    assert!(!original.is_alive());
    assert!(replacement.is_alive());
    assert_eq!(marker.load(Ordering::Relaxed), 1);
    assert_eq!(fixture.handled(), vec!["a", "a"]);

    // Disposing the replacement does not replay the first scope's hooks
    fixture.store.remove(&"a");
    assert_eq!(marker.load(Ordering::Relaxed), 1);
    assert_eq!(fixture.disposed(), vec!["a", "a"]);
}

#[test]
fn dispose_tears_down_every_scope_and_stops_watching() {
    let fixture = Fixture::new(&[("a", 1), ("b", 2)]);

    fixture.reconciler.dispose();

    assert_eq!(fixture.disposed(), vec!["a", "b"]);
    assert!(fixture.reconciler.is_empty());
    assert!(fixture.reconciler.is_disposed());

    fixture.store.insert("c", 3);
    assert_eq!(fixture.handled(), vec!["a", "b"]);
}

#[test]
fn second_dispose_changes_nothing() {
    let fixture = Fixture::new(&[("a", 1)]);

    fixture.reconciler.dispose();
    fixture.reconciler.dispose();

    assert_eq!(fixture.disposed(), vec!["a"]);
}

#[test]
fn unchanged_key_set_creates_and_disposes_nothing() {
    let fixture = Fixture::new(&[("a", 1), ("b", 2)]);

    // Value updates never reach the watcher
    fixture.store.insert("a", 10);
    fixture.store.update(&"b", |v| *v += 1);
    // Same keys, new values
    fixture.store.replace([("b", 0), ("a", 0)]);

    let report = fixture.reconciler.sync().unwrap();
    assert!(report.is_noop());
    assert_eq!(fixture.handled(), vec!["a", "b"]);
    assert!(fixture.disposed().is_empty());
}

#[test]
fn empty_source_never_calls_the_handler() {
    let fixture = Fixture::new(&[]);

    fixture.store.clear();

    assert!(fixture.handled().is_empty());
    assert!(fixture.reconciler.is_empty());
}

#[test]
fn key_scope_owns_what_the_handler_creates() {
    let store: Store = Arc::new(KeyedStore::from_entries([("a", 1)]));
    let tick = Arc::new(Signal::new());
    let runs = Arc::new(AtomicUsize::new(0));

    let tick_clone = tick.clone();
    let runs_clone = runs.clone();
    let reconciler = reconcile(store.clone(), move |_| {
        let tick = tick_clone.clone();
        let runs = runs_clone.clone();
        // Handle dropped, the key scope keeps the effect
        let _ = Effect::new_sync(move || {
            tick.track_dependency();
            runs.fetch_add(1, Ordering::Relaxed);
        });
        Ok(())
    });
    assert_eq!(reconciler.scope(&"a").map(Scope::effect_count), Some(1));

    tick.emit();
    assert_eq!(runs.load(Ordering::Relaxed), 2);

    store.remove(&"a");
    tick.emit();
    assert_eq!(runs.load(Ordering::Relaxed), 2);
}

#[test]
fn derived_key_set_drives_the_reconciler() {
    let store: Store = Arc::new(KeyedStore::new());

    let store_clone = store.clone();
    let positive = Computed::new(move || {
        store_clone
            .keys()
            .into_iter()
            .filter(|k| store_clone.get(k).is_some_and(|v| v > 0))
            .collect::<Vec<_>>()
    });

    let reconciler = reconcile(positive, |_| Ok(()));

    store.insert("a", 1);
    store.insert("b", -1);
    assert_eq!(reconciler.keys(), vec!["a"]);

    store.insert("b", 5);
    assert_eq!(reconciler.keys(), vec!["a", "b"]);

    store.update(&"a", |v| *v = 0);
    assert_eq!(reconciler.keys(), vec!["b"]);
}

#[test]
fn batched_changes_settle_in_one_pass() {
    let store: Store = Arc::new(KeyedStore::new());
    let passes = Arc::new(AtomicUsize::new(0));

    let reconciler = crate::KeyedScopes::new(store.clone())
        .flush(crate::FlushMode::Batched)
        .run(|_| Ok(()))
        .unwrap();

    let passes_clone = passes.clone();
    let store_clone = store.clone();
    let _observer = Effect::new(move || {
        store_clone.keys();
        passes_clone.fetch_add(1, Ordering::Relaxed);
    });

    store.insert("a", 1);
    store.insert("b", 2);
    store.remove(&"a");
    assert!(reconciler.is_empty());

    flush_effects();
    assert_eq!(reconciler.keys(), vec!["b"]);
    assert_eq!(passes.load(Ordering::Relaxed), 2);
}

#[test]
fn writes_through_the_reconciler_source_are_reconciled() {
    let fixture = Fixture::new(&[("a", 1)]);

    fixture.reconciler.source().insert("b", 2);
    assert!(fixture.reconciler.contains(&"b"));
    assert!(Arc::ptr_eq(fixture.reconciler.source(), &fixture.store));

    // A scope nested in the handler's scope goes with the key
    let key_scope = fixture.reconciler.scope(&"b").unwrap();
    let nested = key_scope.run(Scope::nested).unwrap();
    assert_eq!(nested.parent(), Some(key_scope));

    fixture.reconciler.source().remove(&"b");
    assert!(!nested.is_alive());
    assert_eq!(fixture.disposed(), vec!["b"]);
}

#[test]
fn panicking_handler_leaves_other_effects_running() {
    let store: Store = Arc::new(KeyedStore::new());

    let reconciler = reconcile(store.clone(), |key: &&'static str| {
        if *key == "boom" {
            panic!("handler failed for {key}");
        }
        Ok(())
    });

    let observed = Arc::new(AtomicUsize::new(0));
    let observed_clone = observed.clone();
    let store_clone = store.clone();
    let _observer = Effect::new_sync(move || {
        store_clone.keys();
        observed_clone.fetch_add(1, Ordering::Relaxed);
    });

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        store.insert("boom", 1);
    }));
    assert!(result.is_err());
    let after_panic = observed.load(Ordering::Relaxed);

    store.insert("x", 2);
    assert!(observed.load(Ordering::Relaxed) > after_panic);
    assert!(reconciler.contains(&"x"));

    store.insert("y", 3);
    assert!(reconciler.contains(&"y"));
}

// ============================================================================
// Runtime behavior the reconciler leans on
// ============================================================================

#[test]
fn diamond_dependency_updates_correctly() {
    // Both effects should run exactly once each when signal emits
    let signal = Signal::new();
    let signal_id = signal.node_id();
    let counter = Arc::new(AtomicUsize::new(0));

    let c1 = counter.clone();
    let _effect1 = Effect::new(move || {
        signal_id.track_dependency();
        c1.fetch_add(1, Ordering::Relaxed);
    });

    let c2 = counter.clone();
    let _effect2 = Effect::new(move || {
        signal_id.track_dependency();
        c2.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(counter.load(Ordering::Relaxed), 2);

    signal.emit();
    flush_effects();
    assert_eq!(counter.load(Ordering::Relaxed), 4);
}

#[test]
fn effect_resubscribes_on_each_run() {
    use std::sync::atomic::AtomicBool;

    let signal_a = Signal::new();
    let signal_b = Signal::new();
    let signal_a_id = signal_a.node_id();
    let signal_b_id = signal_b.node_id();

    let use_b = Arc::new(AtomicBool::new(false));
    let counter = Arc::new(AtomicUsize::new(0));

    let use_b_clone = use_b.clone();
    let counter_clone = counter.clone();
    let _effect = Effect::new_sync(move || {
        if use_b_clone.load(Ordering::Relaxed) {
            signal_b_id.track_dependency();
        } else {
            signal_a_id.track_dependency();
        }
        counter_clone.fetch_add(1, Ordering::Relaxed);
    });

    use_b.store(true, Ordering::Relaxed);
    signal_a.emit();
    assert_eq!(counter.load(Ordering::Relaxed), 2);

    signal_a.emit();
    assert_eq!(
        counter.load(Ordering::Relaxed),
        2,
        "Effect should not react to A anymore"
    );

    signal_b.emit();
    assert_eq!(counter.load(Ordering::Relaxed), 3, "Effect should react to B now");
}

#[test]
fn effect_drop_while_pending_does_not_run() {
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_clone = counter.clone();

    let signal = Signal::new();
    let signal_id = signal.node_id();
    let effect = Effect::new(move || {
        signal_id.track_dependency();
        counter_clone.fetch_add(1, Ordering::Relaxed);
    });

    effect.invalidate();
    drop(effect);
    flush_effects();

    assert_eq!(counter.load(Ordering::Relaxed), 1);
}

#[test]
fn signal_drop_with_pending_effect_is_safe() {
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_clone = counter.clone();

    let signal = Signal::new();
    let signal_id = signal.node_id();
    let _effect = Effect::new(move || {
        signal_id.track_dependency();
        counter_clone.fetch_add(1, Ordering::Relaxed);
    });

    signal.emit();
    drop(signal);
    flush_effects();

    // Still pending when the signal went away, so it ran once more
    assert_eq!(counter.load(Ordering::Relaxed), 2);
}

#[test]
fn disposing_scope_from_its_own_effect_is_safe() {
    let signal = Signal::new();
    let signal_id = signal.node_id();
    let runs = Arc::new(AtomicUsize::new(0));
    let scope = Scope::new();

    let runs_clone = runs.clone();
    scope.run(|| {
        let _ = Effect::new_sync(move || {
            signal_id.track_dependency();
            if runs_clone.fetch_add(1, Ordering::Relaxed) > 0 {
                scope.dispose();
            }
        });
    });

    signal.emit();
    signal.emit();

    assert!(!scope.is_alive());
    assert_eq!(runs.load(Ordering::Relaxed), 2);
}

// ============================================================================
// Properties over random key-set sequences
// ============================================================================

proptest! {
    #[test]
    fn registry_tracks_every_key_set(
        steps in prop::collection::vec(prop::collection::btree_set(0u8..6, 0..6), 1..24)
    ) {
        let store: Arc<KeyedStore<u8, ()>> = Arc::new(KeyedStore::new());
        let live: Arc<Mutex<HashMap<u8, i32>>> = Arc::new(Mutex::new(HashMap::new()));

        let live_clone = live.clone();
        let reconciler = reconcile(store.clone(), move |key: &u8| {
            let key = *key;
            *live_clone.lock().entry(key).or_default() += 1;
            let live = live_clone.clone();
            on_cleanup(move || *live.lock().entry(key).or_default() -= 1)?;
            Ok(())
        });

        for step in steps {
            store.replace(step.iter().map(|k| (*k, ())));

            let registered: BTreeSet<u8> = reconciler.keys().into_iter().collect();
            prop_assert_eq!(&registered, &step);

            let live = live.lock();
            for key in 0u8..6 {
                let expected = i32::from(step.contains(&key));
                prop_assert_eq!(live.get(&key).copied().unwrap_or(0), expected);
            }
        }

        reconciler.dispose();
        prop_assert!(live.lock().values().all(|count| *count == 0));
    }

    #[test]
    fn transactions_settle_to_the_last_key_set(
        steps in prop::collection::vec(prop::collection::btree_set(0u8..6, 0..6), 1..12)
    ) {
        let store: Arc<KeyedStore<u8, ()>> = Arc::new(KeyedStore::new());
        let reconciler = reconcile(store.clone(), |_| Ok(()));

        Transaction::run(|| {
            for step in &steps {
                store.replace(step.iter().map(|k| (*k, ())));
            }
        });

        let registered: BTreeSet<u8> = reconciler.keys().into_iter().collect();
        prop_assert_eq!(Some(&registered), steps.last());
    }
}
