use crate::arena::{
    CurrentEffectGuard, CurrentScopeGuard, EffectId, EffectMetadata, FlushMode, ReactiveState,
    current_scope, destroy_effect, effect_arena_insert, has_pending_sync_effects,
    mark_effect_pending, remove_from_pending_set, requeue_pending_effects, take_pending_effects,
    take_pending_sync_effects,
};
use crate::transaction::is_transaction_active;
use std::cell::Cell;

thread_local! {
    // Set by emissions, cleared by flush_effects().
    static PROCESSING_SCHEDULED: Cell<bool> = const { Cell::new(false) };

    // Number of effect callbacks executing on this thread (nested creation runs count).
    static RUN_DEPTH: Cell<usize> = const { Cell::new(0) };

    // A flush loop is draining the pending set on this thread.
    static FLUSHING: Cell<bool> = const { Cell::new(false) };

    // The next round of the running (or next) flush takes batched effects too.
    static FULL_FLUSH_REQUESTED: Cell<bool> = const { Cell::new(false) };
}

/// Schedule effect processing without running anything
///
/// Multiple calls only schedule one processing. Batched effects run when
/// `flush_effects()` is called or a transaction ends.
pub fn schedule_effect_processing() {
    PROCESSING_SCHEDULED.with(|scheduled| scheduled.set(true));
}

/// Check if effect processing is scheduled
///
/// Returns true if an emission marked effects pending and `flush_effects()`
/// has not been called since.
pub fn is_processing_scheduled() -> bool {
    PROCESSING_SCHEDULED.with(Cell::get)
}

/// Whether an effect callback is executing on this thread
pub(crate) fn is_running_effect() -> bool {
    RUN_DEPTH.with(Cell::get) > 0
}

struct RunDepthGuard;

impl RunDepthGuard {
    fn enter() -> Self {
        RUN_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for RunDepthGuard {
    fn drop(&mut self) {
        RUN_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Ask the flush that picks up the current work to run batched effects too
///
/// Used where `flush_effects()` cannot run right away, e.g. a transaction
/// ending inside an effect.
pub(crate) fn request_full_flush() {
    FULL_FLUSH_REQUESTED.with(|requested| requested.set(true));
}

struct FlushingGuard;

impl Drop for FlushingGuard {
    fn drop(&mut self) {
        FLUSHING.with(|flushing| flushing.set(false));
    }
}

/// Called by signals after they marked at least one effect Dirty.
///
/// Sync effects are flushed right away unless a transaction is open or an
/// effect is running on this thread; in both cases the enclosing flush (or
/// the transaction exit) picks them up.
pub(crate) fn effects_marked_pending(any_sync: bool) {
    schedule_effect_processing();

    if any_sync && !is_transaction_active() && !is_running_effect() {
        flush_sync_effects();
    }
}

/// Flush sync effects queued while this thread was busy, once it no longer is.
pub(crate) fn flush_sync_if_idle() {
    if is_transaction_active() || is_running_effect() {
        return;
    }

    if FULL_FLUSH_REQUESTED.with(Cell::get) || has_pending_sync_effects() {
        flush_sync_effects();
    }
}

/// Process all pending effects immediately
///
/// Runs sync and batched effects alike until nothing is pending, including
/// effects made pending by the effects that ran. Returns the number of
/// effects run. Called from inside a running flush it returns 0: the outer
/// loop already drains everything.
///
/// # Example
///
/// ```ignore
/// signal.emit();
/// flush_effects();  // All pending effects run now
///
/// // Or integrate into an event loop
/// loop {
///     handle_events();
///     flush_effects();
/// }
/// ```
pub fn flush_effects() -> usize {
    PROCESSING_SCHEDULED.with(|scheduled| scheduled.set(false));
    process_pending(take_pending_effects)
}

/// Process only sync effects, leaving batched ones queued.
pub(crate) fn flush_sync_effects() -> usize {
    process_pending(take_pending_sync_effects)
}

/// Part of a taken batch that has not run yet.
///
/// If a callback unwinds, the rest of the batch goes back to the pending
/// set: those effects are still Dirty, so no emission would queue them again.
struct UnrunBatch {
    remaining: std::vec::IntoIter<EffectId>,
}

impl Drop for UnrunBatch {
    fn drop(&mut self) {
        let unrun: Vec<EffectId> = self.remaining.by_ref().collect();
        if !unrun.is_empty() {
            cov_mark::hit!(unrun_effects_requeued);
            requeue_pending_effects(unrun);
            schedule_effect_processing();
        }
    }
}

/// Fixed-point loop over the pending set.
fn process_pending(take: fn() -> Vec<EffectId>) -> usize {
    if FLUSHING.with(|flushing| flushing.replace(true)) {
        cov_mark::hit!(flush_reentry_deferred);
        return 0;
    }
    let _flushing = FlushingGuard;

    let mut total = 0;
    loop {
        let pending = if FULL_FLUSH_REQUESTED.with(|requested| requested.replace(false)) {
            PROCESSING_SCHEDULED.with(|scheduled| scheduled.set(false));
            take_pending_effects()
        } else {
            take()
        };
        if pending.is_empty() {
            break;
        }

        let mut batch = UnrunBatch {
            remaining: pending.into_iter(),
        };
        while let Some(effect_id) = batch.remaining.next() {
            if effect_id.state() != ReactiveState::Clean {
                run_single_effect(effect_id);
                total += 1;
            }
        }
    }

    total
}

/// Run a single effect by its ID
///
/// 1. Skip if the effect is gone
/// 2. Set state to Clean and leave the pending set
/// 3. Unsubscribe from the sources of the previous run
/// 4. Run the callback with the effect as current effect (dependency tracking)
///    and its owner as current scope (ownership of whatever it creates)
pub fn run_single_effect(effect_id: EffectId) {
    if !effect_id.is_alive() {
        return;
    }

    effect_id.set_state(ReactiveState::Clean);
    remove_from_pending_set(effect_id);

    for source_id in effect_id.take_sources() {
        source_id.remove_subscriber(effect_id);
    }

    // Guards restore the previous context even if the callback panics
    let _depth = RunDepthGuard::enter();
    let _effect = CurrentEffectGuard::new(Some(effect_id));
    let _scope = CurrentScopeGuard::new(effect_id.owner());

    effect_id.run_callback();
}

/// Run a closure without tracking dependencies
///
/// # Example
/// ```ignore
/// let effect = Effect::new(move || {
///     // Tracked: the effect re-runs when signal1 changes
///     signal1.track_dependency();
///
///     // Not tracked
///     untracked(|| signal2.track_dependency());
/// });
/// ```
pub fn untracked<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = CurrentEffectGuard::new(None);
    f()
}

/// Side-effectful computation that automatically re-runs when dependencies change
///
/// # How it works
/// 1. Effect runs immediately on creation, tracking all `signal.track_dependency()` calls
/// 2. When any tracked signal changes, the effect is marked pending
/// 3. Sync effects run as soon as the emission completes; batched effects wait
///    for `flush_effects()` or the end of a transaction
///
/// # Ownership
/// An effect created while a [`Scope`](crate::Scope) is current belongs to
/// that scope: dropping the `Effect` handle leaves it running and disposing
/// the scope stops it. An effect created outside any scope stops when its
/// handle is dropped.
///
/// # Example
/// ```ignore
/// let effect = Effect::new(|| {
///     voltage_signal.track_dependency();
///     println!("Power: {}", voltage * current);
/// });
///
/// voltage_signal.emit();  // Effect marked pending
/// voltage_signal.emit();  // Already pending, skipped
///
/// flush_effects();  // Effect runs once with final values
/// ```
pub struct Effect {
    id: EffectId,
}

impl Effect {
    /// Create a new batched effect (runs immediately)
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::with_flush(FlushMode::Batched, f)
    }

    /// Create a new effect that re-runs as soon as a dependency emits
    pub fn new_sync<F>(f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::with_flush(FlushMode::Sync, f)
    }

    /// Create a new effect with an explicit flush policy (runs immediately)
    pub fn with_flush<F>(flush: FlushMode, f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let id = effect_arena_insert(EffectMetadata::new(Box::new(f), flush));

        if let Some(owner) = current_scope() {
            if owner.add_effect(id) {
                id.set_owner(owner);
            } else {
                tracing::warn!(
                    scope = ?owner,
                    "effect created inside a disposed scope; it is owned by its handle"
                );
            }
        }

        let effect = Self { id };
        effect.run_now();
        effect
    }

    /// Run this effect immediately, then flush sync effects it made pending
    pub(crate) fn run_now(&self) {
        run_single_effect(self.id);
        flush_sync_if_idle();
    }

    /// Mark this effect Dirty as if a dependency had emitted
    pub fn invalidate(&self) {
        if let Some(flush) = mark_effect_pending(self.id) {
            effects_marked_pending(flush == FlushMode::Sync);
        }
    }

    /// Stop this effect now, whoever owns it
    pub fn dispose(self) {
        destroy_effect(self.id);
    }

    /// Whether the effect has not been destroyed
    pub fn is_alive(&self) -> bool {
        self.id.is_alive()
    }

    /// Get the EffectId for this effect (internal use only)
    pub(crate) fn id(&self) -> EffectId {
        self.id
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        // Scope-owned effects live until their scope is disposed
        if self.id.owner().is_some() {
            return;
        }

        destroy_effect(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Signal;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn effect_debounces_rapid_invalidations() {
        let run_count = Arc::new(AtomicUsize::new(0));
        let run_count_clone = run_count.clone();

        let effect = Effect::new(move || {
            run_count_clone.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(run_count.load(Ordering::Relaxed), 1);

        for _ in 0..20 {
            effect.invalidate();
        }

        flush_effects();

        // Total: 1 initial + 1 debounced = 2 runs
        assert_eq!(run_count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn batched_effect_waits_for_flush() {
        let signal = Signal::new();
        let signal_id = signal.node_id();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = counter.clone();
        let _effect = Effect::new(move || {
            signal_id.track_dependency();
            counter_clone.fetch_add(1, Ordering::Relaxed);
        });

        signal.emit();
        signal.emit();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert!(is_processing_scheduled());

        flush_effects();
        assert_eq!(counter.load(Ordering::Relaxed), 2);
        assert!(!is_processing_scheduled());
    }

    #[test]
    fn sync_effect_runs_on_emit() {
        let signal = Signal::new();
        let signal_id = signal.node_id();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = counter.clone();
        let _effect = Effect::new_sync(move || {
            signal_id.track_dependency();
            counter_clone.fetch_add(1, Ordering::Relaxed);
        });

        signal.emit();
        assert_eq!(counter.load(Ordering::Relaxed), 2);

        signal.emit();
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn untracked_reads_do_not_subscribe() {
        let signal = Signal::new();
        let signal_id = signal.node_id();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = counter.clone();
        let effect = Effect::new_sync(move || {
            untracked(|| signal_id.track_dependency());
            counter_clone.fetch_add(1, Ordering::Relaxed);
        });

        signal.emit();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert_eq!(effect.id().source_count(), 0);
    }

    #[test]
    fn dropping_unowned_effect_stops_it() {
        let signal = Signal::new();
        let signal_id = signal.node_id();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = counter.clone();
        let effect = Effect::new_sync(move || {
            signal_id.track_dependency();
            counter_clone.fetch_add(1, Ordering::Relaxed);
        });
        let id = effect.id();
        drop(effect);

        signal.emit();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert!(!id.is_alive());
    }

    #[test]
    fn emission_inside_effect_is_deferred_to_the_loop() {
        let trigger = Signal::new();
        let trigger_id = trigger.node_id();
        let relay = Arc::new(Signal::new());
        let relay_id = relay.node_id();

        let downstream_runs = Arc::new(AtomicUsize::new(0));
        let downstream_clone = downstream_runs.clone();
        let _downstream = Effect::new_sync(move || {
            relay_id.track_dependency();
            downstream_clone.fetch_add(1, Ordering::Relaxed);
        });

        let relay_clone = relay.clone();
        let _upstream = Effect::new_sync(move || {
            trigger_id.track_dependency();
            relay_clone.emit();
        });
        // The creation run of upstream emitted once
        assert_eq!(downstream_runs.load(Ordering::Relaxed), 2);

        trigger.emit();
        assert_eq!(downstream_runs.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn flush_inside_flush_is_deferred() {
        cov_mark::check!(flush_reentry_deferred);

        let signal = Signal::new();
        let signal_id = signal.node_id();
        let nested = Arc::new(AtomicUsize::new(usize::MAX));

        let nested_clone = nested.clone();
        let _effect = Effect::new(move || {
            signal_id.track_dependency();
            nested_clone.store(flush_effects(), Ordering::Relaxed);
        });

        signal.emit();
        flush_effects();
        assert_eq!(nested.load(Ordering::Relaxed), 0);
    }
}
