use crate::arena::{CurrentScopeGuard, FlushMode};
use crate::effect::{flush_sync_if_idle, run_single_effect};
use crate::{Effect, Signal};
use parking_lot::RwLock;
use std::sync::Arc;

/// Memoized derived value that automatically updates when dependencies change
///
/// A Computed is like an Effect that caches its result. It only recomputes when
/// its dependencies change, and only notifies subscribers when the output value
/// actually changes (requires `T: PartialEq`).
///
/// # How it works
/// Internally, a Computed is composed of:
/// - A sync Effect that tracks dependencies and recomputes the value
/// - A Signal that other effects/computeds can subscribe to
/// - A cached value that's only recomputed when dependencies change
///
/// When a dependency changes:
/// 1. The internal Effect re-runs and computes a new value
/// 2. If the new value differs from the cached value, the Signal notifies subscribers
/// 3. If the value is the same, subscribers are NOT notified
///
/// A Computed is never owned by a scope: it lives as long as its `Arc`.
///
/// # Example
/// ```ignore
/// let store = Arc::new(KeyedStore::new());
///
/// let store_clone = store.clone();
/// let even_keys = Computed::new(move || {
///     store_clone.keys().into_iter().filter(|k| k % 2 == 0).collect::<Vec<_>>()
/// });
///
/// store.insert(2, "two");
/// assert_eq!(even_keys.get(), vec![2]);
/// ```
pub struct Computed<T> {
    /// Output signal, dependents subscribe to it through `get()`
    signal: Signal,

    /// Recomputes the value when a dependency emits
    effect: Effect,

    value: Arc<RwLock<Option<T>>>,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Computed<T> {
    /// Create a new computed value
    ///
    /// The computation runs immediately and the result is cached.
    pub fn new<F>(mut f: F) -> Arc<Self>
    where
        F: FnMut() -> T + Send + 'static,
    {
        let signal = Signal::new();
        let signal_id = signal.node_id();
        let value: Arc<RwLock<Option<T>>> = Arc::new(RwLock::new(None));

        let value_for_effect = value.clone();
        let callback = move || {
            let new_value = f();

            let changed = match &*value_for_effect.read() {
                Some(old) => *old != new_value,
                // First computation always "changes"
                None => true,
            };

            if changed {
                *value_for_effect.write() = Some(new_value);
                signal_id.notify_subscribers();
            }
        };

        let effect = {
            let _detached = CurrentScopeGuard::new(None);
            Effect::with_flush(FlushMode::Sync, callback)
        };

        Arc::new(Self {
            signal,
            effect,
            value,
        })
    }

    /// Get the memoized value
    ///
    /// Recomputes first if a dependency emitted and the recomputation has not
    /// run yet (inside a transaction, or while another effect is running).
    /// Inside an effect, the effect subscribes to this computed.
    pub fn get(&self) -> T {
        self.refresh();
        self.signal.track_dependency();

        self.value
            .read()
            .clone()
            .expect("computed value should always be set after creation")
    }

    /// Like [`get`](Self::get) but borrows the cached value
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.refresh();
        self.signal.track_dependency();

        let value = self.value.read();
        f(value
            .as_ref()
            .expect("computed value should always be set after creation"))
    }

    /// Mark the cached value stale as if a dependency had emitted
    pub fn invalidate(&self) {
        self.effect.invalidate();
    }

    fn refresh(&self) {
        let effect_id = self.effect.id();
        if effect_id.needs_work() {
            run_single_effect(effect_id);
            flush_sync_if_idle();
        }
    }
}
