use crate::arena::{
    SignalId, SignalMetadata, current_effect, signal_arena_insert, signal_arena_remove,
};

/// Lightweight reactive marker that tracks dependencies without owning data
///
/// Your values stay in your own structs; the signal only records who read
/// them and tells those readers when they change.
///
/// # Usage
/// ```ignore
/// struct Counter {
///     value: u64,
///     signal: Signal,
/// }
///
/// impl Counter {
///     fn set(&mut self, v: u64) {
///         self.value = v;
///         self.signal.emit();
///     }
///
///     fn get(&self) -> u64 {
///         self.signal.track_dependency();
///         self.value
///     }
/// }
/// ```
pub struct Signal {
    node_id: SignalId,
}

impl Signal {
    /// Create a new signal and allocate it in the arena
    pub fn new() -> Self {
        let node_id = signal_arena_insert(SignalMetadata::new());
        Signal { node_id }
    }

    /// Get the node ID for this signal (internal use only)
    pub(crate) fn node_id(&self) -> SignalId {
        self.node_id
    }

    /// Track this signal as a dependency (if an effect is currently executing)
    pub fn track_dependency(&self) {
        self.node_id.track_dependency();
    }

    /// Emit a change notification to every subscriber
    ///
    /// Subscribers are marked Dirty. Sync subscribers run before this returns,
    /// unless a transaction is open or an effect is running on this thread.
    pub fn emit(&self) {
        if let Some(effect_id) = current_effect() {
            // An effect reading and writing the same signal would loop forever
            if effect_id.has_source(self.node_id) {
                tracing::warn!(
                    effect = ?effect_id,
                    signal = ?self.node_id,
                    "effect both reads and writes a signal; treating the read as untracked"
                );
                self.node_id.remove_subscriber(effect_id);
                effect_id.remove_source(self.node_id);
            }
        }

        self.node_id.notify_subscribers();
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        // Remove this signal from the source list of every subscriber
        self.node_id.with_subscribers(|subscribers| {
            for effect_id in subscribers {
                effect_id.remove_source(self.node_id);
            }
        });

        signal_arena_remove(self.node_id);
    }
}

// NOTE: Signal intentionally does NOT implement Clone.
// Cloning would free the same arena slot twice on drop.
// Share it through Arc<Signal> instead.

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}
