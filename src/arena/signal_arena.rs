// Signal arena - storage for signal metadata
//
// Signals only emit: they keep a set of subscribed effects and nothing else.
// Effects keep the reverse edge (their sources) in the effect arena.

use crate::hash::FastHashBuilder;
use parking_lot::RwLock;
use slab::Slab;
use std::collections::HashSet;

use super::EffectId;
use super::effect_arena::{FlushMode, current_effect, mark_effect_pending};

/// Global signal arena - stores all signal metadata
static SIGNAL_ARENA: RwLock<Slab<SignalMetadata>> = RwLock::new(Slab::new());

/// Unique identifier for a signal node in the arena.
///
/// This is a zero-cost wrapper around a slab index.
/// When a Signal is dropped, it removes itself from the arena,
/// making this SignalId stale. Accessing a stale SignalId returns None.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SignalId(u32);

impl SignalId {
    /// Create a new SignalId from a raw index
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Convert to usize for slab indexing
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Access the signal metadata with a closure (read-only)
    ///
    /// Returns None if the signal has been removed (stale access).
    pub fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&SignalMetadata) -> R,
    {
        let arena = SIGNAL_ARENA.read();
        arena.get(self.index()).map(f)
    }

    /// Subscribe the currently running effect (if any) to this signal.
    pub fn track_dependency(self) {
        if let Some(effect_id) = current_effect() {
            effect_id.add_source(self);
            self.add_subscriber(effect_id);
        }
    }

    /// Add a subscriber to this signal
    pub fn add_subscriber(self, effect_id: EffectId) {
        self.with(|metadata| {
            metadata.subscribers.write().insert(effect_id);
        });
    }

    /// Remove a subscriber from this signal
    pub fn remove_subscriber(self, effect_id: EffectId) {
        self.with(|metadata| {
            metadata.subscribers.write().remove(&effect_id);
        });
    }

    /// Execute a closure with the subscribers of this signal
    pub fn with_subscribers<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&HashSet<EffectId, FastHashBuilder>) -> R,
    {
        self.with(|metadata| {
            let subscribers = metadata.subscribers.read();
            f(&subscribers)
        })
    }

    /// Mark every subscriber Dirty and hand the outcome to the scheduler.
    ///
    /// Subscribers are copied out first: running the scheduler may re-enter
    /// this signal (an effect re-subscribing) and the lock must be free by then.
    pub fn notify_subscribers(self) {
        let subscribers: Vec<EffectId> = self
            .with_subscribers(|subscribers| subscribers.iter().copied().collect())
            .unwrap_or_default();

        let had_subscribers = !subscribers.is_empty();
        let mut marked = false;
        let mut any_sync = false;
        for effect_id in subscribers {
            if let Some(flush) = mark_effect_pending(effect_id) {
                marked = true;
                any_sync |= flush == FlushMode::Sync;
            }
        }

        if marked {
            crate::effect::effects_marked_pending(any_sync);
        } else if had_subscribers {
            // Subscribers already Dirty, e.g. left queued by a flush that unwound
            crate::effect::flush_sync_if_idle();
        }
    }
}

/// Metadata for a signal stored in the arena.
///
/// The signal's value lives outside the arena, next to the Signal that
/// guards it.
#[derive(Debug)]
pub struct SignalMetadata {
    /// Effects subscribed to this signal.
    pub(crate) subscribers: RwLock<HashSet<EffectId, FastHashBuilder>>,
}

impl SignalMetadata {
    /// Create new signal metadata with no subscribers
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashSet::with_hasher(FastHashBuilder)),
        }
    }
}

impl Default for SignalMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Insert a signal into the arena and return its ID
pub fn signal_arena_insert(metadata: SignalMetadata) -> SignalId {
    let mut arena = SIGNAL_ARENA.write();
    let entry = arena.vacant_entry();
    let key = entry.key();
    entry.insert(metadata);
    SignalId::new(key as u32)
}

/// Remove a signal from the arena
pub fn signal_arena_remove(id: SignalId) -> Option<SignalMetadata> {
    let mut arena = SIGNAL_ARENA.write();
    if arena.contains(id.index()) {
        Some(arena.remove(id.index()))
    } else {
        None
    }
}
