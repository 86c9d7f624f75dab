// Effect arena - storage for effect metadata
//
// EffectMetadata holds everything the scheduler needs to re-run an effect:
// - sources: the signals read during the last run (HashSet)
// - state: Clean/Dirty
// - flush: whether the effect runs on emission (Sync) or on an explicit flush (Batched)
// - callback: the effect function stored directly in the arena
//
// Ownership by scopes is kept out of the metadata in the EFFECT_OWNER index,
// the same way the scope arena keeps the reverse edge in its own node.

use crate::hash::{FastHashBuilder, FastIndexSet};
use papaya::HashMap as PapayaHashMap;
use parking_lot::{Mutex, RwLock};
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU8, Ordering};

use super::{ScopeId, SignalId, next_generation};

/// Reactive node states - uses u8 for AtomicU8 compatibility
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReactiveState {
    /// Ran since its sources last changed
    Clean = 0,
    /// A source changed, must re-run
    Dirty = 1,
}

impl ReactiveState {
    /// Convert from u8 to ReactiveState
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => ReactiveState::Clean,
            _ => ReactiveState::Dirty,
        }
    }
}

/// When a Dirty effect gets to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlushMode {
    /// Run as soon as the outermost emission (or transaction) completes.
    Sync,
    /// Wait for [`flush_effects`](crate::flush_effects) or the end of a transaction.
    Batched,
}

/// Global effect arena - stores all effect metadata
static EFFECT_ARENA: RwLock<Slab<EffectMetadata>> = RwLock::new(Slab::new());

// Global map: EffectId -> owning ScopeId
// Effects created outside any scope have no entry.
static EFFECT_OWNER: LazyLock<PapayaHashMap<EffectId, ScopeId>> =
    LazyLock::new(PapayaHashMap::new);

thread_local! {
    // Effect whose callback is executing on this thread (dependency tracking)
    static CURRENT_EFFECT: Cell<Option<EffectId>> = const { Cell::new(None) };

    // Effects marked Dirty on this thread and not yet run, in marking order
    static PENDING_EFFECTS: RefCell<FastIndexSet<EffectId>> =
        RefCell::new(FastIndexSet::default());
}

/// Get the currently executing effect (if any)
pub fn current_effect() -> Option<EffectId> {
    CURRENT_EFFECT.with(Cell::get)
}

/// Set the currently executing effect, returning the previous one
pub fn set_current_effect(effect_id: Option<EffectId>) -> Option<EffectId> {
    CURRENT_EFFECT.with(|c| c.replace(effect_id))
}

/// RAII guard that restores CURRENT_EFFECT when dropped.
/// This ensures CURRENT_EFFECT is always restored even if callback panics.
pub struct CurrentEffectGuard {
    previous: Option<EffectId>,
}

impl CurrentEffectGuard {
    /// Sets CURRENT_EFFECT to `new_value` until the guard drops.
    pub fn new(new_value: Option<EffectId>) -> Self {
        let previous = set_current_effect(new_value);
        Self { previous }
    }
}

impl Drop for CurrentEffectGuard {
    fn drop(&mut self) {
        set_current_effect(self.previous);
    }
}

/// Identifier for an effect node in the arena.
///
/// A slab index plus the generation the node was inserted with. Once the
/// effect is destroyed every accessor returns None (or a default), even if
/// the slot has been reused by a newer effect.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct EffectId {
    index: u32,
    generation: u32,
}

impl EffectId {
    /// Convert to usize for slab indexing
    pub fn index(self) -> usize {
        self.index as usize
    }

    /// Access the effect metadata with a closure (read-only)
    ///
    /// Returns None if the effect has been removed (stale access).
    pub fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&EffectMetadata) -> R,
    {
        let arena = EFFECT_ARENA.read();
        arena
            .get(self.index())
            .filter(|metadata| metadata.generation == self.generation)
            .map(f)
    }

    /// Whether the effect still exists
    pub fn is_alive(self) -> bool {
        self.with(|_| ()).is_some()
    }

    /// Add a source to this effect's dependency list (no duplicates via HashSet)
    pub fn add_source(self, source: SignalId) -> Option<()> {
        self.with(|metadata| {
            metadata.sources.write().insert(source);
        })
    }

    /// Remove a specific source from this effect's dependency list
    pub fn remove_source(self, source: SignalId) -> Option<()> {
        self.with(|metadata| {
            metadata.sources.write().remove(&source);
        })
    }

    /// Check if a signal is a source (dependency) of this effect
    pub fn has_source(self, signal_id: SignalId) -> bool {
        self.with(|metadata| metadata.sources.read().contains(&signal_id))
            .unwrap_or(false)
    }

    /// Number of signals read during the last run
    pub fn source_count(self) -> usize {
        self.with(|metadata| metadata.sources.read().len())
            .unwrap_or(0)
    }

    /// Drain the source list, leaving the effect with no dependencies
    pub fn take_sources(self) -> Vec<SignalId> {
        self.with(|metadata| metadata.sources.write().drain().collect())
            .unwrap_or_default()
    }

    /// Get the current reactive state of this effect
    ///
    /// Returns Clean if the effect has been removed (stale access).
    pub fn state(self) -> ReactiveState {
        self.with(EffectMetadata::get_state)
            .unwrap_or(ReactiveState::Clean)
    }

    /// Set the reactive state
    pub fn set_state(self, state: ReactiveState) {
        self.with(|metadata| metadata.set_state(state));
    }

    /// Check if this effect needs to run (state != Clean)
    pub fn needs_work(self) -> bool {
        self.state() != ReactiveState::Clean
    }

    /// Flush policy of this effect, None once it is gone
    pub fn flush_mode(self) -> Option<FlushMode> {
        self.with(|metadata| metadata.flush)
    }

    /// Scope that owns this effect, if it was created inside one
    pub fn owner(self) -> Option<ScopeId> {
        let guard = EFFECT_OWNER.pin();
        guard.get(&self).copied()
    }

    /// Record the owning scope in the global EFFECT_OWNER map
    pub fn set_owner(self, scope: ScopeId) {
        let guard = EFFECT_OWNER.pin();
        guard.insert(self, scope);
    }

    /// Run the callback stored in the arena for this effect.
    ///
    /// The callback is taken out of the arena while it runs: it may create
    /// or destroy effects, which needs the arena write lock. A drop guard
    /// puts it back (even on panic) unless the effect was destroyed meanwhile.
    pub fn run_callback(self) {
        /// Guard that restores a callback to the arena on drop (even on panic)
        struct CallbackGuard {
            effect_id: EffectId,
            callback: Option<Box<dyn FnMut() + Send>>,
        }

        impl Drop for CallbackGuard {
            fn drop(&mut self) {
                if let Some(cb) = self.callback.take() {
                    self.effect_id.with(move |meta| {
                        *meta.callback.lock() = Some(cb);
                    });
                }
            }
        }

        let callback = self.with(|meta| meta.callback.lock().take()).flatten();
        // Arena lock released - the callback may create or destroy effects

        if let Some(cb) = callback {
            let mut guard = CallbackGuard {
                effect_id: self,
                callback: Some(cb),
            };
            if let Some(cb) = guard.callback.as_mut() {
                cb();
            }
        }
    }

    /// Check if this effect currently holds its callback
    ///
    /// False while the callback is executing and after destruction.
    #[cfg(test)]
    pub fn has_callback(self) -> bool {
        self.with(|metadata| metadata.callback.lock().is_some())
            .unwrap_or(false)
    }
}

/// Metadata for an effect stored in the arena.
pub struct EffectMetadata {
    /// Generation tag copied into the EffectId handed out on insert
    pub(crate) generation: u32,

    /// Clean (0) or Dirty (1)
    pub(crate) state: AtomicU8,

    /// Fixed at creation
    pub(crate) flush: FlushMode,

    /// The effect callback function.
    /// The callback must be Send to be stored in a global static.
    pub(crate) callback: Mutex<Option<Box<dyn FnMut() + Send>>>,

    /// Signals read during the last run.
    pub(crate) sources: RwLock<HashSet<SignalId, FastHashBuilder>>,
}

impl EffectMetadata {
    /// Create new effect metadata (state = Clean) with a fresh generation
    pub fn new(callback: Box<dyn FnMut() + Send>, flush: FlushMode) -> Self {
        Self {
            generation: next_generation(),
            state: AtomicU8::new(ReactiveState::Clean as u8),
            flush,
            callback: Mutex::new(Some(callback)),
            sources: RwLock::new(HashSet::with_hasher(FastHashBuilder)),
        }
    }

    /// Get the current reactive state
    pub fn get_state(&self) -> ReactiveState {
        ReactiveState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Set the reactive state
    pub fn set_state(&self, state: ReactiveState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Set the reactive state, returning the previous one
    pub fn replace_state(&self, state: ReactiveState) -> ReactiveState {
        ReactiveState::from_u8(self.state.swap(state as u8, Ordering::AcqRel))
    }
}

// Arena manipulation functions

/// Insert effect metadata into the arena and return its ID
pub fn effect_arena_insert(metadata: EffectMetadata) -> EffectId {
    let generation = metadata.generation;
    let mut arena = EFFECT_ARENA.write();
    let entry = arena.vacant_entry();
    let key = entry.key();
    entry.insert(metadata);
    EffectId {
        index: key as u32,
        generation,
    }
}

/// Remove an effect from the arena if `id` still names it
pub fn effect_arena_remove(id: EffectId) -> Option<EffectMetadata> {
    let mut arena = EFFECT_ARENA.write();
    match arena.get(id.index()) {
        Some(metadata) if metadata.generation == id.generation => Some(arena.remove(id.index())),
        _ => None,
    }
}

/// Tear an effect down completely.
///
/// Leaves the pending set and its owner's list, unsubscribes from every
/// source and frees the slot. Destroying a stale id is a no-op.
pub fn destroy_effect(effect_id: EffectId) {
    remove_from_pending_set(effect_id);

    let owner = {
        let guard = EFFECT_OWNER.pin();
        guard.remove(&effect_id).copied()
    };
    if let Some(owner) = owner {
        owner.remove_effect(effect_id);
    }

    for source_id in effect_id.take_sources() {
        source_id.remove_subscriber(effect_id);
    }

    // Dropped here, after the arena lock is released: the callback may own
    // signals or unowned effects whose own Drop needs the arenas.
    let removed = effect_arena_remove(effect_id);
    drop(removed);
}

/// Mark an effect Dirty and queue it on this thread.
///
/// Returns the effect's flush mode if it was newly marked, None if it was
/// already Dirty or no longer exists.
pub fn mark_effect_pending(effect_id: EffectId) -> Option<FlushMode> {
    let flush = effect_id
        .with(|metadata| {
            (metadata.replace_state(ReactiveState::Dirty) != ReactiveState::Dirty)
                .then_some(metadata.flush)
        })
        .flatten()?;

    PENDING_EFFECTS.with(|pending| pending.borrow_mut().insert(effect_id));
    Some(flush)
}

/// Take every pending effect, in marking order.
pub fn take_pending_effects() -> Vec<EffectId> {
    PENDING_EFFECTS.with(|pending| pending.borrow_mut().drain(..).collect())
}

/// Take the pending effects that flush on emission, leaving batched ones queued.
///
/// Stale ids are taken too; running them is a no-op.
pub fn take_pending_sync_effects() -> Vec<EffectId> {
    PENDING_EFFECTS.with(|pending| {
        let mut taken = Vec::new();
        pending.borrow_mut().retain(|effect_id| {
            if effect_id.flush_mode() == Some(FlushMode::Batched) {
                true
            } else {
                taken.push(*effect_id);
                false
            }
        });
        taken
    })
}

/// Whether any queued effect flushes on emission
pub fn has_pending_sync_effects() -> bool {
    PENDING_EFFECTS.with(|pending| {
        pending
            .borrow()
            .iter()
            .any(|effect_id| effect_id.flush_mode() == Some(FlushMode::Sync))
    })
}

/// Queue again effects that were taken but never ran. Only Dirty ones go back.
pub fn requeue_pending_effects(effect_ids: impl IntoIterator<Item = EffectId>) {
    PENDING_EFFECTS.with(|pending| {
        let mut pending = pending.borrow_mut();
        for effect_id in effect_ids {
            if effect_id.state() == ReactiveState::Dirty {
                pending.insert(effect_id);
            }
        }
    });
}

/// Remove an effect from the pending set (used when effect is run or destroyed).
pub fn remove_from_pending_set(effect_id: EffectId) {
    PENDING_EFFECTS.with(|pending| {
        pending.borrow_mut().shift_remove(&effect_id);
    });
}
