// Arena-based storage for reactive node metadata
//
// Three arenas back the runtime:
// - Signal arena: stores SignalMetadata (subscribers)
// - Effect arena: stores EffectMetadata (callback, sources, state, flush mode)
// - Scope arena: stores ScopeMetadata (owned effects, child scopes, disposal hooks)
//
// The arenas are global slabs behind RwLock. Effect and scope ids carry a
// generation next to the slab index so that an id kept past disposal never
// resolves to a newer node that reused the slot.
//
// Scheduling state (pending queue, current effect, current scope) is
// thread-local: effects are flushed on the thread that emitted.

use std::sync::atomic::{AtomicU32, Ordering};

// effect_arena first: signal_arena and scope_arena both refer to EffectId
pub mod effect_arena;
pub mod scope_arena;
pub mod signal_arena;

pub use effect_arena::{
    CurrentEffectGuard, EffectId, EffectMetadata, FlushMode, ReactiveState, current_effect,
    destroy_effect, effect_arena_insert, has_pending_sync_effects, mark_effect_pending,
    remove_from_pending_set, requeue_pending_effects, take_pending_effects,
    take_pending_sync_effects,
};

pub use scope_arena::{
    CurrentScopeGuard, ScopeId, create_child_scope, current_scope, dispose_scope,
    scope_arena_insert,
};

pub use signal_arena::{SignalId, SignalMetadata, signal_arena_insert, signal_arena_remove};

static NEXT_GENERATION: AtomicU32 = AtomicU32::new(1);

/// Hand out the generation tag for a freshly inserted effect or scope.
pub(crate) fn next_generation() -> u32 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}
