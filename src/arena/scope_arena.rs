// Scope arena - storage for scope metadata
//
// A scope is an ownership node. It owns:
// - effects created while it was the current scope
// - child scopes created under it
// - disposal hooks registered on it
//
// Disposing a scope takes everything it owns out of the node under the node's
// lock, marks it disposing, and only then runs effect teardown, child disposal
// and hooks with no lock held. A second dispose sees the disposing flag and
// returns immediately.

use super::effect_arena::{CurrentEffectGuard, destroy_effect};
use super::{EffectId, next_generation};
use parking_lot::{Mutex, RwLock};
use slab::Slab;
use std::cell::Cell;

/// Global scope arena - stores all scope metadata
static SCOPE_ARENA: RwLock<Slab<ScopeMetadata>> = RwLock::new(Slab::new());

thread_local! {
    // Scope that effects, child scopes and hooks attach to on this thread
    static CURRENT_SCOPE: Cell<Option<ScopeId>> = const { Cell::new(None) };
}

/// Callback run once when its scope is disposed.
pub type DisposalHook = Box<dyn FnOnce() + Send>;

/// Get the scope currently active on this thread (if any)
pub fn current_scope() -> Option<ScopeId> {
    CURRENT_SCOPE.with(Cell::get)
}

/// Set the active scope, returning the previous one
pub fn set_current_scope(scope_id: Option<ScopeId>) -> Option<ScopeId> {
    CURRENT_SCOPE.with(|c| c.replace(scope_id))
}

/// RAII guard that restores CURRENT_SCOPE when dropped.
pub struct CurrentScopeGuard {
    previous: Option<ScopeId>,
}

impl CurrentScopeGuard {
    /// Sets CURRENT_SCOPE to `new_value` until the guard drops.
    pub fn new(new_value: Option<ScopeId>) -> Self {
        let previous = set_current_scope(new_value);
        Self { previous }
    }
}

impl Drop for CurrentScopeGuard {
    fn drop(&mut self) {
        set_current_scope(self.previous);
    }
}

/// Identifier for a scope node in the arena.
///
/// Index plus generation: two ids compare equal only if they name the same
/// scope, never a later scope that reused the slot.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ScopeId {
    index: u32,
    generation: u32,
}

/// Everything a scope owns, plus the flag that makes disposal one-shot.
#[derive(Default)]
pub(crate) struct Owned {
    disposing: bool,
    children: Vec<ScopeId>,
    effects: Vec<EffectId>,
    hooks: Vec<DisposalHook>,
}

/// Metadata for a scope stored in the arena.
pub struct ScopeMetadata {
    generation: u32,
    parent: Option<ScopeId>,
    owned: Mutex<Owned>,
}

impl ScopeId {
    /// Convert to usize for slab indexing
    pub fn index(self) -> usize {
        self.index as usize
    }

    /// Access the scope metadata with a closure (read-only)
    ///
    /// Returns None once the scope has been removed (stale access).
    pub fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&ScopeMetadata) -> R,
    {
        let arena = SCOPE_ARENA.read();
        arena
            .get(self.index())
            .filter(|metadata| metadata.generation == self.generation)
            .map(f)
    }

    fn with_owned<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&mut Owned) -> R,
    {
        self.with(|metadata| f(&mut metadata.owned.lock()))
    }

    /// Whether the scope exists and has not started disposing
    pub fn is_alive(self) -> bool {
        self.with_owned(|owned| !owned.disposing).unwrap_or(false)
    }

    /// Parent scope, None for roots and stale ids
    pub fn parent(self) -> Option<ScopeId> {
        self.with(|metadata| metadata.parent).flatten()
    }

    /// Attach a child scope. False if this scope is inert.
    pub fn add_child(self, child: ScopeId) -> bool {
        self.with_owned(|owned| {
            if owned.disposing {
                return false;
            }
            owned.children.push(child);
            true
        })
        .unwrap_or(false)
    }

    /// Forget a child scope (it disposed on its own)
    pub fn remove_child(self, child: ScopeId) {
        self.with_owned(|owned| owned.children.retain(|c| *c != child));
    }

    /// Attach an effect. False if this scope is inert.
    pub fn add_effect(self, effect_id: EffectId) -> bool {
        self.with_owned(|owned| {
            if owned.disposing {
                return false;
            }
            owned.effects.push(effect_id);
            true
        })
        .unwrap_or(false)
    }

    /// Forget an effect (it was destroyed on its own)
    pub fn remove_effect(self, effect_id: EffectId) {
        self.with_owned(|owned| owned.effects.retain(|e| *e != effect_id));
    }

    /// Queue a disposal hook. Hands the hook back if this scope is inert.
    pub fn add_hook(self, hook: DisposalHook) -> Result<(), DisposalHook> {
        let mut hook = Some(hook);
        let accepted = self
            .with_owned(|owned| {
                if owned.disposing {
                    return false;
                }
                owned.hooks.extend(hook.take());
                true
            })
            .unwrap_or(false);

        match hook {
            Some(hook) if !accepted => Err(hook),
            _ => Ok(()),
        }
    }

    /// Number of live child scopes
    pub fn child_count(self) -> usize {
        self.with_owned(|owned| owned.children.len()).unwrap_or(0)
    }

    /// Number of owned effects
    pub fn effect_count(self) -> usize {
        self.with_owned(|owned| owned.effects.len()).unwrap_or(0)
    }

    /// Flip the disposing flag and take ownership of everything the scope holds.
    ///
    /// None if the scope is gone or already disposing.
    fn begin_dispose(self) -> Option<Owned> {
        self.with_owned(|owned| {
            if owned.disposing {
                return None;
            }
            owned.disposing = true;
            Some(Owned {
                disposing: true,
                children: std::mem::take(&mut owned.children),
                effects: std::mem::take(&mut owned.effects),
                hooks: std::mem::take(&mut owned.hooks),
            })
        })
        .flatten()
    }
}

/// Insert a scope node. Roots pass `None`; children go through [`create_child_scope`].
pub fn scope_arena_insert(parent: Option<ScopeId>) -> ScopeId {
    let generation = next_generation();
    let mut arena = SCOPE_ARENA.write();
    let entry = arena.vacant_entry();
    let key = entry.key();
    entry.insert(ScopeMetadata {
        generation,
        parent,
        owned: Mutex::new(Owned::default()),
    });
    ScopeId {
        index: key as u32,
        generation,
    }
}

/// Insert a scope owned by `parent`.
///
/// Returns None if the parent is inert.
pub fn create_child_scope(parent: ScopeId) -> Option<ScopeId> {
    if !parent.is_alive() {
        return None;
    }

    let id = scope_arena_insert(Some(parent));
    if !parent.add_child(id) {
        scope_arena_remove(id);
        return None;
    }

    Some(id)
}

/// Remove a scope from the arena if `id` still names it
fn scope_arena_remove(id: ScopeId) -> Option<ScopeMetadata> {
    let mut arena = SCOPE_ARENA.write();
    match arena.get(id.index()) {
        Some(metadata) if metadata.generation == id.generation => Some(arena.remove(id.index())),
        _ => None,
    }
}

/// Frees the slot and detaches from the parent, even if a hook panics.
struct ReleaseOnDrop(ScopeId);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if let Some(parent) = self.0.parent() {
            parent.remove_child(self.0);
        }
        let removed = scope_arena_remove(self.0);
        drop(removed);
    }
}

/// Dispose a scope and everything it owns, synchronously.
///
/// Order: owned effects are destroyed, child scopes are disposed in creation
/// order, then hooks run in registration order. When this returns the scope
/// is gone from the arena. Disposing an inert scope is a no-op.
///
/// If a hook panics, the hooks after it are dropped without running.
pub fn dispose_scope(scope_id: ScopeId) {
    let Some(owned) = scope_id.begin_dispose() else {
        cov_mark::hit!(scope_dispose_already_inert);
        return;
    };
    let _release = ReleaseOnDrop(scope_id);

    tracing::trace!(
        scope = ?scope_id,
        effects = owned.effects.len(),
        children = owned.children.len(),
        hooks = owned.hooks.len(),
        "disposing scope"
    );

    let Owned {
        children,
        effects,
        hooks,
        ..
    } = owned;

    for effect_id in effects {
        destroy_effect(effect_id);
    }

    for child in children {
        dispose_scope(child);
    }

    // Hooks neither subscribe a running effect nor attach to a scope
    let _effect = CurrentEffectGuard::new(None);
    let _scope = CurrentScopeGuard::new(None);
    for hook in hooks {
        hook();
    }
}
