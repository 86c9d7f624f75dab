use crate::arena::{
    CurrentScopeGuard, ScopeId, create_child_scope, current_scope, dispose_scope,
    scope_arena_insert,
};
use crate::error::ScopeError;

/// Disposable ownership boundary for effects, child scopes and disposal hooks
///
/// A `Scope` is a copyable handle; the scope itself lives in the arena until
/// [`dispose`](Scope::dispose) is called on it or on one of its ancestors.
/// While [`run`](Scope::run) executes, the scope is current: effects and
/// scopes created inside belong to it and [`on_cleanup`] registers on it.
///
/// # Example
/// ```ignore
/// let scope = Scope::new();
/// scope.run(|| {
///     let _effect = Effect::new_sync(|| signal.track_dependency());
///     on_cleanup(|| println!("scope gone"))?;
///     Ok::<_, ScopeError>(())
/// })?;
///
/// scope.dispose(); // effect stopped, "scope gone" printed
/// ```
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Scope {
    id: ScopeId,
}

impl Scope {
    /// Create a detached root scope
    pub fn new() -> Self {
        Self {
            id: scope_arena_insert(None),
        }
    }

    /// Create a scope owned by `parent`; disposing `parent` disposes it too
    pub fn child_of(parent: Scope) -> Result<Self, ScopeError> {
        create_child_scope(parent.id)
            .map(|id| Self { id })
            .ok_or(ScopeError::Disposed)
    }

    /// Create a child of the current scope, or a root if none is current
    pub fn nested() -> Result<Self, ScopeError> {
        match Self::current() {
            Some(parent) => Self::child_of(parent),
            None => Ok(Self::new()),
        }
    }

    /// The scope active on this thread, if any
    pub fn current() -> Option<Self> {
        current_scope().map(|id| Self { id })
    }

    /// Run `f` with this scope as the current scope
    pub fn run<F, R>(self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = CurrentScopeGuard::new(Some(self.id));
        f()
    }

    /// Register a hook to run once when this scope is disposed
    ///
    /// Hooks run in registration order, after owned effects and child scopes
    /// have been torn down.
    pub fn on_dispose<F>(self, hook: F) -> Result<(), ScopeError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.id.add_hook(Box::new(hook)).map_err(|_| {
            tracing::warn!(scope = ?self.id, "disposal hook registered on an inert scope");
            ScopeError::Disposed
        })
    }

    /// Dispose this scope and everything it owns
    ///
    /// Synchronous: when this returns, owned effects no longer run and every
    /// hook has fired. Calling it again is a no-op.
    pub fn dispose(self) {
        dispose_scope(self.id);
    }

    /// Whether the scope exists and has not started disposing
    pub fn is_alive(self) -> bool {
        self.id.is_alive()
    }

    /// Parent scope, None for roots and disposed scopes
    pub fn parent(self) -> Option<Scope> {
        self.id.parent().map(|id| Self { id })
    }

    /// Number of live child scopes
    pub fn child_count(self) -> usize {
        self.id.child_count()
    }

    /// Number of effects owned by this scope
    pub fn effect_count(self) -> usize {
        self.id.effect_count()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

/// Register a disposal hook on the current scope
///
/// Fails with [`ScopeError::NoActiveScope`] outside [`Scope::run`] (or an
/// effect owned by a scope).
pub fn on_cleanup<F>(hook: F) -> Result<(), ScopeError>
where
    F: FnOnce() + Send + 'static,
{
    Scope::current()
        .ok_or(ScopeError::NoActiveScope)?
        .on_dispose(hook)
}
