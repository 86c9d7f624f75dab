use crate::error::ScopeError;
use crate::watch::{WatchOptions, watch};
use crate::{Scope, effect};
use std::fmt::Debug;
use std::hash::Hash;

/// The reactive primitives the reconciler is built on
///
/// Implemented by [`Reaktiv`] for this crate's runtime. Another runtime (or
/// a wrapper around `Reaktiv`, e.g. one that records calls) plugs into the
/// reconciler by implementing this trait.
pub trait ReactiveRuntime: Send + Sync + 'static {
    /// Scope handle. Equality must mean "same scope", never "same slot".
    type Scope: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    /// Create a detached root scope
    fn create_root(&self) -> Self::Scope;

    /// Create a scope owned by `parent`
    fn create_scope(&self, parent: Self::Scope) -> Result<Self::Scope, ScopeError>;

    /// Run `f` with `scope` as the active scope
    fn run_in_scope<T>(&self, scope: Self::Scope, f: impl FnOnce() -> T) -> T;

    /// Dispose `scope`, its children and its owned watchers. Idempotent.
    fn dispose_scope(&self, scope: Self::Scope);

    /// Run `hook` once when `scope` is disposed
    fn register_disposal_hook(
        &self,
        scope: Self::Scope,
        hook: Box<dyn FnOnce() + Send>,
    ) -> Result<(), ScopeError>;

    /// The active scope, if any
    fn current_scope(&self) -> Option<Self::Scope>;

    /// Whether `scope` has not been disposed
    fn is_alive(&self, scope: Self::Scope) -> bool;

    /// Watch `read` for changes, owned by `owner`
    ///
    /// `read` is tracked; `callback` receives each observation and runs
    /// untracked. The watcher stops when `owner` is disposed.
    fn on_change<T, Rd, C>(
        &self,
        owner: Self::Scope,
        read: Rd,
        callback: C,
        options: WatchOptions,
    ) -> Result<(), ScopeError>
    where
        Rd: FnMut() -> T + Send + 'static,
        C: FnMut(T) + Send + 'static;

    /// Run `f` without subscribing the running watcher to what it reads
    fn untracked<T>(&self, f: impl FnOnce() -> T) -> T;
}

/// [`ReactiveRuntime`] over this crate's signals, effects and scopes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reaktiv;

impl ReactiveRuntime for Reaktiv {
    type Scope = Scope;

    fn create_root(&self) -> Scope {
        Scope::new()
    }

    fn create_scope(&self, parent: Scope) -> Result<Scope, ScopeError> {
        Scope::child_of(parent)
    }

    fn run_in_scope<T>(&self, scope: Scope, f: impl FnOnce() -> T) -> T {
        scope.run(f)
    }

    fn dispose_scope(&self, scope: Scope) {
        scope.dispose();
    }

    fn register_disposal_hook(
        &self,
        scope: Scope,
        hook: Box<dyn FnOnce() + Send>,
    ) -> Result<(), ScopeError> {
        scope.on_dispose(hook)
    }

    fn current_scope(&self) -> Option<Scope> {
        Scope::current()
    }

    fn is_alive(&self, scope: Scope) -> bool {
        scope.is_alive()
    }

    fn on_change<T, Rd, C>(
        &self,
        owner: Scope,
        read: Rd,
        callback: C,
        options: WatchOptions,
    ) -> Result<(), ScopeError>
    where
        Rd: FnMut() -> T + Send + 'static,
        C: FnMut(T) + Send + 'static,
    {
        if !owner.is_alive() {
            return Err(ScopeError::Disposed);
        }

        // The scope keeps the watcher, the handle can go
        owner.run(|| drop(watch(read, callback, options)));
        Ok(())
    }

    fn untracked<T>(&self, f: impl FnOnce() -> T) -> T {
        effect::untracked(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Signal;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn watcher_lives_until_owner_disposes() {
        let runtime = Reaktiv;
        let signal = Signal::new();
        let signal_id = signal.node_id();
        let calls = Arc::new(AtomicUsize::new(0));

        let owner = runtime.create_root();
        let calls_clone = calls.clone();
        runtime
            .on_change(
                owner,
                move || signal_id.track_dependency(),
                move |()| {
                    calls_clone.fetch_add(1, Ordering::Relaxed);
                },
                WatchOptions::default(),
            )
            .unwrap();
        assert_eq!(owner.effect_count(), 1);

        signal.emit();
        assert_eq!(calls.load(Ordering::Relaxed), 2);

        runtime.dispose_scope(owner);
        signal.emit();
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn inert_owner_is_rejected() {
        let runtime = Reaktiv;
        let owner = runtime.create_root();
        runtime.dispose_scope(owner);

        let watched = runtime.on_change(owner, || (), |()| {}, WatchOptions::default());
        assert_eq!(watched, Err(ScopeError::Disposed));
        assert_eq!(runtime.create_scope(owner), Err(ScopeError::Disposed));
        assert!(!runtime.is_alive(owner));
    }

    #[test]
    fn run_in_scope_sets_the_current_scope() {
        let runtime = Reaktiv;
        let scope = runtime.create_root();

        assert_eq!(runtime.current_scope(), None);
        assert_eq!(runtime.run_in_scope(scope, || runtime.current_scope()), Some(scope));

        runtime.dispose_scope(scope);
    }
}
