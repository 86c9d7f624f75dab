//! Keyed scope reconciler
//!
//! Keeps one scope alive per key of a watched [`KeySource`]:
//!
//! 1. The reconciler owns a root scope. A watcher owned by the root reads the
//!    source's key set and runs a pass whenever it changes.
//! 2. A pass diffs the key set against the registry (key -> scope). Removed
//!    keys have their scope taken out of the registry and disposed, all of
//!    them before any addition. Added keys get a fresh child scope of the
//!    root, which is registered first and then handed to the handler.
//! 3. Every key scope carries a disposal hook that drops its registry entry
//!    if the entry still names that scope. A scope disposed from the inside
//!    (by its handler, or by whatever the handler hands it to) leaves the
//!    registry, and the key gets a new scope on the next pass where it is
//!    present. A late hook never removes a newer scope for the same key.
//! 4. Disposing the root (through [`Reconciler::dispose`] or through the
//!    parent it was attached to) stops the watcher and disposes every key
//!    scope.
//!
//! Passes never overlap: a pass requested while one runs (a handler that
//! changes the source, a nested [`Reconciler::sync`]) is folded into the
//! running pass, which re-reads the source and diffs again before returning.

use crate::arena::FlushMode;
use crate::error::{ReconcileError, report_uncaught};
use crate::hash::{FastIndexMap, FastIndexSet};
use crate::runtime::{Reaktiv, ReactiveRuntime};
use crate::source::KeySource;
use crate::watch::WatchOptions;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Flush mode used unless [`KeyedScopes::flush`] says otherwise
///
/// Sync: every structural change of the source is reconciled before the
/// change call returns.
pub const DEFAULT_FLUSH: FlushMode = FlushMode::Sync;

type Handler<K> = Box<dyn FnMut(&K) -> anyhow::Result<()> + Send>;

/// What one pass changed, in the order it changed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport<K> {
    /// Keys that got a new scope
    pub added: Vec<K>,
    /// Keys whose scope was disposed
    pub removed: Vec<K>,
}

impl<K> PassReport<K> {
    /// Nothing was created or disposed
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl<K> Default for PassReport<K> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
        }
    }
}

/// Builder for a [`Reconciler`]
///
/// # Example
/// ```ignore
/// let store = Arc::new(KeyedStore::new());
///
/// let reconciler = KeyedScopes::new(store.clone())
///     .parent(app_scope)
///     .flush(FlushMode::Batched)
///     .run(|key| {
///         on_cleanup(move || println!("{key} gone"))?;
///         Ok(())
///     })?;
///
/// store.insert("a", 1);
/// flush_effects(); // "a" gets its scope
/// ```
pub struct KeyedScopes<S, R: ReactiveRuntime = Reaktiv> {
    source: S,
    runtime: R,
    parent: Option<R::Scope>,
    flush: FlushMode,
}

impl<S: KeySource> KeyedScopes<S, Reaktiv> {
    /// Start configuring a reconciler over `source`
    pub fn new(source: S) -> Self {
        Self {
            source,
            runtime: Reaktiv,
            parent: None,
            flush: DEFAULT_FLUSH,
        }
    }
}

impl<S: KeySource, R: ReactiveRuntime> KeyedScopes<S, R> {
    /// Use another runtime
    ///
    /// Resets [`parent`](Self::parent): scope handles are runtime specific.
    pub fn runtime<R2: ReactiveRuntime>(self, runtime: R2) -> KeyedScopes<S, R2> {
        KeyedScopes {
            source: self.source,
            runtime,
            parent: None,
            flush: self.flush,
        }
    }

    /// Attach the reconciler to `scope`: disposing it tears the reconciler down
    ///
    /// Without a parent the reconciler owns a detached root and is torn down
    /// by [`Reconciler::dispose`] or when dropped.
    pub fn parent(mut self, scope: R::Scope) -> Self {
        self.parent = Some(scope);
        self
    }

    /// When passes run after the key set changes
    pub fn flush(mut self, mode: FlushMode) -> Self {
        self.flush = mode;
        self
    }

    /// Create the reconciler and run the first pass
    ///
    /// Handler failures of the first pass (and of every pass triggered by a
    /// change) land in [`take_uncaught_errors`](crate::take_uncaught_errors).
    /// Fails only if the parent is already disposed.
    pub fn run<F>(self, handler: F) -> Result<Reconciler<S, R>, ReconcileError>
    where
        F: FnMut(&S::Key) -> anyhow::Result<()> + Send + 'static,
    {
        let (root, owns_root) = match self.parent {
            Some(parent) => {
                let root = self
                    .runtime
                    .create_scope(parent)
                    .map_err(|_| ReconcileError::Disposed)?;
                (root, false)
            }
            None => (self.runtime.create_root(), true),
        };

        Ok(self.start(root, owns_root, Box::new(handler)))
    }

    fn start(self, root: R::Scope, owns_root: bool, handler: Handler<S::Key>) -> Reconciler<S, R> {
        let flush = self.flush;
        let shared = Arc::new(Shared {
            source: self.source,
            runtime: self.runtime,
            root,
            registry: Mutex::new(FastIndexMap::default()),
            handler: Mutex::new(handler),
            in_pass: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&shared);
        let hooked = shared.runtime.register_disposal_hook(
            root,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.mark_disposed();
                }
            }),
        );

        let watched = hooked.and_then(|()| {
            let reader = shared.clone();
            let driver = shared.clone();
            shared.runtime.on_change(
                root,
                move || reader.source.current_keys(),
                move |keys| {
                    if let Err(error) = driver.pass(keys) {
                        report_uncaught(error);
                    }
                },
                WatchOptions {
                    immediate: true,
                    flush,
                },
            )
        });

        if watched.is_err() {
            tracing::warn!(root = ?root, "reconciler root disposed during setup");
            shared.mark_disposed();
        }

        Reconciler { shared, owns_root }
    }
}

/// Reconcile `source` under a detached root with the default settings
///
/// Shorthand for `KeyedScopes::new(source).run(handler)`; with no parent
/// the setup cannot fail.
pub fn reconcile<S, F>(source: S, handler: F) -> Reconciler<S>
where
    S: KeySource,
    F: FnMut(&S::Key) -> anyhow::Result<()> + Send + 'static,
{
    let builder = KeyedScopes::new(source);
    let root = builder.runtime.create_root();
    builder.start(root, true, Box::new(handler))
}

/// A running keyed scope reconciler
///
/// Dropping a reconciler that owns a detached root disposes it. One attached
/// to a parent keeps running until the parent (or [`dispose`](Self::dispose))
/// tears it down.
pub struct Reconciler<S: KeySource, R: ReactiveRuntime = Reaktiv> {
    shared: Arc<Shared<S, R>>,
    owns_root: bool,
}

impl<S: KeySource, R: ReactiveRuntime> Reconciler<S, R> {
    /// Dispose every key scope and stop watching. Idempotent.
    pub fn dispose(&self) {
        self.shared.runtime.dispose_scope(self.shared.root);
        self.shared.mark_disposed();
    }

    /// Run a pass now, reading the source untracked
    ///
    /// Returns what the pass changed, or the handler failures it collected.
    /// Called from inside a running pass it only asks that pass to diff
    /// again, and returns an empty report.
    pub fn sync(&self) -> Result<PassReport<S::Key>, ReconcileError> {
        if self.is_disposed() {
            return Err(ReconcileError::Disposed);
        }

        let keys = self
            .shared
            .runtime
            .untracked(|| self.shared.source.current_keys());
        self.shared.pass(keys)
    }

    /// Registered keys, in the order their scopes were created
    pub fn keys(&self) -> Vec<S::Key> {
        self.shared.registry.lock().keys().cloned().collect()
    }

    /// Scope registered for `key`
    pub fn scope(&self, key: &S::Key) -> Option<R::Scope> {
        self.shared.registry.lock().get(key).copied()
    }

    /// Whether `key` has a scope
    pub fn contains(&self, key: &S::Key) -> bool {
        self.shared.registry.lock().contains_key(key)
    }

    /// Number of registered keys
    pub fn len(&self) -> usize {
        self.shared.registry.lock().len()
    }

    /// Whether no key is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the reconciler has been torn down
    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Scope owning the watcher and every key scope
    pub fn root(&self) -> R::Scope {
        self.shared.root
    }

    /// The watched source
    pub fn source(&self) -> &S {
        &self.shared.source
    }
}

impl<S: KeySource, R: ReactiveRuntime> Drop for Reconciler<S, R> {
    fn drop(&mut self) {
        if self.owns_root {
            self.dispose();
        }
    }
}

/// State shared by the reconciler handle, the watcher and the disposal hooks
struct Shared<S: KeySource, R: ReactiveRuntime> {
    source: S,
    runtime: R,
    root: R::Scope,
    registry: Mutex<FastIndexMap<S::Key, R::Scope>>,
    handler: Mutex<Handler<S::Key>>,
    in_pass: AtomicBool,
    rerun: AtomicBool,
    disposed: AtomicBool,
}

/// Clears the in-pass flag, even if a handler panics
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S: KeySource, R: ReactiveRuntime> Shared<S, R> {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire) || !self.runtime.is_alive(self.root)
    }

    fn mark_disposed(&self) {
        self.disposed.store(true, Ordering::Release);
        // Key scopes were disposed with the root; whatever is left is stale
        self.registry.lock().clear();
    }

    /// Reconcile the registry against `keys`, then against fresh reads for as
    /// long as nested requests came in.
    fn pass(self: &Arc<Self>, keys: Vec<S::Key>) -> Result<PassReport<S::Key>, ReconcileError> {
        if self.in_pass.swap(true, Ordering::AcqRel) {
            cov_mark::hit!(reconcile_pass_deferred);
            self.rerun.store(true, Ordering::Release);
            return Ok(PassReport::default());
        }
        let _guard = PassGuard(&self.in_pass);

        let mut report = PassReport::default();
        let mut failures = Vec::new();
        let mut keys = keys;
        loop {
            self.rerun.store(false, Ordering::Release);
            if self.is_disposed() {
                break;
            }

            self.apply(keys, &mut report, &mut failures);

            if !self.rerun.swap(false, Ordering::AcqRel) {
                break;
            }
            keys = self.runtime.untracked(|| self.source.current_keys());
        }

        if !report.is_noop() {
            tracing::debug!(
                added = report.added.len(),
                removed = report.removed.len(),
                registered = self.registry.lock().len(),
                "reconcile pass"
            );
        }

        match ReconcileError::collect(failures) {
            Some(error) => Err(error),
            None => Ok(report),
        }
    }

    fn apply(
        self: &Arc<Self>,
        keys: Vec<S::Key>,
        report: &mut PassReport<S::Key>,
        failures: &mut Vec<ReconcileError>,
    ) {
        let current: FastIndexSet<S::Key> = keys.into_iter().collect();

        let stale: Vec<(S::Key, R::Scope)> = self
            .registry
            .lock()
            .iter()
            .filter(|(key, _)| !current.contains(*key))
            .map(|(key, scope)| (key.clone(), *scope))
            .collect();

        for (key, scope) in stale {
            // The entry goes first so the scope's own hook finds nothing to do
            if self.forget(&key, scope) {
                self.runtime.dispose_scope(scope);
                tracing::trace!(key = ?key, "key scope disposed");
                report.removed.push(key);
            }
        }

        for key in current {
            if self.is_disposed() {
                break;
            }
            if self.registry.lock().contains_key(&key) {
                continue;
            }

            let Ok(scope) = self.runtime.create_scope(self.root) else {
                break;
            };
            self.registry.lock().insert(key.clone(), scope);
            if !self.install_removal_hook(&key, scope) {
                self.forget(&key, scope);
                self.runtime.dispose_scope(scope);
                continue;
            }
            tracing::trace!(key = ?key, scope = ?scope, "key scope created");
            report.added.push(key.clone());

            let result = {
                let mut handler = self.handler.lock();
                self.runtime
                    .run_in_scope(scope, || self.runtime.untracked(|| (*handler)(&key)))
            };
            if let Err(source) = result {
                tracing::warn!(key = ?key, error = %source, "handler failed; key stays registered");
                failures.push(ReconcileError::Handler {
                    key: format!("{key:?}"),
                    source,
                });
            }
        }
    }

    /// Drop the entry for `key` if it still names `scope`
    fn forget(&self, key: &S::Key, scope: R::Scope) -> bool {
        let mut registry = self.registry.lock();
        match registry.get(key) {
            Some(registered) if *registered == scope => {
                registry.shift_remove(key);
                true
            }
            Some(_) => {
                cov_mark::hit!(stale_disposal_hook);
                false
            }
            None => false,
        }
    }

    fn install_removal_hook(self: &Arc<Self>, key: &S::Key, scope: R::Scope) -> bool {
        let weak: Weak<Self> = Arc::downgrade(self);
        let key = key.clone();
        self.runtime
            .register_disposal_hook(
                scope,
                Box::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.forget(&key, scope);
                    }
                }),
            )
            .is_ok()
    }
}
