#![deny(missing_docs)]

//! Keyed scope reconciliation on standalone fine-grained reactivity.
//!
//! Watch a reactive container of keys and keep exactly one lifetime [`Scope`]
//! per key that is present: a handler runs inside each new scope, and the
//! scope (with every effect and cleanup hook it owns) is disposed the moment
//! its key disappears.
//!
//! # Quick Start
//!
//! ```ignore
//! use reaktiv_keyed::{KeyedStore, Effect, on_cleanup, reconcile};
//! use std::sync::Arc;
//!
//! let rooms = Arc::new(KeyedStore::new());
//!
//! let reconciler = reconcile(rooms.clone(), move |room: &String| {
//!     // Owned by the room's scope, stops when the room is removed
//!     let _presence = Effect::new_sync(|| { /* ... */ });
//!     on_cleanup({
//!         let room = room.clone();
//!         move || println!("left {room}")
//!     })?;
//!     Ok(())
//! });
//!
//! rooms.insert("lobby".to_string(), ());  // handler runs for "lobby"
//! rooms.remove(&"lobby".to_string());     // "left lobby"
//!
//! reconciler.dispose();
//! ```
//!
//! # Core Types
//!
//! - [`Signal`] - Lightweight reactive marker. Call [`emit()`](Signal::emit) when value changes.
//! - [`Effect`] - Side-effectful computation. Auto-runs when dependencies change.
//! - [`Computed<T>`] - Memoized value. Recomputes only when dependencies change.
//! - [`Transaction`] - Batch multiple signal changes into one effect run.
//! - [`Scope`] - Ownership boundary. Disposing it stops its effects and runs its hooks.
//! - [`KeyedStore`] - Reactive ordered map; its key set is a [`KeySource`].
//! - [`Reconciler`] - One scope per key of a [`KeySource`], built by [`reconcile`]
//!   or [`KeyedScopes`].
//!
//! # Scopes
//!
//! ```ignore
//! let scope = Scope::new();
//! scope.run(|| {
//!     let _effect = Effect::new_sync(|| signal.track_dependency());
//!     on_cleanup(|| println!("disposed"))
//! })?;
//! scope.dispose();  // Effect stopped, hook ran
//! ```
//!
//! # Flushing
//!
//! Sync effects (and reconcilers built with the default [`DEFAULT_FLUSH`]) run
//! as soon as an emission completes. Batched ones wait:
//!
//! ```ignore
//! let reconciler = KeyedScopes::new(store.clone())
//!     .flush(FlushMode::Batched)
//!     .run(handler)?;
//!
//! store.insert("a", 1);
//! flush_effects();  // "a" gets its scope now
//! ```
//!
//! # Errors
//!
//! Handlers return `anyhow::Result<()>`. A failing handler leaves its key
//! registered. Failures of [`Reconciler::sync`] are returned; failures of
//! passes run by the watcher go to [`take_uncaught_errors`] and are logged
//! with `tracing::error!`.

// Internal modules
pub(crate) mod arena;
mod computed;
mod effect;
mod error;
mod hash;
mod reconcile;
mod runtime;
mod scope;
mod signal;
mod source;
mod store;
mod transaction;
mod watch;

// Core types
pub use arena::FlushMode;
pub use computed::Computed;
pub use effect::Effect;
pub use scope::{Scope, on_cleanup};
pub use signal::Signal;
pub use transaction::{Transaction, is_transaction_active};

// Key functions
pub use effect::{flush_effects, is_processing_scheduled, untracked};

// Watching and keyed reconciliation
pub use reconcile::{DEFAULT_FLUSH, KeyedScopes, PassReport, Reconciler, reconcile};
pub use runtime::{Reaktiv, ReactiveRuntime};
pub use source::KeySource;
pub use store::KeyedStore;
pub use watch::{WatchOptions, watch};

// Errors
pub use error::{ReconcileError, ScopeError, UNCAUGHT_CAPACITY, take_uncaught_errors};

#[cfg(test)]
mod tests;
