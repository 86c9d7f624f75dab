use crate::arena::FlushMode;
use crate::effect::{Effect, untracked};

/// Options for [`watch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    /// Run the callback for the first observation too
    pub immediate: bool,
    /// When re-runs happen after a change
    pub flush: FlushMode,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            immediate: true,
            flush: FlushMode::Sync,
        }
    }
}

/// Observe `read` and hand each observation to `callback`
///
/// `read` is tracked: whatever it reads becomes a dependency of the watcher.
/// `callback` runs untracked, so reads inside it never re-trigger the watch.
/// With `immediate = false` the first observation only establishes the
/// dependencies and the callback first runs on the next change.
///
/// The watcher is an [`Effect`]: created inside a scope it belongs to that
/// scope, otherwise it stops when the returned handle drops.
///
/// # Example
/// ```ignore
/// let _watcher = watch(
///     move || store.keys(),
///     |keys| println!("keys now {keys:?}"),
///     WatchOptions::default(),
/// );
/// ```
pub fn watch<T, Rd, C>(mut read: Rd, mut callback: C, options: WatchOptions) -> Effect
where
    Rd: FnMut() -> T + Send + 'static,
    C: FnMut(T) + Send + 'static,
{
    let mut first = true;
    Effect::with_flush(options.flush, move || {
        let value = read();

        let skip = std::mem::replace(&mut first, false) && !options.immediate;
        if !skip {
            untracked(|| callback(value));
        }
    })
}
