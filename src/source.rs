use crate::{Computed, KeyedStore};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// A reactive container whose key set can be watched
///
/// `current_keys` is a tracked read: called inside an effect, it subscribes
/// the effect to structural changes of the container. Duplicate keys are
/// ignored by consumers; order only fixes the order in which new keys are
/// handled.
pub trait KeySource: Send + Sync + 'static {
    /// Key type of the container
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    /// Read the current key set
    fn current_keys(&self) -> Vec<Self::Key>;
}

impl<K, V> KeySource for KeyedStore<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    type Key = K;

    fn current_keys(&self) -> Vec<K> {
        self.keys()
    }
}

/// A derived key set
impl<K> KeySource for Computed<Vec<K>>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    type Key = K;

    fn current_keys(&self) -> Vec<K> {
        self.get()
    }
}

impl<S: KeySource + ?Sized> KeySource for Arc<S> {
    type Key = S::Key;

    fn current_keys(&self) -> Vec<S::Key> {
        (**self).current_keys()
    }
}
