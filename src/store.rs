use crate::Signal;
use crate::hash::FastIndexMap;
use parking_lot::RwLock;
use std::hash::Hash;

/// Reactive ordered mapping from keys to values
///
/// Two signals back the store:
/// - the structure signal emits when the key set changes (a new key, a
///   removal, a clear, a replace with a different key set)
/// - the values signal emits when a value changes under an existing key
///
/// [`keys`](KeyedStore::keys) tracks structure only, so an effect that only
/// cares about which keys exist is not re-run by value updates.
///
/// Keys iterate in insertion order. No lock is held while a signal emits, so
/// effects woken by a change can read the store freely.
///
/// # Example
/// ```ignore
/// let store = KeyedStore::new();
/// store.insert("a", 1);      // structure changed
/// store.insert("a", 2);      // values changed
/// store.update(&"a", |v| *v += 1);
/// assert_eq!(store.get(&"a"), Some(3));
/// ```
pub struct KeyedStore<K, V> {
    entries: RwLock<FastIndexMap<K, V>>,
    structure: Signal,
    values: Signal,
}

impl<K, V> KeyedStore<K, V>
where
    K: Clone + Eq + Hash,
{
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FastIndexMap::default()),
            structure: Signal::new(),
            values: Signal::new(),
        }
    }

    /// Create a store holding `entries`, without emitting
    pub fn from_entries(entries: impl IntoIterator<Item = (K, V)>) -> Self {
        let store = Self::new();
        store.entries.write().extend(entries);
        store
    }

    /// Insert or overwrite a value, returning the previous one
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let previous = self.entries.write().insert(key, value);

        match previous {
            Some(_) => self.values.emit(),
            None => self.structure.emit(),
        }
        previous
    }

    /// Remove a key, returning its value
    ///
    /// Later keys keep their relative order.
    pub fn remove(&self, key: &K) -> Option<V> {
        let removed = self.entries.write().shift_remove(key);

        if removed.is_some() {
            self.structure.emit();
        }
        removed
    }

    /// Modify the value under `key` in place
    ///
    /// Returns None (and emits nothing) if the key is absent.
    pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let result = self.entries.write().get_mut(key).map(f);

        if result.is_some() {
            self.values.emit();
        }
        result
    }

    /// Replace the whole content
    ///
    /// Emits structure only if the key set differs from the current one,
    /// values otherwise.
    pub fn replace(&self, entries: impl IntoIterator<Item = (K, V)>) {
        let next: FastIndexMap<K, V> = entries.into_iter().collect();

        let structure_changed = {
            let mut current = self.entries.write();
            let changed =
                current.len() != next.len() || next.keys().any(|k| !current.contains_key(k));
            *current = next;
            changed
        };

        if structure_changed {
            self.structure.emit();
        } else {
            self.values.emit();
        }
    }

    /// Remove every entry
    pub fn clear(&self) {
        let was_empty = {
            let mut entries = self.entries.write();
            let was_empty = entries.is_empty();
            entries.clear();
            was_empty
        };

        if !was_empty {
            self.structure.emit();
        }
    }

    /// Current keys in insertion order (tracks structure)
    pub fn keys(&self) -> Vec<K> {
        self.structure.track_dependency();
        self.entries.read().keys().cloned().collect()
    }

    /// Whether `key` is present (tracks structure)
    pub fn contains_key(&self, key: &K) -> bool {
        self.structure.track_dependency();
        self.entries.read().contains_key(key)
    }

    /// Number of entries (tracks structure)
    pub fn len(&self) -> usize {
        self.structure.track_dependency();
        self.entries.read().len()
    }

    /// Whether the store is empty (tracks structure)
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the value under `key` (tracks structure and values)
    pub fn with<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.structure.track_dependency();
        self.values.track_dependency();
        self.entries.read().get(key).map(f)
    }
}

impl<K, V> KeyedStore<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// Clone of the value under `key` (tracks structure and values)
    pub fn get(&self, key: &K) -> Option<V> {
        self.with(key, V::clone)
    }
}

impl<K, V> Default for KeyedStore<K, V>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
