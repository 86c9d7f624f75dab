//! Zero-sized hash builder and the collection aliases built on it.
//!
//! `FastHashBuilder` is a `BuildHasher` over foldhash with a fixed seed. The
//! runtime uses it for subscriber sets and the pending queue, the reconciler
//! for its key registry. None of these need HashDoS resistance.

use indexmap::{IndexMap, IndexSet};
use std::hash::BuildHasher;

pub use foldhash::fast::{FixedState, FoldHasher};

/// A zero-sized BuildHasher that uses foldhash with a fixed seed.
///
/// # Properties
/// - Zero-sized (`size_of::<FastHashBuilder>()` == 0)
/// - Deterministic (same input = same hash across all instances)
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x517cc1b727220a95).build_hasher()
    }
}

/// Insertion-ordered map hashed with [`FastHashBuilder`].
pub type FastIndexMap<K, V> = IndexMap<K, V, FastHashBuilder>;

/// Insertion-ordered set hashed with [`FastHashBuilder`].
pub type FastIndexSet<T> = IndexSet<T, FastHashBuilder>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_hash_builder_is_zero_sized() {
        assert_eq!(std::mem::size_of::<FastHashBuilder>(), 0);
    }

    #[test]
    fn index_set_keeps_insertion_order() {
        let mut keys = FastIndexSet::default();
        keys.insert("b");
        keys.insert("a");
        keys.insert("b");

        assert_eq!(keys.iter().copied().collect::<Vec<_>>(), vec!["b", "a"]);
    }
}
