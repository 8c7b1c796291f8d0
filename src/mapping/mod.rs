//! Top-level named B+Tree handle: glues [`crate::btree::BTree`]
//! to the store-backed node cache in [`provider`], giving each named tree
//! its own scoped lifetime -- `open` creates or loads the tree, `Drop`
//! flushes it back to the store.

pub mod codec;
pub mod provider;

use std::cell::RefCell;
use std::rc::Rc;

use crate::btree::{BTree, Range};
use crate::error::Result;
use crate::mapping::codec::Codec;
use crate::mapping::provider::StoreProvider;
use crate::store::Store;
use crate::stream::ByteStream;

/// Builder-style options for [`Mapping::open_with_options`]: the typed
/// equivalent of `Mapping::open`'s `order`/`compress` keyword arguments.
/// Only takes effect when the named tree doesn't already exist in the
/// store -- an existing tree's persisted settings always win.
#[derive(Debug, Clone, Copy, Default)]
pub struct MappingOptions {
    order: Option<usize>,
    compress: Option<u32>,
}

impl MappingOptions {
    pub fn new() -> Self {
        MappingOptions::default()
    }

    /// B+Tree order `m` for a newly created tree.
    pub fn order(mut self, order: usize) -> Self {
        self.order = Some(order);
        self
    }

    /// zlib compression level (`0` disables compression) for a newly
    /// created tree's node payloads.
    pub fn compress(mut self, level: u32) -> Self {
        self.compress = Some(level);
        self
    }
}

/// A named B+Tree persisted inside a [`Store`]. Multiple `Mapping`s can
/// share one store by cloning the same `Rc<RefCell<Store<S>>>`: a store's
/// natural dispose order is every mapping it created, then the store
/// itself. The Rust rendition of that ordering is reference counting --
/// `Store`'s own `Drop` flush only runs once every `Mapping` holding a
/// clone of the `Rc` has already dropped, which for stack-scoped locals
/// is exactly that order.
pub struct Mapping<K, V, S: ByteStream> {
    tree: BTree<K, V, StoreProvider<K, V, S>>,
}

impl<K, V, S> Mapping<K, V, S>
where
    K: Ord + Clone,
    V: Clone,
    S: ByteStream,
{
    /// Open (or create) the tree named `name` inside `store`. `order` and
    /// `compress` only take effect when no tree by that name exists yet;
    /// otherwise the persisted settings and codec types win, and the
    /// supplied codecs are checked against them.
    pub fn open(
        store: Rc<RefCell<Store<S>>>,
        name: Vec<u8>,
        order: Option<usize>,
        key_codec: Box<dyn Codec<K>>,
        value_codec: Box<dyn Codec<V>>,
        compress: Option<u32>,
    ) -> Result<Self> {
        let provider = StoreProvider::open(store, name, order, key_codec, value_codec, compress)?;
        Ok(Mapping { tree: BTree::new(provider) })
    }

    /// Open (or create) the tree named `name`, using a [`MappingOptions`]
    /// builder rather than positional `order`/`compress` arguments.
    pub fn open_with_options(
        store: Rc<RefCell<Store<S>>>,
        name: Vec<u8>,
        key_codec: Box<dyn Codec<K>>,
        value_codec: Box<dyn Codec<V>>,
        options: MappingOptions,
    ) -> Result<Self> {
        Self::open(store, name, options.order, key_codec, value_codec, options.compress)
    }

    /// Number of entries in the tree.
    pub fn len(&self) -> u64 {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        self.tree.get(key)
    }

    pub fn contains_key(&mut self, key: &K) -> bool {
        self.tree.contains_key(key)
    }

    pub fn set(&mut self, key: K, value: V) {
        self.tree.set(key, value)
    }

    pub fn pop(&mut self, key: &K) -> Option<V> {
        self.tree.pop(key)
    }

    /// Iterate `[low, high]` in ascending key order (both bounds inclusive
    /// when present).
    pub fn range(&mut self, low: Option<K>, high: Option<K>) -> Range<'_, K, V, StoreProvider<K, V, S>> {
        self.tree.range(low, high)
    }

    /// Space this tree's own nodes occupy in the store (walks every node).
    pub fn size_on_store(&mut self) -> Result<u64> {
        self.tree.provider_mut().size_on_store()
    }

    /// Flush dirty nodes to the store and persist the state blob. `prune`
    /// evicts the in-memory node cache down to just the root afterward.
    pub fn flush(&mut self, prune: bool) -> Result<()> {
        self.tree.provider_mut().flush(prune)
    }

    /// Completely delete this tree from the store: free every node,
    /// remove the state blob, and reset to a fresh empty tree.
    pub fn drop_all(&mut self) -> Result<()> {
        self.tree.provider_mut().drop_all()
    }
}

/// Flushing on drop means a caller that forgets an explicit `flush()`
/// does not silently lose data. `Drop::drop` cannot propagate a `Result`,
/// so a failure here is logged
/// rather than panicking -- callers that need to observe flush errors
/// should call [`Mapping::flush`] explicitly before the value is dropped.
impl<K, V, S> Drop for Mapping<K, V, S>
where
    K: Ord + Clone,
    V: Clone,
    S: ByteStream,
{
    fn drop(&mut self) {
        if let Err(err) = self.tree.provider_mut().flush(true) {
            tracing::error!(error = %err, "mapping flush on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::codec::{JsonCodec, StructCodec};
    use crate::stream::InMemoryStream;

    fn fresh_store() -> Rc<RefCell<Store<InMemoryStream>>> {
        Rc::new(RefCell::new(Store::open(InMemoryStream::new(), 0).unwrap()))
    }

    #[test]
    fn open_with_options_matches_positional_open() {
        let store = fresh_store();
        let mapping: Mapping<i64, String, InMemoryStream> = Mapping::open_with_options(
            store,
            b"opts".to_vec(),
            Box::new(StructCodec::new()),
            Box::new(JsonCodec),
            MappingOptions::new().order(4).compress(0),
        )
        .unwrap();
        assert!(mapping.is_empty());
    }

    #[test]
    fn open_empty_then_reopen() {
        let store = fresh_store();
        {
            let mapping: Mapping<i64, String, InMemoryStream> = Mapping::open(
                store.clone(),
                b"it_works".to_vec(),
                Some(4),
                Box::new(StructCodec::new()),
                Box::new(JsonCodec),
                Some(0),
            )
            .unwrap();
            assert!(mapping.is_empty());
        }
        let reopened: Mapping<i64, String, InMemoryStream> = Mapping::open(
            store,
            b"it_works".to_vec(),
            None,
            Box::new(StructCodec::new()),
            Box::new(JsonCodec),
            None,
        )
        .unwrap();
        assert_eq!(reopened.len(), 0);
    }

    #[test]
    fn set_get_persist_across_reopen() {
        let store = fresh_store();
        {
            let mut mapping: Mapping<i64, String, InMemoryStream> = Mapping::open(
                store.clone(),
                b"tree".to_vec(),
                Some(7),
                Box::new(StructCodec::new()),
                Box::new(JsonCodec),
                Some(0),
            )
            .unwrap();
            for i in 0..200i64 {
                mapping.set(i, i.to_string());
            }
            mapping.flush(false).unwrap();
        }
        let mut reopened: Mapping<i64, String, InMemoryStream> = Mapping::open(
            store,
            b"tree".to_vec(),
            None,
            Box::new(StructCodec::new()),
            Box::new(JsonCodec),
            None,
        )
        .unwrap();
        assert_eq!(reopened.len(), 200);
        for i in 0..200i64 {
            assert_eq!(reopened.get(&i), Some(i.to_string()));
        }
    }

    #[test]
    fn drop_all_releases_store_space() {
        let store = fresh_store();
        {
            let mut mapping: Mapping<i64, String, InMemoryStream> = Mapping::open(
                store.clone(),
                b"tree".to_vec(),
                Some(7),
                Box::new(StructCodec::new()),
                Box::new(JsonCodec),
                Some(0),
            )
            .unwrap();
            for i in 0..500i64 {
                mapping.set(i, i.to_string());
            }
            mapping.flush(false).unwrap();
            assert!(store.borrow().size() > 0);
            mapping.drop_all().unwrap();
            // Checked immediately after `drop_all`: a later flush on
            // scope exit persists a fresh empty root and is not covered
            // by this assertion.
            assert_eq!(store.borrow().size(), 0);
        }
    }

    /// Repeated `flush(prune=true)` evicts every node but the root, so a
    /// later flush's relocation cascade must reach leaves that are no
    /// longer in the in-memory cache (e.g. a far sibling on the leaf
    /// chain) by loading them from the store rather than assuming they're
    /// already resident.
    #[test]
    fn flush_with_prune_then_more_inserts_stays_consistent() {
        crate::init_test_tracing();
        let store = fresh_store();
        let mut mapping: Mapping<i64, String, InMemoryStream> = Mapping::open(
            store,
            b"tree".to_vec(),
            Some(4),
            Box::new(StructCodec::new()),
            Box::new(JsonCodec),
            Some(0),
        )
        .unwrap();

        for round in 0..20 {
            for i in (round * 25)..(round * 25 + 25) {
                mapping.set(i, i.to_string());
            }
            mapping.flush(true).unwrap();
        }

        assert_eq!(mapping.len(), 500);
        for i in 0..500i64 {
            assert_eq!(mapping.get(&i), Some(i.to_string()));
        }
        let all: Vec<_> = mapping.range(None, None).collect();
        let expected: Vec<_> = (0..500i64).map(|i| (i, i.to_string())).collect();
        assert_eq!(all, expected);
    }
}
