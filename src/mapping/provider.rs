//! Store-backed node cache and the flush/relocation cascade: the hardest
//! part of the system.
//!
//! A node's descriptor changes whenever its serialized size changes enough
//! to move it to a different block -- in practice on nearly every flush,
//! since key/value counts rarely repeat exactly. Every holder of a stale
//! descriptor (the parent's child slot, a leaf's `prev`/`next` neighbor,
//! the persisted root pointer) must be rewritten in the same flush, which
//! is what the cascade below chases down.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use serde::{Deserialize, Serialize};

use crate::btree::bisect_right;
use crate::btree::node::{Node, NodeRef};
use crate::btree::provider::Provider;
use crate::descriptor::Block;
use crate::error::{Error, Result};
use crate::mapping::codec::{check_type_name, Codec};
use crate::serialize::{read_u64_list, write_u64_list};
use crate::store::Store;
use crate::stream::ByteStream;

const DEFAULT_ORDER: usize = 128;
const DEFAULT_COMPRESS: u32 = 9;

const LEAF_TAG: u8 = 0x01;
const INTERNAL_TAG: u8 = 0x00;
const LEAF_HEADER_SIZE: usize = 16;

/// The B+Tree state blob persisted under the tree's name. Field order is
/// fixed (sorted) so the on-disk bytes are reproducible.
#[derive(Debug, Serialize, Deserialize)]
struct StateJson {
    compress: u32,
    depth: u32,
    key_type: String,
    order: usize,
    root: u64,
    size: u64,
    value_type: String,
}

/// Storage backend for [`crate::btree::BTree`] that keeps nodes as blobs
/// inside a [`Store`], with a write-back cache and batched, relocation-aware
/// `flush()`. Several `Mapping`s opened from the same store share one
/// `Store` via `Rc<RefCell<_>>` -- no internal locking, external exclusion
/// required if embedded in a concurrent host.
pub struct StoreProvider<K, V, S: ByteStream> {
    store: Rc<RefCell<Store<S>>>,
    name: Vec<u8>,
    key_codec: Box<dyn Codec<K>>,
    value_codec: Box<dyn Codec<V>>,

    d2n: HashMap<NodeRef, Node<K, V>>,
    dirty: HashSet<NodeRef>,
    desc_next: NodeRef,

    size: u64,
    depth: u32,
    order: usize,
    compress: u32,
    root_desc: NodeRef,
}

impl<K, V, S> StoreProvider<K, V, S>
where
    K: Ord + Clone,
    V: Clone,
    S: ByteStream,
{
    /// Open (or create) a named B+Tree inside `store`. `order`/`compress`
    /// are only used when no tree named `name` already exists; when one
    /// does, its persisted settings and codec types win (and the supplied
    /// codecs are checked against the persisted `key_type`/`value_type`).
    pub fn open(
        store: Rc<RefCell<Store<S>>>,
        name: Vec<u8>,
        order: Option<usize>,
        key_codec: Box<dyn Codec<K>>,
        value_codec: Box<dyn Codec<V>>,
        compress: Option<u32>,
    ) -> Result<Self> {
        let state_data = store.borrow_mut().load_by_name(&name)?;

        let mut provider = StoreProvider {
            store,
            name,
            key_codec,
            value_codec,
            d2n: HashMap::new(),
            dirty: HashSet::new(),
            desc_next: -1,
            size: 0,
            depth: 1,
            order: order.unwrap_or(DEFAULT_ORDER),
            compress: compress.unwrap_or(DEFAULT_COMPRESS),
            root_desc: 0,
        };

        if state_data.is_empty() {
            let root = Node::new_leaf(Vec::new(), Vec::new());
            let desc = provider.mint_desc();
            provider.d2n.insert(desc, root);
            provider.dirty.insert(desc);
            provider.root_desc = desc;
            return Ok(provider);
        }

        if state_data.len() < 4 {
            return Err(Error::CorruptHeader { expected: 0, actual: 0 });
        }
        let split = state_data.len() - 4;
        let (json_bytes, crc_bytes) = state_data.split_at(split);
        let expected_crc = u32::from_be_bytes(crc_bytes.try_into().unwrap());
        let actual_crc = crc32fast::hash(json_bytes);
        if actual_crc != expected_crc {
            return Err(Error::CorruptHeader { expected: expected_crc, actual: actual_crc });
        }

        let state: StateJson = serde_json::from_slice(json_bytes)?;
        check_type_name(&state.key_type, &provider.key_codec.type_name())?;
        check_type_name(&state.value_type, &provider.value_codec.type_name())?;

        provider.size = state.size;
        provider.depth = state.depth;
        provider.order = state.order;
        provider.compress = state.compress;
        provider.root_desc = state.root as NodeRef;

        provider.load_node(provider.root_desc)?;

        Ok(provider)
    }

    fn mint_desc(&mut self) -> NodeRef {
        let desc = self.desc_next;
        self.desc_next -= 1;
        desc
    }

    fn store_reserve(&self, size: u64, desc: Option<u64>) -> Result<u64> {
        self.store.borrow_mut().reserve(size, desc)
    }

    fn store_save(&self, data: &[u8], desc: Option<u64>) -> Result<u64> {
        self.store.borrow_mut().save(data, desc)
    }

    fn store_load(&self, desc: u64) -> Result<Vec<u8>> {
        self.store.borrow_mut().load(desc)
    }

    fn store_delete(&self, desc: u64) {
        self.store.borrow_mut().delete(desc)
    }

    fn store_save_by_name(&self, data: &[u8]) -> Result<()> {
        self.store.borrow_mut().save_by_name(&self.name, data)
    }

    fn store_load_by_name(&self) -> Result<Vec<u8>> {
        self.store.borrow_mut().load_by_name(&self.name)
    }

    fn store_delete_by_name(&self) {
        self.store.borrow_mut().delete_by_name(&self.name)
    }

    /// Space occupied by this tree's own nodes in the store (walks the
    /// whole tree).
    pub fn size_on_store(&mut self) -> Result<u64> {
        let mut total = 0u64;
        let mut stack = vec![self.root_desc];
        let mut visited = HashSet::new();
        while let Some(desc) = stack.pop() {
            if !visited.insert(desc) {
                continue;
            }
            if desc > 0 {
                total += Block::from_desc(desc as u64)?.size();
            }
            let node = self.load_node(desc)?;
            if !node.is_leaf() {
                stack.extend(node.children());
            }
        }
        Ok(total)
    }

    fn load_node(&mut self, desc: NodeRef) -> Result<Node<K, V>> {
        if let Some(node) = self.d2n.get(&desc) {
            return Ok(node.clone());
        }
        let raw = self.store_load(desc as u64)?;
        let node = self.node_from_bytes(&raw)?;
        self.d2n.insert(desc, node.clone());
        Ok(node)
    }

    fn node_to_bytes(&self, node: &Node<K, V>) -> Result<Vec<u8>> {
        match node {
            Node::Leaf { keys, values, .. } => {
                let body = self.encode_payload(|w| {
                    self.key_codec.write_list(w, keys)?;
                    self.value_codec.write_list(w, values)?;
                    Ok(())
                })?;
                let mut out = Vec::with_capacity(LEAF_HEADER_SIZE + body.len() + 1);
                out.extend_from_slice(&[0u8; LEAF_HEADER_SIZE]);
                out.extend_from_slice(&body);
                out.push(LEAF_TAG);
                Ok(out)
            }
            Node::Internal { keys, children } => {
                let descs: Vec<u64> = children.iter().map(|&d| d as u64).collect();
                let body = self.encode_payload(|w| {
                    self.key_codec.write_list(w, keys)?;
                    write_u64_list(w, &descs)?;
                    Ok(())
                })?;
                let mut out = Vec::with_capacity(body.len() + 1);
                out.extend_from_slice(&body);
                out.push(INTERNAL_TAG);
                Ok(out)
            }
        }
    }

    fn encode_payload(
        &self,
        write: impl FnOnce(&mut dyn std::io::Write) -> Result<()>,
    ) -> Result<Vec<u8>> {
        if self.compress > 0 {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.compress));
            write(&mut encoder)?;
            Ok(encoder.finish()?)
        } else {
            let mut buf = Vec::new();
            write(&mut buf)?;
            Ok(buf)
        }
    }

    fn node_from_bytes(&self, data: &[u8]) -> Result<Node<K, V>> {
        let (tag, rest) = data.split_last().expect("a node blob always carries a tag byte");
        if *tag == LEAF_TAG {
            let prev = u64::from_be_bytes(rest[0..8].try_into().unwrap()) as NodeRef;
            let next = u64::from_be_bytes(rest[8..16].try_into().unwrap()) as NodeRef;
            let body = &rest[LEAF_HEADER_SIZE..];
            let mut reader = self.payload_reader(body);
            let keys = self.key_codec.read_list(reader.as_mut())?;
            let values = self.value_codec.read_list(reader.as_mut())?;
            let mut node = Node::new_leaf(keys, values);
            node.set_prev(prev);
            node.set_next(next);
            Ok(node)
        } else {
            let mut reader = self.payload_reader(rest);
            let keys = self.key_codec.read_list(reader.as_mut())?;
            let descs = read_u64_list(reader.as_mut())?;
            let children: Vec<NodeRef> = descs.into_iter().map(|d| d as NodeRef).collect();
            Ok(Node::new_internal(keys, children))
        }
    }

    fn payload_reader<'a>(&self, body: &'a [u8]) -> Box<dyn std::io::Read + 'a> {
        if self.compress > 0 {
            Box::new(ZlibDecoder::new(body))
        } else {
            Box::new(body)
        }
    }

    /// Re-find `target_desc`'s current parent by descending from the root
    /// along `first_key`: cycles are resolved by re-descent rather than
    /// explicit parent pointers.
    fn find_parent(
        &mut self,
        root_desc: NodeRef,
        target_desc: NodeRef,
        first_key: &K,
    ) -> Result<Option<NodeRef>> {
        let mut parent_desc = root_desc;
        loop {
            let parent = self.load_node(parent_desc)?;
            if parent.is_leaf() {
                return Ok(None);
            }
            let idx = bisect_right(parent.keys(), first_key);
            let child_desc = parent.children()[idx];
            if child_desc == target_desc {
                return Ok(Some(parent_desc));
            }
            parent_desc = child_desc;
        }
    }

    /// Flush dirty nodes to the store and persist the state blob. `prune`
    /// evicts the cache down to just the root afterward.
    pub fn flush(&mut self, prune: bool) -> Result<()> {
        let mut reloc: HashMap<NodeRef, NodeRef> = HashMap::new();
        let mut root_desc = self.root_desc;
        let mut node_queue: HashSet<NodeRef> = HashSet::new();

        self.flush_leaves(&mut reloc, &mut root_desc, &mut node_queue)?;
        self.flush_internals(&mut reloc, &mut root_desc, &mut node_queue)?;

        self.dirty.clear();
        self.root_desc = root_desc;

        if prune {
            let root = self
                .d2n
                .get(&self.root_desc)
                .cloned()
                .expect("root must be cached right after a flush");
            self.d2n.clear();
            self.d2n.insert(self.root_desc, root);
        }

        let state = StateJson {
            compress: self.compress,
            depth: self.depth,
            key_type: self.key_codec.type_name(),
            order: self.order,
            root: self.root_desc as u64,
            size: self.size,
            value_type: self.value_codec.type_name(),
        };
        let json_bytes = serde_json::to_vec(&state)?;
        let crc = crc32fast::hash(&json_bytes);
        let mut state_data = json_bytes;
        state_data.extend_from_slice(&crc.to_be_bytes());

        if self.store_load_by_name()? != state_data {
            self.store_save_by_name(&state_data)?;
        }

        Ok(())
    }

    fn flush_leaves(
        &mut self,
        reloc: &mut HashMap<NodeRef, NodeRef>,
        root_desc: &mut NodeRef,
        node_queue: &mut HashSet<NodeRef>,
    ) -> Result<()> {
        let mut work: Vec<NodeRef> = Vec::new();
        for &desc in &self.dirty {
            let is_leaf = self.d2n.get(&desc).map(|n| n.is_leaf()).unwrap_or(false);
            if is_leaf {
                work.push(desc);
            } else {
                node_queue.insert(desc);
            }
        }

        let mut enqueued: HashSet<NodeRef> = HashSet::new();
        let mut order: Vec<NodeRef> = Vec::new();
        let mut buffers: HashMap<NodeRef, Vec<u8>> = HashMap::new();

        while let Some(desc) = work.pop() {
            if enqueued.contains(&desc) {
                continue;
            }
            enqueued.insert(desc);

            // A sibling queued only because its neighbor relocated may never
            // have been touched by the algorithm this session -- load it on
            // demand rather than assume it's already cached.
            let node = self.load_node(desc)?;
            debug_assert!(node.is_leaf());

            let raw = self.node_to_bytes(&node)?;
            let reserve_desc = if desc > 0 { Some(desc as u64) } else { None };
            let new_desc = self.store_reserve(raw.len() as u64, reserve_desc)? as NodeRef;
            let moved = reserve_desc != Some(new_desc as u64);

            let final_desc = if moved {
                if desc != *root_desc {
                    let first_key = &node.keys()[0];
                    if let Some(parent_desc) = self.find_parent(*root_desc, desc, first_key)? {
                        node_queue.insert(parent_desc);
                    }
                }
                for sibling_desc in [node.prev(), node.next()] {
                    if sibling_desc > 0
                        && !reloc.contains_key(&sibling_desc)
                        && !enqueued.contains(&sibling_desc)
                    {
                        work.push(sibling_desc);
                    }
                }
                reloc.insert(desc, new_desc);
                if desc == *root_desc {
                    *root_desc = new_desc;
                }
                self.d2n.remove(&desc);
                new_desc
            } else {
                desc
            };

            self.d2n.insert(final_desc, node);
            order.push(final_desc);
            buffers.insert(final_desc, raw);
        }

        for final_desc in order {
            let mut raw = buffers.remove(&final_desc).expect("leaf buffer queued above");
            let mut node = self.d2n.remove(&final_desc).expect("leaf flushed above");

            let prev = node.prev();
            let next = node.next();
            let final_prev = reloc.get(&prev).copied().unwrap_or(prev);
            let final_next = reloc.get(&next).copied().unwrap_or(next);
            node.set_prev(final_prev);
            node.set_next(final_next);

            raw[0..8].copy_from_slice(&(final_prev as u64).to_be_bytes());
            raw[8..16].copy_from_slice(&(final_next as u64).to_be_bytes());

            let reserve_desc = if final_desc > 0 { Some(final_desc as u64) } else { None };
            let saved = self.store_save(&raw, reserve_desc)? as NodeRef;
            debug_assert_eq!(saved, final_desc, "leaf must not move between reserve and save");

            self.d2n.insert(final_desc, node);
        }

        Ok(())
    }

    fn flush_internals(
        &mut self,
        reloc: &mut HashMap<NodeRef, NodeRef>,
        root_desc: &mut NodeRef,
        node_queue: &mut HashSet<NodeRef>,
    ) -> Result<()> {
        while let Some(&start) = node_queue.iter().next() {
            node_queue.remove(&start);
            self.flush_internal_subtree(start, reloc, root_desc, node_queue)?;
        }
        Ok(())
    }

    fn flush_internal_subtree(
        &mut self,
        start: NodeRef,
        reloc: &mut HashMap<NodeRef, NodeRef>,
        root_desc: &mut NodeRef,
        node_queue: &mut HashSet<NodeRef>,
    ) -> Result<()> {
        enum Frame {
            Visit(NodeRef),
            Emit(NodeRef),
        }

        let mut stack = vec![Frame::Visit(start)];
        let mut done: HashSet<NodeRef> = HashSet::new();

        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Visit(desc) => {
                    if done.contains(&desc) || reloc.contains_key(&desc) {
                        continue;
                    }
                    stack.push(Frame::Emit(desc));
                    let node = self.d2n.get(&desc).cloned().expect("dirty internal node missing from cache");
                    for &child_desc in node.children() {
                        if node_queue.contains(&child_desc) && !reloc.contains_key(&child_desc) {
                            stack.push(Frame::Visit(child_desc));
                        }
                    }
                }
                Frame::Emit(desc) => {
                    if done.contains(&desc) {
                        continue;
                    }
                    done.insert(desc);
                    node_queue.remove(&desc);

                    let mut node = self.d2n.get(&desc).cloned().expect("dirty internal node missing from cache");
                    {
                        let (_, children) = node.internal_mut();
                        for child in children.iter_mut() {
                            if let Some(&new_child) = reloc.get(child) {
                                *child = new_child;
                            }
                        }
                    }

                    let raw = self.node_to_bytes(&node)?;
                    let reserve_desc = if desc > 0 { Some(desc as u64) } else { None };
                    let new_desc = self.store_save(&raw, reserve_desc)? as NodeRef;
                    let moved = reserve_desc != Some(new_desc as u64);

                    self.d2n.remove(&desc);
                    self.d2n.insert(new_desc, node.clone());

                    if moved {
                        if desc != *root_desc {
                            let first_key = node.keys()[0].clone();
                            if let Some(parent_desc) = self.find_parent(*root_desc, desc, &first_key)? {
                                node_queue.insert(parent_desc);
                            }
                        }
                        reloc.insert(desc, new_desc);
                        if desc == *root_desc {
                            *root_desc = new_desc;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Completely delete this tree from the store: flush, free every node,
    /// remove the state blob, and reset to a fresh empty tree.
    pub fn drop_all(&mut self) -> Result<()> {
        let mut stack = vec![self.root_desc];
        let mut visited = HashSet::new();
        while let Some(desc) = stack.pop() {
            if !visited.insert(desc) {
                continue;
            }
            let node = self.load_node(desc)?;
            if !node.is_leaf() {
                stack.extend(node.children());
            }
            if desc > 0 {
                self.store_delete(desc as u64);
            }
        }
        self.store_delete_by_name();

        self.d2n.clear();
        self.dirty.clear();
        self.size = 0;
        self.depth = 1;
        let root = Node::new_leaf(Vec::new(), Vec::new());
        let desc = self.mint_desc();
        self.d2n.insert(desc, root);
        self.dirty.insert(desc);
        self.root_desc = desc;

        Ok(())
    }
}

impl<K, V, S> Provider<K, V> for StoreProvider<K, V, S>
where
    K: Ord + Clone,
    V: Clone,
    S: ByteStream,
{
    fn size(&self) -> u64 {
        self.size
    }

    fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    fn depth(&self) -> u32 {
        self.depth
    }

    fn set_depth(&mut self, depth: u32) {
        self.depth = depth;
    }

    fn order(&self) -> usize {
        self.order
    }

    fn root_desc(&self) -> NodeRef {
        self.root_desc
    }

    fn set_root_desc(&mut self, desc: NodeRef) {
        self.root_desc = desc;
    }

    fn load(&mut self, desc: NodeRef) -> Node<K, V> {
        self.load_node(desc)
            .expect("store-backed provider given a descriptor it could not load")
    }

    fn put(&mut self, desc: NodeRef, node: Node<K, V>) {
        self.d2n.insert(desc, node);
        self.dirty.insert(desc);
    }

    fn create(&mut self, node: Node<K, V>) -> NodeRef {
        let desc = self.mint_desc();
        self.d2n.insert(desc, node);
        self.dirty.insert(desc);
        desc
    }

    fn release(&mut self, desc: NodeRef) {
        self.d2n.remove(&desc);
        self.dirty.remove(&desc);
        if desc > 0 {
            self.store_delete(desc as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::codec::BytesCodec;
    use crate::stream::InMemoryStream;

    fn fresh_provider() -> StoreProvider<Vec<u8>, Vec<u8>, InMemoryStream> {
        let store = Rc::new(RefCell::new(Store::open(InMemoryStream::new(), 0).unwrap()));
        StoreProvider::open(
            store,
            b"tree".to_vec(),
            Some(4),
            Box::new(BytesCodec),
            Box::new(BytesCodec),
            Some(0),
        )
        .unwrap()
    }

    #[test]
    fn fresh_tree_has_empty_leaf_root() {
        let mut provider = fresh_provider();
        let root = provider.load(provider.root_desc());
        assert!(root.is_leaf());
        assert!(root.keys().is_empty());
    }

    #[test]
    fn created_nodes_get_negative_descriptors() {
        let mut provider = fresh_provider();
        let desc = provider.create(Node::new_leaf(vec![b"a".to_vec()], vec![b"1".to_vec()]));
        assert!(desc < 0);
        assert!(provider.dirty.contains(&desc));
    }

    #[test]
    fn flush_persists_and_reopen_round_trips() {
        let store = Rc::new(RefCell::new(Store::open(InMemoryStream::new(), 0).unwrap()));
        let mut provider = StoreProvider::open(
            store.clone(),
            b"tree".to_vec(),
            Some(4),
            Box::<BytesCodec>::new(BytesCodec),
            Box::<BytesCodec>::new(BytesCodec),
            Some(0),
        )
        .unwrap();

        let root_desc = provider.root_desc();
        let mut root = provider.load(root_desc);
        {
            let (keys, values) = root.leaf_mut();
            keys.push(b"k1".to_vec());
            values.push(b"v1".to_vec());
        }
        provider.put(root_desc, root);
        provider.set_size(1);
        provider.flush(false).unwrap();

        let new_root_desc = provider.root_desc();
        assert!(new_root_desc > 0, "root must be persisted after flush");

        let reopened = StoreProvider::open(
            store,
            b"tree".to_vec(),
            None,
            Box::<BytesCodec>::new(BytesCodec),
            Box::<BytesCodec>::new(BytesCodec),
            None,
        )
        .unwrap();
        assert_eq!(reopened.root_desc(), new_root_desc);
        assert_eq!(reopened.size(), 1);
    }

    #[test]
    fn flush_is_idempotent_when_nothing_changed() {
        let mut provider = fresh_provider();
        provider.flush(false).unwrap();
        let first_root = provider.root_desc();
        provider.flush(false).unwrap();
        assert_eq!(provider.root_desc(), first_root);
    }
}
