//! The provider abstraction the algorithm is generic over: a small
//! interface with an in-memory implementation for tests and a
//! store-backed implementation for production.

use std::collections::HashMap;

use super::node::{Node, NodeRef};

/// Storage backend for [`super::BTree`]'s nodes. A descriptor is whatever
/// [`NodeRef`] the backend uses to address a node: negative and counting
/// down from `-1` for a node created but not yet flushed, a non-negative
/// store descriptor once persisted. `0` always means "no node" (used for
/// `prev`/`next` and for an absent child, though the algorithm itself
/// never stores `0` as a real child reference).
pub trait Provider<K, V> {
    fn size(&self) -> u64;
    fn set_size(&mut self, size: u64);

    fn depth(&self) -> u32;
    fn set_depth(&mut self, depth: u32);

    fn order(&self) -> usize;

    fn root_desc(&self) -> NodeRef;
    fn set_root_desc(&mut self, desc: NodeRef);

    /// Load the node addressed by `desc`. Panics if the descriptor is
    /// dangling -- the algorithm never asks for a descriptor it did not
    /// itself mint or receive from this provider.
    fn load(&mut self, desc: NodeRef) -> Node<K, V>;

    /// Overwrite the node at `desc` and mark it dirty.
    fn put(&mut self, desc: NodeRef, node: Node<K, V>);

    /// Mint a new descriptor for `node`, cache it, mark it dirty, and
    /// return the descriptor. Newly created nodes always get a negative
    /// descriptor: they are never mistaken for persisted blobs until a
    /// flush relocates them.
    fn create(&mut self, node: Node<K, V>) -> NodeRef;

    /// Drop `desc` from the cache/dirty set entirely, freeing its backing
    /// block if it has one.
    fn release(&mut self, desc: NodeRef);
}

/// An in-memory provider, used to test the B+Tree algorithm in isolation
/// from the store.
pub struct MemoryProvider<K, V> {
    nodes: HashMap<NodeRef, Node<K, V>>,
    next_desc: NodeRef,
    root_desc: NodeRef,
    size: u64,
    depth: u32,
    order: usize,
}

impl<K: Clone, V: Clone> MemoryProvider<K, V> {
    pub fn new(order: usize) -> Self {
        let root_desc = -1;
        let mut nodes = HashMap::new();
        nodes.insert(root_desc, Node::new_leaf(Vec::new(), Vec::new()));
        MemoryProvider {
            nodes,
            next_desc: -2,
            root_desc,
            size: 0,
            depth: 1,
            order,
        }
    }
}

impl<K: Clone, V: Clone> Provider<K, V> for MemoryProvider<K, V> {
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
        self.nodes
            .get(&desc)
            .cloned()
            .expect("memory provider given a descriptor it never minted")
    }

    fn put(&mut self, desc: NodeRef, node: Node<K, V>) {
        self.nodes.insert(desc, node);
    }

    fn create(&mut self, node: Node<K, V>) -> NodeRef {
        let desc = self.next_desc;
        self.next_desc -= 1;
        self.nodes.insert(desc, node);
        desc
    }

    fn release(&mut self, desc: NodeRef) {
        self.nodes.remove(&desc);
    }
}
