//! Persistent B-tree: a balanced ordered map whose nodes are blobs.
//!
//! The tree is generic over a [`NodeStore`], which supplies the pointer
//! type. During a snapshot build the store is an in-memory
//! [`ArenaStore`] with cheap mutable pointers; at commit the finished
//! tree is persisted bottom-up into content-addressed `btree_node`
//! blobs, where a pointer is the digest of the node it refers to and
//! nodes are immutable. Leaves are persisted right-to-left so that each
//! can record the digest of its successor, giving ordered traversal a
//! `next`-leaf chain to follow.
//!
//! All node access goes through an LRU cache sized by the tree order
//! (see [`cache`]).

mod cache;
pub use cache::*;

use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::packfile::BlobType;
use crate::repository::Repository;
use crate::Digest;

/// One node, leaf or inner. Inner nodes hold `children.len() - 1` keys,
/// where `keys[i]` is the smallest key reachable through
/// `children[i + 1]`; leaves hold parallel `keys`/`values` plus the
/// pointer to the next leaf in key order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node<K, V, P> {
    pub keys: Vec<K>,
    pub values: Vec<V>,
    pub children: Vec<P>,
    pub next: Option<P>,
}

impl<K, V, P> Node<K, V, P> {
    pub fn empty_leaf() -> Self {
        Node { keys: Vec::new(), values: Vec::new(), children: Vec::new(), next: None }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Where tree nodes live.
pub trait NodeStore<K, V> {
    type Pointer: Clone + Eq + std::hash::Hash + std::fmt::Debug;

    fn get(&self, ptr: &Self::Pointer) -> Result<Node<K, V, Self::Pointer>>;

    /// Write a new node; never updates an existing one.
    fn put(&self, node: Node<K, V, Self::Pointer>) -> Result<Self::Pointer>;

    /// Replace a node in place. Only meaningful for the mutable arena
    /// used while building; content-addressed stores reject it.
    fn update(&self, ptr: &Self::Pointer, node: Node<K, V, Self::Pointer>) -> Result<()>;
}

/// Mutable in-memory node store used during tree construction.
pub struct ArenaStore<K, V> {
    nodes: RwLock<Vec<Node<K, V, u64>>>,
}

impl<K, V> ArenaStore<K, V> {
    pub fn new() -> Self {
        Self { nodes: RwLock::new(Vec::new()) }
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for ArenaStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone, V: Clone> NodeStore<K, V> for ArenaStore<K, V> {
    type Pointer = u64;

    fn get(&self, ptr: &u64) -> Result<Node<K, V, u64>> {
        self.nodes
            .read()
            .unwrap()
            .get(*ptr as usize)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("arena node {}", ptr)))
    }

    fn put(&self, node: Node<K, V, u64>) -> Result<u64> {
        let mut nodes = self.nodes.write().unwrap();
        nodes.push(node);
        Ok((nodes.len() - 1) as u64)
    }

    fn update(&self, ptr: &u64, node: Node<K, V, u64>) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap();
        match nodes.get_mut(*ptr as usize) {
            Some(slot) => {
                *slot = node;
                Ok(())
            }
            None => Err(Error::NotFound(format!("arena node {}", ptr))),
        }
    }
}

/// Content-addressed node store backed by the repository. Pointers are
/// node digests; nodes are immutable once written.
pub struct RepositoryNodeStore<K, V> {
    repository: Arc<Repository>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> RepositoryNodeStore<K, V> {
    pub fn new(repository: Arc<Repository>) -> Self {
        Self { repository, _marker: PhantomData }
    }
}

impl<K, V> NodeStore<K, V> for RepositoryNodeStore<K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    type Pointer = Digest;

    fn get(&self, ptr: &Digest) -> Result<Node<K, V, Digest>> {
        let bytes = self.repository.get_blob(BlobType::BtreeNode, ptr)?;
        rmp_serde::from_slice(&bytes).map_err(|err| Error::decode("btree node", err))
    }

    fn put(&self, node: Node<K, V, Digest>) -> Result<Digest> {
        let bytes = rmp_serde::to_vec(&node).map_err(|err| Error::encode("btree node", err))?;
        self.repository.put_blob(BlobType::BtreeNode, &bytes)
    }

    fn update(&self, _ptr: &Digest, _node: Node<K, V, Digest>) -> Result<()> {
        Err(Error::Usage("content-addressed btree nodes are immutable".to_string()))
    }
}

/// The tree itself. `order` caps the children of an inner node and the
/// keys of a leaf; the node cache is sized to match.
pub struct BTree<K, V, S: NodeStore<K, V>> {
    order: usize,
    root: S::Pointer,
    cache: NodeCache<K, V, S>,
}

impl<K, V, S> BTree<K, V, S>
where
    K: Ord + Clone,
    V: Clone,
    S: NodeStore<K, V>,
{
    /// Create an empty tree in `store`.
    pub fn new(store: S, order: usize) -> Result<Self> {
        if order < 3 {
            return Err(Error::Usage(format!("btree order {} too small", order)));
        }
        let cache = NodeCache::new(store, order);
        let root = cache.put(Node::empty_leaf())?;
        Ok(Self { order, root, cache })
    }

    /// Open an existing tree rooted at `root`.
    pub fn open(store: S, root: S::Pointer, order: usize) -> Result<Self> {
        if order < 3 {
            return Err(Error::Usage(format!("btree order {} too small", order)));
        }
        Ok(Self { order, root, cache: NodeCache::new(store, order) })
    }

    pub fn root(&self) -> &S::Pointer {
        &self.root
    }

    pub fn cache(&self) -> &NodeCache<K, V, S> {
        &self.cache
    }

    /// Insert a key, replacing the value if the key is already present.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        let root = self.root.clone();
        if let Some((separator, right)) = self.insert_at(&root, key, value)? {
            let new_root = Node {
                keys: vec![separator],
                values: Vec::new(),
                children: vec![root, right],
                next: None,
            };
            self.root = self.cache.put(new_root)?;
        }
        Ok(())
    }

    fn insert_at(
        &mut self,
        ptr: &S::Pointer,
        key: K,
        value: V,
    ) -> Result<Option<(K, S::Pointer)>> {
        let mut node = self.cache.get(ptr)?;

        if node.is_leaf() {
            match node.keys.binary_search(&key) {
                Ok(index) => node.values[index] = value,
                Err(index) => {
                    node.keys.insert(index, key);
                    node.values.insert(index, value);
                }
            }

            if node.keys.len() < self.order {
                self.cache.update(ptr, node)?;
                return Ok(None);
            }

            // overfull leaf, split in the middle
            let middle = node.keys.len() / 2;
            let right_keys = node.keys.split_off(middle);
            let right_values = node.values.split_off(middle);
            let separator = right_keys[0].clone();
            let right = Node {
                keys: right_keys,
                values: right_values,
                children: Vec::new(),
                next: node.next.take(),
            };
            let right_ptr = self.cache.put(right)?;
            node.next = Some(right_ptr.clone());
            self.cache.update(ptr, node)?;
            return Ok(Some((separator, right_ptr)));
        }

        let index = match node.keys.binary_search(&key) {
            Ok(index) => index + 1,
            Err(index) => index,
        };
        let child = node.children[index].clone();

        if let Some((separator, right_ptr)) = self.insert_at(&child, key, value)? {
            node.keys.insert(index, separator);
            node.children.insert(index + 1, right_ptr);

            if node.children.len() <= self.order {
                self.cache.update(ptr, node)?;
                return Ok(None);
            }

            // overfull inner node, promote the middle separator
            let middle = node.children.len() / 2;
            let promoted = node.keys.remove(middle - 1);
            let right_keys = node.keys.split_off(middle - 1);
            let right_children = node.children.split_off(middle);
            let right = Node {
                keys: right_keys,
                values: Vec::new(),
                children: right_children,
                next: None,
            };
            let right_ptr = self.cache.put(right)?;
            self.cache.update(ptr, node)?;
            return Ok(Some((promoted, right_ptr)));
        }

        Ok(None)
    }

    pub fn lookup(&self, key: &K) -> Result<Option<V>> {
        let mut ptr = self.root.clone();
        loop {
            let node = self.cache.get(&ptr)?;
            if node.is_leaf() {
                return Ok(node
                    .keys
                    .binary_search(key)
                    .ok()
                    .map(|index| node.values[index].clone()));
            }
            let index = match node.keys.binary_search(key) {
                Ok(index) => index + 1,
                Err(index) => index,
            };
            ptr = node.children[index].clone();
        }
    }

    /// Lazy ordered scan of `[low, high]`.
    pub fn range(&self, low: &K, high: &K) -> Result<Scan<K, V, S>> {
        let mut scan = self.scan_from(Some(low))?;
        scan.high = Some(high.clone());
        Ok(scan)
    }

    /// Lazy ordered scan of the whole tree.
    pub fn scan(&self) -> Result<Scan<K, V, S>> {
        self.scan_from(None)
    }

    fn scan_from(&self, low: Option<&K>) -> Result<Scan<K, V, S>> {
        let mut ptr = self.root.clone();
        loop {
            let node = self.cache.get(&ptr)?;
            if node.is_leaf() {
                let index = match low {
                    Some(low) => match node.keys.binary_search(low) {
                        Ok(index) => index,
                        Err(index) => index,
                    },
                    None => 0,
                };
                return Ok(Scan { tree: self, node: Some(node), index, high: None });
            }
            let index = match low {
                Some(low) => match node.keys.binary_search(low) {
                    Ok(index) => index + 1,
                    Err(index) => index,
                },
                None => 0,
            };
            ptr = node.children[index].clone();
        }
    }

    /// Depth of the leaf level; every leaf sits at the same depth.
    pub fn height(&self) -> Result<usize> {
        let mut height = 0;
        let mut ptr = self.root.clone();
        loop {
            let node = self.cache.get(&ptr)?;
            if node.is_leaf() {
                return Ok(height);
            }
            height += 1;
            ptr = node.children[0].clone();
        }
    }

    /// Write every cached node back to the store.
    pub fn flush(&self) -> Result<()> {
        self.cache.flushall()
    }
}

/// Lazy ordered iterator over leaf entries.
pub struct Scan<'a, K, V, S: NodeStore<K, V>> {
    tree: &'a BTree<K, V, S>,
    node: Option<Node<K, V, S::Pointer>>,
    index: usize,
    high: Option<K>,
}

impl<'a, K, V, S> Iterator for Scan<'a, K, V, S>
where
    K: Ord + Clone,
    V: Clone,
    S: NodeStore<K, V>,
{
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = self.node.as_ref()?;
            if self.index < node.keys.len() {
                let key = node.keys[self.index].clone();
                if let Some(ref high) = self.high {
                    if key > *high {
                        self.node = None;
                        return None;
                    }
                }
                let value = node.values[self.index].clone();
                self.index += 1;
                return Some(Ok((key, value)));
            }

            match node.next.clone() {
                Some(next) => match self.tree.cache.get(&next) {
                    Ok(next_node) => {
                        self.node = Some(next_node);
                        self.index = 0;
                    }
                    Err(err) => {
                        self.node = None;
                        return Some(Err(err));
                    }
                },
                None => {
                    self.node = None;
                    return None;
                }
            }
        }
    }
}

/// Rewrite a finished tree into another store, bottom-up. Leaves are
/// written right-to-left so each records the pointer of its successor;
/// inner nodes follow once all their children have pointers. Returns
/// the new root pointer.
pub fn persist<K, V, S, T>(tree: &BTree<K, V, S>, target: &T) -> Result<T::Pointer>
where
    K: Ord + Clone,
    V: Clone,
    S: NodeStore<K, V>,
    T: NodeStore<K, V>,
{
    use std::collections::HashMap;

    tree.flush()?;

    // collect leaves left-to-right through the leaf chain
    let mut leaf_ptrs = Vec::new();
    let mut ptr = tree.root().clone();
    loop {
        let node = tree.cache.get(&ptr)?;
        if node.is_leaf() {
            break;
        }
        ptr = node.children[0].clone();
    }
    let mut cursor = Some(ptr);
    while let Some(leaf_ptr) = cursor {
        let node = tree.cache.get(&leaf_ptr)?;
        cursor = node.next.clone();
        leaf_ptrs.push(leaf_ptr);
    }

    // persist leaves right-to-left, threading the next pointers
    let mut translated: HashMap<S::Pointer, T::Pointer> = HashMap::new();
    let mut next: Option<T::Pointer> = None;
    for leaf_ptr in leaf_ptrs.iter().rev() {
        let node = tree.cache.get(leaf_ptr)?;
        let out = Node {
            keys: node.keys,
            values: node.values,
            children: Vec::new(),
            next: next.clone(),
        };
        let out_ptr = target.put(out)?;
        next = Some(out_ptr.clone());
        translated.insert(leaf_ptr.clone(), out_ptr);
    }

    persist_inner(tree, target, tree.root(), &mut translated)
}

fn persist_inner<K, V, S, T>(
    tree: &BTree<K, V, S>,
    target: &T,
    ptr: &S::Pointer,
    translated: &mut std::collections::HashMap<S::Pointer, T::Pointer>,
) -> Result<T::Pointer>
where
    K: Ord + Clone,
    V: Clone,
    S: NodeStore<K, V>,
    T: NodeStore<K, V>,
{
    if let Some(done) = translated.get(ptr) {
        return Ok(done.clone());
    }

    let node = tree.cache.get(ptr)?;
    let mut children = Vec::with_capacity(node.children.len());
    for child in &node.children {
        children.push(persist_inner(tree, target, child, translated)?);
    }

    let out = Node { keys: node.keys, values: node.values, children, next: None };
    let out_ptr = target.put(out)?;
    translated.insert(ptr.clone(), out_ptr.clone());
    Ok(out_ptr)
}
