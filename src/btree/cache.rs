//! Node cache between the B-tree and its store.
//!
//! The cache holds up to `target` nodes (the tree order) in insertion
//! order; on a miss at capacity the longest-resident node is evicted,
//! written through to the store first if dirty. Because nodes on disk
//! are content-addressed and immutable, the only mutable state is the
//! in-memory node buffer and its dirty flag; the cache exists so tree
//! construction does not materialize a digest for every intermediate
//! node.
//!
//! Reads take the read lock and promote to the write lock only to
//! insert on a miss; the capacity check is re-done under the write lock
//! so concurrent misses cannot push the cache past its target.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::btree::{Node, NodeStore};
use crate::error::Result;

struct CachedItem<K, V, P> {
    dirty: bool,
    node: Node<K, V, P>,
}

struct CacheInner<K, V, P> {
    items: HashMap<P, CachedItem<K, V, P>>,
    // insertion order, front = longest resident
    order: VecDeque<P>,
}

pub struct NodeCache<K, V, S: NodeStore<K, V>> {
    store: S,
    target: usize,
    inner: RwLock<CacheInner<K, V, S::Pointer>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V, S> NodeCache<K, V, S>
where
    K: Clone,
    V: Clone,
    S: NodeStore<K, V>,
{
    pub fn new(store: S, target: usize) -> Self {
        Self {
            store,
            target,
            inner: RwLock::new(CacheInner {
                items: HashMap::with_capacity(target),
                order: VecDeque::with_capacity(target),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn get(&self, ptr: &S::Pointer) -> Result<Node<K, V, S::Pointer>> {
        {
            let inner = self.inner.read().unwrap();
            if let Some(item) = inner.items.get(ptr) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(item.node.clone());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let node = self.store.get(ptr)?;

        let mut inner = self.inner.write().unwrap();
        if let Some(item) = inner.items.get(ptr) {
            // raced with another miss
            return Ok(item.node.clone());
        }

        while inner.items.len() >= self.target {
            self.evict_front(&mut inner)?;
        }

        inner.items.insert(ptr.clone(), CachedItem { dirty: false, node: node.clone() });
        inner.order.push_back(ptr.clone());
        Ok(node)
    }

    /// Replace a cached node, marking it dirty; uncached pointers go
    /// straight to the store.
    pub fn update(&self, ptr: &S::Pointer, node: Node<K, V, S::Pointer>) -> Result<()> {
        {
            let mut inner = self.inner.write().unwrap();
            if let Some(item) = inner.items.get_mut(ptr) {
                item.node = node;
                item.dirty = true;
                return Ok(());
            }
        }
        self.store.update(ptr, node)
    }

    /// Write a new node straight through to the store. Admission only
    /// happens on a read miss.
    pub fn put(&self, node: Node<K, V, S::Pointer>) -> Result<S::Pointer> {
        self.store.put(node)
    }

    /// Drain the whole cache in insertion order, writing dirty nodes
    /// through to the store.
    pub fn flushall(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        while !inner.order.is_empty() {
            self.evict_front(&mut inner)?;
        }
        Ok(())
    }

    fn evict_front(&self, inner: &mut CacheInner<K, V, S::Pointer>) -> Result<()> {
        let ptr = match inner.order.pop_front() {
            Some(ptr) => ptr,
            None => return Ok(()),
        };
        if let Some(item) = inner.items.remove(&ptr) {
            if item.dirty {
                self.store.update(&ptr, item.node)?;
            }
        }
        Ok(())
    }
}
