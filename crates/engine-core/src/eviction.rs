//! Eviction policy interface shared by the block pool's LRU and ARC variants.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;

use engine_common::config::EvictionPolicyKind;

use crate::arc::ArcPolicy;
use crate::hashing::BlockHash;
use crate::lru::LruPolicy;
use engine_executor::BlockId;

/// Bookkeeping over cached, unpinned blocks. The pool owns block state; a
/// policy only orders blocks and picks victims.
pub trait EvictionPolicy: Send + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Resident entries tracked before a store must evict first.
    fn capacity(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, block: BlockId) -> bool;

    /// Cache hit by content hash; records the access.
    fn lookup(&mut self, hash: BlockHash) -> Option<BlockId>;

    fn touch(&mut self, block: BlockId);

    /// The block's last holder let go of it. Refreshes its recency without
    /// counting as a reuse.
    fn release(&mut self, block: BlockId);

    /// Called before `hash` is stored; adapts to ghost hits.
    fn prepare_store(&mut self, hash: BlockHash);

    fn complete_store(&mut self, block: BlockId, hash: BlockHash);

    /// Forget a block without recording it as evicted.
    fn remove(&mut self, block: BlockId) -> bool;

    /// Choose and forget one victim among blocks accepted by `evictable`.
    fn evict_one(&mut self, evictable: &dyn Fn(BlockId) -> bool) -> Option<(BlockId, BlockHash)>;

    fn as_any(&self) -> &dyn Any;
}

pub fn new_policy(kind: EvictionPolicyKind, capacity: usize) -> Box<dyn EvictionPolicy> {
    match kind {
        EvictionPolicyKind::Lru => Box::new(LruPolicy::new(capacity)),
        EvictionPolicyKind::Arc => Box::new(ArcPolicy::new(capacity)),
    }
}

/// Keys ordered by last use, least recent first.
#[derive(Debug, Clone)]
pub struct RecencyList<K> {
    tick: u64,
    order: BTreeMap<u64, K>,
    stamps: HashMap<K, u64>,
}

impl<K> Default for RecencyList<K> {
    fn default() -> Self {
        Self { tick: 0, order: BTreeMap::new(), stamps: HashMap::new() }
    }
}

impl<K: Copy + Eq + Hash> RecencyList<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.stamps.contains_key(key)
    }

    /// Insert as most recent, or move there if present.
    pub fn push_back(&mut self, key: K) {
        if let Some(old) = self.stamps.remove(&key) {
            self.order.remove(&old);
        }
        self.tick += 1;
        self.order.insert(self.tick, key);
        self.stamps.insert(key, self.tick);
    }

    pub fn remove(&mut self, key: &K) -> bool {
        match self.stamps.remove(key) {
            Some(stamp) => {
                self.order.remove(&stamp);
                true
            }
            None => false,
        }
    }

    pub fn pop_front(&mut self) -> Option<K> {
        let (_, key) = self.order.pop_first()?;
        self.stamps.remove(&key);
        Some(key)
    }

    /// Remove and return the least recent key accepted by `pred`.
    pub fn pop_front_where(&mut self, pred: impl Fn(&K) -> bool) -> Option<K> {
        let (&stamp, &key) = self.order.iter().find(|(_, k)| pred(k))?;
        self.order.remove(&stamp);
        self.stamps.remove(&key);
        Some(key)
    }

    pub fn front(&self) -> Option<&K> {
        self.order.values().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = &K> {
        self.order.values()
    }
}
