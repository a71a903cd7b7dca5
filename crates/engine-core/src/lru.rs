use std::any::Any;
use std::collections::HashMap;

use engine_executor::BlockId;

use crate::eviction::{EvictionPolicy, RecencyList};
use crate::hashing::BlockHash;

/// Least-recently-used: one recency order over all tracked blocks.
#[derive(Debug)]
pub struct LruPolicy {
    capacity: usize,
    order: RecencyList<BlockId>,
    hashes: HashMap<BlockId, BlockHash>,
    by_hash: HashMap<BlockHash, BlockId>,
}

impl LruPolicy {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, order: RecencyList::new(), hashes: HashMap::new(), by_hash: HashMap::new() }
    }

    /// Tracked blocks, least recent first.
    pub fn order(&self) -> Vec<BlockId> {
        self.order.iter().copied().collect()
    }
}

impl EvictionPolicy for LruPolicy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn contains(&self, block: BlockId) -> bool {
        self.order.contains(&block)
    }

    fn lookup(&mut self, hash: BlockHash) -> Option<BlockId> {
        let block = *self.by_hash.get(&hash)?;
        self.order.push_back(block);
        Some(block)
    }

    fn touch(&mut self, block: BlockId) {
        if self.order.contains(&block) {
            self.order.push_back(block);
        }
    }

    fn release(&mut self, block: BlockId) {
        self.touch(block);
    }

    fn prepare_store(&mut self, _hash: BlockHash) {}

    fn complete_store(&mut self, block: BlockId, hash: BlockHash) {
        if let Some(old) = self.hashes.insert(block, hash) {
            self.by_hash.remove(&old);
        }
        self.by_hash.insert(hash, block);
        self.order.push_back(block);
    }

    fn remove(&mut self, block: BlockId) -> bool {
        if let Some(hash) = self.hashes.remove(&block) {
            self.by_hash.remove(&hash);
        }
        self.order.remove(&block)
    }

    fn evict_one(&mut self, evictable: &dyn Fn(BlockId) -> bool) -> Option<(BlockId, BlockHash)> {
        let block = self.order.pop_front_where(|b| evictable(*b))?;
        let hash = self.hashes.remove(&block)?;
        self.by_hash.remove(&hash);
        Some((block, hash))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
