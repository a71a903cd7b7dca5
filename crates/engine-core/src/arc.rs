//! Adaptive Replacement Cache over block ids.
//!
//! T1 holds blocks seen once, T2 blocks seen at least twice. B1 and B2
//! remember the hashes of blocks evicted from T1 and T2. `p` is the target
//! size of T1: a B1 ghost hit grows it, a B2 ghost hit shrinks it.

use std::any::Any;
use std::collections::{HashMap, HashSet};

use engine_executor::BlockId;

use crate::eviction::{EvictionPolicy, RecencyList};
use crate::hashing::BlockHash;

#[derive(Debug)]
pub struct ArcPolicy {
    capacity: usize,
    p: usize,
    t1: RecencyList<BlockId>,
    t2: RecencyList<BlockId>,
    b1: RecencyList<BlockHash>,
    b2: RecencyList<BlockHash>,
    hashes: HashMap<BlockId, BlockHash>,
    by_hash: HashMap<BlockHash, BlockId>,
    /// Hashes whose pending store came from a ghost hit and goes to T2.
    promote: HashSet<BlockHash>,
}

impl ArcPolicy {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            p: 0,
            t1: RecencyList::new(),
            t2: RecencyList::new(),
            b1: RecencyList::new(),
            b2: RecencyList::new(),
            hashes: HashMap::new(),
            by_hash: HashMap::new(),
            promote: HashSet::new(),
        }
    }

    /// Target size of T1.
    pub fn target_p(&self) -> usize {
        self.p
    }

    pub fn t1_len(&self) -> usize {
        self.t1.len()
    }

    pub fn t2_len(&self) -> usize {
        self.t2.len()
    }

    pub fn b1_len(&self) -> usize {
        self.b1.len()
    }

    pub fn b2_len(&self) -> usize {
        self.b2.len()
    }

    pub fn in_t1(&self, block: BlockId) -> bool {
        self.t1.contains(&block)
    }

    pub fn in_t2(&self, block: BlockId) -> bool {
        self.t2.contains(&block)
    }

    pub fn in_b1(&self, hash: BlockHash) -> bool {
        self.b1.contains(&hash)
    }

    pub fn in_b2(&self, hash: BlockHash) -> bool {
        self.b2.contains(&hash)
    }

    fn remember_ghost(ghosts: &mut RecencyList<BlockHash>, hash: BlockHash, capacity: usize) {
        ghosts.push_back(hash);
        while ghosts.len() > capacity {
            ghosts.pop_front();
        }
    }
}

impl EvictionPolicy for ArcPolicy {
    fn name(&self) -> &'static str {
        "arc"
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.t1.len() + self.t2.len()
    }

    fn contains(&self, block: BlockId) -> bool {
        self.t1.contains(&block) || self.t2.contains(&block)
    }

    fn lookup(&mut self, hash: BlockHash) -> Option<BlockId> {
        let block = *self.by_hash.get(&hash)?;
        self.touch(block);
        Some(block)
    }

    fn touch(&mut self, block: BlockId) {
        if self.t1.remove(&block) {
            self.t2.push_back(block);
        } else if self.t2.contains(&block) {
            self.t2.push_back(block);
        }
    }

    /// Stays in its current list; only a hit moves T1 to T2.
    fn release(&mut self, block: BlockId) {
        if self.t1.contains(&block) {
            self.t1.push_back(block);
        } else if self.t2.contains(&block) {
            self.t2.push_back(block);
        }
    }

    fn prepare_store(&mut self, hash: BlockHash) {
        if self.b1.contains(&hash) {
            let delta = (self.b2.len() / self.b1.len()).max(1);
            self.p = (self.p + delta).min(self.capacity);
            self.b1.remove(&hash);
            self.promote.insert(hash);
            tracing::trace!(target: "block_pool", hash, p = self.p, "arc b1 ghost hit");
        } else if self.b2.contains(&hash) {
            let delta = (self.b1.len() / self.b2.len()).max(1);
            self.p = self.p.saturating_sub(delta);
            self.b2.remove(&hash);
            self.promote.insert(hash);
            tracing::trace!(target: "block_pool", hash, p = self.p, "arc b2 ghost hit");
        }
    }

    fn complete_store(&mut self, block: BlockId, hash: BlockHash) {
        self.remove(block);
        self.hashes.insert(block, hash);
        self.by_hash.insert(hash, block);
        if self.promote.remove(&hash) {
            self.t2.push_back(block);
        } else {
            self.t1.push_back(block);
        }
    }

    fn remove(&mut self, block: BlockId) -> bool {
        if let Some(hash) = self.hashes.remove(&block) {
            self.by_hash.remove(&hash);
        }
        self.t1.remove(&block) | self.t2.remove(&block)
    }

    fn evict_one(&mut self, evictable: &dyn Fn(BlockId) -> bool) -> Option<(BlockId, BlockHash)> {
        let prefer_t1 = self.t1.len() > self.p;
        let order: [bool; 2] = if prefer_t1 { [true, false] } else { [false, true] };
        for from_t1 in order {
            let list = if from_t1 { &mut self.t1 } else { &mut self.t2 };
            let Some(block) = list.pop_front_where(|b| evictable(*b)) else { continue };
            let Some(hash) = self.hashes.remove(&block) else { continue };
            self.by_hash.remove(&hash);
            if from_t1 {
                Self::remember_ghost(&mut self.b1, hash, self.capacity);
            } else {
                Self::remember_ghost(&mut self.b2, hash, self.capacity);
            }
            return Some((block, hash));
        }
        None
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
