//! Fixed-size KV block pool.
//!
//! Blocks live in an arena indexed by `BlockId`. A block moves
//! FREE -> ALLOCATED on allocation, ALLOCATED -> CACHED once its content hash
//! is published, and back to FREE when its last reference is freed or when
//! the eviction policy reclaims it. PINNED blocks are invisible to the policy.
//! Operations on unknown ids are no-ops.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use engine_common::config::CacheConfig;
use engine_common::{EngineError, Result};
use engine_executor::BlockId;
use serde::{Deserialize, Serialize};

use crate::eviction::{new_policy, EvictionPolicy};
use crate::hashing::BlockHash;

const MAX_PENDING_EVENTS: usize = 4096;

/// Ordered by eviction priority: FREE is trivially reusable, PINNED never.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BlockState {
    Free,
    Allocated,
    Cached,
    Pinned,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub state: BlockState,
    pub ref_count: u32,
    /// Set once the content is resident and hashed.
    pub hash: Option<BlockHash>,
    pub last_access: Instant,
    pub access_count: u64,
    pub cached_at: Option<Instant>,
}

impl Block {
    fn new(id: BlockId, now: Instant) -> Self {
        Self { id, state: BlockState::Free, ref_count: 0, hash: None, last_access: now, access_count: 0, cached_at: None }
    }

    pub fn is_evictable(&self) -> bool {
        self.state == BlockState::Cached && self.ref_count == 0
    }

    fn reset(&mut self) {
        self.state = BlockState::Free;
        self.ref_count = 0;
        self.hash = None;
        self.access_count = 0;
        self.cached_at = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Reclaimed to satisfy `get_new_blocks`.
    AllocationPressure,
    /// The policy was full when a new block was cached.
    PolicyCapacity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvictionEvent {
    pub block_id: BlockId,
    pub hash: BlockHash,
    pub reason: EvictionReason,
    /// Time since the block was cached.
    pub age: Duration,
    pub access_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockPoolMetrics {
    pub num_blocks: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub allocations: u64,
    pub frees: u64,
    pub current_free: usize,
    pub current_allocated: usize,
    pub current_cached: usize,
    pub current_pinned: usize,
    pub evictable: usize,
    pub hit_rate: f64,
    /// Share of free blocks outside the longest run of contiguous free ids.
    pub fragmentation: f64,
    pub avg_cached_age_secs: f64,
    pub max_cached_age_secs: f64,
}

#[derive(Debug)]
pub struct BlockPool {
    blocks: Vec<Block>,
    free_queue: VecDeque<BlockId>,
    hash_index: HashMap<BlockHash, BlockId>,
    policy: Box<dyn EvictionPolicy>,
    events: VecDeque<EvictionEvent>,
    hits: u64,
    misses: u64,
    evictions: u64,
    allocations: u64,
    frees: u64,
}

impl BlockPool {
    pub fn new(num_blocks: usize, policy: Box<dyn EvictionPolicy>) -> Self {
        let now = Instant::now();
        let blocks = (0..num_blocks as BlockId).map(|id| Block::new(id, now)).collect();
        Self {
            blocks,
            free_queue: (0..num_blocks as BlockId).collect(),
            hash_index: HashMap::new(),
            policy,
            events: VecDeque::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
            allocations: 0,
            frees: 0,
        }
    }

    pub fn from_config(cfg: &CacheConfig) -> Result<Self> {
        cfg.validate()?;
        let capacity = cfg.policy_capacity.unwrap_or(cfg.num_blocks);
        tracing::debug!(target: "block_pool", num_blocks = cfg.num_blocks, policy = ?cfg.eviction_policy, capacity, "block pool created");
        Ok(Self::new(cfg.num_blocks, new_policy(cfg.eviction_policy, capacity)))
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.free_queue.len()
    }

    pub fn num_evictable_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_evictable()).count()
    }

    /// Blocks obtainable by `get_new_blocks` right now.
    pub fn num_available_blocks(&self) -> usize {
        self.num_free_blocks() + self.num_evictable_blocks()
    }

    /// Fraction of blocks holding live (non-evictable) content.
    pub fn usage(&self) -> f64 {
        if self.blocks.is_empty() {
            return 0.0;
        }
        1.0 - self.num_available_blocks() as f64 / self.blocks.len() as f64
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id as usize)
    }

    pub fn policy(&self) -> &dyn EvictionPolicy {
        self.policy.as_ref()
    }

    /// Block currently indexed under `hash`, without counting a hit.
    pub fn cached_block(&self, hash: BlockHash) -> Option<BlockId> {
        self.hash_index.get(&hash).copied()
    }

    /// Allocate `n` blocks with ref-count 1, evicting cached blocks if the
    /// free list is short. Fails without side effects when even full
    /// eviction cannot cover `n`.
    pub fn get_new_blocks(&mut self, n: usize) -> Result<Vec<BlockId>> {
        let available = self.num_available_blocks();
        if n > available {
            return Err(EngineError::OutOfBlocks { requested: n, available });
        }
        while self.free_queue.len() < n {
            if self.evict(EvictionReason::AllocationPressure).is_none() {
                // counted as evictable above, so the policy lost track of a block
                tracing::warn!(target: "block_pool", requested = n, free = self.free_queue.len(), "eviction policy out of sync with pool");
                return Err(EngineError::OutOfBlocks { requested: n, available: self.free_queue.len() });
            }
        }
        let now = Instant::now();
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let Some(id) = self.free_queue.pop_front() else { break };
            let block = &mut self.blocks[id as usize];
            block.state = BlockState::Allocated;
            block.ref_count = 1;
            block.last_access = now;
            out.push(id);
        }
        self.allocations += out.len() as u64;
        Ok(out)
    }

    /// Drop one reference per id. At zero the block's content is discarded
    /// and it returns to the free list. Pinned blocks are left alone.
    pub fn free_blocks(&mut self, ids: &[BlockId]) {
        for &id in ids {
            let Some(block) = self.blocks.get_mut(id as usize) else {
                tracing::debug!(target: "block_pool", block_id = id, "free of unknown block ignored");
                continue;
            };
            match block.state {
                BlockState::Pinned => continue,
                BlockState::Free => {
                    tracing::warn!(target: "block_pool", block_id = id, "double free ignored");
                    continue;
                }
                _ => {}
            }
            block.ref_count = block.ref_count.saturating_sub(1);
            if block.ref_count == 0 {
                self.discard(id);
            }
        }
    }

    /// Drop one reference per id, keeping cached content resident and
    /// evictable. Uncached blocks go straight back to the free list.
    pub fn release_blocks(&mut self, ids: &[BlockId]) {
        let now = Instant::now();
        for &id in ids {
            let Some(block) = self.blocks.get_mut(id as usize) else { continue };
            if block.state == BlockState::Free {
                tracing::warn!(target: "block_pool", block_id = id, "release of free block ignored");
                continue;
            }
            if block.ref_count == 0 {
                tracing::warn!(target: "block_pool", block_id = id, "ref-count underflow clamped");
                continue;
            }
            block.ref_count -= 1;
            if block.ref_count > 0 {
                continue;
            }
            match block.state {
                BlockState::Cached => {
                    block.last_access = now;
                    self.policy.release(id);
                }
                BlockState::Allocated => self.discard(id),
                _ => {}
            }
        }
    }

    /// Take a reference on resident blocks, e.g. on a prefix hit. Returns
    /// how many were acquired.
    pub fn acquire_blocks(&mut self, ids: &[BlockId]) -> usize {
        let now = Instant::now();
        let mut acquired = 0;
        for &id in ids {
            let Some(block) = self.blocks.get_mut(id as usize) else { continue };
            if block.state == BlockState::Free {
                tracing::debug!(target: "block_pool", block_id = id, "acquire of free block ignored");
                continue;
            }
            block.ref_count += 1;
            block.last_access = now;
            block.access_count += 1;
            acquired += 1;
        }
        acquired
    }

    /// Publish content hashes. ALLOCATED blocks become CACHED, enter the hash
    /// index and the eviction policy; a full policy evicts first. A hash
    /// already indexed under another block is skipped. Returns the number
    /// of blocks cached.
    pub fn cache_blocks(&mut self, ids: &[BlockId], hashes: &[BlockHash]) -> usize {
        let mut cached = 0;
        for (&id, &hash) in ids.iter().zip(hashes) {
            match self.blocks.get(id as usize) {
                Some(b) if b.state == BlockState::Allocated => {}
                Some(b) => {
                    tracing::trace!(target: "block_pool", block_id = id, state = ?b.state, "cache of non-allocated block skipped");
                    continue;
                }
                None => continue,
            }
            if let Some(&other) = self.hash_index.get(&hash) {
                tracing::trace!(target: "block_pool", block_id = id, other, hash, "duplicate content hash");
                continue;
            }
            self.policy.prepare_store(hash);
            if self.policy.len() >= self.policy.capacity() {
                self.evict(EvictionReason::PolicyCapacity);
            }
            let now = Instant::now();
            let block = &mut self.blocks[id as usize];
            block.state = BlockState::Cached;
            block.hash = Some(hash);
            block.cached_at = Some(now);
            block.last_access = now;
            self.hash_index.insert(hash, id);
            self.policy.complete_store(id, hash);
            cached += 1;
        }
        cached
    }

    pub fn touch(&mut self, ids: &[BlockId]) {
        let now = Instant::now();
        for &id in ids {
            let Some(block) = self.blocks.get_mut(id as usize) else { continue };
            if block.state == BlockState::Free {
                continue;
            }
            block.last_access = now;
            block.access_count += 1;
            if block.state == BlockState::Cached {
                self.policy.touch(id);
            }
        }
    }

    /// Exact-hash lookup. Counts a hit or miss and touches the block on hit.
    pub fn lookup_cached_block(&mut self, hash: BlockHash) -> Option<BlockId> {
        let Some(&id) = self.hash_index.get(&hash) else {
            self.misses += 1;
            return None;
        };
        self.hits += 1;
        let block = &mut self.blocks[id as usize];
        block.last_access = Instant::now();
        block.access_count += 1;
        if block.state == BlockState::Cached {
            self.policy.lookup(hash);
        }
        Some(id)
    }

    /// CACHED -> PINNED; pinned blocks are never evicted.
    pub fn pin_blocks(&mut self, ids: &[BlockId]) -> usize {
        let mut pinned = 0;
        for &id in ids {
            let Some(block) = self.blocks.get_mut(id as usize) else { continue };
            if block.state != BlockState::Cached {
                continue;
            }
            block.state = BlockState::Pinned;
            self.policy.remove(id);
            pinned += 1;
        }
        pinned
    }

    /// PINNED -> CACHED, visible to the eviction policy again.
    pub fn unpin_blocks(&mut self, ids: &[BlockId]) -> usize {
        let mut unpinned = 0;
        for &id in ids {
            let Some(block) = self.blocks.get_mut(id as usize) else { continue };
            if block.state != BlockState::Pinned {
                continue;
            }
            block.state = BlockState::Cached;
            if let Some(hash) = block.hash {
                self.policy.complete_store(id, hash);
            }
            unpinned += 1;
        }
        unpinned
    }

    /// Drain eviction events recorded since the previous call.
    pub fn take_eviction_events(&mut self) -> Vec<EvictionEvent> {
        self.events.drain(..).collect()
    }

    /// Counters plus state, fragmentation and age statistics computed from
    /// the arena on every call.
    pub fn get_metrics(&self) -> BlockPoolMetrics {
        let now = Instant::now();
        let mut m = BlockPoolMetrics {
            num_blocks: self.blocks.len(),
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            allocations: self.allocations,
            frees: self.frees,
            ..Default::default()
        };
        let mut age_sum = 0.0;
        let mut longest_run = 0usize;
        let mut run = 0usize;
        for b in &self.blocks {
            match b.state {
                BlockState::Free => m.current_free += 1,
                BlockState::Allocated => m.current_allocated += 1,
                BlockState::Cached => m.current_cached += 1,
                BlockState::Pinned => m.current_pinned += 1,
            }
            if b.is_evictable() {
                m.evictable += 1;
            }
            if b.state == BlockState::Free {
                run += 1;
                longest_run = longest_run.max(run);
            } else {
                run = 0;
            }
            if let Some(at) = b.cached_at {
                let age = now.duration_since(at).as_secs_f64();
                age_sum += age;
                m.max_cached_age_secs = m.max_cached_age_secs.max(age);
            }
        }
        let lookups = self.hits + self.misses;
        if lookups > 0 {
            m.hit_rate = self.hits as f64 / lookups as f64;
        }
        if m.current_free > 0 {
            m.fragmentation = 1.0 - longest_run as f64 / m.current_free as f64;
        }
        let resident = m.current_cached + m.current_pinned;
        if resident > 0 {
            m.avg_cached_age_secs = age_sum / resident as f64;
        }
        m
    }

    fn discard(&mut self, id: BlockId) {
        let block = &mut self.blocks[id as usize];
        if let Some(hash) = block.hash {
            if self.hash_index.get(&hash) == Some(&id) {
                self.hash_index.remove(&hash);
            }
        }
        block.reset();
        self.policy.remove(id);
        self.free_queue.push_back(id);
        self.frees += 1;
    }

    fn evict(&mut self, reason: EvictionReason) -> Option<BlockId> {
        let Self { policy, blocks, .. } = self;
        let (id, hash) = policy.evict_one(&|id: BlockId| blocks.get(id as usize).map_or(false, Block::is_evictable))?;
        let now = Instant::now();
        let block = &mut self.blocks[id as usize];
        let event = EvictionEvent {
            block_id: id,
            hash,
            reason,
            age: block.cached_at.map(|t| now.duration_since(t)).unwrap_or_default(),
            access_count: block.access_count,
        };
        block.reset();
        if self.hash_index.get(&hash) == Some(&id) {
            self.hash_index.remove(&hash);
        }
        self.free_queue.push_back(id);
        self.evictions += 1;
        tracing::debug!(target: "block_pool", block_id = id, hash, ?reason, access_count = event.access_count, "block evicted");
        if self.events.len() >= MAX_PENDING_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(event);
        Some(id)
    }
}
