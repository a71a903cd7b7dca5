//! KV cache manager: per-request block tables on top of the block pool and
//! prefix cache.

use std::collections::HashMap;

use engine_common::config::{CacheConfig, PrefixCacheConfig};
use engine_common::Result;
use engine_executor::{BlockId, RequestId, TokenId};

use crate::block_pool::{BlockPool, BlockPoolMetrics};
use crate::hashing::{BlockHash, BlockHasher};
use crate::prefix_cache::{PrefixCache, PrefixCacheMetrics};
use crate::request::Request;

/// Blocks already holding a request's leading tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputedBlocks {
    pub block_ids: Vec<BlockId>,
    pub num_computed_tokens: usize,
    /// Cache lookups to count once the match is used.
    lookup: Option<CacheLookup>,
}

impl ComputedBlocks {
    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheLookup {
    prefix_entry: Option<u64>,
    block_hashes: Vec<BlockHash>,
}

#[derive(Debug)]
pub struct KvCacheManager {
    block_size: usize,
    enable_caching: bool,
    hasher: BlockHasher,
    pool: BlockPool,
    prefix_cache: PrefixCache,
    req_blocks: HashMap<RequestId, Vec<BlockId>>,
    req_hashes: HashMap<RequestId, Vec<BlockHash>>,
    /// Leading blocks of each request already published to the caches.
    num_cached_blocks: HashMap<RequestId, usize>,
}

impl KvCacheManager {
    pub fn new(cache: &CacheConfig, prefix: PrefixCacheConfig) -> Result<Self> {
        let pool = BlockPool::from_config(cache)?;
        let hasher = BlockHasher::new(cache.hash_seed);
        let prefix_cache = PrefixCache::new(prefix, hasher)?;
        Ok(Self {
            block_size: cache.block_size,
            enable_caching: cache.enable_prefix_caching,
            hasher,
            pool,
            prefix_cache,
            req_blocks: HashMap::new(),
            req_hashes: HashMap::new(),
            num_cached_blocks: HashMap::new(),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    pub fn prefix_cache(&self) -> &PrefixCache {
        &self.prefix_cache
    }

    pub fn block_ids(&self, request_id: &str) -> &[BlockId] {
        self.req_blocks.get(request_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn blocks_for_tokens(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.block_size)
    }

    pub fn usage(&self) -> f64 {
        self.pool.usage()
    }

    pub fn pool_metrics(&self) -> BlockPoolMetrics {
        self.pool.get_metrics()
    }

    pub fn prefix_metrics(&self) -> PrefixCacheMetrics {
        self.prefix_cache.get_metrics()
    }

    /// Longest run of cached blocks covering `tokens`, counted as a use of
    /// the caches. The last token is always left to compute so the request
    /// produces a sample.
    pub fn get_computed_blocks(&mut self, tokens: &[TokenId]) -> ComputedBlocks {
        let computed = self.match_computed_blocks(tokens);
        self.commit_computed_blocks(&computed);
        computed
    }

    /// `get_computed_blocks` without touching hit counters, tiers or
    /// eviction order. Pair with `commit_computed_blocks` once the request
    /// is admitted.
    pub fn match_computed_blocks(&self, tokens: &[TokenId]) -> ComputedBlocks {
        if !self.enable_caching || tokens.len() < 2 {
            return ComputedBlocks::default();
        }
        let hit = self.prefix_cache.peek_longest_match(&tokens[..tokens.len() - 1]);
        let mut lookup = CacheLookup { prefix_entry: hit.entry_hash, block_hashes: Vec::new() };
        let n = (hit.matched_len / self.block_size).min(hit.block_ids.len());
        let hashes = if n > 0 { self.hasher.block_hashes(&tokens[..n * self.block_size], self.block_size) } else { Vec::new() };
        let mut block_ids = Vec::with_capacity(n);
        for (hash, &expected) in hashes.iter().zip(&hit.block_ids) {
            lookup.block_hashes.push(*hash);
            match self.pool.cached_block(*hash) {
                Some(id) if id == expected => block_ids.push(id),
                _ => break,
            }
        }
        let num_computed_tokens = block_ids.len() * self.block_size;
        ComputedBlocks { block_ids, num_computed_tokens, lookup: Some(lookup) }
    }

    /// Record the prefix and block lookups behind `computed`.
    pub fn commit_computed_blocks(&mut self, computed: &ComputedBlocks) {
        let Some(lookup) = &computed.lookup else { return };
        self.prefix_cache.record_lookup(lookup.prefix_entry);
        for &hash in &lookup.block_hashes {
            self.pool.lookup_cached_block(hash);
        }
    }

    /// Grow the request's block table to hold `num_tokens`. On the first
    /// allocation `computed` prefix blocks are acquired ahead of fresh ones.
    /// Fails with `OutOfBlocks` and leaves the table unchanged.
    pub fn allocate_slots(&mut self, request_id: &str, num_tokens: usize, computed: &ComputedBlocks) -> Result<Vec<BlockId>> {
        let existing = self.req_blocks.get(request_id).map_or(0, Vec::len);
        let reuse: &[BlockId] = if existing == 0 { &computed.block_ids } else { &[] };
        self.pool.acquire_blocks(reuse);
        let needed = self.blocks_for_tokens(num_tokens).saturating_sub(existing + reuse.len());
        let fresh = if needed > 0 {
            match self.pool.get_new_blocks(needed) {
                Ok(ids) => ids,
                Err(e) => {
                    self.pool.release_blocks(reuse);
                    return Err(e);
                }
            }
        } else {
            Vec::new()
        };
        self.sync_evictions();
        let table = self.req_blocks.entry(request_id.to_string()).or_default();
        table.extend_from_slice(reuse);
        table.extend_from_slice(&fresh);
        if !reuse.is_empty() {
            self.num_cached_blocks.insert(request_id.to_string(), reuse.len());
        }
        Ok(fresh)
    }

    /// Publish the request's newly full, computed blocks: block hashes into
    /// the pool and each block-aligned prefix into the prefix cache.
    pub fn cache_full_blocks(&mut self, req: &Request) {
        if !self.enable_caching {
            return;
        }
        let id = req.request_id.as_str();
        let Some(table) = self.req_blocks.get(id) else { return };
        let tokens = req.all_token_ids();
        let num_full = (req.num_computed_tokens() / self.block_size).min(table.len());
        let done = self.num_cached_blocks.get(id).copied().unwrap_or(0);
        if num_full <= done {
            return;
        }
        let hashes = self.req_hashes.entry(id.to_string()).or_default();
        self.hasher.extend_block_hashes(hashes, &tokens[..num_full * self.block_size], self.block_size);
        self.pool.cache_blocks(&table[done..num_full], &hashes[done..num_full]);

        // the indexed block may differ from ours when another request cached
        // identical content first
        let mut canonical = Vec::with_capacity(num_full);
        for &h in hashes.iter().take(num_full) {
            match self.pool.cached_block(h) {
                Some(b) => canonical.push(b),
                None => break,
            }
        }
        for i in (done + 1)..=canonical.len() {
            self.prefix_cache.cache_prefix(&tokens[..i * self.block_size], &canonical[..i]);
        }
        self.num_cached_blocks.insert(id.to_string(), num_full);
        self.sync_evictions();
    }

    /// Release the request's blocks, tail first so the tail is evicted first.
    pub fn free(&mut self, request_id: &str) {
        self.req_hashes.remove(request_id);
        self.num_cached_blocks.remove(request_id);
        let Some(mut table) = self.req_blocks.remove(request_id) else { return };
        table.reverse();
        self.pool.release_blocks(&table);
    }

    pub fn pin_prefix(&mut self, tokens: &[TokenId]) -> usize {
        let ids = match self.prefix_cache.lookup_exact(tokens) {
            Some(e) => e.block_ids.clone(),
            None => return 0,
        };
        self.pool.pin_blocks(&ids)
    }

    pub fn unpin_prefix(&mut self, tokens: &[TokenId]) -> usize {
        let ids = match self.prefix_cache.lookup_exact(tokens) {
            Some(e) => e.block_ids.clone(),
            None => return 0,
        };
        self.pool.unpin_blocks(&ids)
    }

    fn sync_evictions(&mut self) {
        let events = self.pool.take_eviction_events();
        if events.is_empty() {
            return;
        }
        let ids: Vec<BlockId> = events.iter().map(|e| e.block_id).collect();
        self.prefix_cache.remove_skipped_blocks(&ids);
    }
}
