//! Prefix cache: token prefixes mapped to the blocks holding their KV data.
//!
//! Entries are reachable by exact hash and through a `PrefixIndex` for
//! longest-prefix lookups; both views are updated together. Entries start
//! COLD, become WARM when hit and HOT once `hot_threshold` hits accumulate.
//! HOT entries are never evicted; WARM entries idle past `warm_timeout_ms`
//! are demoted to COLD before a victim is picked among COLD entries.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use engine_common::config::PrefixCacheConfig;
use engine_common::Result;
use engine_executor::{BlockId, TokenId};
use serde::{Deserialize, Serialize};

use crate::hashing::BlockHasher;
use crate::prefix_index::{new_index, PrefixIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    Hot,
    Warm,
    Cold,
}

#[derive(Debug, Clone)]
pub struct PrefixEntry {
    pub tokens: Vec<TokenId>,
    pub hash: u64,
    pub block_ids: Vec<BlockId>,
    pub hit_count: u64,
    pub last_access: Instant,
    pub tier: CacheTier,
}

/// Result of `find_longest_cache_hit`. A miss has `matched_len == 0` and
/// no entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixMatch {
    pub matched_len: usize,
    pub block_ids: Vec<BlockId>,
    pub remaining: Vec<TokenId>,
    pub entry_hash: Option<u64>,
}

impl PrefixMatch {
    pub fn is_hit(&self) -> bool {
        self.entry_hash.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrewarmCandidate {
    pub hash: u64,
    pub tokens: Vec<TokenId>,
    pub hit_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrefixCacheMetrics {
    pub total_entries: usize,
    pub hot: usize,
    pub warm: usize,
    pub cold: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub rejected_inserts: u64,
    pub prewarm_candidates: usize,
}

#[derive(Debug)]
pub struct PrefixCache {
    cfg: PrefixCacheConfig,
    hasher: BlockHasher,
    entries: HashMap<u64, PrefixEntry>,
    index: Box<dyn PrefixIndex>,
    /// Entries referencing each block.
    block_refs: HashMap<BlockId, HashSet<u64>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    rejected: u64,
}

impl PrefixCache {
    pub fn new(cfg: PrefixCacheConfig, hasher: BlockHasher) -> Result<Self> {
        cfg.validate()?;
        let index = new_index(cfg.matcher);
        Ok(Self {
            cfg,
            hasher,
            entries: HashMap::new(),
            index,
            block_refs: HashMap::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
            rejected: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries known to the longest-prefix index; always equals `len()`.
    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    pub fn get(&self, hash: u64) -> Option<&PrefixEntry> {
        self.entries.get(&hash)
    }

    /// O(1) exact lookup by token sequence; does not count as a hit.
    pub fn lookup_exact(&self, tokens: &[TokenId]) -> Option<&PrefixEntry> {
        self.entries.get(&self.hasher.hash_tokens(tokens)).filter(|e| e.tokens == tokens)
    }

    /// Insert `tokens -> block_ids`, or touch the entry if already present.
    /// Returns false when the prefix could not be stored because every
    /// entry is HOT or freshly WARM.
    pub fn cache_prefix(&mut self, tokens: &[TokenId], block_ids: &[BlockId]) -> bool {
        if tokens.is_empty() {
            return false;
        }
        let hash = self.hasher.hash_tokens(tokens);
        if let Some(entry) = self.entries.get_mut(&hash) {
            if entry.tokens != tokens {
                tracing::warn!(target: "prefix_cache", hash, "hash collision, prefix not cached");
                return false;
            }
            entry.last_access = Instant::now();
            return true;
        }
        if self.entries.len() >= self.cfg.capacity && !self.evict_one() {
            self.rejected += 1;
            tracing::debug!(target: "prefix_cache", len = tokens.len(), "prefix cache full, insert rejected");
            return false;
        }
        self.entries.insert(
            hash,
            PrefixEntry {
                tokens: tokens.to_vec(),
                hash,
                block_ids: block_ids.to_vec(),
                hit_count: 0,
                last_access: Instant::now(),
                tier: CacheTier::Cold,
            },
        );
        self.index.insert(tokens, hash);
        for &b in block_ids {
            self.block_refs.entry(b).or_default().insert(hash);
        }
        true
    }

    /// Longest cached prefix of `tokens`. Records a hit on the entry and
    /// updates its tier.
    pub fn find_longest_cache_hit(&mut self, tokens: &[TokenId]) -> PrefixMatch {
        let m = self.peek_longest_match(tokens);
        self.record_lookup(m.entry_hash);
        m
    }

    /// `find_longest_cache_hit` without recording anything.
    pub fn peek_longest_match(&self, tokens: &[TokenId]) -> PrefixMatch {
        let found = self.index.longest_match(tokens).and_then(|(len, hash)| Some((len, self.entries.get(&hash)?)));
        match found {
            Some((len, entry)) => PrefixMatch {
                matched_len: len,
                block_ids: entry.block_ids.clone(),
                remaining: tokens[len..].to_vec(),
                entry_hash: Some(entry.hash),
            },
            None => PrefixMatch { matched_len: 0, block_ids: Vec::new(), remaining: tokens.to_vec(), entry_hash: None },
        }
    }

    /// Count a lookup that was acted on. A hit bumps the entry and may move
    /// it up a tier; `None` or an entry that is gone by now is a miss.
    pub fn record_lookup(&mut self, entry_hash: Option<u64>) {
        let hot_threshold = self.cfg.hot_threshold;
        let Some(entry) = entry_hash.and_then(|h| self.entries.get_mut(&h)) else {
            self.misses += 1;
            return;
        };
        entry.hit_count += 1;
        entry.last_access = Instant::now();
        entry.tier = match entry.tier {
            CacheTier::Cold => CacheTier::Warm,
            CacheTier::Warm if entry.hit_count >= hot_threshold => CacheTier::Hot,
            tier => tier,
        };
        self.hits += 1;
    }

    /// Drop every entry that references any of `block_ids`. Returns the
    /// number of entries removed.
    pub fn remove_skipped_blocks(&mut self, block_ids: &[BlockId]) -> usize {
        let doomed: HashSet<u64> = block_ids
            .iter()
            .filter_map(|b| self.block_refs.get(b))
            .flat_map(|set| set.iter().copied())
            .collect();
        let removed = doomed.into_iter().filter(|&h| self.remove_entry(h)).count();
        if removed > 0 {
            tracing::debug!(target: "prefix_cache", removed, "entries dropped for reused blocks");
        }
        removed
    }

    /// Entries with at least `prewarm_threshold` hits, most hit first.
    pub fn get_prewarm_candidates(&self, limit: usize) -> Vec<PrewarmCandidate> {
        let mut out: Vec<&PrefixEntry> =
            self.entries.values().filter(|e| e.hit_count >= self.cfg.prewarm_threshold).collect();
        out.sort_by(|a, b| b.hit_count.cmp(&a.hit_count).then_with(|| a.hash.cmp(&b.hash)));
        out.into_iter()
            .take(limit)
            .map(|e| PrewarmCandidate { hash: e.hash, tokens: e.tokens.clone(), hit_count: e.hit_count })
            .collect()
    }

    pub fn get_metrics(&self) -> PrefixCacheMetrics {
        let mut m = PrefixCacheMetrics {
            total_entries: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            rejected_inserts: self.rejected,
            ..Default::default()
        };
        for e in self.entries.values() {
            match e.tier {
                CacheTier::Hot => m.hot += 1,
                CacheTier::Warm => m.warm += 1,
                CacheTier::Cold => m.cold += 1,
            }
            if e.hit_count >= self.cfg.prewarm_threshold {
                m.prewarm_candidates += 1;
            }
        }
        let lookups = self.hits + self.misses;
        if lookups > 0 {
            m.hit_rate = self.hits as f64 / lookups as f64;
        }
        m
    }

    fn remove_entry(&mut self, hash: u64) -> bool {
        let Some(entry) = self.entries.remove(&hash) else { return false };
        if self.index.remove(&entry.tokens) != Some(hash) {
            tracing::warn!(target: "prefix_cache", hash, "prefix index out of sync with entries");
        }
        for b in &entry.block_ids {
            if let Some(set) = self.block_refs.get_mut(b) {
                set.remove(&hash);
                if set.is_empty() {
                    self.block_refs.remove(b);
                }
            }
        }
        true
    }

    fn evict_one(&mut self) -> bool {
        let now = Instant::now();
        let timeout = Duration::from_millis(self.cfg.warm_timeout_ms);
        for e in self.entries.values_mut() {
            if e.tier == CacheTier::Warm && now.duration_since(e.last_access) > timeout {
                e.tier = CacheTier::Cold;
            }
        }
        let victim = self
            .entries
            .values()
            .filter(|e| e.tier == CacheTier::Cold)
            .min_by_key(|e| (e.hit_count, e.last_access))
            .map(|e| e.hash);
        match victim {
            Some(hash) => {
                self.remove_entry(hash);
                self.evictions += 1;
                tracing::trace!(target: "prefix_cache", hash, "prefix evicted");
                true
            }
            None => false,
        }
    }
}
