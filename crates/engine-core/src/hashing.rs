use engine_executor::TokenId;
use xxhash_rust::xxh3::xxh3_64_with_seed;

pub type BlockHash = u64;

/// Seeded content hashing for KV blocks and prefixes. Built once by the
/// owner of the cache and passed down, never global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHasher {
    seed: u64,
}

impl BlockHasher {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Hash of one block chained on its parent's hash, so equal tokens at
    /// different positions hash differently.
    pub fn hash_block(&self, parent: Option<BlockHash>, tokens: &[TokenId]) -> BlockHash {
        let mut buf = Vec::with_capacity(9 + tokens.len() * 4);
        match parent {
            Some(h) => {
                buf.push(1);
                buf.extend_from_slice(&h.to_le_bytes());
            }
            None => buf.push(0),
        }
        for t in tokens {
            buf.extend_from_slice(&t.to_le_bytes());
        }
        xxh3_64_with_seed(&buf, self.seed)
    }

    /// Hash of a whole token sequence.
    pub fn hash_tokens(&self, tokens: &[TokenId]) -> u64 {
        let mut buf = Vec::with_capacity(tokens.len() * 4);
        for t in tokens {
            buf.extend_from_slice(&t.to_le_bytes());
        }
        xxh3_64_with_seed(&buf, self.seed)
    }

    /// Chained hashes of every full block in `tokens`.
    pub fn block_hashes(&self, tokens: &[TokenId], block_size: usize) -> Vec<BlockHash> {
        let mut out = Vec::with_capacity(tokens.len() / block_size.max(1));
        self.extend_block_hashes(&mut out, tokens, block_size);
        out
    }

    /// Continue a chain: hash the full blocks of `tokens` past those already in `hashes`.
    pub fn extend_block_hashes(&self, hashes: &mut Vec<BlockHash>, tokens: &[TokenId], block_size: usize) {
        if block_size == 0 {
            return;
        }
        let full = tokens.len() / block_size;
        for i in hashes.len()..full {
            let parent = hashes.last().copied();
            let h = self.hash_block(parent, &tokens[i * block_size..(i + 1) * block_size]);
            hashes.push(h);
        }
    }
}
