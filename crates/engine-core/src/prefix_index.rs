//! Longest-prefix matchers over token sequences.
//!
//! `LinearIndex` scans every key and is the reference behavior.
//! `RadixIndex` is a compressed trie kept in an arena: nodes refer to each
//! other by slot index, children are keyed by the first token of their
//! fragment, and removal prunes empty chains and re-merges single-child
//! nodes so the tree stays compressed.

use std::collections::HashMap;
use std::fmt;

use engine_common::config::MatcherKind;
use engine_executor::TokenId;

pub trait PrefixIndex: Send + fmt::Debug {
    /// Attach `key` to `tokens`, replacing any key already there. Empty
    /// sequences are ignored.
    fn insert(&mut self, tokens: &[TokenId], key: u64);

    fn remove(&mut self, tokens: &[TokenId]) -> Option<u64>;

    /// Longest stored sequence that is a prefix of `tokens`, as
    /// (length, key).
    fn longest_match(&self, tokens: &[TokenId]) -> Option<(usize, u64)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn new_index(kind: MatcherKind) -> Box<dyn PrefixIndex> {
    match kind {
        MatcherKind::Radix => Box::new(RadixIndex::new()),
        MatcherKind::Linear => Box::new(LinearIndex::default()),
    }
}

#[derive(Debug, Default)]
pub struct LinearIndex {
    keys: Vec<(Vec<TokenId>, u64)>,
}

impl PrefixIndex for LinearIndex {
    fn insert(&mut self, tokens: &[TokenId], key: u64) {
        if tokens.is_empty() {
            return;
        }
        match self.keys.iter_mut().find(|(t, _)| t.as_slice() == tokens) {
            Some(slot) => slot.1 = key,
            None => self.keys.push((tokens.to_vec(), key)),
        }
    }

    fn remove(&mut self, tokens: &[TokenId]) -> Option<u64> {
        let pos = self.keys.iter().position(|(t, _)| t.as_slice() == tokens)?;
        Some(self.keys.swap_remove(pos).1)
    }

    fn longest_match(&self, tokens: &[TokenId]) -> Option<(usize, u64)> {
        self.keys
            .iter()
            .filter(|(t, _)| tokens.starts_with(t))
            .max_by_key(|(t, _)| t.len())
            .map(|(t, k)| (t.len(), *k))
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

const ROOT: usize = 0;

#[derive(Debug, Default)]
struct Node {
    fragment: Vec<TokenId>,
    children: HashMap<TokenId, usize>,
    parent: Option<usize>,
    entry: Option<u64>,
}

#[derive(Debug)]
pub struct RadixIndex {
    nodes: Vec<Option<Node>>,
    vacant: Vec<usize>,
    len: usize,
}

impl Default for RadixIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl RadixIndex {
    pub fn new() -> Self {
        Self { nodes: vec![Some(Node::default())], vacant: Vec::new(), len: 0 }
    }

    /// Live nodes including the root.
    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// Every stored key with its token sequence, rebuilt by concatenating
    /// fragments along each root-to-node path.
    pub fn entries(&self) -> Vec<(Vec<TokenId>, u64)> {
        let mut out = Vec::new();
        let mut stack = vec![(ROOT, Vec::new())];
        while let Some((idx, mut path)) = stack.pop() {
            let Some(node) = self.node(idx) else { continue };
            path.extend_from_slice(&node.fragment);
            if let Some(key) = node.entry {
                out.push((path.clone(), key));
            }
            for &child in node.children.values() {
                stack.push((child, path.clone()));
            }
        }
        out
    }

    /// Whether every non-root node without an entry has at least two
    /// children, i.e. the tree is fully compressed.
    pub fn is_compressed(&self) -> bool {
        self.nodes.iter().enumerate().all(|(idx, n)| match n {
            Some(n) if idx != ROOT => n.entry.is_some() || n.children.len() >= 2,
            _ => true,
        })
    }

    fn node(&self, idx: usize) -> Option<&Node> {
        self.nodes.get(idx).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node> {
        self.nodes.get_mut(idx).and_then(Option::as_mut)
    }

    fn alloc(&mut self, node: Node) -> usize {
        match self.vacant.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) -> Option<Node> {
        let node = self.nodes.get_mut(idx)?.take()?;
        self.vacant.push(idx);
        Some(node)
    }

    /// Node whose path spells exactly `tokens`.
    fn find_exact(&self, tokens: &[TokenId]) -> Option<usize> {
        let mut cur = ROOT;
        let mut i = 0;
        while i < tokens.len() {
            let child = *self.node(cur)?.children.get(&tokens[i])?;
            let frag = &self.node(child)?.fragment;
            if !tokens[i..].starts_with(frag) {
                return None;
            }
            i += frag.len();
            cur = child;
        }
        Some(cur)
    }

    /// Fold a childless, entry-less node into nothing, walking up.
    fn prune(&mut self, mut idx: usize) -> usize {
        while idx != ROOT {
            let Some(node) = self.node(idx) else { break };
            if node.entry.is_some() || !node.children.is_empty() {
                break;
            }
            let first = node.fragment.first().copied();
            let parent = node.parent.unwrap_or(ROOT);
            if let (Some(first), Some(p)) = (first, self.node_mut(parent)) {
                p.children.remove(&first);
            }
            self.release(idx);
            idx = parent;
        }
        idx
    }

    /// Absorb the only child of an entry-less node into it.
    fn merge_single_child(&mut self, idx: usize) {
        if idx == ROOT {
            return;
        }
        let child = match self.node(idx) {
            Some(n) if n.entry.is_none() && n.children.len() == 1 => n.children.values().next().copied(),
            _ => None,
        };
        let Some(child) = child else { return };
        let Some(child_node) = self.release(child) else { return };
        for &grandchild in child_node.children.values() {
            if let Some(g) = self.node_mut(grandchild) {
                g.parent = Some(idx);
            }
        }
        if let Some(node) = self.node_mut(idx) {
            node.fragment.extend_from_slice(&child_node.fragment);
            node.children = child_node.children;
            node.entry = child_node.entry;
        }
    }
}

impl PrefixIndex for RadixIndex {
    fn insert(&mut self, tokens: &[TokenId], key: u64) {
        if tokens.is_empty() {
            return;
        }
        let mut cur = ROOT;
        let mut i = 0;
        loop {
            if i == tokens.len() {
                let added = self.node_mut(cur).map_or(false, |node| node.entry.replace(key).is_none());
                if added {
                    self.len += 1;
                }
                return;
            }
            let first = tokens[i];
            let existing = self.node(cur).and_then(|n| n.children.get(&first).copied());
            let Some(child) = existing else {
                let leaf = self.alloc(Node {
                    fragment: tokens[i..].to_vec(),
                    children: HashMap::new(),
                    parent: Some(cur),
                    entry: Some(key),
                });
                if let Some(node) = self.node_mut(cur) {
                    node.children.insert(first, leaf);
                }
                self.len += 1;
                return;
            };
            let Some(frag) = self.node(child).map(|n| n.fragment.clone()) else { return };
            let common = frag.iter().zip(&tokens[i..]).take_while(|(a, b)| a == b).count();
            if common == frag.len() {
                cur = child;
                i += common;
                continue;
            }
            // split `child` so the shared part becomes its own node
            let mid = self.alloc(Node {
                fragment: frag[..common].to_vec(),
                children: HashMap::from([(frag[common], child)]),
                parent: Some(cur),
                entry: None,
            });
            if let Some(c) = self.node_mut(child) {
                c.fragment = frag[common..].to_vec();
                c.parent = Some(mid);
            }
            if let Some(node) = self.node_mut(cur) {
                node.children.insert(first, mid);
            }
            cur = mid;
            i += common;
        }
    }

    fn remove(&mut self, tokens: &[TokenId]) -> Option<u64> {
        let idx = self.find_exact(tokens)?;
        if idx == ROOT {
            return None;
        }
        let key = self.node_mut(idx)?.entry.take()?;
        self.len -= 1;
        let stop = self.prune(idx);
        self.merge_single_child(stop);
        Some(key)
    }

    fn longest_match(&self, tokens: &[TokenId]) -> Option<(usize, u64)> {
        let mut cur = ROOT;
        let mut i = 0;
        let mut best = None;
        while i < tokens.len() {
            let Some(&child) = self.node(cur).and_then(|n| n.children.get(&tokens[i])) else { break };
            let Some(node) = self.node(child) else { break };
            if !tokens[i..].starts_with(&node.fragment) {
                break;
            }
            i += node.fragment.len();
            cur = child;
            if let Some(key) = node.entry {
                best = Some((i, key));
            }
        }
        best
    }

    fn len(&self) -> usize {
        self.len
    }
}
