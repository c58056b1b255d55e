/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The prefix chain tree: an in-memory forest of known blocks rooted at the last
//! irreversible block, aggregating prevote confirmations along chain suffixes.
//!
//! ## Confirmation aggregation
//!
//! The non-trivial operation is [`add_confirmations`](PrefixTree::add_confirmations):
//! given a chain `(base, [b1..bk])` and a signer's prevote, it walks the nodes of that
//! chain that exist in the tree and stamps each with the prevote. A single prevote over
//! a chain suffix is thereby credited to every ancestor on the voted path, so a deep
//! node's [`confirmation_number`](TreeNode::confirmation_number) equals the count of
//! distinct producer keys that voted for *any* suffix containing that block.
//!
//! ## Structure
//!
//! Nodes live in an arena (`Vec`) with parent/child edges expressed as indices and an
//! id-to-index map for lookup. [`set_root`](PrefixTree::set_root) prunes by rebuilding
//! the arena from the new root's subtree. Each node has at most one parent; the root is
//! always the current last irreversible block; inserting a block requires its parent
//! chain to be present.

use std::collections::{HashMap, HashSet};

use crate::types::basic::BlockId;
use crate::types::crypto_primitives::VerifyingKey;

/// A chain suffix: a base block and the ids of its consecutive descendants.
#[derive(Clone, PartialEq, Eq)]
pub struct Chain {
    pub base_block: BlockId,
    pub blocks: Vec<BlockId>,
}

/// Returned by [`PrefixTree::insert`] when neither the chain's base block nor any of
/// its blocks are present in the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeNotFoundError;

/// One known block, with the prevote confirmations accumulated for it this round.
pub struct TreeNode<C> {
    pub block_id: BlockId,
    /// `None` only for a root created from an id the tree had never seen (a LIB jump
    /// during sync).
    pub creator_key: Option<VerifyingKey>,
    pub active_bp_keys: HashSet<VerifyingKey>,
    parent: Option<usize>,
    children: Vec<usize>,
    confirmation_data: HashMap<VerifyingKey, C>,
}

impl<C> TreeNode<C> {
    fn new(
        block_id: BlockId,
        creator_key: Option<VerifyingKey>,
        active_bp_keys: HashSet<VerifyingKey>,
        parent: Option<usize>,
    ) -> Self {
        Self {
            block_id,
            creator_key,
            active_bp_keys,
            parent,
            children: Vec::new(),
            confirmation_data: HashMap::new(),
        }
    }

    /// Number of distinct producer keys that have confirmed this block.
    pub fn confirmation_number(&self) -> usize {
        self.confirmation_data.len()
    }

    pub fn has_confirmation(&self, key: &VerifyingKey) -> bool {
        self.confirmation_data.contains_key(key)
    }

    /// The prevotes stored at this node, one per confirming key.
    pub fn confirmations(&self) -> impl Iterator<Item = &C> {
        self.confirmation_data.values()
    }
}

/// The tree itself. Generic over the confirmation payload stored per `(node, key)`.
pub struct PrefixTree<C> {
    nodes: Vec<TreeNode<C>>,
    index: HashMap<BlockId, usize>,
    root: usize,
    head: usize,
    last_inserted: HashMap<VerifyingKey, BlockId>,
}

impl<C: Clone> PrefixTree<C> {
    /// A fresh single-node tree rooted at `root_block`.
    pub fn new(root_block: BlockId) -> Self {
        let root = TreeNode::new(root_block, None, HashSet::new(), None);
        let mut index = HashMap::new();
        index.insert(root_block, 0);
        Self {
            nodes: vec![root],
            index,
            root: 0,
            head: 0,
            last_inserted: HashMap::new(),
        }
    }

    pub fn find(&self, block_id: &BlockId) -> Option<&TreeNode<C>> {
        self.index.get(block_id).map(|&idx| &self.nodes[idx])
    }

    pub fn get_root(&self) -> &TreeNode<C> {
        &self.nodes[self.root]
    }

    /// The deepest node overall. Among nodes of equal depth the earliest inserted wins,
    /// since the head only moves on a strictly greater block number.
    pub fn get_head(&self) -> &TreeNode<C> {
        &self.nodes[self.head]
    }

    /// The deepest block inserted by `creator`, if it is still in the tree.
    pub fn get_last_inserted_block(&self, creator: &VerifyingKey) -> Option<BlockId> {
        self.last_inserted.get(creator).copied()
    }

    /// Append one node per entry of `chain.blocks`, rooted transitively at the chain's
    /// base. Blocks already present are walked through without modification.
    pub fn insert(
        &mut self,
        chain: &Chain,
        creator_key: &VerifyingKey,
        active_bp_keys: &HashSet<VerifyingKey>,
    ) -> Result<(), NodeNotFoundError> {
        let (node, blocks) = self.resolve_base(chain).ok_or(NodeNotFoundError)?;
        self.insert_blocks(node, blocks, creator_key, active_bp_keys);
        Ok(())
    }

    /// Record `key → conf` on every node of `chain` that exists in the tree, and
    /// return the deepest such node's id. Returns `None`, inserting nothing, when the
    /// chain shares no block with the tree. A walk that runs off the known chain stops
    /// at the last node reached. Re-stamping the same `(key, node)` pair overwrites.
    pub fn add_confirmations(
        &mut self,
        chain: &Chain,
        sender_key: &VerifyingKey,
        conf: C,
    ) -> Option<BlockId> {
        let (mut node, blocks) = self.resolve_base(chain)?;
        let mut max_conf_node = node;
        self.nodes[node]
            .confirmation_data
            .insert(*sender_key, conf.clone());

        for block_id in &blocks {
            match self.child_by_id(node, block_id) {
                Some(child) => node = child,
                None => break,
            }
            self.nodes[node]
                .confirmation_data
                .insert(*sender_key, conf.clone());
            if self.nodes[max_conf_node].confirmation_data.len()
                <= self.nodes[node].confirmation_data.len()
            {
                max_conf_node = node;
            }
        }

        Some(self.nodes[max_conf_node].block_id)
    }

    /// Clear the confirmation data of every node. Called between rounds.
    pub fn remove_confirmations(&mut self) {
        for node in &mut self.nodes {
            node.confirmation_data.clear();
        }
    }

    /// The path from immediately after the root to `head_block_id`. `None` if the
    /// block is not in the tree.
    pub fn get_branch(&self, head_block_id: &BlockId) -> Option<Chain> {
        let mut idx = *self.index.get(head_block_id)?;
        let mut blocks = Vec::new();
        while idx != self.root {
            blocks.push(self.nodes[idx].block_id);
            idx = self.nodes[idx]
                .parent
                .expect("every non-root node has a parent");
        }
        blocks.reverse();
        Some(Chain {
            base_block: self.nodes[self.root].block_id,
            blocks,
        })
    }

    /// Reposition the root at `new_root` and prune everything that is not one of its
    /// descendants. Returns `false`, leaving the tree untouched, if `new_root` is not
    /// in the tree; the caller then replaces the whole tree.
    pub fn set_root(&mut self, new_root: &BlockId) -> bool {
        let Some(&new_root_idx) = self.index.get(new_root) else {
            return false;
        };
        if new_root_idx == self.root {
            return true;
        }

        // Rebuild the arena from the new root's subtree, remapping indices.
        let mut kept = Vec::new();
        let mut remap: HashMap<usize, usize> = HashMap::new();
        let mut stack = vec![new_root_idx];
        while let Some(idx) = stack.pop() {
            remap.insert(idx, kept.len());
            kept.push(idx);
            stack.extend(&self.nodes[idx].children);
        }

        let mut nodes = Vec::with_capacity(kept.len());
        let mut index = HashMap::with_capacity(kept.len());
        for &old_idx in &kept {
            let old = &self.nodes[old_idx];
            let parent = if old_idx == new_root_idx {
                None
            } else {
                old.parent.map(|p| remap[&p])
            };
            index.insert(old.block_id, nodes.len());
            nodes.push(TreeNode {
                block_id: old.block_id,
                creator_key: old.creator_key,
                active_bp_keys: old.active_bp_keys.clone(),
                parent,
                children: old.children.iter().map(|c| remap[c]).collect(),
                confirmation_data: old.confirmation_data.clone(),
            });
        }

        let head_id = self.nodes[self.head].block_id;
        self.nodes = nodes;
        self.root = 0;
        self.head = *index.get(&head_id).unwrap_or(&self.root);
        self.last_inserted.retain(|_, id| index.contains_key(id));
        self.index = index;
        true
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Resolve a chain against the tree: the index of the deepest known prefix node and
    /// the remaining block ids to walk. If the base is unknown, the first known block
    /// of the chain anchors the walk instead.
    fn resolve_base(&self, chain: &Chain) -> Option<(usize, Vec<BlockId>)> {
        if let Some(&idx) = self.index.get(&chain.base_block) {
            return Some((idx, chain.blocks.clone()));
        }
        let pos = chain
            .blocks
            .iter()
            .position(|block| self.index.contains_key(block))?;
        Some((
            self.index[&chain.blocks[pos]],
            chain.blocks[pos + 1..].to_vec(),
        ))
    }

    fn child_by_id(&self, node: usize, block_id: &BlockId) -> Option<usize> {
        self.nodes[node]
            .children
            .iter()
            .copied()
            .find(|&child| self.nodes[child].block_id == *block_id)
    }

    fn insert_blocks(
        &mut self,
        mut node: usize,
        blocks: Vec<BlockId>,
        creator_key: &VerifyingKey,
        active_bp_keys: &HashSet<VerifyingKey>,
    ) {
        for block_id in blocks {
            node = match self.child_by_id(node, &block_id) {
                Some(existing) => existing,
                None => {
                    let idx = self.nodes.len();
                    self.nodes.push(TreeNode::new(
                        block_id,
                        Some(*creator_key),
                        active_bp_keys.clone(),
                        Some(node),
                    ));
                    self.index.insert(block_id, idx);
                    self.nodes[node].children.push(idx);
                    idx
                }
            };
        }
        self.last_inserted
            .insert(*creator_key, self.nodes[node].block_id);

        if self.nodes[node].block_id.number() > self.nodes[self.head].block_id.number() {
            self.head = node;
        }
    }
}
