/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-round state machine.
//!
//! One [`Round`] exists per round window. It drives
//! `Init → Prevote → ReadyToPrecommit → Precommit → Done | Fail`:
//!
//! - On construction the round immediately prevotes: it locates the primary's deepest
//!   block in the tree, broadcasts a single prevote over the branch leading to it
//!   signed by every local provider, and records the self-prevotes.
//! - Incoming prevotes are split into per-signer singletons, validated, and credited to
//!   every existing node of the voted chain. When the deepest stamped node's
//!   confirmation count strictly exceeds 2/3 of its active producer set, that node is
//!   latched as `best_node` and the round becomes `ReadyToPrecommit`.
//! - [`end_prevote`](Round::end_prevote), invoked by the engine when the prevote
//!   sub-window closes, freezes the proof's best block and prevotes and starts the
//!   precommit phase; without the threshold the round fails.
//! - Precommits are accepted in `ReadyToPrecommit` as well as `Precommit`, so a vote
//!   arriving between the internal threshold and `end_prevote` still counts. When the
//!   precommit count strictly exceeds 2/3, the round is `Done` and the injected
//!   `done_cb` fires.
//!
//! The round never talks to the network directly: the engine injects the two broadcast
//! closures and the done callback at construction.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use crate::messages::{Precommit, Prevote, Proof, SignedPrecommit, SignedPrevote};
use crate::prefix_tree::{Chain, PrefixTree};
use crate::types::basic::{BlockId, RoundNum};
use crate::types::crypto_primitives::{SignatureProvider, VerifyingKey};
use crate::types::signed_messages::Signed;

/// The tree is owned by the engine and shared with the current round; a round never
/// outlives its tree.
pub(crate) type SharedTree = Rc<RefCell<PrefixTree<Rc<SignedPrevote>>>>;

pub(crate) type PrevoteBroadcaster = Box<dyn Fn(&SignedPrevote)>;
pub(crate) type PrecommitBroadcaster = Box<dyn Fn(&SignedPrecommit)>;
pub(crate) type DoneCallback = Box<dyn Fn()>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RoundState {
    Init,
    Prevote,
    ReadyToPrecommit,
    Precommit,
    Done,
    Fail,
}

/// The node latched when the prevote threshold is reached, together with the size of
/// its active producer set at that moment. The count stays in force for the rest of
/// the round: the precommit threshold must not drift (or collapse to zero) if a LIB
/// jump prunes the latched node out of the tree mid-round.
#[derive(Clone, Copy)]
struct BestNode {
    block_id: BlockId,
    active_bp_count: usize,
}

pub(crate) struct Round {
    num: RoundNum,
    primary: VerifyingKey,
    tree: SharedTree,
    state: RoundState,
    proof: Proof,
    best_node: Option<BestNode>,
    signature_providers: Vec<SignatureProvider>,
    prevote_bcast: PrevoteBroadcaster,
    precommit_bcast: PrecommitBroadcaster,
    done_cb: DoneCallback,
    prevoted_keys: HashSet<VerifyingKey>,
    precommited_keys: HashSet<VerifyingKey>,
}

impl Round {
    pub(crate) fn new(
        num: RoundNum,
        primary: VerifyingKey,
        tree: SharedTree,
        signature_providers: Vec<SignatureProvider>,
        prevote_bcast: PrevoteBroadcaster,
        precommit_bcast: PrecommitBroadcaster,
        done_cb: DoneCallback,
    ) -> Self {
        log::debug!(
            "Round started, num: {}, primary: {}",
            num,
            crate::logging::abbrev(primary.as_bytes())
        );

        let mut round = Self {
            num,
            primary,
            tree,
            state: RoundState::Init,
            proof: Proof {
                round_num: num,
                best_block: BlockId::new([0u8; 32]),
                prevotes: Vec::new(),
                precommits: Vec::new(),
            },
            best_node: None,
            signature_providers,
            prevote_bcast,
            precommit_bcast,
            done_cb,
            prevoted_keys: HashSet::new(),
            precommited_keys: HashSet::new(),
        };
        round.prevote();
        round
    }

    pub(crate) fn num(&self) -> RoundNum {
        self.num
    }

    pub(crate) fn state(&self) -> RoundState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: RoundState) {
        self.state = state;
    }

    /// The round's proof. `Some` only once the round is done.
    pub(crate) fn proof(&self) -> Option<&Proof> {
        (self.state == RoundState::Done).then_some(&self.proof)
    }

    /// Handle a (possibly multi-signed) prevote message: split it into per-signer
    /// singletons, validate, and aggregate each independently.
    pub(crate) fn on_prevote(&mut self, msg: &SignedPrevote) {
        if self.state != RoundState::Prevote && self.state != RoundState::ReadyToPrecommit {
            log::debug!("Skipping prevote, round: {}", self.num);
            return;
        }

        for single in msg.split().collect::<Vec<_>>() {
            let key = single.signatures[0].signer;
            if !self.validate_prevote(&single.data, &key) {
                log::debug!("Invalid prevote for round {}", self.num);
                continue;
            }
            self.add_prevote(single);
        }
    }

    /// Handle a (possibly multi-signed) precommit message.
    pub(crate) fn on_precommit(&mut self, msg: &SignedPrecommit) {
        if self.state != RoundState::Precommit && self.state != RoundState::ReadyToPrecommit {
            log::debug!("Skipping precommit, round: {}", self.num);
            return;
        }

        for single in msg.split().collect::<Vec<_>>() {
            let key = single.signatures[0].signer;
            if !self.validate_precommit(&single.data, &key) {
                log::debug!("Invalid precommit for round {}", self.num);
                continue;
            }
            self.add_precommit(single);
        }
    }

    /// Close the prevote sub-window. Freezes the proof's best block and prevotes and
    /// moves on to precommitting, or fails the round if the prevote threshold was not
    /// reached.
    pub(crate) fn end_prevote(&mut self) {
        let Some(best_node) = self.best_node.filter(|_| self.state == RoundState::ReadyToPrecommit)
        else {
            log::debug!("Round failed, num: {}, state: {:?}", self.num, self.state);
            self.state = RoundState::Fail;
            return;
        };

        let prevotes = {
            let tree = self.tree.borrow();
            tree.find(&best_node.block_id)
                .map(|node| node.confirmations().map(|conf| (**conf).clone()).collect())
        };
        let Some(prevotes) = prevotes else {
            log::warn!(
                "Best block {} left the tree before the prevote window closed, round: {}",
                best_node.block_id,
                self.num
            );
            self.state = RoundState::Fail;
            return;
        };

        log::debug!(
            "Prevote finished for round {}, best_block: {}",
            self.num,
            best_node.block_id
        );

        self.proof.round_num = self.num;
        self.proof.best_block = best_node.block_id;
        self.proof.prevotes = prevotes;

        self.precommit();
    }

    /// Returns whether the round gained a supermajority; fails the round otherwise.
    /// Invoked by the engine when the round window ends.
    pub(crate) fn finish(&mut self) -> bool {
        if self.state != RoundState::Done {
            log::debug!("Round failed, num: {}, state: {:?}", self.num, self.state);
            self.state = RoundState::Fail;
            return false;
        }
        true
    }

    fn prevote(&mut self) {
        self.state = RoundState::Prevote;

        let chain = {
            let tree = self.tree.borrow();
            let Some(last_block) = tree.get_last_inserted_block(&self.primary) else {
                log::warn!(
                    "No block in tree for primary: {}",
                    crate::logging::abbrev(self.primary.as_bytes())
                );
                return;
            };
            match tree.get_branch(&last_block) {
                Some(chain) => chain,
                None => return,
            }
        };

        let prevote = Prevote {
            round_num: self.num,
            base_block: chain.base_block,
            blocks: chain.blocks,
        };

        for i in 0..self.signature_providers.len() {
            let msg = Signed::new(
                prevote.clone(),
                std::slice::from_ref(&self.signature_providers[i]),
            );
            self.add_prevote(msg);
        }
        (self.prevote_bcast)(&Signed::new(prevote, &self.signature_providers));
    }

    fn precommit(&mut self) {
        self.state = RoundState::Precommit;

        let Some(best_node) = self.best_node else {
            return;
        };
        let precommit = Precommit {
            round_num: self.num,
            block_id: best_node.block_id,
        };

        for i in 0..self.signature_providers.len() {
            let msg = Signed::new(
                precommit.clone(),
                std::slice::from_ref(&self.signature_providers[i]),
            );
            self.add_precommit(msg);
        }
        (self.precommit_bcast)(&Signed::new(precommit, &self.signature_providers));
    }

    fn validate_prevote(&self, prevote: &Prevote, key: &VerifyingKey) -> bool {
        if self.num != prevote.round_num {
            log::debug!(
                "Received prevote for wrong round, received for: {}, expected: {}",
                prevote.round_num,
                self.num
            );
            return false;
        }

        if self.prevoted_keys.contains(key) {
            log::debug!(
                "Received prevote second time for key {}",
                crate::logging::abbrev(key.as_bytes())
            );
            return false;
        }

        let tree = self.tree.borrow();
        let Some(node_id) = Self::find_last_node(&tree, &prevote.base_block, &prevote.blocks)
        else {
            log::debug!("Received prevote for unknown blocks");
            return false;
        };

        let node = tree
            .find(&node_id)
            .expect("find_last_node only returns blocks present in the tree");
        if !node.active_bp_keys.contains(key) {
            log::debug!(
                "Received prevote for block {} from not active producer {}",
                node_id,
                crate::logging::abbrev(key.as_bytes())
            );
            return false;
        }

        true
    }

    fn validate_precommit(&self, precommit: &Precommit, key: &VerifyingKey) -> bool {
        if self.num != precommit.round_num {
            log::debug!(
                "Received precommit for wrong round, received for: {}, expected: {}",
                precommit.round_num,
                self.num
            );
            return false;
        }

        if self.precommited_keys.contains(key) {
            log::debug!(
                "Received precommit second time for key {}",
                crate::logging::abbrev(key.as_bytes())
            );
            return false;
        }

        let Some(best_node) = self.best_node else {
            return false;
        };

        if precommit.block_id != best_node.block_id {
            log::debug!(
                "Received precommit for not best block, id: {}, best_id: {}",
                precommit.block_id,
                best_node.block_id
            );
            return false;
        }

        let tree = self.tree.borrow();
        let has_prevoted = tree
            .find(&best_node.block_id)
            .is_some_and(|node| node.has_confirmation(key));
        if !has_prevoted {
            log::debug!(
                "Received precommit for block {} from not prevoted peer: {}",
                best_node.block_id,
                crate::logging::abbrev(key.as_bytes())
            );
            return false;
        }

        true
    }

    /// Record a single-signed prevote: stamp the voted chain in the tree and check the
    /// prevote threshold.
    fn add_prevote(&mut self, msg: SignedPrevote) {
        let key = msg.signatures[0].signer;
        let chain = Chain {
            base_block: msg.data.base_block,
            blocks: msg.data.blocks.clone(),
        };

        let max_prevote_node =
            self.tree
                .borrow_mut()
                .add_confirmations(&chain, &key, Rc::new(msg));
        let Some(max_prevote_node) = max_prevote_node else {
            log::error!("Prevote chain unexpectedly left the tree, round: {}", self.num);
            return;
        };

        self.prevoted_keys.insert(key);

        let (confirmations, active_len) = {
            let tree = self.tree.borrow();
            let node = tree
                .find(&max_prevote_node)
                .expect("add_confirmations returned a block present in the tree");
            (node.confirmation_number(), node.active_bp_keys.len())
        };
        log::debug!(
            "Prevote inserted, round: {}, from: {}, max_confs: {}",
            self.num,
            crate::logging::abbrev(key.as_bytes()),
            confirmations
        );

        if self.state != RoundState::ReadyToPrecommit && confirmations > active_len * 2 / 3 {
            self.state = RoundState::ReadyToPrecommit;
            self.best_node = Some(BestNode {
                block_id: max_prevote_node,
                active_bp_count: active_len,
            });
            log::debug!(
                "Prevote threshold reached, round: {}, best block: {}",
                self.num,
                max_prevote_node
            );
        }
    }

    /// Record a single-signed precommit and check the precommit threshold.
    fn add_precommit(&mut self, msg: SignedPrecommit) {
        let key = msg.signatures[0].signer;
        self.precommited_keys.insert(key);
        self.proof.precommits.push(msg);

        log::debug!(
            "Precommit inserted, round: {}, from: {}",
            self.num,
            crate::logging::abbrev(key.as_bytes())
        );

        let Some(best_node) = self.best_node else {
            return;
        };

        if self.state != RoundState::Done
            && self.proof.precommits.len() > best_node.active_bp_count * 2 / 3
        {
            log::debug!("Precommit threshold reached, round: {}", self.num);
            self.state = RoundState::Done;
            (self.done_cb)();
        }
    }

    /// The deepest block of `(base_block, blocks)` that exists in the tree: a reverse
    /// scan of `blocks`, falling back to the base.
    fn find_last_node(
        tree: &PrefixTree<Rc<SignedPrevote>>,
        base_block: &BlockId,
        blocks: &[BlockId],
    ) -> Option<BlockId> {
        blocks
            .iter()
            .rev()
            .copied()
            .find(|block_id| tree.find(block_id).is_some())
            .or_else(|| tree.find(base_block).map(|node| node.block_id))
    }
}
