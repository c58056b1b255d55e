/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The finality engine: the single-threaded dispatcher at the center of the gadget.
//!
//! The engine owns the prefix chain tree, the current round (at most one at a time),
//! the peer table, the message-dedup caches, the proof ring, and the node state
//! (`syncing`, `frozen`). It is driven exclusively by [`process`](Engine::process):
//! the engine thread pops one message at a time off the queue and dispatches it here,
//! so every handler runs to completion before the next message is looked at.
//!
//! ## Round windows
//!
//! With `round_width` w and `prevote_width` p, a block of height h belongs to round
//! `(h - 1) / w` at offset `(h - 1) mod w`. A new round starts when an accepted
//! block's round number exceeds the current round's (or no round exists); the prevote
//! sub-window closes when an accepted block sits at offset p of the current round.
//!
//! ## Suppression
//!
//! While the host is replaying history (`syncing`) or the head has run more than
//! `max_finality_lag` blocks past the last irreversible block (`frozen`), the engine
//! creates no rounds, processes no votes, and accepts no proofs.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use lru::LruCache;

use crate::channel::{FinalityChannel, NetChannel};
use crate::config::Configuration;
use crate::events::{AcceptedBlockEvent, ChainEvent, IrreversibleEvent, NewPeerEvent};
use crate::logging::abbrev;
use crate::messages::{
    FinalityNotice, FinalityReqProof, Handshake, HandshakeAns, NetEnvelope, NetMessage, Precommit,
    Prevote, Proof, SignedFinalityNotice, SignedFinalityReqProof, SignedHandshake,
    SignedHandshakeAns, SignedPrecommit, SignedPrevote, SignedProof,
};
use crate::prefix_tree::{Chain, PrefixTree};
use crate::round::{Round, RoundState, SharedTree};
use crate::types::basic::{BlockId, BlockNum, Digest, RoundNum, SessionId};
use crate::types::crypto_primitives::{SignatureProvider, VerifyingKey};
use crate::types::signed_messages::Signed;

/// One unit of work for the engine thread: either a network message or a chain event.
pub(crate) enum GadgetMessage {
    Network(NetEnvelope),
    Chain(ChainEvent),
}

/// Handle for sending and broadcasting messages on the outbound network channel.
///
/// Cloneable so that the current round's broadcast closures share the engine's peer
/// table and its sent-message dedup cache.
#[derive(Clone)]
pub(crate) struct MessageSender {
    out: Arc<NetChannel>,
    peers: Rc<RefCell<HashMap<VerifyingKey, SessionId>>>,
    sent_messages: Rc<RefCell<LruCache<Digest, ()>>>,
}

impl MessageSender {
    fn new(out: Arc<NetChannel>, cache_size: std::num::NonZeroUsize) -> Self {
        Self {
            out,
            peers: Rc::new(RefCell::new(HashMap::new())),
            sent_messages: Rc::new(RefCell::new(LruCache::new(cache_size))),
        }
    }

    pub(crate) fn send(&self, session_id: SessionId, message: NetMessage) {
        self.out.send(&NetEnvelope {
            session_id,
            message,
            receive_time: SystemTime::now(),
        });
    }

    /// Send `message` to every known peer, unless the same message was recently
    /// broadcast already.
    pub(crate) fn broadcast(&self, message: NetMessage) {
        let msg_hash = message.message_hash();
        if self.sent_messages.borrow().contains(&msg_hash) {
            return;
        }
        for session_id in self.peers.borrow().values() {
            self.send(*session_id, message.clone());
        }
        self.sent_messages.borrow_mut().put(msg_hash, ());
    }
}

pub(crate) struct Engine {
    config: Configuration,
    is_block_producer: bool,
    signature_providers: Vec<SignatureProvider>,
    public_keys: Vec<VerifyingKey>,
    sig_provs_by_key: HashMap<VerifyingKey, SignatureProvider>,
    tree: SharedTree,
    round: Option<Round>,
    /// Set by the current round's `done_cb`; checked after every round interaction so
    /// the completion runs once the round handler has returned.
    round_done: Rc<Cell<bool>>,
    lib: BlockId,
    last_proven_block_num: BlockNum,
    sender: MessageSender,
    self_messages: LruCache<Digest, ()>,
    last_proofs: VecDeque<Proof>,
    is_syncing: Arc<AtomicBool>,
    is_frozen: Arc<AtomicBool>,
    finality: Arc<FinalityChannel>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Configuration,
        is_block_producer: bool,
        signature_providers: Vec<SignatureProvider>,
        out_net: Arc<NetChannel>,
        finality: Arc<FinalityChannel>,
        initial_lib: BlockId,
        is_syncing: Arc<AtomicBool>,
        is_frozen: Arc<AtomicBool>,
    ) -> Self {
        let public_keys: Vec<_> = signature_providers
            .iter()
            .map(|prov| *prov.public_key())
            .collect();
        let sig_provs_by_key = signature_providers
            .iter()
            .map(|prov| (*prov.public_key(), prov.clone()))
            .collect();
        let sender = MessageSender::new(out_net, config.message_cache_size);
        let self_messages = LruCache::new(config.message_cache_size);

        Self {
            config,
            is_block_producer,
            signature_providers,
            public_keys,
            sig_provs_by_key,
            tree: Rc::new(RefCell::new(PrefixTree::new(initial_lib))),
            round: None,
            round_done: Rc::new(Cell::new(false)),
            lib: initial_lib,
            last_proven_block_num: BlockNum::new(0),
            sender,
            self_messages,
            last_proofs: VecDeque::new(),
            is_syncing,
            is_frozen,
            finality,
        }
    }

    pub(crate) fn process(&mut self, message: GadgetMessage) {
        match message {
            GadgetMessage::Network(envelope) => self.process_net_msg(envelope),
            GadgetMessage::Chain(event) => self.process_event(event),
        }
    }

    fn process_net_msg(&mut self, envelope: NetEnvelope) {
        let age = SystemTime::now()
            .duration_since(envelope.receive_time)
            .unwrap_or_default();
        if age > self.config.msg_expiration {
            log::debug!("Network message dropped, msg age: {:?}", age);
            return;
        }

        if !envelope.message.verify() {
            log::debug!(
                "Network message with invalid signatures dropped, kind: {}",
                envelope.message.kind()
            );
            return;
        }

        let session_id = envelope.session_id;
        match envelope.message {
            NetMessage::Prevote(msg) => self.on_prevote_msg(msg),
            NetMessage::Precommit(msg) => self.on_precommit_msg(msg),
            NetMessage::FinalityNotice(msg) => self.on_finality_notice(session_id, msg),
            NetMessage::FinalityReqProof(msg) => self.on_finality_req_proof(session_id, msg),
            NetMessage::Proof(msg) => self.on_proof_msg(msg),
            NetMessage::Handshake(msg) => self.on_handshake(session_id, msg),
            NetMessage::HandshakeAns(msg) => self.on_handshake_ans(session_id, msg),
        }
    }

    fn process_event(&mut self, event: ChainEvent) {
        match event {
            ChainEvent::AcceptedBlock(event) => self.on_accepted_block(event),
            ChainEvent::Irreversible(event) => self.on_irreversible(event),
            ChainEvent::NewPeer(event) => self.on_new_peer(event),
        }
    }

    //
    // Network message handlers.
    //

    fn on_prevote_msg(&mut self, msg: SignedPrevote) {
        if !self.admit_round_msg(msg.message_hash(), msg.data.round_num, || {
            NetMessage::Prevote(msg.clone())
        }) {
            return;
        }

        let Some(round) = self.round.as_mut() else {
            log::debug!("Round does not exist");
            return;
        };
        round.on_prevote(&msg);
        self.maybe_finish_round();
    }

    fn on_precommit_msg(&mut self, msg: SignedPrecommit) {
        if !self.admit_round_msg(msg.message_hash(), msg.data.round_num, || {
            NetMessage::Precommit(msg.clone())
        }) {
            return;
        }

        let Some(round) = self.round.as_mut() else {
            log::debug!("Round does not exist");
            return;
        };
        round.on_precommit(&msg);
        self.maybe_finish_round();
    }

    /// Shared admission path for prevotes and precommits: drop while syncing or
    /// frozen, drop duplicates, and gossip messages of the head block's round on to
    /// every peer.
    fn admit_round_msg(
        &mut self,
        msg_hash: Digest,
        msg_round: RoundNum,
        gossip: impl FnOnce() -> NetMessage,
    ) -> bool {
        if self.is_suppressed() {
            log::debug!("Syncing or frozen");
            return false;
        }

        if self.self_messages.contains(&msg_hash) {
            return false;
        }
        self.self_messages.put(msg_hash, ());

        let head_round = self.round_num(&self.tree.borrow().get_head().block_id);
        if head_round == msg_round {
            self.sender.broadcast(gossip());
        }
        true
    }

    fn on_finality_notice(&mut self, session_id: SessionId, msg: SignedFinalityNotice) {
        let data = &msg.data;
        log::debug!("finality_notice received for block {}", data.best_block);

        if self.is_active_bp(&data.best_block)
            && data.best_block.number() <= self.last_proven_block_num
        {
            log::debug!("No need to get finality proof for a block producer node");
            return;
        }

        let request = Signed::new(
            FinalityReqProof {
                round_num: data.round_num,
            },
            &self.signature_providers,
        );
        self.sender
            .send(session_id, NetMessage::FinalityReqProof(request));
    }

    fn on_finality_req_proof(&mut self, session_id: SessionId, msg: SignedFinalityReqProof) {
        log::debug!("finality_req_proof received for round {}", msg.data.round_num);
        if let Some(proof) = self
            .last_proofs
            .iter()
            .find(|proof| proof.round_num == msg.data.round_num)
        {
            log::debug!("Proof found; sending it");
            let reply = Signed::new(proof.clone(), &self.signature_providers);
            self.sender.send(session_id, NetMessage::Proof(reply));
        }
    }

    fn on_proof_msg(&mut self, msg: SignedProof) {
        let proof = &msg.data;
        log::debug!("Received proof for round {}", proof.round_num);

        if self.is_suppressed() {
            log::debug!("Skipping proof while syncing or frozen");
            return;
        }

        if self.last_proven_block_num >= proof.best_block.number() {
            log::debug!(
                "Skipping proof for {} cause last proven block {} is higher",
                proof.best_block,
                self.last_proven_block_num
            );
            return;
        }

        if self.lib.number() >= proof.best_block.number() {
            log::debug!(
                "Skipping proof for {} cause lib {} is higher",
                proof.best_block,
                self.lib
            );
            return;
        }

        if self
            .round
            .as_ref()
            .is_some_and(|round| round.state() == RoundState::Done)
        {
            log::debug!(
                "Skipping proof for {} cause the current round is finished",
                proof.best_block
            );
            return;
        }

        if !self.validate_proof(proof) {
            for public_key in msg.public_keys() {
                log::info!("Invalid proof from {}", abbrev(public_key.as_bytes()));
            }
            return;
        }

        log::info!("Successfully validated proof for block {}", proof.best_block);

        if let Some(round) = self.round.as_mut() {
            if round.num() == proof.round_num {
                log::debug!("Gotta proof for round {}", round.num());
                round.set_state(RoundState::Done);
            }
        }
        let proof = proof.clone();
        self.on_proof_gained(&proof);
    }

    fn on_handshake(&mut self, session_id: SessionId, msg: SignedHandshake) {
        for public_key in msg.public_keys() {
            log::info!(
                "handshake received, ses_id: {}, from: {}",
                session_id,
                abbrev(public_key.as_bytes())
            );
            self.sender.peers.borrow_mut().insert(public_key, session_id);
            let answer = Signed::new(HandshakeAns { lib: self.lib }, &self.signature_providers);
            self.sender.send(session_id, NetMessage::HandshakeAns(answer));
        }
    }

    fn on_handshake_ans(&mut self, session_id: SessionId, msg: SignedHandshakeAns) {
        for public_key in msg.public_keys() {
            log::info!(
                "handshake_ans received, ses_id: {}, from: {}",
                session_id,
                abbrev(public_key.as_bytes())
            );
            self.sender.peers.borrow_mut().insert(public_key, session_id);
        }
    }

    //
    // Chain event handlers.
    //

    fn on_accepted_block(&mut self, event: AcceptedBlockEvent) {
        log::debug!(
            "accepted_block handled, block_id: {}, num: {}, creator: {}",
            event.block_id,
            event.block_id.number(),
            abbrev(event.creator_key.as_bytes())
        );

        let chain = Chain {
            base_block: event.prev_block_id,
            blocks: vec![event.block_id],
        };
        if self
            .tree
            .borrow_mut()
            .insert(&chain, &event.creator_key, &event.active_bp_keys)
            .is_err()
        {
            log::error!(
                "Cannot insert block into tree, base_block: {}, block: {}",
                event.prev_block_id,
                event.block_id
            );
            return;
        }

        self.is_syncing.store(event.sync, Ordering::Relaxed);
        let lag = event.block_id.number().int() as i64 - self.lib.number().int() as i64;
        self.is_frozen
            .store(lag > self.config.max_finality_lag as i64, Ordering::Relaxed);

        // While syncing or frozen it is useless to create new rounds.
        if self.is_suppressed() {
            log::info!("Omit block while syncing or frozen, id: {}", event.block_id);
            return;
        }

        if self.should_start_round(&event.block_id) {
            log::debug!("Starting new round");
            self.remove_round();

            if self.is_active_bp(&event.block_id) {
                let round_num = self.round_num(&event.block_id);
                self.new_round(round_num, &event.creator_key, &event.active_bp_keys);
            }
        }

        if self.should_end_prevote(&event.block_id) {
            if let Some(round) = self.round.as_mut() {
                round.end_prevote();
            }
            self.maybe_finish_round();
        }
    }

    fn on_irreversible(&mut self, event: IrreversibleEvent) {
        log::debug!(
            "irreversible handled, block_id: {}, num: {}",
            event.block_id,
            event.block_id.number()
        );

        if event.block_id.number() <= self.tree.borrow().get_root().block_id.number() {
            log::debug!(
                "Handled irreversible for old block, num: {}",
                event.block_id.number()
            );
            return;
        }

        self.update_lib(event.block_id);
    }

    fn on_new_peer(&mut self, event: NewPeerEvent) {
        log::debug!("new_peer handled, ses_id: {}", event.session_id);
        let msg = Signed::new(Handshake { lib: self.lib }, &self.signature_providers);
        self.sender
            .send(event.session_id, NetMessage::Handshake(msg));
    }

    //
    // Round management.
    //

    fn new_round(
        &mut self,
        round_num: RoundNum,
        primary: &VerifyingKey,
        active_bp_keys: &HashSet<VerifyingKey>,
    ) {
        let prevote_sender = self.sender.clone();
        let precommit_sender = self.sender.clone();
        let done_flag = Rc::clone(&self.round_done);

        self.round = Some(Round::new(
            round_num,
            *primary,
            Rc::clone(&self.tree),
            self.get_active_signature_providers(active_bp_keys),
            Box::new(move |msg: &SignedPrevote| {
                prevote_sender.broadcast(NetMessage::Prevote(msg.clone()))
            }),
            Box::new(move |msg: &SignedPrecommit| {
                precommit_sender.broadcast(NetMessage::Precommit(msg.clone()))
            }),
            Box::new(move || done_flag.set(true)),
        ));
        log::debug!("New round ({}) started", round_num);
    }

    fn remove_round(&mut self) {
        self.sender.sent_messages.borrow_mut().clear();
        self.self_messages.clear();
        self.tree.borrow_mut().remove_confirmations();
        self.round = None;
        self.round_done.set(false);
        log::debug!("Current round removed");
    }

    /// Run the round-completion path if the current round signalled `done` from inside
    /// a message handler.
    fn maybe_finish_round(&mut self) {
        if self.round_done.replace(false) {
            self.finish_round();
        }
    }

    fn finish_round(&mut self) {
        let proof = match self.round.as_mut() {
            Some(round) => {
                if !round.finish() {
                    return;
                }
                round.proof().cloned()
            }
            _ => return,
        };
        let Some(proof) = proof else {
            return;
        };

        log::info!(
            "Round reached supermajority, round num: {}, best block id: {}, best block num: {}",
            proof.round_num,
            proof.best_block,
            proof.best_block.number()
        );

        if self.lib.number() < proof.best_block.number() {
            self.on_proof_gained(&proof);
            self.update_lib(proof.best_block);
        }
        log::debug!("Round {} finished", proof.round_num);
    }

    fn on_proof_gained(&mut self, proof: &Proof) {
        self.last_proofs.push_front(proof.clone());
        self.last_proofs.truncate(self.config.proof_cache_size);
        log::debug!("Cached proof for block {}", proof.best_block);

        self.last_proven_block_num = proof.best_block.number();
        self.finality.send(&proof.best_block);

        let notice = Signed::new(
            FinalityNotice {
                round_num: proof.round_num,
                best_block: proof.best_block,
            },
            &self.signature_providers,
        );
        self.sender.broadcast(NetMessage::FinalityNotice(notice));
    }

    fn update_lib(&mut self, lib_id: BlockId) {
        let repositioned = self.tree.borrow_mut().set_root(&lib_id);
        if !repositioned {
            // The LIB jumped beyond anything we know; restart from a fresh root.
            *self.tree.borrow_mut() = PrefixTree::new(lib_id);
        }
        self.lib = lib_id;
    }

    //
    // Proof validation, independent of any round.
    //

    fn validate_proof(&self, proof: &Proof) -> bool {
        let tree = self.tree.borrow();
        let Some(node) = tree.find(&proof.best_block) else {
            log::debug!("Received proof for unknown block: {}", proof.best_block);
            return false;
        };
        let bp_keys = &node.active_bp_keys;

        let mut prevoted_keys = HashSet::new();
        for prevote in &proof.prevotes {
            if !prevote.verify() {
                log::debug!("Proof prevote carries invalid signatures");
                return false;
            }
            for prevoter_key in prevote.public_keys() {
                if !Self::validate_proof_prevote(
                    &prevote.data,
                    &prevoter_key,
                    &proof.best_block,
                    bp_keys,
                ) {
                    log::debug!("Prevote validation failed, base_block: {}", prevote.data.base_block);
                    return false;
                }
                prevoted_keys.insert(prevoter_key);
            }
        }

        let mut precommited_keys = HashSet::new();
        for precommit in &proof.precommits {
            if !precommit.verify() {
                log::debug!("Proof precommit carries invalid signatures");
                return false;
            }
            for precommiter_key in precommit.public_keys() {
                if !prevoted_keys.contains(&precommiter_key) {
                    log::debug!(
                        "Precommitter has not prevoted, pub_key: {}",
                        abbrev(precommiter_key.as_bytes())
                    );
                    return false;
                }
                if !Self::validate_proof_precommit(
                    &precommit.data,
                    &precommiter_key,
                    &proof.best_block,
                    bp_keys,
                ) {
                    log::debug!("Precommit validation failed for {}", precommit.data.block_id);
                    return false;
                }
                precommited_keys.insert(precommiter_key);
            }
        }

        let is_enough_keys = precommited_keys.len() > bp_keys.len() * 2 / 3;
        if !is_enough_keys {
            log::debug!(
                "Precommit validation failed: not enough keys: have {}, need {}",
                precommited_keys.len(),
                bp_keys.len() * 2 / 3 + 1
            );
        }
        is_enough_keys
    }

    fn validate_proof_prevote(
        prevote: &Prevote,
        prevoter_key: &VerifyingKey,
        best_block: &BlockId,
        bp_keys: &HashSet<VerifyingKey>,
    ) -> bool {
        if prevote.base_block != *best_block && !prevote.blocks.contains(best_block) {
            log::debug!("Best block: {} was not found in prevote blocks", best_block);
            false
        } else if !bp_keys.contains(prevoter_key) {
            log::debug!(
                "Prevoter public key is not in active bp keys: {}",
                abbrev(prevoter_key.as_bytes())
            );
            false
        } else {
            true
        }
    }

    fn validate_proof_precommit(
        precommit: &Precommit,
        precommiter_key: &VerifyingKey,
        best_block: &BlockId,
        bp_keys: &HashSet<VerifyingKey>,
    ) -> bool {
        if precommit.block_id != *best_block {
            log::debug!(
                "Precommit block {}, best block: {}",
                precommit.block_id,
                best_block
            );
            false
        } else if !bp_keys.contains(precommiter_key) {
            log::debug!(
                "Precommitter public key is not in active bp keys: {}",
                abbrev(precommiter_key.as_bytes())
            );
            false
        } else {
            true
        }
    }

    //
    // Round window arithmetic and small queries.
    //

    fn is_suppressed(&self) -> bool {
        self.is_syncing.load(Ordering::Relaxed) || self.is_frozen.load(Ordering::Relaxed)
    }

    fn round_num(&self, block_id: &BlockId) -> RoundNum {
        RoundNum::new(block_id.number().int().saturating_sub(1) / self.config.round_width)
    }

    fn num_in_round(&self, block_id: &BlockId) -> u32 {
        block_id.number().int().saturating_sub(1) % self.config.round_width
    }

    fn should_start_round(&self, block_id: &BlockId) -> bool {
        if block_id.number().int() < 1 {
            return false;
        }
        match &self.round {
            None => true,
            Some(round) => self.round_num(block_id) > round.num(),
        }
    }

    fn should_end_prevote(&self, block_id: &BlockId) -> bool {
        match &self.round {
            None => false,
            Some(round) => {
                self.round_num(block_id) == round.num()
                    && self.num_in_round(block_id) == self.config.prevote_width
            }
        }
    }

    fn is_active_bp(&self, block_id: &BlockId) -> bool {
        if !self.is_block_producer {
            return false;
        }

        let tree = self.tree.borrow();
        let Some(node) = tree.find(block_id) else {
            log::debug!("Block not found: {}", block_id);
            return false;
        };

        self.public_keys
            .iter()
            .any(|key| node.active_bp_keys.contains(key))
    }

    /// Intersection of the configured signature providers with a block's active
    /// producer set.
    fn get_active_signature_providers(
        &self,
        active_bp_keys: &HashSet<VerifyingKey>,
    ) -> Vec<SignatureProvider> {
        active_bp_keys
            .iter()
            .filter_map(|key| self.sig_provs_by_key.get(key))
            .cloned()
            .collect()
    }
}
