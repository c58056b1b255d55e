/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Events pushed into the gadget by the host node.
//!
//! The host is responsible for three notifications: a block was accepted into the fork
//! database, a block became irreversible, and a new peer session was established. Each
//! corresponds to a variant of [`ChainEvent`] with an inner struct carrying the event's
//! payload.

use std::collections::HashSet;

use crate::types::basic::{BlockId, SessionId};
use crate::types::crypto_primitives::VerifyingKey;

/// Everything the host chain can tell the gadget.
#[derive(Clone)]
pub enum ChainEvent {
    AcceptedBlock(AcceptedBlockEvent),
    Irreversible(IrreversibleEvent),
    NewPeer(NewPeerEvent),
}

/// A block was accepted by the host node.
#[derive(Clone)]
pub struct AcceptedBlockEvent {
    pub block_id: BlockId,
    pub prev_block_id: BlockId,
    /// The block creator's producer key.
    pub creator_key: VerifyingKey,
    /// Keys of the producers permitted to vote in the round containing this block.
    pub active_bp_keys: HashSet<VerifyingKey>,
    /// Whether the host is replaying historical blocks.
    pub sync: bool,
}

/// A block became irreversible on the host chain.
#[derive(Clone)]
pub struct IrreversibleEvent {
    pub block_id: BlockId,
}

/// A new peer session was established by the transport.
#[derive(Clone, Copy)]
pub struct NewPeerEvent {
    pub session_id: SessionId,
}
