/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Structured messages exchanged between peers.
//!
//! ## Messages
//!
//! The protocol involves seven kinds of messages:
//! 1. [`Prevote`]: a first-round vote over a chain suffix ("I see this chain as best
//!    from `base_block`").
//! 2. [`Precommit`]: a second-round vote naming exactly one block ("I commit to this
//!    block").
//! 3. [`FinalityNotice`]: broadcast after a proof is gained, advertising the newly
//!    final block.
//! 4. [`FinalityReqProof`]: asks a peer for the proof of a given round, sent in
//!    response to a notice for a block we have not proven ourselves.
//! 5. [`Proof`]: the full proof bundle for a round: the best block, the prevotes
//!    stored at it, and a supermajority of precommits.
//! 6. [`Handshake`] / [`HandshakeAns`]: peer introduction, carrying each side's last
//!    irreversible block.
//!
//! Every message travels as a [`Signed`] wrapper with one or more signatures, inside a
//! [`NetEnvelope`] stamped by the transport with the session id and the receive time.

use std::time::SystemTime;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::{BlockId, RoundNum, SessionId};
use crate::types::signed_messages::{Payload, Signed};

/// Peer introduction, carrying the sender's last irreversible block.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Handshake {
    pub lib: BlockId,
}

impl Payload for Handshake {
    const TAG: u8 = 1;
}

/// Answer to a [`Handshake`].
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct HandshakeAns {
    pub lib: BlockId,
}

impl Payload for HandshakeAns {
    const TAG: u8 = 2;
}

/// First-round vote over the chain suffix `(base_block, blocks)`.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Prevote {
    pub round_num: RoundNum,
    pub base_block: BlockId,
    pub blocks: Vec<BlockId>,
}

impl Payload for Prevote {
    const TAG: u8 = 3;
}

/// Second-round vote naming exactly one block.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Precommit {
    pub round_num: RoundNum,
    pub block_id: BlockId,
}

impl Payload for Precommit {
    const TAG: u8 = 4;
}

/// Advertisement that a proof exists for `best_block`.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct FinalityNotice {
    pub round_num: RoundNum,
    pub best_block: BlockId,
}

impl Payload for FinalityNotice {
    const TAG: u8 = 5;
}

/// Request for the proof of a given round.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct FinalityReqProof {
    pub round_num: RoundNum,
}

impl Payload for FinalityReqProof {
    const TAG: u8 = 6;
}

/// Bundle demonstrating a supermajority on `best_block`.
///
/// Well-formedness, checked by `validate_proof`: every precommit signer appears among
/// the prevote signers, every precommit names `best_block`, and the precommit signer
/// count strictly exceeds 2/3 of the active producer set of `best_block`.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Proof {
    pub round_num: RoundNum,
    pub best_block: BlockId,
    pub prevotes: Vec<SignedPrevote>,
    pub precommits: Vec<SignedPrecommit>,
}

impl Payload for Proof {
    const TAG: u8 = 7;
}

pub type SignedHandshake = Signed<Handshake>;
pub type SignedHandshakeAns = Signed<HandshakeAns>;
pub type SignedPrevote = Signed<Prevote>;
pub type SignedPrecommit = Signed<Precommit>;
pub type SignedFinalityNotice = Signed<FinalityNotice>;
pub type SignedFinalityReqProof = Signed<FinalityReqProof>;
pub type SignedProof = Signed<Proof>;

/// The closed sum of everything a peer can send us.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub enum NetMessage {
    Handshake(SignedHandshake),
    HandshakeAns(SignedHandshakeAns),
    Prevote(SignedPrevote),
    Precommit(SignedPrecommit),
    Proof(SignedProof),
    FinalityNotice(SignedFinalityNotice),
    FinalityReqProof(SignedFinalityReqProof),
}

impl NetMessage {
    /// Whether the signature list is non-empty and every signature verifies against
    /// the body.
    pub fn verify(&self) -> bool {
        match self {
            NetMessage::Handshake(msg) => msg.verify(),
            NetMessage::HandshakeAns(msg) => msg.verify(),
            NetMessage::Prevote(msg) => msg.verify(),
            NetMessage::Precommit(msg) => msg.verify(),
            NetMessage::Proof(msg) => msg.verify(),
            NetMessage::FinalityNotice(msg) => msg.verify(),
            NetMessage::FinalityReqProof(msg) => msg.verify(),
        }
    }

    /// Dedup-cache key: hash over the body and the signatures of the inner message.
    pub fn message_hash(&self) -> crate::types::basic::Digest {
        match self {
            NetMessage::Handshake(msg) => msg.message_hash(),
            NetMessage::HandshakeAns(msg) => msg.message_hash(),
            NetMessage::Prevote(msg) => msg.message_hash(),
            NetMessage::Precommit(msg) => msg.message_hash(),
            NetMessage::Proof(msg) => msg.message_hash(),
            NetMessage::FinalityNotice(msg) => msg.message_hash(),
            NetMessage::FinalityReqProof(msg) => msg.message_hash(),
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            NetMessage::Handshake(_) => "handshake",
            NetMessage::HandshakeAns(_) => "handshake_ans",
            NetMessage::Prevote(_) => "prevote",
            NetMessage::Precommit(_) => "precommit",
            NetMessage::Proof(_) => "proof",
            NetMessage::FinalityNotice(_) => "finality_notice",
            NetMessage::FinalityReqProof(_) => "finality_req_proof",
        }
    }
}

impl From<SignedHandshake> for NetMessage {
    fn from(msg: SignedHandshake) -> Self {
        NetMessage::Handshake(msg)
    }
}

impl From<SignedHandshakeAns> for NetMessage {
    fn from(msg: SignedHandshakeAns) -> Self {
        NetMessage::HandshakeAns(msg)
    }
}

impl From<SignedPrevote> for NetMessage {
    fn from(msg: SignedPrevote) -> Self {
        NetMessage::Prevote(msg)
    }
}

impl From<SignedPrecommit> for NetMessage {
    fn from(msg: SignedPrecommit) -> Self {
        NetMessage::Precommit(msg)
    }
}

impl From<SignedProof> for NetMessage {
    fn from(msg: SignedProof) -> Self {
        NetMessage::Proof(msg)
    }
}

impl From<SignedFinalityNotice> for NetMessage {
    fn from(msg: SignedFinalityNotice) -> Self {
        NetMessage::FinalityNotice(msg)
    }
}

impl From<SignedFinalityReqProof> for NetMessage {
    fn from(msg: SignedFinalityReqProof) -> Self {
        NetMessage::FinalityReqProof(msg)
    }
}

/// A network message as delivered by the transport: the session it arrived on (or is
/// to be sent to), the body, and the time the transport received it.
#[derive(Clone)]
pub struct NetEnvelope {
    pub session_id: SessionId,
    pub message: NetMessage,
    pub receive_time: SystemTime,
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use crate::types::crypto_primitives::{SignatureProvider, SigningKey};

    use super::*;

    fn provider() -> SignatureProvider {
        SignatureProvider::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    fn block_id(num: u32) -> BlockId {
        let mut bytes = [0u8; 32];
        bytes[0..4].copy_from_slice(&num.to_be_bytes());
        BlockId::new(bytes)
    }

    #[test]
    fn domain_tags_keep_digests_apart() {
        // A handshake and its answer share the same field layout; only the domain tag
        // separates their signing targets.
        let handshake = Handshake { lib: block_id(3) };
        let answer = HandshakeAns { lib: block_id(3) };
        assert_ne!(handshake.digest(), answer.digest());
    }

    #[test]
    fn net_message_verify_covers_every_kind() {
        let providers = [provider()];
        let prevote = Signed::new(
            Prevote {
                round_num: RoundNum::new(0),
                base_block: block_id(1),
                blocks: vec![block_id(2)],
            },
            &providers,
        );
        assert!(NetMessage::from(prevote.clone()).verify());

        let mut forged = prevote;
        forged.data.round_num = RoundNum::new(1);
        assert!(!NetMessage::from(forged).verify());
    }
}
