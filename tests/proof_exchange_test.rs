use std::time::Duration;

use log::LevelFilter;
use randpa::config::DEFAULT_MAX_FINALITY_LAG;
use randpa::messages::{FinalityReqProof, NetMessage};
use randpa::types::basic::{RoundNum, SessionId};
use randpa::types::signed_messages::Signed;

mod common;

use crate::common::harness::{block, start_gadget, wait_until, Harness};
use crate::common::logging::setup_logger;

/// Drive the gadget through one complete round so a proof lands in its ring.
fn finalize_one_round(harness: &Harness) {
    let (genesis, b1, b2) = (harness.genesis, block(1, 1), block(2, 1));

    harness.deliver(SessionId::new(5), NetMessage::Handshake(harness.handshake_from(1)));
    harness.accept_block(b1, genesis, 0, false);
    for peer in 1..=2 {
        let prevote = harness.prevote_from(peer, 0, genesis, &[b1]);
        harness.deliver(SessionId::new(5), NetMessage::Prevote(prevote));
    }
    harness.accept_block(b2, b1, 1, false);
    for peer in 1..=2 {
        let precommit = harness.precommit_from(peer, 0, b1);
        harness.deliver(SessionId::new(5), NetMessage::Precommit(precommit));
    }
    assert!(wait_until(
        || harness.finalized.lock().unwrap().first() == Some(&b1),
        Duration::from_secs(5),
    ));
}

/// A peer that missed a round can still fetch its proof: the gadget serves proof
/// requests for rounds in its ring and stays silent for rounds that are not.
#[test]
fn retroactive_proof_request_test() {
    setup_logger(LevelFilter::Debug);

    let harness = start_gadget();
    finalize_one_round(&harness);

    let request = Signed::new(
        FinalityReqProof {
            round_num: RoundNum::new(0),
        },
        std::slice::from_ref(&harness.providers[3]),
    );
    harness.deliver(SessionId::new(9), NetMessage::FinalityReqProof(request));

    log::debug!("Waiting for the proof reply.");
    assert!(wait_until(
        || harness.sent_contains(|env| {
            matches!(env.message, NetMessage::Proof(_)) && env.session_id == SessionId::new(9)
        }),
        Duration::from_secs(5),
    ));

    // A request for a round outside the ring gets no reply.
    let request = Signed::new(
        FinalityReqProof {
            round_num: RoundNum::new(3),
        },
        std::slice::from_ref(&harness.providers[3]),
    );
    harness.deliver(SessionId::new(11), NetMessage::FinalityReqProof(request));
    assert!(!wait_until(
        || harness.sent_contains(|env| env.session_id == SessionId::new(11)),
        Duration::from_secs(1),
    ));
}

/// When the head runs further than the finality lag past the LIB, the gadget freezes:
/// no rounds, no proofs. It thaws once the LIB catches back up.
#[test]
fn frozen_gadget_test() {
    setup_logger(LevelFilter::Debug);

    let harness = start_gadget();
    let genesis = harness.genesis;

    let far = block(DEFAULT_MAX_FINALITY_LAG + 1, 1);
    harness.accept_block(far, genesis, 0, false);
    assert!(wait_until(
        || harness.gadget.is_frozen(),
        Duration::from_secs(5),
    ));
    assert!(!harness.sent_contains(|env| matches!(env.message, NetMessage::Prevote(_))));
    assert!(harness.finalized.lock().unwrap().is_empty());

    // The chain reports an irreversible block near the head; the next accepted block
    // recomputes the freeze flag.
    let lib = block(DEFAULT_MAX_FINALITY_LAG, 2);
    harness.irreversible(lib);
    let next = block(DEFAULT_MAX_FINALITY_LAG + 2, 3);
    harness.accept_block(next, lib, 0, false);
    assert!(wait_until(
        || !harness.gadget.is_frozen(),
        Duration::from_secs(5),
    ));
}
