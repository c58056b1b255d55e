use std::time::Duration;

use log::LevelFilter;
use randpa::messages::NetMessage;
use randpa::types::basic::SessionId;

mod common;

use crate::common::harness::{block, start_gadget, wait_until};
use crate::common::logging::setup_logger;

/// One full round among four producers: the gadget (producer A) starts round 0 on the
/// round's first block, collects prevotes and precommits from two peers, and emits a
/// finality signal for the round's best block.
#[test]
fn basic_finality_test() {
    setup_logger(LevelFilter::Debug);

    let harness = start_gadget();
    let (genesis, b1, b2) = (harness.genesis, block(1, 1), block(2, 1));

    // 1. A peer session comes up: the gadget introduces itself.
    log::debug!("Waiting for the handshake to the new peer.");
    harness.new_peer(SessionId::new(5));
    assert!(wait_until(
        || harness.sent_contains(|env| matches!(env.message, NetMessage::Handshake(_))
            && env.session_id == SessionId::new(5)),
        Duration::from_secs(5),
    ));

    // Producer B answers, so broadcasts from now on reach session 5.
    harness.deliver(SessionId::new(5), NetMessage::Handshake(harness.handshake_from(1)));

    // 2. The first block of round 0 arrives; the gadget prevotes for it.
    log::debug!("Waiting for the gadget's prevote.");
    harness.accept_block(b1, genesis, 0, false);
    assert!(wait_until(
        || harness.sent_contains(|env| matches!(env.message, NetMessage::Prevote(_))),
        Duration::from_secs(5),
    ));

    // 3. Producers B and C prevote for the same branch.
    for peer in 1..=2 {
        let prevote = harness.prevote_from(peer, 0, genesis, &[b1]);
        harness.deliver(SessionId::new(5), NetMessage::Prevote(prevote));
    }

    // 4. The next block closes the prevote window; the gadget precommits.
    log::debug!("Waiting for the gadget's precommit.");
    harness.accept_block(b2, b1, 1, false);
    assert!(wait_until(
        || harness.sent_contains(|env| matches!(env.message, NetMessage::Precommit(_))),
        Duration::from_secs(5),
    ));

    // 5. Producers B and C precommit: supermajority reached, the round's first block
    //    becomes final.
    for peer in 1..=2 {
        let precommit = harness.precommit_from(peer, 0, b1);
        harness.deliver(SessionId::new(5), NetMessage::Precommit(precommit));
    }

    log::debug!("Waiting for the finality signal.");
    assert!(wait_until(
        || harness.finalized.lock().unwrap().first() == Some(&b1),
        Duration::from_secs(5),
    ));

    // A finality notice went out to the peer.
    assert!(wait_until(
        || harness.sent_contains(|env| matches!(env.message, NetMessage::FinalityNotice(_))),
        Duration::from_secs(5),
    ));

    assert!(!harness.gadget.is_syncing());
    assert!(!harness.gadget.is_frozen());
}

/// While the host replays history, the gadget reports `syncing` and emits no votes.
#[test]
fn no_votes_while_syncing() {
    setup_logger(LevelFilter::Debug);

    let harness = start_gadget();
    let (genesis, b1) = (harness.genesis, block(1, 2));

    harness.accept_block(b1, genesis, 0, true);
    assert!(wait_until(
        || harness.gadget.is_syncing(),
        Duration::from_secs(5),
    ));

    assert!(!harness.sent_contains(|env| matches!(env.message, NetMessage::Prevote(_))));
    assert!(harness.finalized.lock().unwrap().is_empty());
}
