//! A harness that runs one gadget against scripted peers.
//!
//! The gadget under test votes as producer A of the four-producer set {A, B, C, D}.
//! The other three producers exist only as signing keys: the test crafts their
//! messages by hand and pushes them through the inbound network channel, while probes
//! on the outbound and finality channels record everything the gadget emits.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use randpa::channel::{EventChannel, FinalityChannel, NetChannel};
use randpa::events::{AcceptedBlockEvent, ChainEvent, IrreversibleEvent, NewPeerEvent};
use randpa::messages::{
    Handshake, NetEnvelope, NetMessage, Precommit, Prevote, SignedHandshake, SignedPrecommit,
    SignedPrevote,
};
use randpa::types::basic::{BlockId, RoundNum, SessionId};
use randpa::types::crypto_primitives::{SignatureProvider, SigningKey, VerifyingKey};
use randpa::types::signed_messages::Signed;
use randpa::{FinalityGadget, FinalityGadgetBuilder};

pub(crate) struct Harness {
    pub(crate) gadget: FinalityGadget,
    pub(crate) providers: Vec<SignatureProvider>,
    pub(crate) active: HashSet<VerifyingKey>,
    pub(crate) genesis: BlockId,
    pub(crate) in_net: Arc<NetChannel>,
    pub(crate) events: Arc<EventChannel>,
    pub(crate) sent: Arc<Mutex<Vec<NetEnvelope>>>,
    pub(crate) finalized: Arc<Mutex<Vec<BlockId>>>,
}

pub(crate) fn block(num: u32, tag: u8) -> BlockId {
    let mut bytes = [tag; 32];
    bytes[0..4].copy_from_slice(&num.to_be_bytes());
    BlockId::new(bytes)
}

/// Start a gadget voting as producer A, with the tree rooted at a height-0 genesis.
pub(crate) fn start_gadget() -> Harness {
    let providers: Vec<_> = (1u8..=4)
        .map(|seed| SignatureProvider::from_signing_key(SigningKey::from_bytes(&[seed; 32])))
        .collect();
    let active: HashSet<_> = providers.iter().map(|p| *p.public_key()).collect();

    let in_net = Arc::new(NetChannel::new());
    let out_net = Arc::new(NetChannel::new());
    let events = Arc::new(EventChannel::new());
    let finality = Arc::new(FinalityChannel::new());

    let sent = Arc::new(Mutex::new(Vec::new()));
    {
        let sent = Arc::clone(&sent);
        out_net.subscribe(move |envelope: &NetEnvelope| {
            sent.lock().unwrap().push(envelope.clone())
        });
    }
    let finalized = Arc::new(Mutex::new(Vec::new()));
    {
        let finalized = Arc::clone(&finalized);
        finality.subscribe(move |id: &BlockId| finalized.lock().unwrap().push(*id));
    }

    let gadget = FinalityGadgetBuilder::new()
        .block_producer()
        .signature_providers(vec![providers[0].clone()])
        .unwrap()
        .in_net_channel(Arc::clone(&in_net))
        .out_net_channel(out_net)
        .event_channel(Arc::clone(&events))
        .finality_channel(finality)
        .start(block(0, 0))
        .unwrap();

    Harness {
        gadget,
        providers,
        active,
        genesis: block(0, 0),
        in_net,
        events,
        sent,
        finalized,
    }
}

impl Harness {
    pub(crate) fn accept_block(&self, id: BlockId, prev: BlockId, creator: usize, sync: bool) {
        self.events
            .send(&ChainEvent::AcceptedBlock(AcceptedBlockEvent {
                block_id: id,
                prev_block_id: prev,
                creator_key: *self.providers[creator].public_key(),
                active_bp_keys: self.active.clone(),
                sync,
            }));
    }

    pub(crate) fn irreversible(&self, id: BlockId) {
        self.events
            .send(&ChainEvent::Irreversible(IrreversibleEvent { block_id: id }));
    }

    pub(crate) fn new_peer(&self, session_id: SessionId) {
        self.events
            .send(&ChainEvent::NewPeer(NewPeerEvent { session_id }));
    }

    pub(crate) fn deliver(&self, session_id: SessionId, message: NetMessage) {
        self.in_net.send(&NetEnvelope {
            session_id,
            message,
            receive_time: SystemTime::now(),
        });
    }

    pub(crate) fn handshake_from(&self, peer: usize) -> SignedHandshake {
        Signed::new(
            Handshake { lib: self.genesis },
            std::slice::from_ref(&self.providers[peer]),
        )
    }

    pub(crate) fn prevote_from(
        &self,
        peer: usize,
        round: u32,
        base: BlockId,
        blocks: &[BlockId],
    ) -> SignedPrevote {
        Signed::new(
            Prevote {
                round_num: RoundNum::new(round),
                base_block: base,
                blocks: blocks.to_vec(),
            },
            std::slice::from_ref(&self.providers[peer]),
        )
    }

    pub(crate) fn precommit_from(&self, peer: usize, round: u32, block_id: BlockId) -> SignedPrecommit {
        Signed::new(
            Precommit {
                round_num: RoundNum::new(round),
                block_id,
            },
            std::slice::from_ref(&self.providers[peer]),
        )
    }

    pub(crate) fn sent_contains(&self, predicate: impl Fn(&NetEnvelope) -> bool) -> bool {
        self.sent.lock().unwrap().iter().any(|env| predicate(env))
    }
}

/// Poll `condition` until it holds or the timeout elapses.
pub(crate) fn wait_until(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    condition()
}
