/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that build and start the gadget, as well as [the type](FinalityGadget)
//! which keeps it alive.
//!
//! ## Wiring
//!
//! The gadget talks to its host exclusively through four [channels](crate::channel):
//! inbound network messages, outbound network messages, inbound chain events, and the
//! outbound finality stream. The host wires all four with the builder's setters, then
//! calls [`start`](FinalityGadgetBuilder::start) with the current last irreversible
//! block. Starting spawns the engine thread and subscribes the two inbound channels,
//! which from then on only enqueue onto the engine's message queue.
//!
//! ## Full nodes and block producers
//!
//! A freshly built gadget is a full node: it holds a single signature provider with a
//! generated private key and a zeroed public key, which is enough to sign handshakes
//! and proof requests but never matches any block's active producer set. A block
//! producer calls [`block_producer`](FinalityGadgetBuilder::block_producer) and
//! installs its real providers with
//! [`signature_providers`](FinalityGadgetBuilder::signature_providers).

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use rand_core::OsRng;

use crate::channel::{EventChannel, FinalityChannel, NetChannel};
use crate::config::Configuration;
use crate::engine::{Engine, GadgetMessage};
use crate::events::ChainEvent;
use crate::messages::NetEnvelope;
use crate::msg_queue::MessageQueue;
use crate::types::basic::BlockId;
use crate::types::crypto_primitives::{
    zeroed_public_key, Keypair, SignatureProvider, SigningKey,
};

/// Returned when [`FinalityGadgetBuilder::start`] cannot bring the gadget up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartError {
    /// One of the four channels was not wired.
    MissingChannel(&'static str),
    /// The node is configured as a block producer but holds no signature providers.
    NoSignatureProviders,
}

impl Display for StartError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StartError::MissingChannel(name) => {
                write!(f, "channel `{}` should be initialized", name)
            }
            StartError::NoSignatureProviders => {
                write!(f, "a block producer requires at least one signature provider")
            }
        }
    }
}

pub struct FinalityGadgetBuilder {
    config: Configuration,
    is_block_producer: bool,
    signature_providers: Vec<SignatureProvider>,
    in_net_channel: Option<Arc<NetChannel>>,
    out_net_channel: Option<Arc<NetChannel>>,
    event_channel: Option<Arc<EventChannel>>,
    finality_channel: Option<Arc<FinalityChannel>>,
}

impl FinalityGadgetBuilder {
    /// A full-node builder: one generated signature provider under a zeroed public
    /// key, no channels wired.
    pub fn new() -> Self {
        let default_keypair = Keypair::new(SigningKey::generate(&mut OsRng));
        let default_provider = SignatureProvider::new(
            zeroed_public_key(),
            Arc::new(move |digest| default_keypair.sign(digest)),
        );

        Self {
            config: Configuration::default(),
            is_block_producer: false,
            signature_providers: vec![default_provider],
            in_net_channel: None,
            out_net_channel: None,
            event_channel: None,
            finality_channel: None,
        }
    }

    pub fn config(mut self, config: Configuration) -> Self {
        self.config = config;
        self
    }

    /// Mark this node as a block producer. Required before installing signature
    /// providers and for creating or advancing rounds.
    pub fn block_producer(mut self) -> Self {
        self.is_block_producer = true;
        self
    }

    /// Replace the provider list wholesale with the producer's own providers.
    pub fn signature_providers(
        mut self,
        providers: Vec<SignatureProvider>,
    ) -> Result<Self, StartError> {
        if !self.is_block_producer {
            return Err(StartError::NoSignatureProviders);
        }
        for provider in &providers {
            log::debug!(
                "Set signature provider for producer {}",
                crate::logging::abbrev(provider.public_key().as_bytes())
            );
        }
        self.signature_providers = providers;
        Ok(self)
    }

    /// Append one provider. The generated full-node default stays in the list.
    // TODO: decide whether the first appended provider should replace the generated
    // full-node default.
    pub fn add_signature_provider(
        mut self,
        provider: SignatureProvider,
    ) -> Result<Self, StartError> {
        if !self.is_block_producer {
            return Err(StartError::NoSignatureProviders);
        }
        log::debug!(
            "Set signature provider for producer {}",
            crate::logging::abbrev(provider.public_key().as_bytes())
        );
        self.signature_providers.push(provider);
        Ok(self)
    }

    pub fn in_net_channel(mut self, channel: Arc<NetChannel>) -> Self {
        self.in_net_channel = Some(channel);
        self
    }

    pub fn out_net_channel(mut self, channel: Arc<NetChannel>) -> Self {
        self.out_net_channel = Some(channel);
        self
    }

    pub fn event_channel(mut self, channel: Arc<EventChannel>) -> Self {
        self.event_channel = Some(channel);
        self
    }

    pub fn finality_channel(mut self, channel: Arc<FinalityChannel>) -> Self {
        self.finality_channel = Some(channel);
        self
    }

    /// Validate the wiring, subscribe the inbound channels, and spawn the engine
    /// thread with a tree rooted at `initial_lib`.
    pub fn start(self, initial_lib: BlockId) -> Result<FinalityGadget, StartError> {
        let in_net = self
            .in_net_channel
            .ok_or(StartError::MissingChannel("in_net"))?;
        let out_net = self
            .out_net_channel
            .ok_or(StartError::MissingChannel("out_net"))?;
        let events = self
            .event_channel
            .ok_or(StartError::MissingChannel("events"))?;
        let finality = self
            .finality_channel
            .ok_or(StartError::MissingChannel("finality"))?;
        if self.is_block_producer && self.signature_providers.is_empty() {
            return Err(StartError::NoSignatureProviders);
        }

        let queue = Arc::new(MessageQueue::new(self.config.queue_capacity));
        let is_syncing = Arc::new(AtomicBool::new(false));
        let is_frozen = Arc::new(AtomicBool::new(false));

        {
            let queue = Arc::clone(&queue);
            in_net.subscribe(move |envelope: &NetEnvelope| {
                queue.push(GadgetMessage::Network(envelope.clone()));
            });
        }
        {
            let queue = Arc::clone(&queue);
            events.subscribe(move |event: &ChainEvent| {
                queue.push(GadgetMessage::Chain(event.clone()));
            });
        }

        let engine_thread = {
            let queue = Arc::clone(&queue);
            let config = self.config;
            let is_block_producer = self.is_block_producer;
            let providers = self.signature_providers;
            let is_syncing = Arc::clone(&is_syncing);
            let is_frozen = Arc::clone(&is_frozen);
            thread::spawn(move || {
                log::warn!("Finality engine thread started");
                let mut engine = Engine::new(
                    config,
                    is_block_producer,
                    providers,
                    out_net,
                    finality,
                    initial_lib,
                    is_syncing,
                    is_frozen,
                );
                while let Some(message) = queue.pop_wait() {
                    engine.process(message);
                }
                log::warn!("Finality engine thread terminated");
            })
        };

        Ok(FinalityGadget {
            queue,
            engine_thread: Some(engine_thread),
            is_syncing,
            is_frozen,
        })
    }
}

impl Default for FinalityGadgetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running finality gadget. Stops and joins its engine thread on
/// [`stop`](FinalityGadget::stop) or drop.
pub struct FinalityGadget {
    queue: Arc<MessageQueue<GadgetMessage>>,
    engine_thread: Option<JoinHandle<()>>,
    is_syncing: Arc<AtomicBool>,
    is_frozen: Arc<AtomicBool>,
}

impl FinalityGadget {
    /// Whether the host was replaying historical blocks at the last accepted block.
    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::Relaxed)
    }

    /// Whether the head has run too far past the last irreversible block.
    pub fn is_frozen(&self) -> bool {
        self.is_frozen.load(Ordering::Relaxed)
    }

    /// Number of messages waiting for the engine thread.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Terminate the queue and join the engine thread. In-flight handlers run to
    /// completion; messages still queued are discarded.
    pub fn stop(&mut self) {
        self.queue.terminate();
        if let Some(thread) = self.engine_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for FinalityGadget {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> (
        Arc<NetChannel>,
        Arc<NetChannel>,
        Arc<EventChannel>,
        Arc<FinalityChannel>,
    ) {
        (
            Arc::new(NetChannel::new()),
            Arc::new(NetChannel::new()),
            Arc::new(EventChannel::new()),
            Arc::new(FinalityChannel::new()),
        )
    }

    #[test]
    fn start_requires_all_four_channels() {
        let (in_net, out_net, events, _) = channels();
        let err = FinalityGadgetBuilder::new()
            .in_net_channel(in_net)
            .out_net_channel(out_net)
            .event_channel(events)
            .start(BlockId::new([0u8; 32]))
            .err();
        assert_eq!(err, Some(StartError::MissingChannel("finality")));
    }

    #[test]
    fn signature_providers_require_the_block_producer_flag() {
        let provider =
            SignatureProvider::from_signing_key(SigningKey::from_bytes(&[1u8; 32]));
        let err = FinalityGadgetBuilder::new()
            .signature_providers(vec![provider])
            .err();
        assert_eq!(err, Some(StartError::NoSignatureProviders));
    }

    #[test]
    fn add_signature_provider_keeps_the_generated_default() {
        let provider =
            SignatureProvider::from_signing_key(SigningKey::from_bytes(&[1u8; 32]));
        let builder = FinalityGadgetBuilder::new()
            .block_producer()
            .add_signature_provider(provider)
            .unwrap();
        assert_eq!(builder.signature_providers.len(), 2);
        assert_eq!(
            builder.signature_providers[0].public_key(),
            &zeroed_public_key()
        );
    }

    #[test]
    fn gadget_starts_and_stops_cleanly() {
        let (in_net, out_net, events, finality) = channels();
        let mut gadget = FinalityGadgetBuilder::new()
            .in_net_channel(in_net)
            .out_net_channel(out_net)
            .event_channel(events)
            .finality_channel(finality)
            .start(BlockId::new([0u8; 32]))
            .unwrap();

        assert!(!gadget.is_syncing());
        assert!(!gadget.is_frozen());
        assert_eq!(gadget.queue_len(), 0);
        gadget.stop();
    }
}
