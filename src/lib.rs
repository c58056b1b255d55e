/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A RANDPA-style BFT finality gadget.
//!
//! The gadget runs alongside a block-producing chain and produces *irreversibility
//! proofs* for blocks by collecting two rounds of signed votes (prevotes, then
//! precommits) from the active block-producer set. A block is final once more than
//! 2/3 of the active producers precommit to it.
//!
//! The host node pushes [chain events](crate::events) and inbound
//! [network messages](crate::messages) into the gadget through
//! [channels](crate::channel); a single engine thread drains them, drives the
//! [prefix chain tree](crate::prefix_tree) and the per-round state machine, and emits
//! outbound messages plus a finality signal for every newly proven block. See
//! [`gadget`](crate::gadget) for how to wire and start it.

pub mod channel;

pub mod config;

pub mod events;

pub mod gadget;

pub mod messages;

pub mod prefix_tree;

pub mod types;

pub(crate) mod engine;

pub(crate) mod logging;

pub(crate) mod msg_queue;

pub(crate) mod round;

// Re-exports
pub use gadget::{FinalityGadget, FinalityGadgetBuilder, StartError};
