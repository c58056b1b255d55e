/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration of the gadget's protocol constants and cache bounds.

use std::num::NonZeroUsize;
use std::time::Duration;

/// Blocks per round.
pub const DEFAULT_ROUND_WIDTH: u32 = 2;

/// Block offset inside a round at which the prevote window ends.
pub const DEFAULT_PREVOTE_WIDTH: u32 = 1;

/// Inbound network messages older than this are silently dropped.
pub const DEFAULT_MSG_EXPIRATION: Duration = Duration::from_millis(1000);

/// Freeze when the head runs further than this past the last irreversible block.
/// 2/3 * 102 producers * 12 blocks per slot * 2 rounds * 2 (additional).
pub const DEFAULT_MAX_FINALITY_LAG: u32 = 69 * 12 * 2 * 2;

/// Capacity of each message-dedup cache.
pub const DEFAULT_MESSAGE_CACHE_SIZE: usize = 100 * 100 * 100;

/// How many recent proofs to keep for retroactive proof requests.
pub const DEFAULT_PROOF_CACHE_SIZE: usize = 2;

/// Capacity of the engine's inbound message queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

#[derive(Clone, Debug)]
pub struct Configuration {
    pub round_width: u32,
    pub prevote_width: u32,
    pub msg_expiration: Duration,
    pub max_finality_lag: u32,
    pub message_cache_size: NonZeroUsize,
    pub proof_cache_size: usize,
    pub queue_capacity: usize,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            round_width: DEFAULT_ROUND_WIDTH,
            prevote_width: DEFAULT_PREVOTE_WIDTH,
            msg_expiration: DEFAULT_MSG_EXPIRATION,
            max_finality_lag: DEFAULT_MAX_FINALITY_LAG,
            message_cache_size: NonZeroUsize::new(DEFAULT_MESSAGE_CACHE_SIZE)
                .expect("default cache size is non-zero"),
            proof_cache_size: DEFAULT_PROOF_CACHE_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}
