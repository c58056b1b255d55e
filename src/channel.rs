/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Multi-subscriber callback fan-out for the gadget's four boundary streams.
//!
//! A [`Channel`] holds a list of subscriber callbacks. [`send`](Channel::send) invokes
//! every subscriber synchronously, in registration order, on the caller's thread. There
//! is no back-pressure and no unsubscribe.
//!
//! The four streams are: network-in and network-out ([`NetChannel`]), chain events in
//! ([`EventChannel`]), and finality notifications out ([`FinalityChannel`]).

use std::sync::Mutex;

use crate::events::ChainEvent;
use crate::messages::NetEnvelope;
use crate::types::basic::BlockId;

type Subscriber<T> = Box<dyn Fn(&T) + Send>;

pub struct Channel<T> {
    subscribers: Mutex<Vec<Subscriber<T>>>,
}

impl<T> Channel<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Append a subscriber. Subscribers are invoked in registration order.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + 'static) {
        self.subscribers
            .lock()
            .expect("channel subscriber list poisoned")
            .push(Box::new(callback));
    }

    /// Invoke every subscriber with `value`, synchronously on the calling thread.
    pub fn send(&self, value: &T) {
        let subscribers = self
            .subscribers
            .lock()
            .expect("channel subscriber list poisoned");
        for subscriber in subscribers.iter() {
            subscriber(value);
        }
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Network messages, inbound or outbound depending on which side subscribes.
pub type NetChannel = Channel<NetEnvelope>;

/// Chain events from the host node.
pub type EventChannel = Channel<ChainEvent>;

/// Ids of newly proven blocks, pushed whenever a proof advances the last proven block.
pub type FinalityChannel = Channel<BlockId>;

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn send_reaches_every_subscriber_in_order() {
        let channel: Channel<u32> = Channel::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3u32 {
            let log = Arc::clone(&log);
            channel.subscribe(move |value| log.lock().unwrap().push((tag, *value)));
        }

        channel.send(&7);
        assert_eq!(*log.lock().unwrap(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn send_without_subscribers_is_a_no_op() {
        let channel: Channel<u32> = Channel::new();
        channel.send(&1);
    }

    #[test]
    fn subscribers_see_every_send() {
        let channel: Channel<u32> = Channel::new();
        let count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&count);
        channel.subscribe(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        for i in 0..5 {
            channel.send(&i);
        }
        assert_eq!(count.load(Ordering::Relaxed), 5);
    }
}
