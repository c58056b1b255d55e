/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Bounded blocking FIFO between the I/O subscriber callbacks and the engine thread.
//!
//! Producers ([`push`](MessageQueue::push)) block while the queue is full; the
//! consumer ([`pop_wait`](MessageQueue::pop_wait)) blocks while it is empty.
//! [`terminate`](MessageQueue::terminate) flips the `done` flag and wakes both sides:
//! blocked producers discard their message, and `pop_wait` returns `None` so the
//! engine thread can exit its loop and be joined.
//!
//! Messages are delivered in push order per producer; no cross-producer ordering is
//! guaranteed beyond the mutex's serialization of pushes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

pub(crate) struct MessageQueue<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    done: AtomicBool,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> MessageQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
            done: AtomicBool::new(false),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Add a message to the queue, blocking while the queue is full. After
    /// [`terminate`](Self::terminate) the message is silently discarded.
    pub(crate) fn push(&self, message: T) {
        let mut queue = self.queue.lock().expect("message queue poisoned");
        while queue.len() >= self.capacity && !self.done.load(Ordering::Relaxed) {
            queue = self
                .not_full
                .wait(queue)
                .expect("message queue poisoned");
        }
        if self.done.load(Ordering::Relaxed) {
            return;
        }
        queue.push_back(message);
        self.not_empty.notify_one();
    }

    /// Extract the next message, waiting until one appears. Returns `None` once the
    /// queue has been terminated.
    pub(crate) fn pop_wait(&self) -> Option<T> {
        let mut queue = self.queue.lock().expect("message queue poisoned");
        loop {
            if self.done.load(Ordering::Relaxed) {
                return None;
            }
            match queue.pop_front() {
                Some(message) => {
                    self.not_full.notify_one();
                    return Some(message);
                }
                None => {
                    queue = self
                        .not_empty
                        .wait(queue)
                        .expect("message queue poisoned");
                }
            }
        }
    }

    /// Finish working with the queue: wake all waiters on both sides.
    pub(crate) fn terminate(&self) {
        self.done.store(true, Ordering::Relaxed);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().expect("message queue poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn delivers_in_fifo_order() {
        let queue = MessageQueue::new(16);
        for i in 0..5 {
            queue.push(i);
        }
        for i in 0..5 {
            assert_eq!(queue.pop_wait(), Some(i));
        }
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn pop_wait_blocks_until_a_push_arrives() {
        let queue = Arc::new(MessageQueue::new(16));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_wait())
        };
        thread::sleep(Duration::from_millis(50));
        queue.push(99u32);
        assert_eq!(consumer.join().unwrap(), Some(99));
    }

    #[test]
    fn terminate_wakes_a_blocked_consumer() {
        let queue: Arc<MessageQueue<u32>> = Arc::new(MessageQueue::new(16));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_wait())
        };
        thread::sleep(Duration::from_millis(50));
        queue.terminate();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn push_blocks_at_capacity_and_resumes_after_pop() {
        let queue = Arc::new(MessageQueue::new(1));
        queue.push(1u32);

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.pop_wait(), Some(1));
        producer.join().unwrap();
        assert_eq!(queue.pop_wait(), Some(2));
    }

    #[test]
    fn push_after_terminate_is_discarded() {
        let queue = MessageQueue::new(4);
        queue.terminate();
        queue.push(1u32);
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.pop_wait(), None);
    }
}
