//! Bounded per-topic ring.
//!
//! Backed by a lock-free `ArrayQueue`: each slot carries a stamp that is
//! published with release ordering only after the value has been written, and
//! consumers read the stamp with acquire ordering, so a consumer never sees a
//! half-written message.

use crate::protocol::{Confidence, Message};
use crossbeam::queue::ArrayQueue;

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message: Message,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Telemetry: evict the oldest unread entry.
    DropOldest,
    /// Control-critical: refuse the write and push back on the producer.
    Reject,
}

#[derive(Debug)]
pub enum Append {
    Stored,
    Evicted(Delivery),
}

#[derive(Debug)]
pub struct TopicQueue {
    ring: ArrayQueue<Delivery>,
    policy: OverflowPolicy,
}

impl TopicQueue {
    /// `depth` must be non-zero; the bus validates it at registration.
    pub fn new(depth: usize, policy: OverflowPolicy) -> Self {
        debug_assert!(depth > 0, "topic queue depth must be non-zero");
        Self {
            ring: ArrayQueue::new(depth.max(1)),
            policy,
        }
    }

    /// On `Reject` overflow the delivery is handed back untouched.
    pub fn append(&self, delivery: Delivery) -> Result<Append, Delivery> {
        match self.policy {
            OverflowPolicy::Reject => self.ring.push(delivery).map(|()| Append::Stored),
            OverflowPolicy::DropOldest => Ok(match self.ring.force_push(delivery) {
                Some(evicted) => Append::Evicted(evicted),
                None => Append::Stored,
            }),
        }
    }

    pub fn pop(&self) -> Option<Delivery> {
        self.ring.pop()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }
}
