//! Topic-based publish/subscribe transport.
//!
//! The bus is built once at startup (`register`, `subscribe` take `&mut self`)
//! and then shared by reference. After that point every operation takes
//! `&self` and touches only atomics and lock-free rings, so nothing on the
//! control-loop path ever blocks.
//!
//! Each sequence stream (one per single-producer topic, one per replica member,
//! one for the voter's authoritative output) has exactly one writer: the
//! executive commits a node's staged output from a single thread, which is what
//! keeps sequence numbers gap-free without a compare-and-swap loop.

pub mod queue;
pub mod topic;

pub use queue::{Delivery, OverflowPolicy, TopicQueue};
pub use topic::{
    Cardinality, Criticality, Members, QosClass, TopicHandle, TopicName, TopicSpec, TopicStats,
    MAX_REPLICAS, MAX_SUBSCRIBERS, MAX_TOPICS,
};

use crate::error::{BusError, BusResult};
use crate::node::MAX_NODES;
use crate::protocol::{Confidence, Message, MissionTime, NodeId, Payload, SchemaId, TopicId};
use crossbeam::queue::ArrayQueue;
use heapless::Vec;
use queue::Append;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::{debug, warn};

pub const SYSTEM_TOPIC_NAME: &str = "system";
pub const SYSTEM_SCHEMA: SchemaId = SchemaId(0);
pub const SYSTEM_HALT: &[u8] = b"SYSTEM_HALT";
const SYSTEM_QUEUE_DEPTH: usize = 8;
const CANDIDATES_PER_MEMBER: usize = 4;
const RATE_WINDOW_US: u64 = 1_000_000;

/// What happened to a publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishReceipt {
    Appended { sequence: u64 },
    /// Telemetry queue was full; the oldest unread entry was dropped.
    AppendedEvicting { sequence: u64, evicted_sequence: u64 },
    /// Replica-group publication handed to the voter.
    Candidate { sequence: u64 },
    /// Producer is quarantined; nothing was stored.
    Suppressed,
}

#[derive(Debug)]
struct ProducerStream {
    producer: NodeId,
    next: AtomicU64,
}

impl ProducerStream {
    fn new(producer: NodeId) -> Self {
        Self {
            producer,
            next: AtomicU64::new(1),
        }
    }
}

/// Sequence that follows `sequence` on the same stream. A stream that has
/// reached `u64::MAX` accepts nothing further.
fn successor(sequence: u64) -> BusResult<u64> {
    sequence
        .checked_add(1)
        .ok_or(BusError::MalformedFrame("sequence space exhausted"))
}

#[derive(Debug, Default)]
struct RateWindow {
    start_us: AtomicU64,
    count: AtomicU32,
}

#[derive(Debug, Default)]
struct TopicCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    evicted: AtomicU64,
    rejected: AtomicU64,
    suppressed: AtomicU64,
    candidates: AtomicU64,
    checksum_failures: AtomicU64,
    rate_limited: AtomicU64,
}

#[derive(Debug)]
struct TopicSlot {
    id: TopicId,
    spec: TopicSpec,
    queue: TopicQueue,
    candidates: Option<ArrayQueue<Message>>,
    authoritative: ProducerStream,
    members: Vec<ProducerStream, MAX_REPLICAS>,
    rate: RateWindow,
    counters: TopicCounters,
    subscribers: Vec<NodeId, MAX_SUBSCRIBERS>,
}

impl TopicSlot {
    fn member_stream(&self, producer: NodeId) -> Option<&ProducerStream> {
        self.members.iter().find(|stream| stream.producer == producer)
    }
}

/// Messages drained at the start of a frame, grouped by topic in publish order.
#[derive(Debug, Default)]
pub struct DeliveryBatch {
    deliveries: alloc::vec::Vec<Delivery>,
    corrupted: alloc::vec::Vec<(TopicId, NodeId)>,
}

impl DeliveryBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.deliveries.clear();
        self.corrupted.clear();
    }

    /// Deliveries for a set of subscribed topics, in-order within each topic.
    pub fn for_topics<'a>(&'a self, topics: &'a [TopicId]) -> impl Iterator<Item = &'a Delivery> + 'a {
        self.deliveries
            .iter()
            .filter(move |delivery| topics.contains(&delivery.message.topic()))
    }

    pub fn for_topic(&self, topic: TopicId) -> impl Iterator<Item = &Delivery> + '_ {
        self.deliveries
            .iter()
            .filter(move |delivery| delivery.message.topic() == topic)
    }

    /// Messages whose checksum failed; reported against their producer.
    pub fn corrupted(&self) -> &[(TopicId, NodeId)] {
        &self.corrupted
    }

    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }
}

pub struct MessageBus {
    topics: Vec<TopicSlot, MAX_TOPICS>,
    quarantined: [AtomicBool; MAX_NODES],
    system_topic: TopicHandle,
}

impl MessageBus {
    pub fn new() -> Self {
        let mut bus = Self {
            topics: Vec::new(),
            quarantined: core::array::from_fn(|_| AtomicBool::new(false)),
            system_topic: TopicHandle {
                id: TopicId(0),
                schema: SYSTEM_SCHEMA,
            },
        };

        let mut name = TopicName::new();
        name.push_str(SYSTEM_TOPIC_NAME);
        let system = TopicSpec {
            name,
            schema: SYSTEM_SCHEMA,
            qos: QosClass::Aperiodic { max_rate_hz: u32::MAX },
            criticality: Criticality::ControlCritical,
            cardinality: Cardinality::Single {
                producer: NodeId::EXECUTIVE,
            },
            queue_depth: SYSTEM_QUEUE_DEPTH,
        };
        // The registry is empty here, so registering the system topic cannot fail.
        if let Ok(handle) = bus.register(system) {
            bus.system_topic = handle;
        }
        bus
    }

    /// Registers a topic. Fails with `DuplicateTopic` if the name is taken.
    pub fn register(&mut self, spec: TopicSpec) -> BusResult<TopicHandle> {
        if self.topics.iter().any(|slot| slot.spec.name == spec.name) {
            return Err(BusError::DuplicateTopic(spec.name.to_string()));
        }
        if self.topics.is_full() {
            return Err(BusError::RegistryFull("topics"));
        }
        validate_spec(&spec)?;

        let id = TopicId(self.topics.len() as u16);
        let policy = match spec.criticality {
            Criticality::ControlCritical => OverflowPolicy::Reject,
            Criticality::Telemetry => OverflowPolicy::DropOldest,
        };

        let (authoritative, members, candidates) = match &spec.cardinality {
            Cardinality::Single { producer } => (ProducerStream::new(*producer), Vec::new(), None),
            Cardinality::ReplicaGroup { members } => {
                let mut streams = Vec::new();
                for member in members {
                    let _ = streams.push(ProducerStream::new(*member));
                }
                let ring = ArrayQueue::new(members.len() * CANDIDATES_PER_MEMBER);
                (ProducerStream::new(NodeId::VOTER), streams, Some(ring))
            }
        };

        let handle = TopicHandle {
            id,
            schema: spec.schema,
        };
        let slot = TopicSlot {
            id,
            queue: TopicQueue::new(spec.queue_depth, policy),
            spec,
            candidates,
            authoritative,
            members,
            rate: RateWindow::default(),
            counters: TopicCounters::default(),
            subscribers: Vec::new(),
        };
        if self.topics.push(slot).is_err() {
            return Err(BusError::RegistryFull("topics"));
        }

        debug!(topic = %id, "registered topic");
        Ok(handle)
    }

    /// Registers `subscriber` as a handler for `topic`. Inside its own frame
    /// slot the node sees, once per frame, every message published on the
    /// topic since the previous frame (see `NodeContext::deliveries`).
    pub fn subscribe(&mut self, topic: TopicId, subscriber: NodeId) -> BusResult<()> {
        let slot = self
            .topics
            .get_mut(topic.index())
            .ok_or(BusError::UnknownTopic(topic))?;
        if slot.subscribers.contains(&subscriber) {
            return Ok(());
        }
        slot.subscribers
            .push(subscriber)
            .map_err(|_| BusError::RegistryFull("subscribers"))
    }

    pub fn unsubscribe_all(&mut self, subscriber: NodeId) {
        for slot in self.topics.iter_mut() {
            slot.subscribers.retain(|node| *node != subscriber);
        }
    }

    pub fn publish(
        &self,
        topic: TopicId,
        producer: NodeId,
        payload: &[u8],
        timestamp: MissionTime,
    ) -> BusResult<PublishReceipt> {
        let slot = self.slot(topic)?;
        let payload = Payload::from_slice(payload).map_err(|()| BusError::PayloadTooLarge(payload.len()))?;

        match &slot.spec.cardinality {
            Cardinality::Single { producer: owner } => {
                if *owner != producer {
                    return Err(BusError::NotProducer { topic, producer });
                }
                if self.is_quarantined(producer) {
                    slot.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                    return Ok(PublishReceipt::Suppressed);
                }
                self.admit_rate(slot, timestamp)?;
                self.append(slot, &slot.authoritative, payload, timestamp, Confidence::Nominal)
            }
            Cardinality::ReplicaGroup { .. } => {
                let stream = slot
                    .member_stream(producer)
                    .ok_or(BusError::NotAMember { topic, producer })?;
                if self.is_quarantined(producer) {
                    slot.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                    return Ok(PublishReceipt::Suppressed);
                }
                let sequence = stream.next.load(Ordering::Acquire);
                let next = successor(sequence)?;
                self.admit_rate(slot, timestamp)?;
                let message = Message::new(topic, producer, sequence, timestamp, slot.spec.schema, payload);
                self.push_candidate(slot, message);
                stream.next.store(next, Ordering::Release);
                Ok(PublishReceipt::Candidate { sequence })
            }
        }
    }

    /// Appends the voter's authoritative value for a replica-group topic.
    pub fn publish_voted(
        &self,
        topic: TopicId,
        payload: &[u8],
        timestamp: MissionTime,
        confidence: Confidence,
    ) -> BusResult<PublishReceipt> {
        let slot = self.slot(topic)?;
        if !slot.spec.cardinality.is_replicated() {
            return Err(BusError::NotProducer {
                topic,
                producer: NodeId::VOTER,
            });
        }
        let payload = Payload::from_slice(payload).map_err(|()| BusError::PayloadTooLarge(payload.len()))?;
        self.append(slot, &slot.authoritative, payload, timestamp, confidence)
    }

    /// Emits `SYSTEM_HALT` on the reserved system topic.
    pub fn publish_system_halt(&self, timestamp: MissionTime) -> BusResult<PublishReceipt> {
        self.publish(self.system_topic.id, NodeId::EXECUTIVE, SYSTEM_HALT, timestamp)
    }

    /// Accepts a wire frame from a remote link as a publication by its producer.
    pub fn ingest_frame(&self, bytes: &[u8]) -> BusResult<PublishReceipt> {
        let message = Message::decode(bytes)?;
        let topic = message.topic();
        let producer = message.producer();
        let slot = self.slot(topic)?;

        if !message.verify() {
            slot.counters.checksum_failures.fetch_add(1, Ordering::Relaxed);
            warn!(topic = %topic, producer = %producer, "checksum mismatch on ingested frame");
            return Err(BusError::ChecksumMismatch { topic, producer });
        }
        if message.schema() != slot.spec.schema {
            return Err(BusError::SchemaMismatch(topic));
        }

        let stream = match &slot.spec.cardinality {
            Cardinality::Single { producer: owner } if *owner == producer => &slot.authoritative,
            Cardinality::Single { .. } => return Err(BusError::NotProducer { topic, producer }),
            Cardinality::ReplicaGroup { .. } => slot
                .member_stream(producer)
                .ok_or(BusError::NotAMember { topic, producer })?,
        };
        let expected = stream.next.load(Ordering::Acquire);
        if message.sequence() < expected {
            return Err(BusError::MalformedFrame("sequence regression"));
        }
        let next = successor(message.sequence())?;
        if self.is_quarantined(producer) {
            slot.counters.suppressed.fetch_add(1, Ordering::Relaxed);
            return Ok(PublishReceipt::Suppressed);
        }
        self.admit_rate(slot, message.timestamp())?;

        let sequence = message.sequence();
        if slot.spec.cardinality.is_replicated() {
            self.push_candidate(slot, message);
            stream.next.store(next, Ordering::Release);
            return Ok(PublishReceipt::Candidate { sequence });
        }

        let receipt = self.store(
            slot,
            Delivery {
                message,
                confidence: Confidence::Nominal,
            },
        )?;
        stream.next.store(next, Ordering::Release);
        Ok(receipt)
    }

    /// Moves this frame's candidates for a replica-group topic into `out`.
    pub fn drain_candidates(&self, topic: TopicId, out: &mut alloc::vec::Vec<Message>) -> BusResult<()> {
        let slot = self.slot(topic)?;
        if let Some(ring) = &slot.candidates {
            while let Some(candidate) = ring.pop() {
                if candidate.verify() {
                    out.push(candidate);
                } else {
                    slot.counters.checksum_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    /// Drains every topic queue into `batch`. Called once, at the start of a frame.
    ///
    /// Messages still queued from a producer that has since been quarantined
    /// are dropped here and counted as suppressed.
    pub fn collect_deliveries(&self, batch: &mut DeliveryBatch) {
        batch.clear();
        for slot in self.topics.iter() {
            let mut drained = 0u64;
            while let Some(delivery) = slot.queue.pop() {
                if self.is_quarantined(delivery.message.producer()) {
                    slot.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                if !delivery.message.verify() {
                    slot.counters.checksum_failures.fetch_add(1, Ordering::Relaxed);
                    batch.corrupted.push((slot.id, delivery.message.producer()));
                    continue;
                }
                drained += 1;
                batch.deliveries.push(delivery);
            }
            if drained > 0 && !slot.subscribers.is_empty() {
                slot.counters.delivered.fetch_add(drained, Ordering::Relaxed);
            }
        }
    }

    pub fn quarantine(&self, node: NodeId) {
        if let Some(flag) = self.quarantined.get(node.index()) {
            if !flag.swap(true, Ordering::AcqRel) {
                warn!(node = %node, "node quarantined on bus");
            }
        }
    }

    pub fn release(&self, node: NodeId) {
        if let Some(flag) = self.quarantined.get(node.index()) {
            flag.store(false, Ordering::Release);
        }
    }

    pub fn is_quarantined(&self, node: NodeId) -> bool {
        self.quarantined
            .get(node.index())
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    pub fn lookup(&self, name: &str) -> Option<TopicHandle> {
        self.topics
            .iter()
            .find(|slot| slot.spec.name.as_str() == name)
            .map(|slot| TopicHandle {
                id: slot.id,
                schema: slot.spec.schema,
            })
    }

    pub fn spec(&self, topic: TopicId) -> BusResult<&TopicSpec> {
        self.slot(topic).map(|slot| &slot.spec)
    }

    pub fn subscribers(&self, topic: TopicId) -> BusResult<&[NodeId]> {
        self.slot(topic).map(|slot| slot.subscribers.as_slice())
    }

    pub fn topic_ids(&self) -> impl Iterator<Item = TopicId> + '_ {
        self.topics.iter().map(|slot| slot.id)
    }

    pub fn replicated_topics(&self) -> impl Iterator<Item = TopicId> + '_ {
        self.topics
            .iter()
            .filter(|slot| slot.spec.cardinality.is_replicated())
            .map(|slot| slot.id)
    }

    pub fn system_topic(&self) -> TopicHandle {
        self.system_topic
    }

    pub fn stats(&self, topic: TopicId) -> BusResult<TopicStats> {
        let slot = self.slot(topic)?;
        let counters = &slot.counters;
        Ok(TopicStats {
            published: counters.published.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            evicted: counters.evicted.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            suppressed: counters.suppressed.load(Ordering::Relaxed),
            candidates: counters.candidates.load(Ordering::Relaxed),
            checksum_failures: counters.checksum_failures.load(Ordering::Relaxed),
            rate_limited: counters.rate_limited.load(Ordering::Relaxed),
            queued: slot.queue.len(),
        })
    }

    fn slot(&self, topic: TopicId) -> BusResult<&TopicSlot> {
        self.topics.get(topic.index()).ok_or(BusError::UnknownTopic(topic))
    }

    fn admit_rate(&self, slot: &TopicSlot, timestamp: MissionTime) -> BusResult<()> {
        let QosClass::Aperiodic { max_rate_hz } = slot.spec.qos else {
            return Ok(());
        };
        let now = timestamp.as_micros();
        let start = slot.rate.start_us.load(Ordering::Acquire);
        if now < start || now - start >= RATE_WINDOW_US {
            slot.rate.start_us.store(now, Ordering::Release);
            slot.rate.count.store(0, Ordering::Release);
        }
        if slot.rate.count.load(Ordering::Acquire) >= max_rate_hz {
            slot.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            return Err(BusError::RateLimitExceeded(slot.id));
        }
        slot.rate.count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn append(
        &self,
        slot: &TopicSlot,
        stream: &ProducerStream,
        payload: Payload,
        timestamp: MissionTime,
        confidence: Confidence,
    ) -> BusResult<PublishReceipt> {
        let sequence = stream.next.load(Ordering::Acquire);
        let next = successor(sequence)?;
        let message = Message::new(slot.id, stream.producer, sequence, timestamp, slot.spec.schema, payload);
        let receipt = self.store(slot, Delivery { message, confidence })?;
        stream.next.store(next, Ordering::Release);
        Ok(receipt)
    }

    fn store(&self, slot: &TopicSlot, delivery: Delivery) -> BusResult<PublishReceipt> {
        let sequence = delivery.message.sequence();
        match slot.queue.append(delivery) {
            Ok(Append::Stored) => {
                slot.counters.published.fetch_add(1, Ordering::Relaxed);
                Ok(PublishReceipt::Appended { sequence })
            }
            Ok(Append::Evicted(evicted)) => {
                slot.counters.published.fetch_add(1, Ordering::Relaxed);
                slot.counters.evicted.fetch_add(1, Ordering::Relaxed);
                debug!(topic = %slot.id, evicted = evicted.message.sequence(), "telemetry queue full, dropped oldest");
                Ok(PublishReceipt::AppendedEvicting {
                    sequence,
                    evicted_sequence: evicted.message.sequence(),
                })
            }
            Err(_) => {
                slot.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %slot.id, "control-critical queue full, rejecting write");
                Err(BusError::QueueFull(slot.id))
            }
        }
    }

    fn push_candidate(&self, slot: &TopicSlot, message: Message) {
        if let Some(ring) = &slot.candidates {
            // Only the first candidate per member counts in a frame, so an
            // overflowing ring can shed its oldest entries.
            let _ = ring.force_push(message);
            slot.counters.candidates.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_spec(spec: &TopicSpec) -> BusResult<()> {
    if spec.queue_depth == 0 {
        return Err(BusError::config(alloc::format!("topic '{}' has zero queue depth", spec.name)));
    }
    match spec.qos {
        QosClass::Periodic { period_us, deadline_us } => {
            if period_us == 0 || deadline_us == 0 || deadline_us > period_us {
                return Err(BusError::config(alloc::format!(
                    "topic '{}' needs 0 < deadline <= period",
                    spec.name
                )));
            }
        }
        QosClass::Aperiodic { max_rate_hz } => {
            if max_rate_hz == 0 {
                return Err(BusError::config(alloc::format!("topic '{}' has zero max rate", spec.name)));
            }
        }
    }
    if let Cardinality::ReplicaGroup { members } = &spec.cardinality {
        if members.is_empty() || members.len() % 2 == 0 {
            return Err(BusError::config(alloc::format!(
                "replica group for '{}' needs an odd number of members, got {}",
                spec.name,
                members.len()
            )));
        }
        for (index, member) in members.iter().enumerate() {
            if members[..index].contains(member) {
                return Err(BusError::config(alloc::format!(
                    "replica group for '{}' lists {} twice",
                    spec.name,
                    member
                )));
            }
        }
    }
    Ok(())
}
