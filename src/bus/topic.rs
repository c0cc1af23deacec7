use crate::protocol::{NodeId, SchemaId, TopicId};
use arrayvec::ArrayString;
use heapless::Vec;
use serde::{Deserialize, Serialize};

pub const MAX_TOPICS: usize = 64;
pub const MAX_REPLICAS: usize = 7;
pub const MAX_SUBSCRIBERS: usize = 16;
pub const TOPIC_NAME_LEN: usize = 32;

pub type TopicName = ArrayString<TOPIC_NAME_LEN>;
pub type Members = Vec<NodeId, MAX_REPLICAS>;

/// Quality-of-service class of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QosClass {
    Periodic { period_us: u64, deadline_us: u64 },
    Aperiodic { max_rate_hz: u32 },
}

impl QosClass {
    /// Deadline relative to the start of the frame, if the topic has one.
    pub fn deadline_us(&self) -> Option<u64> {
        match self {
            QosClass::Periodic { deadline_us, .. } => Some(*deadline_us),
            QosClass::Aperiodic { .. } => None,
        }
    }
}

/// Decides the overflow policy of a topic queue and the execution band of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Criticality {
    ControlCritical,
    Telemetry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cardinality {
    Single { producer: NodeId },
    ReplicaGroup { members: Members },
}

impl Cardinality {
    pub fn is_replicated(&self) -> bool {
        matches!(self, Cardinality::ReplicaGroup { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: TopicName,
    pub schema: SchemaId,
    pub qos: QosClass,
    pub criticality: Criticality,
    pub cardinality: Cardinality,
    pub queue_depth: usize,
}

/// Returned by registration; cheap to copy into nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicHandle {
    pub id: TopicId,
    pub schema: SchemaId,
}

/// Snapshot of a topic's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicStats {
    pub published: u64,
    pub delivered: u64,
    pub evicted: u64,
    pub rejected: u64,
    pub suppressed: u64,
    pub candidates: u64,
    pub checksum_failures: u64,
    pub rate_limited: u64,
    pub queued: usize,
}
