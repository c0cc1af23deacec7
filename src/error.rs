use crate::protocol::{NodeId, TopicId};
use thiserror::Error;

/// Error taxonomy shared by every component of the bus.
///
/// The first block mirrors the fault classes a flight system reasons about;
/// the second block is plumbing for registration, framing and configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("topic '{0}' is already registered")]
    DuplicateTopic(alloc::string::String),
    #[error("queue for topic {0} is full")]
    QueueFull(TopicId),
    #[error("static schedule infeasible: utilization {utilization_ppm} ppm exceeds 1000000 ppm")]
    SchedulingInfeasible { utilization_ppm: u64 },
    #[error("node {node} overran its budget: {elapsed_us} us > {budget_us} us")]
    TimingViolation { node: NodeId, elapsed_us: u64, budget_us: u64 },
    #[error("checksum mismatch on message from node {producer} (topic {topic})")]
    ChecksumMismatch { topic: TopicId, producer: NodeId },
    #[error("quorum lost on topic {topic}: {live} live members, minimum {min}")]
    QuorumLost { topic: TopicId, live: usize, min: usize },
    #[error("byzantine disagreement on topic {0}")]
    ByzantineDisagreement(TopicId),
    #[error("numerical divergence in state estimator: {0}")]
    NumericalDivergence(&'static str),
    #[error("node {0} has failed permanently")]
    NodeFailed(NodeId),

    #[error("unknown topic {0}")]
    UnknownTopic(TopicId),
    #[error("unknown topic name '{0}'")]
    UnknownTopicName(alloc::string::String),
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("unknown node name '{0}'")]
    UnknownNodeName(alloc::string::String),
    #[error("registry full: {0}")]
    RegistryFull(&'static str),
    #[error("node {producer} is not the producer of topic {topic}")]
    NotProducer { topic: TopicId, producer: NodeId },
    #[error("node {producer} is not a member of the replica group for topic {topic}")]
    NotAMember { topic: TopicId, producer: NodeId },
    #[error("aperiodic rate limit exceeded on topic {0}")]
    RateLimitExceeded(TopicId),
    #[error("payload of {0} bytes exceeds the maximum payload size")]
    PayloadTooLarge(usize),
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("schema mismatch on topic {0}")]
    SchemaMismatch(TopicId),
    #[error("invalid state transition: {0}")]
    InvalidState(&'static str),
    #[error("invalid configuration: {0}")]
    InvalidConfig(alloc::string::String),
    #[error("fault log is full")]
    FaultLogFull,
    #[error("system halted")]
    Halted,
}

impl BusError {
    pub fn config(reason: impl Into<alloc::string::String>) -> Self {
        BusError::InvalidConfig(reason.into())
    }

    /// True for the conditions that end the mission frame loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BusError::SchedulingInfeasible { .. } | BusError::QuorumLost { .. } | BusError::Halted
        )
    }
}

pub type BusResult<T> = Result<T, BusError>;
