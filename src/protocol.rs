use crate::error::{BusError, BusResult};
use crc::{Crc, CRC_64_ECMA_182};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

pub const MAX_PAYLOAD_SIZE: usize = 512;
pub const MAX_VALUE_COMPONENTS: usize = MAX_PAYLOAD_SIZE / 8;

/// topic(2) + producer(2) + sequence(8) + timestamp(8) + schema(2) + payload_len(2)
pub const FRAME_HEADER_SIZE: usize = 24;
pub const FRAME_TRAILER_SIZE: usize = 8;
pub const MAX_FRAME_SIZE: usize = FRAME_HEADER_SIZE + MAX_PAYLOAD_SIZE + FRAME_TRAILER_SIZE;

const_assert!(MAX_PAYLOAD_SIZE <= u16::MAX as usize);

/// CRC-64/ECMA-182, polynomial 0x42F0E1EBA9EA3693.
const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

pub type Payload = Vec<u8, MAX_PAYLOAD_SIZE>;
pub type FrameBuffer = Vec<u8, MAX_FRAME_SIZE>;
pub type Components = Vec<f64, MAX_VALUE_COMPONENTS>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopicId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaId(pub u16);

impl NodeId {
    /// Producer of system messages such as `SYSTEM_HALT`.
    pub const EXECUTIVE: NodeId = NodeId(u16::MAX);
    /// Producer of authoritative (voted) replica-group values.
    pub const VOTER: NodeId = NodeId(u16::MAX - 1);

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_reserved(self) -> bool {
        self == Self::EXECUTIVE || self == Self::VOTER
    }
}

impl TopicId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for TopicId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match *self {
            NodeId::EXECUTIVE => write!(f, "EXEC"),
            NodeId::VOTER => write!(f, "VOTER"),
            NodeId(id) => write!(f, "N{}", id),
        }
    }
}

/// Fixed-point mission time: microseconds since mission epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct MissionTime(u64);

impl MissionTime {
    pub const EPOCH: MissionTime = MissionTime(0);

    pub const fn from_micros(us: u64) -> Self {
        MissionTime(us)
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    pub fn saturating_add_micros(self, us: u64) -> Self {
        MissionTime(self.0.saturating_add(us))
    }

    /// Microseconds elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn micros_since(self, earlier: MissionTime) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl core::fmt::Display for MissionTime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{:06}s", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

/// A bus message. Immutable once built: the checksum covers every field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    topic: TopicId,
    producer: NodeId,
    sequence: u64,
    timestamp: MissionTime,
    schema: SchemaId,
    payload: Payload,
    checksum: u64,
}

impl Message {
    pub fn new(
        topic: TopicId,
        producer: NodeId,
        sequence: u64,
        timestamp: MissionTime,
        schema: SchemaId,
        payload: Payload,
    ) -> Self {
        let checksum = compute_checksum(topic, producer, sequence, timestamp, schema, &payload);
        Self {
            topic,
            producer,
            sequence,
            timestamp,
            schema,
            payload,
            checksum,
        }
    }

    pub fn topic(&self) -> TopicId {
        self.topic
    }

    pub fn producer(&self) -> NodeId {
        self.producer
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> MissionTime {
        self.timestamp
    }

    pub fn schema(&self) -> SchemaId {
        self.schema
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn checksum(&self) -> u64 {
        self.checksum
    }

    /// Recomputes the CRC-64 and compares it with the carried checksum.
    pub fn verify(&self) -> bool {
        self.checksum
            == compute_checksum(
                self.topic,
                self.producer,
                self.sequence,
                self.timestamp,
                self.schema,
                &self.payload,
            )
    }

    pub fn encode(&self) -> FrameBuffer {
        let mut frame = FrameBuffer::new();
        // Capacity is sized for the largest payload, so these cannot fail.
        let _ = frame.extend_from_slice(&self.topic.0.to_le_bytes());
        let _ = frame.extend_from_slice(&self.producer.0.to_le_bytes());
        let _ = frame.extend_from_slice(&self.sequence.to_le_bytes());
        let _ = frame.extend_from_slice(&self.timestamp.0.to_le_bytes());
        let _ = frame.extend_from_slice(&self.schema.0.to_le_bytes());
        let _ = frame.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        let _ = frame.extend_from_slice(&self.payload);
        let _ = frame.extend_from_slice(&self.checksum.to_le_bytes());
        frame
    }

    /// Decodes a wire frame. The checksum is carried over as received;
    /// callers decide what to do with a message that fails [`Message::verify`].
    pub fn decode(bytes: &[u8]) -> BusResult<Self> {
        if bytes.len() < FRAME_HEADER_SIZE + FRAME_TRAILER_SIZE {
            return Err(BusError::MalformedFrame("frame shorter than header"));
        }

        let topic = TopicId(read_u16(bytes, 0));
        let producer = NodeId(read_u16(bytes, 2));
        let sequence = read_u64(bytes, 4);
        let timestamp = MissionTime(read_u64(bytes, 12));
        let schema = SchemaId(read_u16(bytes, 20));
        let payload_len = read_u16(bytes, 22) as usize;

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(BusError::PayloadTooLarge(payload_len));
        }
        if bytes.len() != FRAME_HEADER_SIZE + payload_len + FRAME_TRAILER_SIZE {
            return Err(BusError::MalformedFrame("length field disagrees with frame size"));
        }

        let body_end = FRAME_HEADER_SIZE + payload_len;
        let payload = Payload::from_slice(&bytes[FRAME_HEADER_SIZE..body_end])
            .map_err(|()| BusError::PayloadTooLarge(payload_len))?;
        let checksum = read_u64(bytes, body_end);

        Ok(Self {
            topic,
            producer,
            sequence,
            timestamp,
            schema,
            payload,
            checksum,
        })
    }
}

fn compute_checksum(
    topic: TopicId,
    producer: NodeId,
    sequence: u64,
    timestamp: MissionTime,
    schema: SchemaId,
    payload: &[u8],
) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&topic.0.to_le_bytes());
    digest.update(&producer.0.to_le_bytes());
    digest.update(&sequence.to_le_bytes());
    digest.update(&timestamp.0.to_le_bytes());
    digest.update(&schema.0.to_le_bytes());
    digest.update(&(payload.len() as u16).to_le_bytes());
    digest.update(payload);
    digest.finalize()
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// Encodes continuous-valued components as little-endian `f64`.
pub fn encode_components(values: &[f64]) -> BusResult<Payload> {
    let mut payload = Payload::new();
    for value in values {
        payload
            .extend_from_slice(&value.to_le_bytes())
            .map_err(|()| BusError::PayloadTooLarge(values.len() * 8))?;
    }
    Ok(payload)
}

pub fn decode_components(payload: &[u8]) -> BusResult<Components> {
    if payload.len() % 8 != 0 {
        return Err(BusError::MalformedFrame("continuous payload is not a whole number of f64"));
    }
    let mut values = Components::new();
    for chunk in payload.chunks_exact(8) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        values
            .push(f64::from_le_bytes(raw))
            .map_err(|_| BusError::PayloadTooLarge(payload.len()))?;
    }
    Ok(values)
}

/// Confidence attached to a delivery. Degraded marks a last-known-good
/// republication or an estimate produced after a rejected update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    Nominal,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Nominal,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultClass {
    MissedHeartbeat,
    TimingViolation,
    ChecksumMismatch,
    ByzantineDisagreement,
    NumericalDivergence,
    QuorumLost,
    SchedulingInfeasible,
    NodeFailed,
}

impl FaultClass {
    pub const COUNT: usize = 8;

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub node: NodeId,
    pub status: HealthStatus,
    pub fault: Option<FaultClass>,
    pub timestamp: MissionTime,
}

impl HealthReport {
    /// A heartbeat.
    pub fn nominal(node: NodeId, timestamp: MissionTime) -> Self {
        Self {
            node,
            status: HealthStatus::Nominal,
            fault: None,
            timestamp,
        }
    }

    pub fn fault(node: NodeId, status: HealthStatus, fault: FaultClass, timestamp: MissionTime) -> Self {
        Self {
            node,
            status,
            fault: Some(fault),
            timestamp,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.status == HealthStatus::Nominal && self.fault.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let payload = encode_components(&[100.0, -2.5]).unwrap();
        Message::new(TopicId(3), NodeId(7), 42, MissionTime::from_micros(1_500), SchemaId(9), payload)
    }

    #[test]
    fn test_frame_layout() {
        let message = sample();
        let frame = message.encode();
        assert_eq!(frame.len(), FRAME_HEADER_SIZE + 16 + FRAME_TRAILER_SIZE);
        assert_eq!(&frame[0..2], &3u16.to_le_bytes());
        assert_eq!(&frame[frame.len() - 8..], &message.checksum().to_le_bytes());

        let decoded = Message::decode(&frame).unwrap();
        assert_eq!(decoded, message);
        assert!(decoded.verify());
    }

    #[test]
    fn test_corrupted_payload_fails_verification() {
        let mut frame = sample().encode();
        frame[FRAME_HEADER_SIZE + 3] ^= 0x10;
        let decoded = Message::decode(&frame).unwrap();
        assert!(!decoded.verify());
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let frame = sample().encode();
        assert!(matches!(
            Message::decode(&frame[..frame.len() - 1]),
            Err(BusError::MalformedFrame(_))
        ));
        assert!(Message::decode(&frame[..10]).is_err());
    }

    #[test]
    fn test_checksum_depends_on_sequence() {
        let a = sample();
        let b = Message::new(a.topic(), a.producer(), 43, a.timestamp(), a.schema(), Payload::from_slice(a.payload()).unwrap());
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_components() {
        let values = decode_components(&encode_components(&[1.0, 2.0, 3.0]).unwrap()).unwrap();
        assert_eq!(values.as_slice(), &[1.0, 2.0, 3.0]);
        assert!(decode_components(&[0u8; 7]).is_err());
        assert!(encode_components(&[0.0; MAX_VALUE_COMPONENTS + 1]).is_err());
    }

    #[test]
    fn test_mission_time_display() {
        assert_eq!(MissionTime::from_micros(2_000_500).to_string(), "2.000500s");
    }
}
