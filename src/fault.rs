use crate::error::{BusError, BusResult};
use crate::protocol::{FaultClass, MissionTime, NodeId};
use heapless::Vec;
use serde::{Deserialize, Serialize};

pub const FAULT_LOG_CAPACITY: usize = 512;
/// Tail of the log kept free for the records that end a mission.
const FATAL_RESERVE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationAction {
    None,
    Quarantine,
    Restart,
    ShrinkQuorum,
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryOutcome {
    Pending,
    Recovered,
    Failed,
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub id: u32,
    pub node: NodeId,
    pub fault: FaultClass,
    pub frame: u64,
    pub detected_at: MissionTime,
    pub action: IsolationAction,
    pub outcome: RecoveryOutcome,
}

impl FaultRecord {
    pub fn is_fatal(&self) -> bool {
        self.action == IsolationAction::Halt
    }

    /// True for records that took a node, or the mission, out of service.
    pub fn is_failure(&self) -> bool {
        matches!(
            self.action,
            IsolationAction::Quarantine | IsolationAction::ShrinkQuorum | IsolationAction::Halt
        )
    }
}

/// Append-only audit trail. Records are never mutated or evicted; a later
/// outcome is a new record referring to the same node.
#[derive(Debug)]
pub struct FaultLog {
    records: Vec<FaultRecord, FAULT_LOG_CAPACITY>,
    next_id: u32,
}

impl FaultLog {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            next_id: 1,
        }
    }

    pub fn append(
        &mut self,
        node: NodeId,
        fault: FaultClass,
        frame: u64,
        detected_at: MissionTime,
        action: IsolationAction,
        outcome: RecoveryOutcome,
    ) -> BusResult<u32> {
        let limit = if action == IsolationAction::Halt {
            FAULT_LOG_CAPACITY
        } else {
            FAULT_LOG_CAPACITY - FATAL_RESERVE
        };
        if self.records.len() >= limit {
            return Err(BusError::FaultLogFull);
        }

        let id = self.next_id;
        let record = FaultRecord {
            id,
            node,
            fault,
            frame,
            detected_at,
            action,
            outcome,
        };
        self.records.push(record).map_err(|_| BusError::FaultLogFull)?;
        self.next_id += 1;
        Ok(id)
    }

    pub fn records(&self) -> &[FaultRecord] {
        &self.records
    }

    pub fn for_node(&self, node: NodeId) -> impl Iterator<Item = &FaultRecord> {
        self.records.iter().filter(move |record| record.node == node)
    }

    pub fn count(&self, fault: FaultClass) -> usize {
        self.records.iter().filter(|record| record.fault == fault).count()
    }

    pub fn failures(&self) -> usize {
        self.records.iter().filter(|record| record.is_failure()).count()
    }

    /// Failures per second of mission time elapsed up to `now`.
    pub fn failure_rate(&self, now: MissionTime) -> f64 {
        let elapsed_s = now.as_secs_f64();
        if elapsed_s > 0.0 {
            self.failures() as f64 / elapsed_s
        } else {
            0.0
        }
    }

    /// Mean time between failures in seconds, the inverse of
    /// [`FaultLog::failure_rate`]. `None` until something has failed.
    pub fn mean_time_between_failures(&self, now: MissionTime) -> Option<f64> {
        let failures = self.failures();
        (failures > 0).then(|| now.as_secs_f64() / failures as f64)
    }

    pub fn last(&self) -> Option<&FaultRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for FaultLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_sequential() {
        let mut log = FaultLog::new();
        let a = log
            .append(NodeId(1), FaultClass::MissedHeartbeat, 3, MissionTime::EPOCH, IsolationAction::Quarantine, RecoveryOutcome::Pending)
            .unwrap();
        let b = log
            .append(NodeId(1), FaultClass::MissedHeartbeat, 9, MissionTime::EPOCH, IsolationAction::None, RecoveryOutcome::Recovered)
            .unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(log.for_node(NodeId(1)).count(), 2);
        assert_eq!(log.records()[0].outcome, RecoveryOutcome::Pending);
    }

    #[test]
    fn test_mtbf_counts_isolations_only() {
        let mut log = FaultLog::new();
        let now = MissionTime::from_micros(60_000_000);
        assert_eq!(log.mean_time_between_failures(now), None);
        assert!(log.failure_rate(now).abs() < f64::EPSILON);

        for (frame, action) in [
            (100, IsolationAction::Quarantine),
            (300, IsolationAction::ShrinkQuorum),
            (700, IsolationAction::Quarantine),
        ] {
            log.append(NodeId(1), FaultClass::MissedHeartbeat, frame, MissionTime::from_micros(frame * 10_000), action, RecoveryOutcome::Pending)
                .unwrap();
        }
        log.append(NodeId(1), FaultClass::MissedHeartbeat, 900, MissionTime::from_micros(9_000_000), IsolationAction::None, RecoveryOutcome::Recovered)
            .unwrap();

        assert_eq!(log.failures(), 3);
        let mtbf = log.mean_time_between_failures(now).unwrap();
        assert!((mtbf - 20.0).abs() < 1e-12);
        assert!((log.failure_rate(now) - 0.05).abs() < 1e-12);
        assert!(log.failure_rate(MissionTime::EPOCH).abs() < f64::EPSILON);
    }

    #[test]
    fn test_reserve_kept_for_halt() {
        let mut log = FaultLog::new();
        for frame in 0..(FAULT_LOG_CAPACITY - FATAL_RESERVE) as u64 {
            log.append(NodeId(0), FaultClass::TimingViolation, frame, MissionTime::EPOCH, IsolationAction::None, RecoveryOutcome::NotApplicable)
                .unwrap();
        }
        assert_eq!(
            log.append(NodeId(0), FaultClass::TimingViolation, 0, MissionTime::EPOCH, IsolationAction::None, RecoveryOutcome::NotApplicable),
            Err(BusError::FaultLogFull)
        );
        assert!(log
            .append(NodeId::EXECUTIVE, FaultClass::QuorumLost, 0, MissionTime::EPOCH, IsolationAction::Halt, RecoveryOutcome::Failed)
            .is_ok());
        assert!(log.last().unwrap().is_fatal());
    }
}
