//! Fault detection, isolation and recovery.
//!
//! The supervisor is evaluated once per frame with what the frame produced
//! (heartbeats and health reports) and answers with [`FdirActions`] for the
//! executive to carry out. It never reaches into the bus or the scheduler
//! itself. It is also the only writer of the fault log.

use crate::error::{BusError, BusResult};
use crate::fault::{FaultLog, FaultRecord, IsolationAction, RecoveryOutcome};
use crate::node::MAX_NODES;
use crate::protocol::{FaultClass, HealthReport, MissionTime, NodeId, TopicId};
use heapless::{HistoryBuffer, Vec};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use tracing::{error, info, warn};

const JOURNAL_CAPACITY: usize = 256;
/// Largest action set one node can produce in one frame (an isolation).
const ACTIONS_PER_NODE: usize = 3;
const MAX_ACTIONS: usize = 192;

const_assert!(MAX_ACTIONS >= ACTIONS_PER_NODE * MAX_NODES);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultThresholds {
    /// Consecutive frames without a heartbeat before a node becomes suspect.
    pub missed_heartbeat: u32,
    /// Consecutive frames with a budget overrun before a node becomes suspect.
    pub timing_violation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdirConfig {
    pub thresholds: FaultThresholds,
    pub isolate_after_suspect_frames: u32,
    pub max_restart_attempts: u32,
    pub backoff_base_frames: u64,
    pub max_backoff_frames: u64,
    pub probation_frames: u32,
}

impl FdirConfig {
    pub fn validate(&self) -> BusResult<()> {
        if self.thresholds.missed_heartbeat == 0 || self.thresholds.timing_violation == 0 {
            return Err(BusError::config("fdir thresholds must be positive"));
        }
        if self.isolate_after_suspect_frames == 0 {
            return Err(BusError::config("isolate_after_suspect_frames must be positive"));
        }
        if self.backoff_base_frames == 0 || self.max_backoff_frames < self.backoff_base_frames {
            return Err(BusError::config("fdir backoff needs 0 < base <= max"));
        }
        if self.probation_frames == 0 {
            return Err(BusError::config("probation_frames must be positive"));
        }
        Ok(())
    }

    fn threshold(&self, class: FaultClass) -> u32 {
        match class {
            FaultClass::MissedHeartbeat => self.thresholds.missed_heartbeat,
            FaultClass::TimingViolation => self.thresholds.timing_violation,
            _ => 1,
        }
    }

    /// Frames to wait before restart attempt `attempt` (1-based).
    pub fn backoff_frames(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(63);
        self.backoff_base_frames
            .checked_mul(1u64 << shift)
            .unwrap_or(u64::MAX)
            .min(self.max_backoff_frames)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    Nominal,
    Suspect,
    Isolated,
    Recovering,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdirAction {
    Quarantine(NodeId),
    Deschedule(NodeId),
    ShrinkQuorum { topic: TopicId, node: NodeId },
    Restart(NodeId),
    Readmit(NodeId),
    Release(NodeId),
    /// Restart attempts are exhausted; the node leaves the mission for good.
    Retire(NodeId),
}

#[derive(Debug, Default)]
pub struct FdirActions {
    actions: Vec<FdirAction, MAX_ACTIONS>,
}

impl FdirActions {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, action: FdirAction) -> BusResult<()> {
        self.actions
            .push(action)
            .map_err(|_| BusError::RegistryFull("fdir actions"))
    }

    pub fn has_actions(&self) -> bool {
        !self.actions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FdirAction> {
        self.actions.iter()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub node: NodeId,
    pub from: HealthState,
    pub to: HealthState,
    pub frame: u64,
    pub cause: Option<FaultClass>,
}

/// What the executive observed during one frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameObservations<'a> {
    pub frame: u64,
    pub now: MissionTime,
    /// Nodes that held a slot this frame and owed a heartbeat.
    pub expected: &'a [NodeId],
    pub heartbeats: &'a [NodeId],
    pub reports: &'a [HealthReport],
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisorStats {
    pub frames_evaluated: u64,
    pub isolations: u32,
    pub restarts: u32,
    pub recoveries: u32,
    pub failures: u32,
    pub log_overflows: u32,
}

#[derive(Debug, Clone)]
struct NodeHealth {
    node: NodeId,
    state: HealthState,
    replica_group: Option<TopicId>,
    consecutive: [u32; FaultClass::COUNT],
    suspect_frames: u32,
    attempts: u32,
    next_eligible_frame: u64,
    probation_clean: u32,
    last_fault: Option<FaultClass>,
    shrunk: bool,
}

impl NodeHealth {
    fn new(node: NodeId, replica_group: Option<TopicId>) -> Self {
        Self {
            node,
            state: HealthState::Nominal,
            replica_group,
            consecutive: [0; FaultClass::COUNT],
            suspect_frames: 0,
            attempts: 0,
            next_eligible_frame: 0,
            probation_clean: 0,
            last_fault: None,
            shrunk: false,
        }
    }
}

type FrameFaults = Vec<FaultClass, { FaultClass::COUNT }>;

#[derive(Debug)]
pub struct FdirSupervisor {
    config: FdirConfig,
    nodes: Vec<NodeHealth, MAX_NODES>,
    log: FaultLog,
    journal: HistoryBuffer<Transition, JOURNAL_CAPACITY>,
    stats: SupervisorStats,
}

impl FdirSupervisor {
    pub fn new(config: FdirConfig) -> BusResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            nodes: Vec::new(),
            log: FaultLog::new(),
            journal: HistoryBuffer::new(),
            stats: SupervisorStats::default(),
        })
    }

    pub fn monitor(&mut self, node: NodeId, replica_group: Option<TopicId>) -> BusResult<()> {
        if self.health(node).is_some() {
            return Ok(());
        }
        self.nodes
            .push(NodeHealth::new(node, replica_group))
            .map_err(|_| BusError::RegistryFull("fdir monitored nodes"))
    }

    /// Stops tracking a node that has left the mission. Its fault records stay
    /// in the log.
    pub fn forget(&mut self, node: NodeId) {
        self.nodes.retain(|health| health.node != node);
    }

    /// Runs the per-node state machines over one frame's observations.
    pub fn evaluate(&mut self, observations: &FrameObservations<'_>) -> BusResult<FdirActions> {
        let mut actions = FdirActions::new();
        self.stats.frames_evaluated += 1;

        for report in observations.reports {
            if let Some(class) = report.fault {
                if matches!(
                    class,
                    FaultClass::ByzantineDisagreement | FaultClass::NumericalDivergence
                ) {
                    self.commit(
                        report.node,
                        class,
                        observations,
                        IsolationAction::None,
                        RecoveryOutcome::NotApplicable,
                    );
                }
            }
        }

        for index in 0..self.nodes.len() {
            let node = self.nodes[index].node;
            let faults = frame_faults(node, observations);
            let ran = observations.expected.contains(&node);

            match self.nodes[index].state {
                HealthState::Nominal => {
                    self.advance_counters(index, &faults);
                    if let Some(cause) = self.tripped(index) {
                        self.enter_suspect(index, cause, observations, &mut actions)?;
                    }
                }
                HealthState::Suspect => {
                    if faults.is_empty() && ran {
                        self.nodes[index].consecutive = [0; FaultClass::COUNT];
                        self.nodes[index].suspect_frames = 0;
                        self.transition(index, HealthState::Nominal, observations.frame, None);
                    } else if let Some(cause) = faults.first().copied() {
                        self.nodes[index].suspect_frames += 1;
                        self.nodes[index].last_fault = Some(cause);
                        if self.nodes[index].suspect_frames >= self.config.isolate_after_suspect_frames {
                            self.isolate(index, cause, observations, &mut actions)?;
                        }
                    }
                }
                HealthState::Isolated => {
                    if observations.frame >= self.nodes[index].next_eligible_frame {
                        self.attempt_recovery(index, observations, &mut actions)?;
                    }
                }
                HealthState::Recovering => {
                    if let Some(cause) = faults.first().copied() {
                        warn!(node = %node, fault = ?cause, "fault during probation");
                        self.isolate(index, cause, observations, &mut actions)?;
                    } else if ran {
                        self.nodes[index].probation_clean += 1;
                        if self.nodes[index].probation_clean >= self.config.probation_frames {
                            self.recover(index, observations, &mut actions)?;
                        }
                    }
                }
                HealthState::Failed => {}
            }
        }

        Ok(actions)
    }

    /// Records the fatal event that precedes `SYSTEM_HALT`. Written before the
    /// halt message is published.
    pub fn record_halt(&mut self, node: NodeId, fault: FaultClass, frame: u64, now: MissionTime) -> BusResult<u32> {
        error!(node = %node, fault = ?fault, frame, "halting mission");
        self.log
            .append(node, fault, frame, now, IsolationAction::Halt, RecoveryOutcome::Failed)
    }

    /// Records a system-level event that no per-node state machine owns,
    /// such as a schedule found infeasible at startup.
    pub fn record_event(
        &mut self,
        node: NodeId,
        fault: FaultClass,
        frame: u64,
        now: MissionTime,
        outcome: RecoveryOutcome,
    ) -> BusResult<u32> {
        self.log
            .append(node, fault, frame, now, IsolationAction::None, outcome)
    }

    pub fn get_state(&self, node: NodeId) -> Option<HealthState> {
        self.health(node).map(|health| health.state)
    }

    pub fn restart_attempts(&self, node: NodeId) -> Option<u32> {
        self.health(node).map(|health| health.attempts)
    }

    pub fn states(&self) -> impl Iterator<Item = (NodeId, HealthState)> + '_ {
        self.nodes.iter().map(|health| (health.node, health.state))
    }

    pub fn fault_log(&self) -> &FaultLog {
        &self.log
    }

    pub fn fault_records(&self) -> &[FaultRecord] {
        self.log.records()
    }

    /// Transitions, oldest first. Older entries are overwritten when full.
    pub fn journal(&self) -> impl Iterator<Item = &Transition> {
        self.journal.oldest_ordered()
    }

    pub fn get_stats(&self) -> &SupervisorStats {
        &self.stats
    }

    pub fn config(&self) -> &FdirConfig {
        &self.config
    }

    fn health(&self, node: NodeId) -> Option<&NodeHealth> {
        self.nodes.iter().find(|health| health.node == node)
    }

    fn advance_counters(&mut self, index: usize, faults: &FrameFaults) {
        let health = &mut self.nodes[index];
        for class in ALL_CLASSES {
            if faults.contains(&class) {
                health.consecutive[class.index()] = health.consecutive[class.index()].saturating_add(1);
                health.last_fault = Some(class);
            } else {
                health.consecutive[class.index()] = 0;
            }
        }
    }

    fn tripped(&self, index: usize) -> Option<FaultClass> {
        let health = &self.nodes[index];
        ALL_CLASSES
            .into_iter()
            .find(|class| health.consecutive[class.index()] >= self.config.threshold(*class))
    }

    fn enter_suspect(
        &mut self,
        index: usize,
        cause: FaultClass,
        observations: &FrameObservations<'_>,
        actions: &mut FdirActions,
    ) -> BusResult<()> {
        self.nodes[index].suspect_frames = 1;
        self.transition(index, HealthState::Suspect, observations.frame, Some(cause));
        if self.nodes[index].suspect_frames >= self.config.isolate_after_suspect_frames {
            self.isolate(index, cause, observations, actions)?;
        }
        Ok(())
    }

    fn isolate(
        &mut self,
        index: usize,
        cause: FaultClass,
        observations: &FrameObservations<'_>,
        actions: &mut FdirActions,
    ) -> BusResult<()> {
        let node = self.nodes[index].node;
        let next_attempt = self.nodes[index].attempts + 1;
        let backoff = self.config.backoff_frames(next_attempt);

        self.nodes[index].next_eligible_frame = observations.frame.saturating_add(backoff);
        self.nodes[index].probation_clean = 0;
        self.nodes[index].consecutive = [0; FaultClass::COUNT];
        self.transition(index, HealthState::Isolated, observations.frame, Some(cause));
        self.stats.isolations += 1;

        actions.push(FdirAction::Quarantine(node))?;
        actions.push(FdirAction::Deschedule(node))?;

        let mut logged_action = IsolationAction::Quarantine;
        if let Some(topic) = self.nodes[index].replica_group {
            if !self.nodes[index].shrunk {
                self.nodes[index].shrunk = true;
                actions.push(FdirAction::ShrinkQuorum { topic, node })?;
                logged_action = IsolationAction::ShrinkQuorum;
            }
        }

        warn!(node = %node, fault = ?cause, backoff, "node isolated");
        self.commit(node, cause, observations, logged_action, RecoveryOutcome::Pending);
        Ok(())
    }

    fn attempt_recovery(
        &mut self,
        index: usize,
        observations: &FrameObservations<'_>,
        actions: &mut FdirActions,
    ) -> BusResult<()> {
        let node = self.nodes[index].node;
        let cause = self.nodes[index].last_fault.unwrap_or(FaultClass::NodeFailed);

        if self.nodes[index].attempts >= self.config.max_restart_attempts {
            self.transition(index, HealthState::Failed, observations.frame, Some(FaultClass::NodeFailed));
            self.stats.failures += 1;
            error!(node = %node, attempts = self.nodes[index].attempts, "restart attempts exhausted, node failed");
            self.commit(
                node,
                FaultClass::NodeFailed,
                observations,
                IsolationAction::None,
                RecoveryOutcome::Failed,
            );
            return actions.push(FdirAction::Retire(node));
        }

        self.nodes[index].attempts += 1;
        self.nodes[index].probation_clean = 0;
        self.transition(index, HealthState::Recovering, observations.frame, None);
        self.stats.restarts += 1;

        actions.push(FdirAction::Restart(node))?;
        actions.push(FdirAction::Readmit(node))?;

        info!(node = %node, attempt = self.nodes[index].attempts, "restarting isolated node");
        self.commit(node, cause, observations, IsolationAction::Restart, RecoveryOutcome::Pending);
        Ok(())
    }

    fn recover(&mut self, index: usize, observations: &FrameObservations<'_>, actions: &mut FdirActions) -> BusResult<()> {
        let node = self.nodes[index].node;
        let cause = self.nodes[index].last_fault.unwrap_or(FaultClass::NodeFailed);

        self.nodes[index].suspect_frames = 0;
        self.transition(index, HealthState::Nominal, observations.frame, None);
        self.stats.recoveries += 1;
        actions.push(FdirAction::Release(node))?;

        info!(node = %node, "node recovered after probation");
        self.commit(node, cause, observations, IsolationAction::None, RecoveryOutcome::Recovered);
        Ok(())
    }

    fn transition(&mut self, index: usize, to: HealthState, frame: u64, cause: Option<FaultClass>) {
        let health = &mut self.nodes[index];
        let from = health.state;
        health.state = to;
        self.journal.write(Transition {
            node: health.node,
            from,
            to,
            frame,
            cause,
        });
    }

    fn commit(
        &mut self,
        node: NodeId,
        fault: FaultClass,
        observations: &FrameObservations<'_>,
        action: IsolationAction,
        outcome: RecoveryOutcome,
    ) {
        if self
            .log
            .append(node, fault, observations.frame, observations.now, action, outcome)
            .is_err()
        {
            self.stats.log_overflows += 1;
            warn!(node = %node, fault = ?fault, "fault log full, record dropped");
        }
    }
}

const ALL_CLASSES: [FaultClass; FaultClass::COUNT] = [
    FaultClass::MissedHeartbeat,
    FaultClass::TimingViolation,
    FaultClass::ChecksumMismatch,
    FaultClass::ByzantineDisagreement,
    FaultClass::NumericalDivergence,
    FaultClass::QuorumLost,
    FaultClass::SchedulingInfeasible,
    FaultClass::NodeFailed,
];

/// Fault classes observed against `node` in this frame. An overrun node's
/// heartbeat was discarded with the rest of its output, so it is charged with
/// the timing violation only.
fn frame_faults(node: NodeId, observations: &FrameObservations<'_>) -> FrameFaults {
    let mut faults = FrameFaults::new();
    for report in observations.reports.iter().filter(|report| report.node == node) {
        if let Some(class) = report.fault {
            if !faults.contains(&class) {
                let _ = faults.push(class);
            }
        }
    }

    let expected = observations.expected.contains(&node);
    let beat = observations.heartbeats.contains(&node)
        || observations
            .reports
            .iter()
            .any(|report| report.node == node && report.is_heartbeat());
    if expected && !beat && !faults.contains(&FaultClass::TimingViolation) {
        let _ = faults.push(FaultClass::MissedHeartbeat);
    }
    faults
}
