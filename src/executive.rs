//! Cyclic flight executive.
//!
//! Owns one instance of every component and drives the frame:
//!
//! 1. frame boundary (pending schedule changes applied)
//! 2. mission clock tick
//! 3. drain queued messages into the delivery batch
//! 4. control-critical nodes, rate-monotonic order
//! 5. TMR vote on replica-group topics
//! 6. FDIR evaluation and its actions
//! 7. telemetry-class nodes
//!
//! Faults raised by telemetry-class nodes are evaluated in the next frame.

use crate::bus::{Cardinality, DeliveryBatch, Members, MessageBus, PublishReceipt, TopicName, TopicSpec};
use crate::clock::{MissionClock, TimeSource};
use crate::config::MissionConfig;
use crate::error::{BusError, BusResult};
use crate::estimator::{ConstantVelocity, EstimatorNode, FusedState, MeasurementModel, StateEstimator};
use crate::fault::RecoveryOutcome;
use crate::fdir::{FdirAction, FdirSupervisor, FrameObservations};
use crate::node::{FlightNode, NodeContext, NodeDescriptor, NodeName, NodeRegistry, Outbox};
use crate::protocol::{Confidence, FaultClass, HealthReport, HealthStatus, Message, MissionTime, NodeId, SchemaId, TopicId};
use crate::scheduler::{CyclicScheduler, ScheduleEntry, SchedulerState};
use crate::voter::{Decision, QuorumStatus, ReplicaGroupConfig, TmrVoter, VoteResult, MAX_REPLICA_GROUPS};
use alloc::boxed::Box;
use alloc::vec::Vec;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

const MAX_SUBSCRIPTIONS: usize = 16;

type Subscriptions = heapless::Vec<TopicId, MAX_SUBSCRIPTIONS>;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExecutiveStats {
    pub frames: u64,
    pub node_steps: u64,
    pub overruns: u64,
    pub step_errors: u64,
    pub backpressure_events: u64,
    pub degraded_publications: u64,
    pub last_frame_us: u64,
}

/// Summary of one executed frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub frame: u64,
    pub time: MissionTime,
    pub executed: usize,
    pub overruns: Vec<NodeId>,
    pub votes: Vec<VoteResult>,
    pub actions: Vec<FdirAction>,
    pub state: SchedulerState,
}

impl FrameReport {
    fn new(frame: u64, time: MissionTime) -> Self {
        Self {
            frame,
            time,
            executed: 0,
            overruns: Vec::new(),
            votes: Vec::new(),
            actions: Vec::new(),
            state: SchedulerState::Running,
        }
    }

    pub fn halted(&self) -> bool {
        self.state == SchedulerState::Halted
    }

    pub fn vote(&self, topic: TopicId) -> Option<&VoteResult> {
        self.votes.iter().find(|vote| vote.topic == topic)
    }
}

pub struct FlightExecutive<T: TimeSource> {
    bus: MessageBus,
    nodes: NodeRegistry,
    behaviors: Vec<Option<Box<dyn FlightNode>>>,
    subscriptions: Vec<Subscriptions>,
    backpressure: Vec<Subscriptions>,
    scheduler: CyclicScheduler,
    clock: MissionClock,
    voter: TmrVoter,
    supervisor: FdirSupervisor,
    time: T,

    batch: DeliveryBatch,
    outbox: Outbox,
    candidates: Vec<Message>,
    expected: Vec<NodeId>,
    heartbeats: Vec<NodeId>,
    reports: Vec<HealthReport>,

    fused_topic: Option<TopicId>,
    velocity_components: Vec<usize>,
    latest_fused: Option<FusedState>,
    stats: ExecutiveStats,
    halted: bool,
}

impl<T: TimeSource> FlightExecutive<T> {
    /// Builds every component from a validated profile. Behaviors for the
    /// declared nodes are attached afterwards with [`FlightExecutive::attach`];
    /// the estimator node, if configured, is attached here.
    pub fn from_config(config: &MissionConfig, time: T) -> BusResult<Self> {
        config.validate()?;

        let mut nodes = NodeRegistry::new();
        for node in &config.nodes {
            nodes.register(NodeDescriptor {
                name: node_name(&node.name)?,
                role: node.role,
                period_us: node.period_us,
                budget_us: node.budget_us,
                priority: node.priority,
                criticality: node.criticality,
                replica_group: None,
            })?;
        }

        let mut bus = MessageBus::new();
        for topic in &config.topics {
            let cardinality = match config.replica_group(&topic.name) {
                Some(group) => {
                    let mut members = Members::new();
                    for member in &group.members {
                        members
                            .push(resolve(&nodes, member)?)
                            .map_err(|_| BusError::RegistryFull("replica members"))?;
                    }
                    Cardinality::ReplicaGroup { members }
                }
                None => {
                    let producer = topic.producer.as_deref().unwrap_or_default();
                    Cardinality::Single {
                        producer: resolve(&nodes, producer)?,
                    }
                }
            };
            let name = TopicName::from(&topic.name)
                .map_err(|_| BusError::config(alloc::format!("topic name '{}' too long", topic.name)))?;
            bus.register(TopicSpec {
                name,
                schema: SchemaId(topic.schema),
                qos: topic.qos,
                criticality: topic.criticality,
                cardinality,
                queue_depth: topic.queue_depth,
            })?;
        }

        let mut voter = TmrVoter::new();
        let mut group_topics: heapless::Vec<(NodeId, TopicId), { crate::node::MAX_NODES }> = heapless::Vec::new();
        for group in &config.replica_groups {
            let topic = topic_id(&bus, &group.topic)?;
            let qos = bus.spec(topic)?.qos;
            let members = match &bus.spec(topic)?.cardinality {
                Cardinality::ReplicaGroup { members } => members.clone(),
                Cardinality::Single { .. } => Members::new(),
            };
            for member in &members {
                let _ = group_topics.push((*member, topic));
            }
            voter.add_group(ReplicaGroupConfig {
                topic,
                members,
                min_quorum: group.min_quorum,
                vote: group.vote,
                deadline_us: qos.deadline_us().unwrap_or(config.frame_period_us),
            })?;
        }
        for (member, topic) in &group_topics {
            nodes.get_mut(*member)?.replica_group = Some(*topic);
        }

        let node_count = nodes.iter().count();
        let mut subscriptions: Vec<Subscriptions> = (0..node_count).map(|_| Subscriptions::new()).collect();
        for node in &config.nodes {
            let id = resolve(&nodes, &node.name)?;
            for topic in &node.subscribes {
                let topic = topic_id(&bus, topic)?;
                subscribe(&mut bus, &mut subscriptions, topic, id)?;
            }
        }

        let mut scheduler = CyclicScheduler::new(config.frame_period_us);
        let mut supervisor = FdirSupervisor::new(config.fdir)?;
        for (id, descriptor) in nodes.iter() {
            scheduler.add_node(ScheduleEntry {
                node: id,
                period_us: descriptor.period_us,
                budget_us: descriptor.budget_us,
                priority: descriptor.priority,
                criticality: descriptor.criticality,
            })?;
            supervisor.monitor(id, descriptor.replica_group)?;
        }

        let mut behaviors: Vec<Option<Box<dyn FlightNode>>> = (0..node_count).map(|_| None).collect();
        let mut fused_topic = None;
        if let Some(estimator) = &config.estimator {
            let host = resolve(&nodes, &estimator.node)?;
            let output = topic_id(&bus, &estimator.output)?;
            let dynamics = ConstantVelocity {
                axes: estimator.axes,
                process_noise: estimator.process_noise,
            };
            let mut filter = StateEstimator::new(
                dynamics,
                DVector::from_column_slice(&estimator.initial_state),
                DMatrix::from_diagonal(&DVector::from_column_slice(&estimator.initial_variance)),
                estimator.psd_tolerance,
            )?;
            for measurement in &estimator.measurements {
                let topic = topic_id(&bus, &measurement.topic)?;
                filter.add_measurement(MeasurementModel {
                    topic,
                    h: matrix_from_rows(&measurement.h),
                    r: matrix_from_rows(&measurement.r),
                })?;
                subscribe(&mut bus, &mut subscriptions, topic, host)?;
            }
            behaviors[host.index()] = Some(Box::new(EstimatorNode::new(filter, output)));
            fused_topic = Some(output);
        }

        let clock = MissionClock::new(config.frame_period_us, config.clock.correction_interval_frames)?;
        info!(
            nodes = node_count,
            topics = config.topics.len(),
            groups = config.replica_groups.len(),
            "flight executive configured"
        );

        Ok(Self {
            bus,
            nodes,
            backpressure: (0..node_count).map(|_| Subscriptions::new()).collect(),
            behaviors,
            subscriptions,
            scheduler,
            clock,
            voter,
            supervisor,
            time,
            batch: DeliveryBatch::new(),
            outbox: Outbox::new(),
            candidates: Vec::new(),
            expected: Vec::new(),
            heartbeats: Vec::new(),
            reports: Vec::new(),
            fused_topic,
            velocity_components: config.clock.velocity_components.clone(),
            latest_fused: None,
            stats: ExecutiveStats::default(),
            halted: false,
        })
    }

    /// Attaches the flight software for a declared node.
    pub fn attach(&mut self, name: &str, behavior: Box<dyn FlightNode>) -> BusResult<NodeId> {
        let id = self
            .nodes
            .lookup(name)
            .ok_or_else(|| BusError::UnknownNodeName(name.into()))?;
        let slot = self.behaviors.get_mut(id.index()).ok_or(BusError::UnknownNode(id))?;
        *slot = Some(behavior);
        Ok(id)
    }

    /// Runs the schedulability check and starts the cyclic executive.
    /// An infeasible schedule is logged and the executive stays idle.
    pub fn start(&mut self) -> BusResult<()> {
        for (id, descriptor) in self.nodes.iter() {
            if self.behaviors.get(id.index()).map_or(true, Option::is_none) {
                return Err(BusError::config(alloc::format!(
                    "node '{}' has no flight software attached",
                    descriptor.name
                )));
            }
        }

        if let Err(error) = self.scheduler.arm() {
            if let BusError::SchedulingInfeasible { .. } = error {
                let _ = self.supervisor.record_event(
                    NodeId::EXECUTIVE,
                    FaultClass::SchedulingInfeasible,
                    0,
                    self.clock.now(),
                    RecoveryOutcome::NotApplicable,
                );
            }
            return Err(error);
        }
        self.scheduler.start()
    }

    /// Executes one frame.
    pub fn run_frame(&mut self) -> BusResult<FrameReport> {
        if self.scheduler.get_state() == SchedulerState::Halted {
            return Err(BusError::Halted);
        }
        let frame_started_us = self.time.now_us();

        let plan = match self.scheduler.begin_frame() {
            Ok(plan) => plan,
            Err(BusError::SchedulingInfeasible { utilization_ppm }) => {
                let now = self.clock.now();
                self.halt(
                    NodeId::EXECUTIVE,
                    FaultClass::SchedulingInfeasible,
                    self.stats.frames,
                    now,
                    "readmission broke schedulability",
                );
                return Err(BusError::SchedulingInfeasible { utilization_ppm });
            }
            Err(error) => return Err(error),
        };
        let frame = plan.frame;
        let now = self.clock.tick();
        let mut report = FrameReport::new(frame, now);

        self.bus.collect_deliveries(&mut self.batch);
        for &(topic, producer) in self.batch.corrupted() {
            if !producer.is_reserved() {
                warn!(topic = %topic, producer = %producer, "checksum mismatch in delivery");
                self.reports.push(HealthReport::fault(
                    producer,
                    HealthStatus::Degraded,
                    FaultClass::ChecksumMismatch,
                    now,
                ));
            }
        }
        self.absorb_fused_state();

        for entry in plan.control_critical() {
            self.run_node(entry, frame, now, &mut report);
        }

        if !self.resolve_votes(frame, now, &mut report)? {
            report.state = self.scheduler.get_state();
            return Ok(report);
        }

        let evaluation = self.supervisor.evaluate(&FrameObservations {
            frame,
            now,
            expected: &self.expected,
            heartbeats: &self.heartbeats,
            reports: &self.reports,
        });
        self.expected.clear();
        self.heartbeats.clear();
        self.reports.clear();
        let actions = evaluation?;

        for action in actions.iter() {
            report.actions.push(*action);
            self.execute(*action, frame, now);
        }

        if self.scheduler.get_state() != SchedulerState::Halted {
            for entry in plan.telemetry() {
                self.run_node(entry, frame, now, &mut report);
            }
        }

        self.stats.frames += 1;
        self.stats.last_frame_us = self.time.now_us().saturating_sub(frame_started_us);
        report.state = self.scheduler.get_state();
        debug!(frame, time = %now, executed = report.executed, "frame complete");
        Ok(report)
    }

    /// Runs up to `frames` frames, stopping early on halt.
    pub fn run_frames(&mut self, frames: u64) -> BusResult<Vec<FrameReport>> {
        let mut reports = Vec::new();
        for _ in 0..frames {
            let report = self.run_frame()?;
            let halted = report.halted();
            reports.push(report);
            if halted {
                break;
            }
        }
        Ok(reports)
    }

    /// Accepts a wire frame from a remote link. A corrupted frame is charged
    /// to its claimed producer at the next FDIR evaluation.
    pub fn ingest_frame(&mut self, bytes: &[u8]) -> BusResult<PublishReceipt> {
        let result = self.bus.ingest_frame(bytes);
        if let Err(BusError::ChecksumMismatch { producer, .. }) = &result {
            if self.nodes.get(*producer).is_ok() {
                self.reports.push(HealthReport::fault(
                    *producer,
                    HealthStatus::Degraded,
                    FaultClass::ChecksumMismatch,
                    self.clock.now(),
                ));
            }
        }
        result
    }

    /// Removes a node from the mission for good: its bus traffic is dropped,
    /// its subscriptions are cancelled and it leaves the schedule at the next
    /// frame boundary. A replica member also leaves its group's quorum, and a
    /// group left below its minimum halts the mission.
    pub fn deregister(&mut self, name: &str) -> BusResult<NodeDescriptor> {
        if self.halted {
            return Err(BusError::Halted);
        }
        let node = self.node_id(name)?;
        let replica_group = self.nodes.get(node)?.replica_group;
        self.supervisor.forget(node);
        let descriptor = self.retire(node)?;

        if let Some(topic) = replica_group {
            if let QuorumStatus::Lost { .. } = self.voter.shrink(topic, node)? {
                let now = self.clock.now();
                self.halt(NodeId::VOTER, FaultClass::QuorumLost, self.stats.frames, now, "replica quorum lost");
            }
        }
        Ok(descriptor)
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    pub fn scheduler(&self) -> &CyclicScheduler {
        &self.scheduler
    }

    pub fn voter(&self) -> &TmrVoter {
        &self.voter
    }

    pub fn supervisor(&self) -> &FdirSupervisor {
        &self.supervisor
    }

    pub fn clock(&self) -> &MissionClock {
        &self.clock
    }

    pub fn latest_fused_state(&self) -> Option<&FusedState> {
        self.latest_fused.as_ref()
    }

    pub fn node_id(&self, name: &str) -> BusResult<NodeId> {
        self.nodes
            .lookup(name)
            .ok_or_else(|| BusError::UnknownNodeName(name.into()))
    }

    pub fn topic_id(&self, name: &str) -> BusResult<TopicId> {
        self.bus
            .lookup(name)
            .map(|handle| handle.id)
            .ok_or_else(|| BusError::UnknownTopicName(name.into()))
    }

    pub fn get_stats(&self) -> &ExecutiveStats {
        &self.stats
    }

    pub fn get_state(&self) -> SchedulerState {
        self.scheduler.get_state()
    }

    fn run_node(&mut self, entry: &ScheduleEntry, frame: u64, now: MissionTime, report: &mut FrameReport) {
        let node = entry.node;
        let index = node.index();
        let Some(behavior) = self.behaviors.get_mut(index).and_then(Option::as_mut) else {
            return;
        };

        self.outbox.clear();
        let backpressure = core::mem::take(&mut self.backpressure[index]);
        let started_us = self.time.now_us();
        let result = {
            let mut ctx = NodeContext::new(
                node,
                frame,
                now,
                &self.bus,
                &self.batch,
                &self.subscriptions[index],
                &backpressure,
                &mut self.outbox,
            );
            behavior.step(&mut ctx)
        };
        let elapsed_us = self.time.now_us().saturating_sub(started_us);

        self.expected.push(node);
        self.stats.node_steps += 1;
        report.executed += 1;

        if elapsed_us > entry.budget_us {
            warn!(node = %node, elapsed_us, budget_us = entry.budget_us, "budget overrun, output discarded");
            self.stats.overruns += 1;
            report.overruns.push(node);
            self.reports.push(HealthReport::fault(
                node,
                HealthStatus::Degraded,
                FaultClass::TimingViolation,
                now,
            ));
            return;
        }
        if let Err(error) = result {
            warn!(node = %node, %error, "node step failed, output discarded");
            self.stats.step_errors += 1;
            return;
        }

        let mut rejected = Subscriptions::new();
        for (topic, payload) in self.outbox.publications() {
            match self.bus.publish(*topic, node, payload, now) {
                Ok(_) => {}
                Err(BusError::QueueFull(full)) => {
                    self.stats.backpressure_events += 1;
                    let _ = rejected.push(full);
                }
                Err(error) => warn!(node = %node, topic = %topic, %error, "publication refused"),
            }
        }
        self.reports.extend_from_slice(self.outbox.reports());
        if self.outbox.heartbeat() {
            self.heartbeats.push(node);
        }
        self.backpressure[index] = rejected;
    }

    /// Returns false if a quorum loss halted the mission.
    fn resolve_votes(&mut self, frame: u64, now: MissionTime, report: &mut FrameReport) -> BusResult<bool> {
        let topics: heapless::Vec<TopicId, MAX_REPLICA_GROUPS> = self.voter.topics().collect();
        for topic in topics {
            self.candidates.clear();
            self.bus.drain_candidates(topic, &mut self.candidates)?;
            let result = self.voter.vote(topic, &self.candidates, now)?;

            if let Decision::Byzantine { contributors } = &result.decision {
                for member in contributors {
                    self.reports.push(HealthReport::fault(
                        *member,
                        HealthStatus::Degraded,
                        FaultClass::ByzantineDisagreement,
                        now,
                    ));
                }
            }
            if matches!(result.decision, Decision::QuorumLost { .. }) {
                report.votes.push(result);
                self.halt(NodeId::VOTER, FaultClass::QuorumLost, frame, now, "replica quorum lost");
                return Ok(false);
            }

            if let Some((payload, confidence)) = &result.emit {
                match self.bus.publish_voted(topic, payload, now, *confidence) {
                    Ok(_) => {
                        if *confidence == Confidence::Degraded {
                            self.stats.degraded_publications += 1;
                        }
                    }
                    Err(error) => warn!(topic = %topic, %error, "voted value not published"),
                }
            }
            report.votes.push(result);
        }
        Ok(true)
    }

    fn execute(&mut self, action: FdirAction, frame: u64, now: MissionTime) {
        let outcome = match action {
            FdirAction::Quarantine(node) => {
                self.bus.quarantine(node);
                Ok(())
            }
            FdirAction::Deschedule(node) => self.scheduler.request_removal(node),
            FdirAction::ShrinkQuorum { topic, node } => match self.voter.shrink(topic, node) {
                Ok(QuorumStatus::Lost { .. }) => {
                    self.halt(NodeId::VOTER, FaultClass::QuorumLost, frame, now, "replica quorum lost");
                    Ok(())
                }
                Ok(QuorumStatus::Healthy { .. }) => Ok(()),
                Err(error) => Err(error),
            },
            FdirAction::Restart(node) => {
                if let Some(behavior) = self.behaviors.get_mut(node.index()).and_then(Option::as_mut) {
                    behavior.restart();
                }
                Ok(())
            }
            FdirAction::Readmit(node) => self.scheduler.request_readmission(node),
            FdirAction::Release(node) => {
                self.bus.release(node);
                Ok(())
            }
            FdirAction::Retire(node) => self.retire(node).map(|_| ()),
        };
        if let Err(error) = outcome {
            if error != BusError::Halted {
                warn!(?action, %error, "fdir action failed");
            }
        }
    }

    fn retire(&mut self, node: NodeId) -> BusResult<NodeDescriptor> {
        self.bus.quarantine(node);
        self.bus.unsubscribe_all(node);
        if let Some(list) = self.subscriptions.get_mut(node.index()) {
            list.clear();
        }
        if let Some(list) = self.backpressure.get_mut(node.index()) {
            list.clear();
        }
        if let Some(slot) = self.behaviors.get_mut(node.index()) {
            *slot = None;
        }
        let descriptor = self.nodes.retire(node)?;
        self.scheduler.retire(node)?;
        info!(node = %node, name = %descriptor.name, "node retired from mission");
        Ok(descriptor)
    }

    /// The fault record is committed before `SYSTEM_HALT` goes out. Only the
    /// first halt of a mission is recorded and announced.
    fn halt(&mut self, node: NodeId, fault: FaultClass, frame: u64, now: MissionTime, reason: &'static str) {
        if self.halted {
            return;
        }
        self.halted = true;
        if let Err(error) = self.supervisor.record_halt(node, fault, frame, now) {
            error!(%error, "halt could not be recorded");
        }
        self.scheduler.halt(reason);
        if let Err(error) = self.bus.publish_system_halt(now) {
            error!(%error, "SYSTEM_HALT could not be published");
        }
    }

    fn absorb_fused_state(&mut self) {
        let Some(topic) = self.fused_topic else {
            return;
        };
        let Some(delivery) = self.batch.for_topic(topic).last() else {
            return;
        };
        match FusedState::decode(delivery.message.payload(), delivery.message.timestamp()) {
            Ok(fused) => {
                if !self.velocity_components.is_empty() {
                    self.clock.set_speed(fused.speed(&self.velocity_components));
                }
                self.latest_fused = Some(fused);
            }
            Err(error) => warn!(%error, "undecodable fused state"),
        }
    }
}

fn resolve(nodes: &NodeRegistry, name: &str) -> BusResult<NodeId> {
    nodes
        .lookup(name)
        .ok_or_else(|| BusError::UnknownNodeName(name.into()))
}

fn topic_id(bus: &MessageBus, name: &str) -> BusResult<TopicId> {
    bus.lookup(name)
        .map(|handle| handle.id)
        .ok_or_else(|| BusError::UnknownTopicName(name.into()))
}

fn node_name(name: &str) -> BusResult<NodeName> {
    NodeName::from(name).map_err(|_| BusError::config(alloc::format!("node name '{}' too long", name)))
}

fn matrix_from_rows(rows: &[Vec<f64>]) -> DMatrix<f64> {
    let ncols = rows.first().map_or(0, Vec::len);
    DMatrix::from_fn(rows.len(), ncols, |r, c| rows[r][c])
}

fn subscribe(
    bus: &mut MessageBus,
    subscriptions: &mut [Subscriptions],
    topic: TopicId,
    node: NodeId,
) -> BusResult<()> {
    bus.subscribe(topic, node)?;
    let list = subscriptions.get_mut(node.index()).ok_or(BusError::UnknownNode(node))?;
    if !list.contains(&topic) {
        list.push(topic)
            .map_err(|_| BusError::RegistryFull("node subscriptions"))?;
    }
    Ok(())
}
