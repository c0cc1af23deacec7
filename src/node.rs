//! Node registry and the narrow interface flight software implements.

use crate::bus::{Criticality, Delivery, DeliveryBatch, MessageBus, TopicHandle};
use crate::error::{BusError, BusResult};
use crate::protocol::{
    encode_components, FaultClass, HealthReport, HealthStatus, MissionTime, NodeId, Payload, TopicId,
};
use arrayvec::ArrayString;
use heapless::Vec;
use serde::{Deserialize, Serialize};

pub const MAX_NODES: usize = 64;
pub const NODE_NAME_LEN: usize = 32;
const MAX_STAGED_PUBLICATIONS: usize = 16;
const MAX_STAGED_REPORTS: usize = 4;

pub type NodeName = ArrayString<NODE_NAME_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Sensor,
    Actuator,
    Estimator,
    Supervisor,
}

/// Static description of a schedulable unit of flight software.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub name: NodeName,
    pub role: NodeRole,
    pub period_us: u64,
    pub budget_us: u64,
    pub priority: u8,
    pub criticality: Criticality,
    pub replica_group: Option<TopicId>,
}

/// Fixed-capacity registry. A node's id is its slot index and never changes;
/// retired slots are not reused.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    slots: Vec<Option<NodeDescriptor>, MAX_NODES>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn register(&mut self, descriptor: NodeDescriptor) -> BusResult<NodeId> {
        if self.lookup(&descriptor.name).is_some() {
            return Err(BusError::config(alloc::format!(
                "node '{}' is already registered",
                descriptor.name
            )));
        }
        let id = NodeId(self.slots.len() as u16);
        self.slots
            .push(Some(descriptor))
            .map_err(|_| BusError::RegistryFull("nodes"))?;
        Ok(id)
    }

    pub fn retire(&mut self, id: NodeId) -> BusResult<NodeDescriptor> {
        self.slots
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or(BusError::UnknownNode(id))
    }

    pub fn get(&self, id: NodeId) -> BusResult<&NodeDescriptor> {
        self.slots
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(BusError::UnknownNode(id))
    }

    pub fn get_mut(&mut self, id: NodeId) -> BusResult<&mut NodeDescriptor> {
        self.slots
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(BusError::UnknownNode(id))
    }

    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.iter()
            .find(|(_, descriptor)| descriptor.name.as_str() == name)
            .map(|(id, _)| id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &NodeDescriptor)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|descriptor| (NodeId(index as u16), descriptor)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a node produced during its slot. Merged into the bus only if
/// the node finished inside its budget.
#[derive(Debug, Default)]
pub struct Outbox {
    publications: Vec<(TopicId, Payload), MAX_STAGED_PUBLICATIONS>,
    reports: Vec<HealthReport, MAX_STAGED_REPORTS>,
    heartbeat: bool,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.publications.clear();
        self.reports.clear();
        self.heartbeat = false;
    }

    pub fn publications(&self) -> &[(TopicId, Payload)] {
        &self.publications
    }

    pub fn reports(&self) -> &[HealthReport] {
        &self.reports
    }

    pub fn heartbeat(&self) -> bool {
        self.heartbeat
    }
}

/// View of the bus handed to a node for the duration of its frame slot.
pub struct NodeContext<'a> {
    node: NodeId,
    frame: u64,
    now: MissionTime,
    bus: &'a MessageBus,
    batch: &'a DeliveryBatch,
    subscriptions: &'a [TopicId],
    backpressure: &'a [TopicId],
    outbox: &'a mut Outbox,
}

impl<'a> NodeContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: NodeId,
        frame: u64,
        now: MissionTime,
        bus: &'a MessageBus,
        batch: &'a DeliveryBatch,
        subscriptions: &'a [TopicId],
        backpressure: &'a [TopicId],
        outbox: &'a mut Outbox,
    ) -> Self {
        Self {
            node,
            frame,
            now,
            bus,
            batch,
            subscriptions,
            backpressure,
            outbox,
        }
    }

    pub fn id(&self) -> NodeId {
        self.node
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn now(&self) -> MissionTime {
        self.now
    }

    pub fn topic(&self, name: &str) -> BusResult<TopicHandle> {
        self.bus
            .lookup(name)
            .ok_or_else(|| BusError::UnknownTopicName(name.into()))
    }

    /// Messages on subscribed topics published since the previous frame.
    pub fn deliveries(&self) -> impl Iterator<Item = &Delivery> + '_ {
        self.batch.for_topics(self.subscriptions)
    }

    pub fn deliveries_on(&self, topic: TopicId) -> impl Iterator<Item = &Delivery> + '_ {
        let subscribed = self.subscriptions.contains(&topic);
        self.batch.for_topic(topic).filter(move |_| subscribed)
    }

    /// Stages a publication; it reaches the bus when the slot closes in budget.
    pub fn publish(&mut self, topic: TopicId, payload: &[u8]) -> BusResult<()> {
        let payload = Payload::from_slice(payload).map_err(|()| BusError::PayloadTooLarge(payload.len()))?;
        self.outbox
            .publications
            .push((topic, payload))
            .map_err(|_| BusError::QueueFull(topic))
    }

    pub fn publish_values(&mut self, topic: TopicId, values: &[f64]) -> BusResult<()> {
        let payload = encode_components(values)?;
        self.publish(topic, &payload)
    }

    pub fn heartbeat(&mut self) {
        self.outbox.heartbeat = true;
    }

    pub fn report_health(&mut self, status: HealthStatus, fault: Option<FaultClass>) {
        let report = HealthReport {
            node: self.node,
            status,
            fault,
            timestamp: self.now,
        };
        // A node only has a handful of fault classes to report per frame.
        let _ = self.outbox.reports.push(report);
    }

    /// True if a control-critical write to `topic` was rejected last frame.
    pub fn backpressure(&self, topic: TopicId) -> bool {
        self.backpressure.contains(&topic)
    }
}

/// Flight software hosted by the executive.
pub trait FlightNode: Send {
    /// Runs one frame slot. An error discards the staged output; a node that
    /// fails this way has also not sent its heartbeat.
    fn step(&mut self, ctx: &mut NodeContext<'_>) -> BusResult<()>;

    /// Called when FDIR restarts the node after isolation.
    fn restart(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> NodeDescriptor {
        NodeDescriptor {
            name: NodeName::from(name).unwrap(),
            role: NodeRole::Sensor,
            period_us: 10_000,
            budget_us: 1_000,
            priority: 1,
            criticality: Criticality::ControlCritical,
            replica_group: None,
        }
    }

    #[test]
    fn test_ids_are_stable_across_retirement() {
        let mut registry = NodeRegistry::new();
        let a = registry.register(descriptor("alt_a")).unwrap();
        let b = registry.register(descriptor("alt_b")).unwrap();
        registry.retire(a).unwrap();
        let c = registry.register(descriptor("alt_c")).unwrap();

        assert_eq!(b, NodeId(1));
        assert_eq!(c, NodeId(2));
        assert!(registry.get(a).is_err());
        assert_eq!(registry.lookup("alt_b"), Some(b));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = NodeRegistry::new();
        registry.register(descriptor("gnc")).unwrap();
        assert!(matches!(
            registry.register(descriptor("gnc")),
            Err(BusError::InvalidConfig(_))
        ));
    }
}
