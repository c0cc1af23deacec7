use crate::bus::TopicStats;
use crate::clock::TimeSource;
use crate::error::{BusError, BusResult};
use crate::estimator::FusedState;
use crate::executive::{ExecutiveStats, FlightExecutive};
use crate::fault::FaultRecord;
use crate::fdir::{HealthState, SupervisorStats};
use crate::protocol::{MissionTime, NodeId, TopicId};
use crate::scheduler::{SchedulerState, SchedulerStats};
use crate::voter::VoterStats;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicTelemetry {
    pub topic: TopicId,
    pub name: String,
    pub stats: TopicStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTelemetry {
    pub node: NodeId,
    pub name: String,
    pub health: Option<HealthState>,
    pub quarantined: bool,
    pub scheduled: bool,
    pub restart_attempts: u32,
}

/// Read-only view of the mission for downlink or display. Capturing a
/// snapshot never changes executive state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub time: MissionTime,
    pub clock_offset_us: f64,
    pub scheduler_state: SchedulerState,
    pub halt_reason: Option<String>,
    pub fused_state: Option<FusedState>,
    pub fault_log: Vec<FaultRecord>,
    /// Mission time per failure so far, in seconds.
    pub mtbf_s: Option<f64>,
    pub topics: Vec<TopicTelemetry>,
    pub nodes: Vec<NodeTelemetry>,
    pub scheduler: SchedulerStats,
    pub voter: VoterStats,
    pub supervisor: SupervisorStats,
    pub executive: ExecutiveStats,
}

impl TelemetrySnapshot {
    pub fn capture<T: TimeSource>(executive: &FlightExecutive<T>) -> BusResult<Self> {
        let bus = executive.bus();
        let mut topics = Vec::new();
        for topic in bus.topic_ids() {
            topics.push(TopicTelemetry {
                topic,
                name: bus.spec(topic)?.name.to_string(),
                stats: bus.stats(topic)?,
            });
        }

        let supervisor = executive.supervisor();
        let nodes = executive
            .nodes()
            .iter()
            .map(|(node, descriptor)| NodeTelemetry {
                node,
                name: descriptor.name.to_string(),
                health: supervisor.get_state(node),
                quarantined: bus.is_quarantined(node),
                scheduled: executive.scheduler().is_scheduled(node),
                restart_attempts: supervisor.restart_attempts(node).unwrap_or(0),
            })
            .collect();

        Ok(Self {
            time: executive.clock().now(),
            clock_offset_us: executive.clock().offset_us(),
            scheduler_state: executive.get_state(),
            halt_reason: executive.scheduler().halt_reason().map(ToString::to_string),
            fused_state: executive.latest_fused_state().cloned(),
            fault_log: supervisor.fault_records().to_vec(),
            mtbf_s: supervisor.fault_log().mean_time_between_failures(executive.clock().now()),
            topics,
            nodes,
            scheduler: executive.scheduler().get_stats().clone(),
            voter: executive.voter().get_stats().clone(),
            supervisor: supervisor.get_stats().clone(),
            executive: *executive.get_stats(),
        })
    }

    pub fn to_json(&self) -> BusResult<String> {
        serde_json::to_string(self).map_err(|e| BusError::config(alloc::format!("telemetry serialization: {}", e)))
    }

    pub fn topic(&self, name: &str) -> Option<&TopicTelemetry> {
        self.topics.iter().find(|topic| topic.name == name)
    }

    pub fn node(&self, name: &str) -> Option<&NodeTelemetry> {
        self.nodes.iter().find(|node| node.name == name)
    }
}
