//! Static mission configuration, loaded from JSON.
//!
//! Every operational threshold (FDIR thresholds, voting epsilons, quorum
//! minimums, budgets) must be present in the profile. Nothing here falls back
//! to a built-in value.

use crate::bus::{Criticality, QosClass};
use crate::error::{BusError, BusResult};
use crate::estimator::MAX_STATE_DIM;
use crate::fdir::FdirConfig;
use crate::node::NodeRole;
use crate::voter::VoteKind;
use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MissionConfig {
    pub frame_period_us: u64,
    pub clock: ClockConfig,
    pub topics: Vec<TopicConfig>,
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub replica_groups: Vec<ReplicaGroupEntry>,
    pub fdir: FdirConfig,
    #[serde(default)]
    pub estimator: Option<EstimatorConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClockConfig {
    pub correction_interval_frames: u64,
    /// Indices of the fused-state components that make up the velocity.
    pub velocity_components: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopicConfig {
    pub name: String,
    pub schema: u16,
    pub qos: QosClass,
    pub criticality: Criticality,
    /// Single producer. Absent for replica-group topics.
    #[serde(default)]
    pub producer: Option<String>,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub name: String,
    pub role: NodeRole,
    pub period_us: u64,
    pub budget_us: u64,
    pub priority: u8,
    pub criticality: Criticality,
    #[serde(default)]
    pub subscribes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicaGroupEntry {
    pub topic: String,
    pub members: Vec<String>,
    pub min_quorum: usize,
    pub vote: VoteKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EstimatorConfig {
    /// Node that hosts the filter.
    pub node: String,
    /// Topic the fused state is published on.
    pub output: String,
    pub axes: usize,
    pub process_noise: f64,
    pub initial_state: Vec<f64>,
    /// Diagonal of the initial covariance.
    pub initial_variance: Vec<f64>,
    pub psd_tolerance: f64,
    pub measurements: Vec<MeasurementConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasurementConfig {
    pub topic: String,
    /// Observation matrix rows.
    pub h: Vec<Vec<f64>>,
    /// Measurement noise covariance rows.
    pub r: Vec<Vec<f64>>,
}

impl MissionConfig {
    pub fn from_json(json: &str) -> BusResult<Self> {
        let config: MissionConfig =
            serde_json::from_str(json).map_err(|e| BusError::config(alloc::format!("profile parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> BusResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| BusError::config(alloc::format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> BusResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| BusError::config(alloc::format!("{}", e)))
    }

    pub fn topic(&self, name: &str) -> Option<&TopicConfig> {
        self.topics.iter().find(|topic| topic.name == name)
    }

    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|node| node.name == name)
    }

    pub fn replica_group(&self, topic: &str) -> Option<&ReplicaGroupEntry> {
        self.replica_groups.iter().find(|group| group.topic == topic)
    }

    /// Replica group a node is a member of, by topic name.
    pub fn group_of(&self, node: &str) -> Option<&str> {
        self.replica_groups
            .iter()
            .find(|group| group.members.iter().any(|member| member == node))
            .map(|group| group.topic.as_str())
    }

    /// Cross-reference checks. Schedulability is left to the scheduler.
    pub fn validate(&self) -> BusResult<()> {
        if self.frame_period_us == 0 {
            return Err(BusError::config("frame_period_us must be positive"));
        }
        if self.clock.correction_interval_frames == 0 {
            return Err(BusError::config("clock.correction_interval_frames must be positive"));
        }
        self.fdir.validate()?;

        for (index, node) in self.nodes.iter().enumerate() {
            if self.nodes[..index].iter().any(|other| other.name == node.name) {
                return Err(BusError::config(alloc::format!("node '{}' declared twice", node.name)));
            }
            if node.budget_us > node.period_us {
                return Err(BusError::config(alloc::format!(
                    "node '{}' budget {} us exceeds its {} us period",
                    node.name,
                    node.budget_us,
                    node.period_us
                )));
            }
            for topic in &node.subscribes {
                if self.topic(topic).is_none() {
                    return Err(BusError::config(alloc::format!(
                        "node '{}' subscribes to unknown topic '{}'",
                        node.name,
                        topic
                    )));
                }
            }
        }

        for topic in &self.topics {
            if let QosClass::Periodic { deadline_us, .. } = topic.qos {
                if deadline_us > self.frame_period_us {
                    return Err(BusError::config(alloc::format!(
                        "topic '{}' deadline {} us exceeds the {} us frame",
                        topic.name,
                        deadline_us,
                        self.frame_period_us
                    )));
                }
            }
            let replicated = self.replica_group(&topic.name).is_some();
            match (&topic.producer, replicated) {
                (Some(producer), false) => {
                    if self.node(producer).is_none() {
                        return Err(BusError::config(alloc::format!(
                            "topic '{}' produced by unknown node '{}'",
                            topic.name,
                            producer
                        )));
                    }
                }
                (None, true) => {}
                (Some(_), true) => {
                    return Err(BusError::config(alloc::format!(
                        "replica-group topic '{}' must not name a single producer",
                        topic.name
                    )))
                }
                (None, false) => {
                    return Err(BusError::config(alloc::format!(
                        "topic '{}' has neither a producer nor a replica group",
                        topic.name
                    )))
                }
            }
        }

        for group in &self.replica_groups {
            if self.topic(&group.topic).is_none() {
                return Err(BusError::config(alloc::format!(
                    "replica group for unknown topic '{}'",
                    group.topic
                )));
            }
            for member in &group.members {
                if self.node(member).is_none() {
                    return Err(BusError::config(alloc::format!(
                        "replica group '{}' lists unknown node '{}'",
                        group.topic,
                        member
                    )));
                }
                if self.replica_groups.iter().filter(|g| g.members.contains(member)).count() > 1 {
                    return Err(BusError::config(alloc::format!(
                        "node '{}' belongs to more than one replica group",
                        member
                    )));
                }
            }
        }

        if let Some(estimator) = &self.estimator {
            self.validate_estimator(estimator)?;
        }
        Ok(())
    }

    fn validate_estimator(&self, estimator: &EstimatorConfig) -> BusResult<()> {
        let n = 2 * estimator.axes;
        if n == 0 || n > MAX_STATE_DIM {
            return Err(BusError::config(alloc::format!(
                "estimator state dimension {} outside 1..={}",
                n,
                MAX_STATE_DIM
            )));
        }
        if self.node(&estimator.node).is_none() {
            return Err(BusError::config(alloc::format!("estimator node '{}' is not declared", estimator.node)));
        }
        match self.topic(&estimator.output) {
            Some(topic) if topic.producer.as_deref() == Some(estimator.node.as_str()) => {}
            _ => {
                return Err(BusError::config(alloc::format!(
                    "estimator output '{}' must be a topic produced by '{}'",
                    estimator.output,
                    estimator.node
                )))
            }
        }
        if estimator.initial_state.len() != n || estimator.initial_variance.len() != n {
            return Err(BusError::config("estimator initial state does not match 2 * axes"));
        }
        if estimator.initial_variance.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(BusError::config("estimator initial variance must be finite and non-negative"));
        }
        for index in &self.clock.velocity_components {
            if *index >= n {
                return Err(BusError::config("clock velocity component outside the estimator state"));
            }
        }
        for measurement in &estimator.measurements {
            if self.topic(&measurement.topic).is_none() {
                return Err(BusError::config(alloc::format!(
                    "estimator measures unknown topic '{}'",
                    measurement.topic
                )));
            }
            let m = measurement.h.len();
            if m == 0
                || measurement.h.iter().any(|row| row.len() != n)
                || measurement.r.len() != m
                || measurement.r.iter().any(|row| row.len() != m)
            {
                return Err(BusError::config(alloc::format!(
                    "measurement model for '{}' has inconsistent dimensions",
                    measurement.topic
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"{
        "frame_period_us": 10000,
        "clock": { "correction_interval_frames": 10, "velocity_components": [] },
        "topics": [
            { "name": "altitude", "schema": 1,
              "qos": { "Periodic": { "period_us": 10000, "deadline_us": 5000 } },
              "criticality": "ControlCritical", "queue_depth": 8 }
        ],
        "nodes": [
            { "name": "alt_a", "role": "Sensor", "period_us": 10000, "budget_us": 500, "priority": 1, "criticality": "ControlCritical" },
            { "name": "alt_b", "role": "Sensor", "period_us": 10000, "budget_us": 500, "priority": 1, "criticality": "ControlCritical" },
            { "name": "alt_c", "role": "Sensor", "period_us": 10000, "budget_us": 500, "priority": 1, "criticality": "ControlCritical" }
        ],
        "replica_groups": [
            { "topic": "altitude", "members": ["alt_a", "alt_b", "alt_c"], "min_quorum": 2,
              "vote": { "Continuous": { "epsilon": 1.0 } } }
        ],
        "fdir": {
            "thresholds": { "missed_heartbeat": 3, "timing_violation": 1 },
            "isolate_after_suspect_frames": 1,
            "max_restart_attempts": 3,
            "backoff_base_frames": 10,
            "max_backoff_frames": 100,
            "probation_frames": 5
        }
    }"#;

    #[test]
    fn test_profile_parses() {
        let config = MissionConfig::from_json(PROFILE).unwrap();
        assert_eq!(config.group_of("alt_b"), Some("altitude"));
        assert_eq!(config.fdir.thresholds.missed_heartbeat, 3);
    }

    #[test]
    fn test_missing_threshold_rejected() {
        let without_fdir = PROFILE.replace("\"missed_heartbeat\": 3, ", "");
        assert!(matches!(
            MissionConfig::from_json(&without_fdir),
            Err(BusError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_budget_longer_than_period_rejected() {
        let greedy = PROFILE.replacen("\"budget_us\": 500", "\"budget_us\": 10001", 1);
        assert!(matches!(
            MissionConfig::from_json(&greedy),
            Err(BusError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_deadline_longer_than_frame_rejected() {
        let late = PROFILE.replace("\"deadline_us\": 5000", "\"deadline_us\": 20000");
        assert!(MissionConfig::from_json(&late).is_err());
    }
}
