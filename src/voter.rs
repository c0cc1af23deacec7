//! Triple-modular-redundancy voter for replica-group topics.
//!
//! Candidates come from [`MessageBus::drain_candidates`](crate::bus::MessageBus::drain_candidates);
//! the voter never touches the bus itself. It returns what should be
//! published and leaves the write to the executive.

use crate::bus::{Members, MAX_REPLICAS};
use crate::error::{BusError, BusResult};
use crate::protocol::{decode_components, encode_components, Confidence, Message, MissionTime, NodeId, Payload, TopicId};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

pub const MAX_REPLICA_GROUPS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum VoteKind {
    /// Bit-exact majority over the payload.
    Discrete,
    /// Component-wise median; candidates agree when every component is within `epsilon`.
    Continuous { epsilon: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaGroupConfig {
    pub topic: TopicId,
    pub members: Members,
    pub min_quorum: usize,
    pub vote: VoteKind,
    /// Candidates stamped later than frame start plus this are non-votes.
    pub deadline_us: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Agreed { votes: usize, outliers: Members },
    /// Live quorum intact but too few candidates arrived this cycle.
    Insufficient { votes: usize },
    /// No two candidates agree; the listed members contributed.
    Byzantine { contributors: Members },
    QuorumLost { live: usize, min: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoteResult {
    pub topic: TopicId,
    pub decision: Decision,
    /// Value to publish as authoritative, if any.
    pub emit: Option<(Payload, Confidence)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumStatus {
    Healthy { live: usize },
    Lost { live: usize, min: usize },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoterStats {
    pub agreed: u64,
    pub insufficient: u64,
    pub byzantine: u64,
    pub quorum_lost: u64,
    pub late_candidates: u64,
    pub ignored_candidates: u64,
    pub outliers: u64,
}

#[derive(Debug)]
struct GroupState {
    config: ReplicaGroupConfig,
    live: Members,
    last_known_good: Option<Payload>,
}

impl GroupState {
    fn quorum(&self) -> QuorumStatus {
        let live = self.live.len();
        if live < self.config.min_quorum || live == 0 {
            QuorumStatus::Lost {
                live,
                min: self.config.min_quorum,
            }
        } else {
            QuorumStatus::Healthy { live }
        }
    }

    fn fall_back(&self) -> Option<(Payload, Confidence)> {
        self.last_known_good
            .as_ref()
            .map(|payload| (payload.clone(), Confidence::Degraded))
    }
}

#[derive(Debug, Default)]
pub struct TmrVoter {
    groups: Vec<GroupState, MAX_REPLICA_GROUPS>,
    stats: VoterStats,
}

impl TmrVoter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&mut self, config: ReplicaGroupConfig) -> BusResult<()> {
        if self.group(config.topic).is_ok() {
            return Err(BusError::config(alloc::format!(
                "replica group for {} configured twice",
                config.topic
            )));
        }
        let members = config.members.len();
        if members == 0 || members % 2 == 0 {
            return Err(BusError::config(alloc::format!(
                "replica group for {} needs an odd member count, got {}",
                config.topic,
                members
            )));
        }
        if config.min_quorum == 0 || config.min_quorum > members {
            return Err(BusError::config(alloc::format!(
                "replica group for {} has min quorum {} outside 1..={}",
                config.topic,
                config.min_quorum,
                members
            )));
        }
        if let VoteKind::Continuous { epsilon } = config.vote {
            if !epsilon.is_finite() || epsilon < 0.0 {
                return Err(BusError::config(alloc::format!(
                    "replica group for {} has invalid epsilon",
                    config.topic
                )));
            }
        }

        let state = GroupState {
            live: config.members.clone(),
            config,
            last_known_good: None,
        };
        self.groups
            .push(state)
            .map_err(|_| BusError::RegistryFull("replica groups"))
    }

    /// Resolves one cycle of candidates for `topic`.
    pub fn vote(&mut self, topic: TopicId, candidates: &[Message], frame_start: MissionTime) -> BusResult<VoteResult> {
        let index = self.group_index(topic)?;
        let group = &self.groups[index];

        if let QuorumStatus::Lost { live, min } = group.quorum() {
            self.stats.quorum_lost += 1;
            error!(topic = %topic, live, min, "replica quorum lost");
            return Ok(VoteResult {
                topic,
                decision: Decision::QuorumLost { live, min },
                emit: None,
            });
        }

        let deadline = frame_start.saturating_add_micros(group.config.deadline_us);
        let mut accepted: Vec<&Message, MAX_REPLICAS> = Vec::new();
        for candidate in candidates {
            if candidate.topic() != topic || !group.live.contains(&candidate.producer()) {
                self.stats.ignored_candidates += 1;
                continue;
            }
            if candidate.timestamp() < frame_start || candidate.timestamp() > deadline {
                self.stats.late_candidates += 1;
                continue;
            }
            if accepted.iter().any(|seen| seen.producer() == candidate.producer()) {
                self.stats.ignored_candidates += 1;
                continue;
            }
            let _ = accepted.push(candidate);
        }

        let votes = accepted.len();
        if votes < group.config.min_quorum {
            self.stats.insufficient += 1;
            debug!(topic = %topic, votes, "too few candidates this cycle");
            return Ok(VoteResult {
                topic,
                decision: Decision::Insufficient { votes },
                emit: group.fall_back(),
            });
        }

        let resolved = match group.config.vote {
            VoteKind::Discrete => discrete_majority(&accepted, group.live.len()),
            VoteKind::Continuous { epsilon } => continuous_median(&accepted, epsilon)?,
        };

        let group = &mut self.groups[index];
        match resolved {
            Some((payload, outliers)) => {
                self.stats.agreed += 1;
                self.stats.outliers += outliers.len() as u64;
                group.last_known_good = Some(payload.clone());
                Ok(VoteResult {
                    topic,
                    decision: Decision::Agreed { votes, outliers },
                    emit: Some((payload, Confidence::Nominal)),
                })
            }
            None => {
                self.stats.byzantine += 1;
                let mut contributors = Members::new();
                for candidate in &accepted {
                    let _ = contributors.push(candidate.producer());
                }
                warn!(topic = %topic, votes, "byzantine disagreement, republishing last known good");
                Ok(VoteResult {
                    topic,
                    decision: Decision::Byzantine { contributors },
                    emit: group.fall_back(),
                })
            }
        }
    }

    /// Removes `node` from the live set. Membership never grows back.
    pub fn shrink(&mut self, topic: TopicId, node: NodeId) -> BusResult<QuorumStatus> {
        let index = self.group_index(topic)?;
        let group = &mut self.groups[index];
        if !group.config.members.contains(&node) {
            return Err(BusError::NotAMember { topic, producer: node });
        }
        group.live.retain(|member| *member != node);
        let status = group.quorum();
        warn!(topic = %topic, node = %node, live = group.live.len(), "replica group shrunk");
        Ok(status)
    }

    pub fn quorum(&self, topic: TopicId) -> BusResult<QuorumStatus> {
        self.group(topic).map(GroupState::quorum)
    }

    pub fn live_members(&self, topic: TopicId) -> BusResult<&[NodeId]> {
        self.group(topic).map(|group| group.live.as_slice())
    }

    /// Replica group a node belongs to, if any.
    pub fn group_of(&self, node: NodeId) -> Option<TopicId> {
        self.groups
            .iter()
            .find(|group| group.config.members.contains(&node))
            .map(|group| group.config.topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = TopicId> + '_ {
        self.groups.iter().map(|group| group.config.topic)
    }

    pub fn last_known_good(&self, topic: TopicId) -> BusResult<Option<&[u8]>> {
        self.group(topic)
            .map(|group| group.last_known_good.as_deref())
    }

    pub fn get_stats(&self) -> &VoterStats {
        &self.stats
    }

    fn group(&self, topic: TopicId) -> BusResult<&GroupState> {
        self.groups
            .iter()
            .find(|group| group.config.topic == topic)
            .ok_or(BusError::UnknownTopic(topic))
    }

    fn group_index(&self, topic: TopicId) -> BusResult<usize> {
        self.groups
            .iter()
            .position(|group| group.config.topic == topic)
            .ok_or(BusError::UnknownTopic(topic))
    }
}

/// Strict majority of the live quorum, compared bit for bit.
fn discrete_majority(accepted: &[&Message], live: usize) -> Option<(Payload, Members)> {
    for candidate in accepted {
        let agreeing = accepted
            .iter()
            .filter(|other| other.payload() == candidate.payload())
            .count();
        if agreeing * 2 > live {
            let mut outliers = Members::new();
            for other in accepted.iter().filter(|other| other.payload() != candidate.payload()) {
                let _ = outliers.push(other.producer());
            }
            let payload = Payload::from_slice(candidate.payload()).ok()?;
            return Some((payload, outliers));
        }
    }
    None
}

/// Component-wise median, provided at least one pair of candidates agrees
/// within `epsilon` on every component. A lone candidate is accepted as is.
/// Undecodable candidates, or ones whose dimension differs from the first,
/// cannot agree with anything and are left out.
fn continuous_median(accepted: &[&Message], epsilon: f64) -> BusResult<Option<(Payload, Members)>> {
    let mut values: Vec<(NodeId, crate::protocol::Components), MAX_REPLICAS> = Vec::new();
    for candidate in accepted {
        let Ok(components) = decode_components(candidate.payload()) else {
            continue;
        };
        if values.first().is_some_and(|(_, first)| first.len() != components.len()) {
            continue;
        }
        let _ = values.push((candidate.producer(), components));
    }
    if values.is_empty() {
        return Ok(None);
    }

    let agrees = |a: &[f64], b: &[f64]| a.iter().zip(b).all(|(x, y)| (x - y).abs() <= epsilon);

    let any_pair = (values.len() == 1 && accepted.len() == 1)
        || values.iter().enumerate().any(|(i, (_, a))| {
            values[i + 1..].iter().any(|(_, b)| agrees(a, b))
        });
    if !any_pair {
        return Ok(None);
    }

    let dimension = values.first().map_or(0, |(_, v)| v.len());
    let mut median: alloc::vec::Vec<f64> = alloc::vec::Vec::with_capacity(dimension);
    let mut column: Vec<f64, MAX_REPLICAS> = Vec::new();
    for component in 0..dimension {
        column.clear();
        for (_, v) in &values {
            let _ = column.push(v[component]);
        }
        column.sort_unstable_by(f64::total_cmp);
        let n = column.len();
        let mid = if n % 2 == 1 {
            column[n / 2]
        } else {
            (column[n / 2 - 1] + column[n / 2]) / 2.0
        };
        median.push(mid);
    }

    let mut outliers = Members::new();
    for (producer, v) in &values {
        if !agrees(v, &median) {
            let _ = outliers.push(*producer);
        }
    }

    Ok(Some((encode_components(&median)?, outliers)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SchemaId;

    const TOPIC: TopicId = TopicId(5);

    fn members(ids: &[u16]) -> Members {
        ids.iter().map(|id| NodeId(*id)).collect()
    }

    fn voter(vote: VoteKind, min_quorum: usize) -> TmrVoter {
        let mut voter = TmrVoter::new();
        voter
            .add_group(ReplicaGroupConfig {
                topic: TOPIC,
                members: members(&[1, 2, 3]),
                min_quorum,
                vote,
                deadline_us: 5_000,
            })
            .unwrap();
        voter
    }

    fn candidate(producer: u16, value: f64, at: u64) -> Message {
        Message::new(
            TOPIC,
            NodeId(producer),
            1,
            MissionTime::from_micros(at),
            SchemaId(1),
            encode_components(&[value]).unwrap(),
        )
    }

    fn value_of(result: &VoteResult) -> f64 {
        let (payload, _) = result.emit.as_ref().unwrap();
        decode_components(payload).unwrap()[0]
    }

    #[test]
    fn test_even_candidate_median_is_mean_of_middle() {
        let mut voter = voter(VoteKind::Continuous { epsilon: 1.0 }, 2);
        let candidates = [candidate(1, 10.0, 0), candidate(2, 10.5, 0)];
        let result = voter.vote(TOPIC, &candidates, MissionTime::EPOCH).unwrap();
        assert!((value_of(&result) - 10.25).abs() < 1e-12);
    }

    #[test]
    fn test_late_and_duplicate_candidates_ignored() {
        let mut voter = voter(VoteKind::Continuous { epsilon: 1.0 }, 2);
        let candidates = [
            candidate(1, 10.0, 0),
            candidate(1, 99.0, 0),
            candidate(2, 10.0, 9_000),
            candidate(9, 10.0, 0),
        ];
        let result = voter.vote(TOPIC, &candidates, MissionTime::EPOCH).unwrap();
        assert_eq!(result.decision, Decision::Insufficient { votes: 1 });
        assert!(result.emit.is_none());
        assert_eq!(voter.get_stats().late_candidates, 1);
        assert_eq!(voter.get_stats().ignored_candidates, 2);
    }

    #[test]
    fn test_discrete_majority() {
        let mut voter = voter(VoteKind::Discrete, 2);
        let msg = |producer: u16, byte: u8| {
            Message::new(
                TOPIC,
                NodeId(producer),
                1,
                MissionTime::EPOCH,
                SchemaId(1),
                Payload::from_slice(&[byte]).unwrap(),
            )
        };
        let result = voter
            .vote(TOPIC, &[msg(1, 7), msg(2, 7), msg(3, 8)], MissionTime::EPOCH)
            .unwrap();
        assert_eq!(result.emit.as_ref().unwrap().0.as_slice(), &[7]);
        assert_eq!(
            result.decision,
            Decision::Agreed {
                votes: 3,
                outliers: members(&[3])
            }
        );

        let result = voter
            .vote(TOPIC, &[msg(1, 1), msg(2, 2), msg(3, 3)], MissionTime::EPOCH)
            .unwrap();
        assert!(matches!(result.decision, Decision::Byzantine { .. }));
        assert_eq!(result.emit.unwrap(), (Payload::from_slice(&[7]).unwrap(), Confidence::Degraded));
    }

    #[test]
    fn test_shrink_below_minimum_loses_quorum() {
        let mut voter = voter(VoteKind::Continuous { epsilon: 1.0 }, 2);
        assert_eq!(voter.shrink(TOPIC, NodeId(1)).unwrap(), QuorumStatus::Healthy { live: 2 });
        assert_eq!(
            voter.shrink(TOPIC, NodeId(2)).unwrap(),
            QuorumStatus::Lost { live: 1, min: 2 }
        );
        let result = voter.vote(TOPIC, &[candidate(3, 1.0, 0)], MissionTime::EPOCH).unwrap();
        assert_eq!(result.decision, Decision::QuorumLost { live: 1, min: 2 });
        assert!(result.emit.is_none());
        assert!(voter.shrink(TOPIC, NodeId(42)).is_err());
    }

    #[test]
    fn test_even_group_rejected() {
        let mut voter = TmrVoter::new();
        let result = voter.add_group(ReplicaGroupConfig {
            topic: TOPIC,
            members: members(&[1, 2]),
            min_quorum: 1,
            vote: VoteKind::Discrete,
            deadline_us: 1,
        });
        assert!(matches!(result, Err(BusError::InvalidConfig(_))));
    }
}
