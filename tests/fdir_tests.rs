use avbus::fault::{IsolationAction, RecoveryOutcome};
use avbus::fdir::*;
use avbus::protocol::*;

const NODE: NodeId = NodeId(3);
const PEER: NodeId = NodeId(4);

fn config(missed_heartbeat: u32, isolate_after_suspect_frames: u32) -> FdirConfig {
    FdirConfig {
        thresholds: FaultThresholds {
            missed_heartbeat,
            timing_violation: 1,
        },
        isolate_after_suspect_frames,
        max_restart_attempts: 3,
        backoff_base_frames: 10,
        max_backoff_frames: 40,
        probation_frames: 3,
    }
}

fn observe<'a>(
    frame: u64,
    expected: &'a [NodeId],
    heartbeats: &'a [NodeId],
    reports: &'a [HealthReport],
) -> FrameObservations<'a> {
    FrameObservations {
        frame,
        now: MissionTime::from_micros((frame + 1) * 10_000),
        expected,
        heartbeats,
        reports,
    }
}

#[test]
fn test_three_missed_heartbeats_isolate_with_single_record() {
    let mut fdir = FdirSupervisor::new(config(3, 1)).unwrap();
    fdir.monitor(NODE, None).unwrap();
    fdir.monitor(PEER, None).unwrap();

    for frame in 0..2 {
        let actions = fdir.evaluate(&observe(frame, &[NODE, PEER], &[PEER], &[])).unwrap();
        assert!(!actions.has_actions());
        assert_eq!(fdir.get_state(NODE), Some(HealthState::Nominal));
    }

    let actions = fdir.evaluate(&observe(2, &[NODE, PEER], &[PEER], &[])).unwrap();
    let actions: Vec<FdirAction> = actions.iter().copied().collect();
    assert_eq!(actions, vec![FdirAction::Quarantine(NODE), FdirAction::Deschedule(NODE)]);
    assert_eq!(fdir.get_state(NODE), Some(HealthState::Isolated));
    assert_eq!(fdir.get_state(PEER), Some(HealthState::Nominal));

    let records = fdir.fault_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].node, NODE);
    assert_eq!(records[0].fault, FaultClass::MissedHeartbeat);
    assert_eq!(records[0].frame, 2);
    assert_eq!(records[0].action, IsolationAction::Quarantine);
    assert_eq!(records[0].outcome, RecoveryOutcome::Pending);

    // Suspect and isolation both show up in the journal
    let path: Vec<HealthState> = fdir.journal().map(|t| t.to).collect();
    assert_eq!(path, vec![HealthState::Suspect, HealthState::Isolated]);
}

#[test]
fn test_heartbeat_resets_the_count() {
    let mut fdir = FdirSupervisor::new(config(3, 1)).unwrap();
    fdir.monitor(NODE, None).unwrap();

    fdir.evaluate(&observe(0, &[NODE], &[], &[])).unwrap();
    fdir.evaluate(&observe(1, &[NODE], &[], &[])).unwrap();
    fdir.evaluate(&observe(2, &[NODE], &[NODE], &[])).unwrap();
    fdir.evaluate(&observe(3, &[NODE], &[], &[])).unwrap();
    fdir.evaluate(&observe(4, &[NODE], &[], &[])).unwrap();

    assert_eq!(fdir.get_state(NODE), Some(HealthState::Nominal));
    assert!(fdir.fault_log().is_empty());
}

#[test]
fn test_unscheduled_node_owes_no_heartbeat() {
    let mut fdir = FdirSupervisor::new(config(1, 1)).unwrap();
    fdir.monitor(NODE, None).unwrap();

    for frame in 0..10 {
        fdir.evaluate(&observe(frame, &[], &[], &[])).unwrap();
    }
    assert_eq!(fdir.get_state(NODE), Some(HealthState::Nominal));
}

#[test]
fn test_overrun_charged_as_timing_violation_only() {
    let mut fdir = FdirSupervisor::new(config(1, 1)).unwrap();
    fdir.monitor(NODE, None).unwrap();

    let overrun = [HealthReport::fault(
        NODE,
        HealthStatus::Degraded,
        FaultClass::TimingViolation,
        MissionTime::from_micros(10_000),
    )];
    fdir.evaluate(&observe(0, &[NODE], &[], &overrun)).unwrap();

    let records = fdir.fault_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].fault, FaultClass::TimingViolation);
}

#[test]
fn test_byzantine_reports_are_logged() {
    let mut fdir = FdirSupervisor::new(config(3, 2)).unwrap();
    fdir.monitor(NODE, Some(TopicId(1))).unwrap();

    let byzantine = [HealthReport::fault(
        NODE,
        HealthStatus::Degraded,
        FaultClass::ByzantineDisagreement,
        MissionTime::from_micros(10_000),
    )];
    fdir.evaluate(&observe(0, &[NODE], &[NODE], &byzantine)).unwrap();

    assert_eq!(fdir.get_state(NODE), Some(HealthState::Suspect));
    let record = fdir.fault_log().last().unwrap();
    assert_eq!(record.fault, FaultClass::ByzantineDisagreement);
    assert_eq!(record.action, IsolationAction::None);
    assert_eq!(record.outcome, RecoveryOutcome::NotApplicable);
}

#[test]
fn test_replica_isolation_shrinks_quorum_once() {
    let mut fdir = FdirSupervisor::new(config(1, 1)).unwrap();
    fdir.monitor(NODE, Some(TopicId(1))).unwrap();

    let actions = fdir.evaluate(&observe(0, &[NODE], &[], &[])).unwrap();
    assert!(actions
        .iter()
        .any(|a| *a == FdirAction::ShrinkQuorum { topic: TopicId(1), node: NODE }));

    // Restart at frame 10, then fail again during probation
    let actions = fdir.evaluate(&observe(10, &[], &[], &[])).unwrap();
    assert!(actions.iter().any(|a| *a == FdirAction::Restart(NODE)));
    assert_eq!(fdir.get_state(NODE), Some(HealthState::Recovering));
    assert_eq!(fdir.restart_attempts(NODE), Some(1));

    let actions = fdir.evaluate(&observe(11, &[NODE], &[], &[])).unwrap();
    assert_eq!(fdir.get_state(NODE), Some(HealthState::Isolated));
    assert!(!actions.iter().any(|a| matches!(a, FdirAction::ShrinkQuorum { .. })));
    assert_eq!(fdir.fault_log().last().unwrap().action, IsolationAction::Quarantine);
}

#[test]
fn test_backoff_grows_between_attempts() {
    let mut fdir = FdirSupervisor::new(config(1, 1)).unwrap();
    fdir.monitor(NODE, None).unwrap();

    fdir.evaluate(&observe(0, &[NODE], &[], &[])).unwrap();
    fdir.evaluate(&observe(10, &[], &[], &[])).unwrap();
    fdir.evaluate(&observe(11, &[NODE], &[], &[])).unwrap();
    assert_eq!(fdir.get_state(NODE), Some(HealthState::Isolated));

    // Second attempt waits 20 frames
    fdir.evaluate(&observe(30, &[], &[], &[])).unwrap();
    assert_eq!(fdir.get_state(NODE), Some(HealthState::Isolated));
    fdir.evaluate(&observe(31, &[], &[], &[])).unwrap();
    assert_eq!(fdir.get_state(NODE), Some(HealthState::Recovering));
    assert_eq!(fdir.restart_attempts(NODE), Some(2));
}
