use avbus::bus::Criticality;
use avbus::protocol::NodeId;
use avbus::scheduler::*;
use avbus::BusError;

const FRAME_US: u64 = 10_000;

fn entry(node: u16, period_us: u64, budget_us: u64) -> ScheduleEntry {
    ScheduleEntry {
        node: NodeId(node),
        period_us,
        budget_us,
        priority: node as u8,
        criticality: Criticality::ControlCritical,
    }
}

#[test]
fn test_overloaded_schedule_never_runs() {
    let mut scheduler = CyclicScheduler::new(FRAME_US);
    scheduler.add_node(entry(1, 10_000, 6_000)).unwrap();
    scheduler.add_node(entry(2, 20_000, 9_000)).unwrap();

    assert_eq!(
        scheduler.arm(),
        Err(BusError::SchedulingInfeasible { utilization_ppm: 1_050_000 })
    );
    assert_eq!(scheduler.get_state(), SchedulerState::Idle);
    assert!(scheduler.start().is_err());
    assert!(scheduler.begin_frame().is_err());
    assert_eq!(scheduler.get_state(), SchedulerState::Idle);
}

#[test]
fn test_full_utilization_is_feasible() {
    let mut scheduler = CyclicScheduler::new(FRAME_US);
    scheduler.add_node(entry(1, 10_000, 5_000)).unwrap();
    scheduler.add_node(entry(2, 10_000, 5_000)).unwrap();
    scheduler.arm().unwrap();
    scheduler.start().unwrap();
    assert_eq!(scheduler.get_state(), SchedulerState::Running);
    assert_eq!(scheduler.get_stats().utilization_ppm, 1_000_000);
}

#[test]
fn test_thirds_summing_to_one_are_feasible() {
    let mut scheduler = CyclicScheduler::new(FRAME_US);
    for node in 1..=3 {
        scheduler.add_node(entry(node, 30_000, 10_000)).unwrap();
    }
    scheduler.arm().unwrap();
    scheduler.start().unwrap();
    assert_eq!(scheduler.get_state(), SchedulerState::Running);
    assert_eq!(scheduler.get_stats().utilization_ppm, 1_000_000);
}

#[test]
fn test_mixed_periods_just_over_one_rejected() {
    // 1/3 + 1/3 + 1/3 + 1/60000
    let mut scheduler = CyclicScheduler::new(FRAME_US);
    for node in 1..=3 {
        scheduler.add_node(entry(node, 30_000, 10_000)).unwrap();
    }
    scheduler.add_node(entry(4, 60_000, 1)).unwrap();
    assert_eq!(
        scheduler.arm(),
        Err(BusError::SchedulingInfeasible { utilization_ppm: 1_000_017 })
    );
    assert_eq!(scheduler.get_state(), SchedulerState::Idle);
}

#[test]
fn test_budget_longer_than_period_rejected() {
    let mut scheduler = CyclicScheduler::new(FRAME_US);
    assert!(matches!(
        scheduler.add_node(entry(1, 10_000, 1 << 63)),
        Err(BusError::InvalidConfig(_))
    ));
    assert!(matches!(
        scheduler.add_node(entry(2, 10_000, 10_001)),
        Err(BusError::InvalidConfig(_))
    ));
    scheduler.add_node(entry(3, 10_000, 10_000)).unwrap();
}

#[test]
fn test_exact_utilization_fraction() {
    let entries = [entry(1, 20_000, 5_000), entry(2, 30_000, 10_000)];
    let utilization = Utilization::of(entries.iter()).unwrap();
    // 1/4 + 1/3 = 7/12
    assert!(utilization.is_feasible());
    assert_eq!(utilization.ppm(), 583_334);

    let heavy = [entry(1, 10_000, 10_000), entry(2, 1_000_000, 1)];
    assert!(!Utilization::of(heavy.iter()).unwrap().is_feasible());
}

#[test]
fn test_multi_rate_release() {
    let mut scheduler = CyclicScheduler::new(FRAME_US);
    scheduler.add_node(entry(1, 10_000, 1_000)).unwrap();
    scheduler.add_node(entry(2, 20_000, 1_000)).unwrap();
    scheduler.add_node(entry(3, 40_000, 1_000)).unwrap();
    scheduler.arm().unwrap();
    scheduler.start().unwrap();

    let due: Vec<Vec<u16>> = (0..4)
        .map(|_| {
            let plan = scheduler.begin_frame().unwrap();
            plan.entries.iter().map(|e| e.node.0).collect()
        })
        .collect();
    assert_eq!(due, vec![vec![1, 2, 3], vec![1], vec![1, 2], vec![1]]);
}

#[test]
fn test_control_critical_precedes_telemetry() {
    let mut scheduler = CyclicScheduler::new(FRAME_US);
    let mut housekeeping = entry(1, 10_000, 1_000);
    housekeeping.criticality = Criticality::Telemetry;
    scheduler.add_node(housekeeping).unwrap();
    scheduler.add_node(entry(2, 20_000, 1_000)).unwrap();
    scheduler.arm().unwrap();
    scheduler.start().unwrap();

    let plan = scheduler.begin_frame().unwrap();
    let control: Vec<u16> = plan.control_critical().map(|e| e.node.0).collect();
    let telemetry: Vec<u16> = plan.telemetry().map(|e| e.node.0).collect();
    assert_eq!(control, vec![2]);
    assert_eq!(telemetry, vec![1]);
}

#[test]
fn test_readmission_restores_node() {
    let mut scheduler = CyclicScheduler::new(FRAME_US);
    scheduler.add_node(entry(1, 10_000, 1_000)).unwrap();
    scheduler.add_node(entry(2, 10_000, 1_000)).unwrap();
    scheduler.arm().unwrap();
    scheduler.start().unwrap();

    scheduler.request_removal(NodeId(2)).unwrap();
    let plan = scheduler.begin_frame().unwrap();
    assert!(plan.entries.iter().all(|e| e.node != NodeId(2)));
    assert_eq!(scheduler.get_state(), SchedulerState::Degraded);
    assert!(!scheduler.is_scheduled(NodeId(2)));

    scheduler.request_readmission(NodeId(2)).unwrap();
    let plan = scheduler.begin_frame().unwrap();
    assert!(plan.entries.iter().any(|e| e.node == NodeId(2)));
    assert!(scheduler.is_scheduled(NodeId(2)));
    assert_eq!(scheduler.get_stats().readmissions_applied, 1);
}
