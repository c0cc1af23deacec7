use crate::bus::Criticality;
use crate::error::{BusError, BusResult};
use crate::node::MAX_NODES;
use crate::protocol::NodeId;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

const PPM: u128 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    Idle,
    Armed,
    Running,
    Degraded,
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub node: NodeId,
    pub period_us: u64,
    pub budget_us: u64,
    pub priority: u8,
    pub criticality: Criticality,
}

impl ScheduleEntry {
    /// Rate-monotonic key: control-critical band first, then shorter period,
    /// then configured priority, then id.
    fn order_key(&self) -> (Criticality, u64, u8, NodeId) {
        (self.criticality, self.period_us, self.priority, self.node)
    }
}

/// Total utilization `Σ budget/period` held as an exact fraction over the
/// hyperperiod, so a table that sums to exactly one is feasible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utilization {
    numerator: u128,
    denominator: u128,
}

impl Utilization {
    pub fn of<'e, I>(entries: I) -> BusResult<Self>
    where
        I: Iterator<Item = &'e ScheduleEntry> + Clone,
    {
        let mut denominator = 1u128;
        for entry in entries.clone() {
            if entry.period_us == 0 {
                return Err(BusError::config(alloc::format!("node {} has zero period", entry.node)));
            }
            denominator = lcm(denominator, u128::from(entry.period_us))
                .ok_or_else(|| BusError::config("schedule periods have no representable hyperperiod"))?;
        }
        let numerator = entries.fold(0u128, |total, entry| {
            let releases = denominator / u128::from(entry.period_us);
            total.saturating_add(u128::from(entry.budget_us).saturating_mul(releases))
        });
        Ok(Self {
            numerator,
            denominator,
        })
    }

    pub fn is_feasible(&self) -> bool {
        self.numerator <= self.denominator
    }

    /// Parts per million, rounded up, for reporting.
    pub fn ppm(&self) -> u64 {
        let whole = self.numerator / self.denominator;
        let rest = self.numerator % self.denominator;
        let rest_ppm = match rest.checked_mul(PPM) {
            Some(scaled) => scaled.div_ceil(self.denominator),
            None => rest / (self.denominator / PPM) + 1,
        };
        let total = whole.saturating_mul(PPM).saturating_add(rest_ppm);
        u64::try_from(total).unwrap_or(u64::MAX)
    }
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn lcm(a: u128, b: u128) -> Option<u128> {
    (a / gcd(a, b)).checked_mul(b)
}

/// Nodes due in one frame, in execution order.
#[derive(Debug, Clone)]
pub struct FramePlan {
    pub frame: u64,
    pub entries: Vec<ScheduleEntry, MAX_NODES>,
}

impl FramePlan {
    pub fn control_critical(&self) -> impl Iterator<Item = &ScheduleEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.criticality == Criticality::ControlCritical)
    }

    pub fn telemetry(&self) -> impl Iterator<Item = &ScheduleEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.criticality == Criticality::Telemetry)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulerStats {
    pub frames_started: u64,
    pub removals_applied: u32,
    pub readmissions_applied: u32,
    pub utilization_ppm: u64,
    pub active_nodes: u8,
}

/// Cyclic executive schedule. Membership changes are queued and applied only
/// in [`CyclicScheduler::begin_frame`].
#[derive(Debug)]
pub struct CyclicScheduler {
    state: SchedulerState,
    frame_period_us: u64,
    entries: Vec<ScheduleEntry, MAX_NODES>,
    removed: Vec<NodeId, MAX_NODES>,
    pending_removals: Vec<NodeId, MAX_NODES>,
    pending_retirements: Vec<NodeId, MAX_NODES>,
    pending_readmissions: Vec<NodeId, MAX_NODES>,
    next_frame: u64,
    halt_reason: Option<&'static str>,
    stats: SchedulerStats,
}

impl CyclicScheduler {
    pub fn new(frame_period_us: u64) -> Self {
        Self {
            state: SchedulerState::Idle,
            frame_period_us,
            entries: Vec::new(),
            removed: Vec::new(),
            pending_removals: Vec::new(),
            pending_retirements: Vec::new(),
            pending_readmissions: Vec::new(),
            next_frame: 0,
            halt_reason: None,
            stats: SchedulerStats::default(),
        }
    }

    /// Adds a node to the static table. Only allowed before arming.
    pub fn add_node(&mut self, entry: ScheduleEntry) -> BusResult<()> {
        if self.state != SchedulerState::Idle {
            return Err(BusError::InvalidState("schedule table is frozen once armed"));
        }
        if self.entries.iter().any(|existing| existing.node == entry.node) {
            return Err(BusError::config(alloc::format!("node {} scheduled twice", entry.node)));
        }
        if entry.budget_us > entry.period_us {
            return Err(BusError::config(alloc::format!(
                "node {} budget {} us exceeds its {} us period",
                entry.node,
                entry.budget_us,
                entry.period_us
            )));
        }
        self.entries
            .push(entry)
            .map_err(|_| BusError::RegistryFull("schedule table"))
    }

    /// Static schedulability check. On failure the scheduler stays `Idle`.
    pub fn arm(&mut self) -> BusResult<()> {
        if self.state != SchedulerState::Idle {
            return Err(BusError::InvalidState("arm requires an idle scheduler"));
        }
        if self.frame_period_us == 0 {
            return Err(BusError::config("frame period must be positive"));
        }
        for entry in &self.entries {
            if entry.budget_us == 0 {
                return Err(BusError::config(alloc::format!("node {} has zero budget", entry.node)));
            }
            if entry.period_us == 0 || entry.period_us % self.frame_period_us != 0 {
                return Err(BusError::config(alloc::format!(
                    "node {} period {} us is not a multiple of the {} us frame",
                    entry.node,
                    entry.period_us,
                    self.frame_period_us
                )));
            }
        }

        let utilization = Utilization::of(self.entries.iter())?;
        let utilization_ppm = utilization.ppm();
        if !utilization.is_feasible() {
            error!(utilization_ppm, "static schedule infeasible");
            return Err(BusError::SchedulingInfeasible { utilization_ppm });
        }

        self.stats.utilization_ppm = utilization_ppm;
        self.stats.active_nodes = self.entries.len() as u8;
        self.state = SchedulerState::Armed;
        info!(utilization_ppm, nodes = self.entries.len(), "schedule armed");
        Ok(())
    }

    pub fn start(&mut self) -> BusResult<()> {
        match self.state {
            SchedulerState::Armed => {
                self.state = SchedulerState::Running;
                info!("cyclic executive running");
                Ok(())
            }
            SchedulerState::Halted => Err(BusError::Halted),
            _ => Err(BusError::InvalidState("start requires an armed schedule")),
        }
    }

    /// Queues removal of `node` for the next frame boundary.
    pub fn request_removal(&mut self, node: NodeId) -> BusResult<()> {
        self.ensure_active()?;
        if !self.pending_removals.contains(&node) {
            self.pending_removals
                .push(node)
                .map_err(|_| BusError::RegistryFull("pending removals"))?;
        }
        Ok(())
    }

    /// Drops `node` from the table for good. Before the schedule runs it is
    /// removed at once; afterwards it leaves at the next frame boundary and
    /// can never be readmitted.
    pub fn retire(&mut self, node: NodeId) -> BusResult<()> {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.node == node)
            .ok_or(BusError::UnknownNode(node))?;
        match self.state {
            SchedulerState::Idle | SchedulerState::Armed => {
                self.entries.swap_remove(position);
                Ok(())
            }
            SchedulerState::Running | SchedulerState::Degraded => {
                if !self.pending_retirements.contains(&node) {
                    self.pending_retirements
                        .push(node)
                        .map_err(|_| BusError::RegistryFull("pending retirements"))?;
                }
                Ok(())
            }
            SchedulerState::Halted => Err(BusError::Halted),
        }
    }

    /// Queues readmission of a removed node for the next frame boundary.
    pub fn request_readmission(&mut self, node: NodeId) -> BusResult<()> {
        self.ensure_active()?;
        if !self.entries.iter().any(|entry| entry.node == node) {
            return Err(BusError::UnknownNode(node));
        }
        if !self.pending_readmissions.contains(&node) {
            self.pending_readmissions
                .push(node)
                .map_err(|_| BusError::RegistryFull("pending readmissions"))?;
        }
        Ok(())
    }

    /// Applies pending membership changes and returns the plan for this frame.
    ///
    /// A readmission that would push utilization above one halts the
    /// scheduler and returns `SchedulingInfeasible`.
    pub fn begin_frame(&mut self) -> BusResult<FramePlan> {
        self.ensure_active()?;

        while let Some(node) = self.pending_removals.pop() {
            if !self.removed.contains(&node) && self.removed.push(node).is_ok() {
                self.stats.removals_applied += 1;
                if self.state == SchedulerState::Running {
                    self.state = SchedulerState::Degraded;
                    warn!(node = %node, "node descheduled, schedule degraded");
                }
            }
        }

        while let Some(node) = self.pending_retirements.pop() {
            let Some(position) = self.entries.iter().position(|entry| entry.node == node) else {
                continue;
            };
            self.entries.swap_remove(position);
            if let Some(index) = self.removed.iter().position(|removed| *removed == node) {
                self.removed.swap_remove(index);
            } else {
                self.stats.removals_applied += 1;
            }
            if self.state == SchedulerState::Running {
                self.state = SchedulerState::Degraded;
            }
            info!(node = %node, "node retired from schedule");
        }

        while let Some(node) = self.pending_readmissions.pop() {
            let Some(position) = self.removed.iter().position(|removed| *removed == node) else {
                continue;
            };
            self.removed.swap_remove(position);
            let utilization = Utilization::of(self.active_entries())?;
            if !utilization.is_feasible() {
                let _ = self.removed.push(node);
                self.pending_readmissions.clear();
                self.halt("readmission broke schedulability");
                return Err(BusError::SchedulingInfeasible {
                    utilization_ppm: utilization.ppm(),
                });
            }
            self.stats.readmissions_applied += 1;
            info!(node = %node, "node readmitted to schedule");
        }

        let frame = self.next_frame;
        self.next_frame += 1;

        let mut entries: Vec<ScheduleEntry, MAX_NODES> = Vec::new();
        let frame_start_us = frame * self.frame_period_us;
        for entry in self.active_entries() {
            if frame_start_us % entry.period_us == 0 {
                let _ = entries.push(*entry);
            }
        }
        entries.sort_unstable_by_key(ScheduleEntry::order_key);

        self.stats.frames_started += 1;
        self.stats.utilization_ppm = Utilization::of(self.active_entries())?.ppm();
        self.stats.active_nodes = self.active_entries().count() as u8;

        Ok(FramePlan { frame, entries })
    }

    pub fn halt(&mut self, reason: &'static str) {
        if self.state == SchedulerState::Halted {
            return;
        }
        error!(reason, "scheduler halted");
        self.state = SchedulerState::Halted;
        self.halt_reason = Some(reason);
    }

    pub fn get_state(&self) -> SchedulerState {
        self.state
    }

    pub fn halt_reason(&self) -> Option<&'static str> {
        self.halt_reason
    }

    pub fn get_stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn is_scheduled(&self, node: NodeId) -> bool {
        self.entries.iter().any(|entry| entry.node == node) && !self.removed.contains(&node)
    }

    pub fn entry(&self, node: NodeId) -> Option<&ScheduleEntry> {
        self.entries.iter().find(|entry| entry.node == node)
    }

    pub fn frame_period_us(&self) -> u64 {
        self.frame_period_us
    }

    fn active_entries(&self) -> impl Iterator<Item = &ScheduleEntry> + Clone + '_ {
        self.entries
            .iter()
            .filter(move |entry| !self.removed.contains(&entry.node))
    }

    fn ensure_active(&self) -> BusResult<()> {
        match self.state {
            SchedulerState::Running | SchedulerState::Degraded => Ok(()),
            SchedulerState::Halted => Err(BusError::Halted),
            _ => Err(BusError::InvalidState("scheduler is not running")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(node: u16, period_us: u64, budget_us: u64, criticality: Criticality) -> ScheduleEntry {
        ScheduleEntry {
            node: NodeId(node),
            period_us,
            budget_us,
            priority: 0,
            criticality,
        }
    }

    fn running(entries: &[ScheduleEntry]) -> CyclicScheduler {
        let mut scheduler = CyclicScheduler::new(10_000);
        for e in entries {
            scheduler.add_node(*e).unwrap();
        }
        scheduler.arm().unwrap();
        scheduler.start().unwrap();
        scheduler
    }

    #[test]
    fn test_scheduler_creation() {
        let scheduler = CyclicScheduler::new(10_000);
        assert_eq!(scheduler.get_state(), SchedulerState::Idle);
        assert_eq!(scheduler.get_stats().frames_started, 0);
    }

    #[test]
    fn test_rate_monotonic_order() {
        let mut scheduler = running(&[
            entry(0, 20_000, 1_000, Criticality::ControlCritical),
            entry(1, 10_000, 1_000, Criticality::Telemetry),
            entry(2, 10_000, 1_000, Criticality::ControlCritical),
        ]);

        let plan = scheduler.begin_frame().unwrap();
        let order: alloc::vec::Vec<u16> = plan.entries.iter().map(|e| e.node.0).collect();
        assert_eq!(order, alloc::vec![2, 0, 1]);

        // Node 0 runs every other frame.
        let plan = scheduler.begin_frame().unwrap();
        let order: alloc::vec::Vec<u16> = plan.entries.iter().map(|e| e.node.0).collect();
        assert_eq!(order, alloc::vec![2, 1]);
    }

    #[test]
    fn test_period_must_be_frame_multiple() {
        let mut scheduler = CyclicScheduler::new(10_000);
        scheduler.add_node(entry(0, 15_000, 1_000, Criticality::ControlCritical)).unwrap();
        assert!(matches!(scheduler.arm(), Err(BusError::InvalidConfig(_))));
        assert_eq!(scheduler.get_state(), SchedulerState::Idle);
    }

    #[test]
    fn test_removal_applies_at_boundary() {
        let mut scheduler = running(&[
            entry(0, 10_000, 1_000, Criticality::ControlCritical),
            entry(1, 10_000, 1_000, Criticality::ControlCritical),
        ]);
        scheduler.begin_frame().unwrap();
        scheduler.request_removal(NodeId(1)).unwrap();
        assert!(scheduler.is_scheduled(NodeId(1)));
        assert_eq!(scheduler.get_state(), SchedulerState::Running);

        let plan = scheduler.begin_frame().unwrap();
        assert_eq!(plan.entries.len(), 1);
        assert_eq!(scheduler.get_state(), SchedulerState::Degraded);

        scheduler.request_readmission(NodeId(1)).unwrap();
        let plan = scheduler.begin_frame().unwrap();
        assert_eq!(plan.entries.len(), 2);
        assert_eq!(scheduler.get_stats().readmissions_applied, 1);
    }

    #[test]
    fn test_retired_node_never_readmitted() {
        let mut scheduler = running(&[
            entry(0, 10_000, 1_000, Criticality::ControlCritical),
            entry(1, 10_000, 1_000, Criticality::ControlCritical),
        ]);
        scheduler.retire(NodeId(1)).unwrap();
        let plan = scheduler.begin_frame().unwrap();
        assert_eq!(plan.entries.len(), 1);
        assert!(!scheduler.is_scheduled(NodeId(1)));
        assert_eq!(scheduler.get_state(), SchedulerState::Degraded);
        assert_eq!(
            scheduler.request_readmission(NodeId(1)),
            Err(BusError::UnknownNode(NodeId(1)))
        );
    }

    #[test]
    fn test_retire_before_arming_drops_entry() {
        let mut scheduler = CyclicScheduler::new(10_000);
        scheduler.add_node(entry(0, 10_000, 6_000, Criticality::ControlCritical)).unwrap();
        scheduler.add_node(entry(1, 10_000, 6_000, Criticality::ControlCritical)).unwrap();
        scheduler.retire(NodeId(1)).unwrap();
        scheduler.arm().unwrap();
        assert!(scheduler.entry(NodeId(1)).is_none());
    }

    #[test]
    fn test_halted_is_terminal() {
        let mut scheduler = running(&[entry(0, 10_000, 1_000, Criticality::ControlCritical)]);
        scheduler.halt("test");
        assert_eq!(scheduler.begin_frame().unwrap_err(), BusError::Halted);
        assert_eq!(scheduler.start().unwrap_err(), BusError::Halted);
        assert_eq!(scheduler.halt_reason(), Some("test"));
    }
}
