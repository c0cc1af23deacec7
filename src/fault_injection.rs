use crate::protocol::{NodeId, FRAME_HEADER_SIZE, FRAME_TRAILER_SIZE};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::info;

const MAX_ACTIVE_FAULTS: usize = 8;
const DEFAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;

// Default fault type weights, out of 100
const STUCK_WEIGHT: u8 = 30;
const OFFSET_WEIGHT: u8 = 25;
const SILENCE_WEIGHT: u8 = 20;
const OVERRUN_WEIGHT: u8 = 15;
const CORRUPT_WEIGHT: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum InjectedFault {
    /// Sensor repeats a frozen reading.
    StuckValue { value: f64 },
    /// Sensor reading biased by a constant.
    Offset { bias: f64 },
    /// Node produces nothing and sends no heartbeat.
    Silence,
    /// Node burns extra execution time.
    Overrun { extra_us: u64 },
    /// Frames from the node are corrupted on the link.
    CorruptFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActiveFault {
    pub target: NodeId,
    pub fault: InjectedFault,
    pub frames_remaining: u32,
    pub injected_at_frame: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FaultInjectionStats {
    pub total_faults_injected: u32,
    pub stuck_faults: u32,
    pub offset_faults: u32,
    pub silence_faults: u32,
    pub overrun_faults: u32,
    pub corrupt_faults: u32,
    pub expired_faults: u32,
    pub current_active_faults: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultInjectionConfig {
    pub enabled: bool,
    /// Chance per frame that a new fault starts.
    pub rate_percent: f32,
    pub min_duration_frames: u32,
    pub max_duration_frames: u32,
    pub stuck_weight: u8,
    pub offset_weight: u8,
    pub silence_weight: u8,
    pub overrun_weight: u8,
    pub corrupt_weight: u8,
    pub max_offset: f64,
    pub max_overrun_us: u64,
}

impl Default for FaultInjectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_percent: 1.0,
            min_duration_frames: 2,
            max_duration_frames: 20,
            stuck_weight: STUCK_WEIGHT,
            offset_weight: OFFSET_WEIGHT,
            silence_weight: SILENCE_WEIGHT,
            overrun_weight: OVERRUN_WEIGHT,
            corrupt_weight: CORRUPT_WEIGHT,
            max_offset: 50.0,
            max_overrun_us: 5_000,
        }
    }
}

/// Deterministic fault injection engine driven by a linear congruential
/// generator, so a given seed replays the same mission.
#[derive(Debug)]
pub struct FaultInjector {
    config: FaultInjectionConfig,
    active_faults: Vec<ActiveFault, MAX_ACTIVE_FAULTS>,
    stats: FaultInjectionStats,
    frame: u64,
    rng_state: u64,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::new_with_config(FaultInjectionConfig::default(), DEFAULT_SEED)
    }

    pub fn new_with_config(config: FaultInjectionConfig, seed: u64) -> Self {
        Self {
            config,
            active_faults: Vec::new(),
            stats: FaultInjectionStats::default(),
            frame: 0,
            rng_state: seed,
        }
    }

    /// Advance one frame: expire finished faults and maybe start a new one on
    /// one of `targets`. `last_value` lets a stuck fault freeze the reading the
    /// sensor had at injection time.
    pub fn update(&mut self, targets: &[NodeId], last_value: f64) -> Option<ActiveFault> {
        self.frame += 1;

        let before = self.active_faults.len();
        for fault in self.active_faults.iter_mut() {
            fault.frames_remaining = fault.frames_remaining.saturating_sub(1);
        }
        self.active_faults.retain(|fault| fault.frames_remaining > 0);
        self.stats.expired_faults += (before - self.active_faults.len()) as u32;

        let mut started = None;
        if self.config.enabled && !targets.is_empty() && !self.active_faults.is_full() {
            let roll = (self.next_random() % 10_000) as f32 / 100.0;
            if roll < self.config.rate_percent {
                let target = targets[(self.next_random() % targets.len() as u64) as usize];
                if self.fault_for(target).is_none() {
                    let fault = self.pick_fault(last_value);
                    let duration = self.pick_duration();
                    started = self.inject(target, fault, duration);
                }
            }
        }
        self.stats.current_active_faults = self.active_faults.len() as u8;
        started
    }

    /// Starts a specific fault, replacing any active one on the same target.
    pub fn inject(&mut self, target: NodeId, fault: InjectedFault, duration_frames: u32) -> Option<ActiveFault> {
        self.active_faults.retain(|active| active.target != target);
        let active = ActiveFault {
            target,
            fault,
            frames_remaining: duration_frames.max(1),
            injected_at_frame: self.frame,
        };
        self.active_faults.push(active).ok()?;

        self.stats.total_faults_injected += 1;
        match fault {
            InjectedFault::StuckValue { .. } => self.stats.stuck_faults += 1,
            InjectedFault::Offset { .. } => self.stats.offset_faults += 1,
            InjectedFault::Silence => self.stats.silence_faults += 1,
            InjectedFault::Overrun { .. } => self.stats.overrun_faults += 1,
            InjectedFault::CorruptFrame => self.stats.corrupt_faults += 1,
        }
        self.stats.current_active_faults = self.active_faults.len() as u8;
        info!(target = %target, fault = ?fault, duration_frames, "fault injected");
        Some(active)
    }

    pub fn fault_for(&self, target: NodeId) -> Option<InjectedFault> {
        self.active_faults
            .iter()
            .find(|active| active.target == target)
            .map(|active| active.fault)
    }

    /// Applies a value fault to a sensor reading; `None` means silence.
    pub fn apply_to_value(&self, target: NodeId, value: f64) -> Option<f64> {
        match self.fault_for(target) {
            Some(InjectedFault::StuckValue { value: stuck }) => Some(stuck),
            Some(InjectedFault::Offset { bias }) => Some(value + bias),
            Some(InjectedFault::Silence) => None,
            _ => Some(value),
        }
    }

    pub fn overrun_us(&self, target: NodeId) -> u64 {
        match self.fault_for(target) {
            Some(InjectedFault::Overrun { extra_us }) => extra_us,
            _ => 0,
        }
    }

    /// Flips one payload bit of an encoded frame, if it has a payload.
    pub fn corrupt(&mut self, frame: &mut [u8]) -> bool {
        if frame.len() <= FRAME_HEADER_SIZE + FRAME_TRAILER_SIZE {
            return false;
        }
        let payload_len = frame.len() - FRAME_HEADER_SIZE - FRAME_TRAILER_SIZE;
        let offset = FRAME_HEADER_SIZE + (self.next_random() % payload_len as u64) as usize;
        let bit = (self.next_random() % 8) as u8;
        frame[offset] ^= 1 << bit;
        true
    }

    pub fn clear_faults(&mut self, target: Option<NodeId>) {
        match target {
            Some(node) => self.active_faults.retain(|active| active.target != node),
            None => self.active_faults.clear(),
        }
        self.stats.current_active_faults = self.active_faults.len() as u8;
    }

    pub fn get_active_faults(&self) -> &[ActiveFault] {
        &self.active_faults
    }

    pub fn get_stats(&self) -> &FaultInjectionStats {
        &self.stats
    }

    fn pick_fault(&mut self, last_value: f64) -> InjectedFault {
        let total = u32::from(self.config.stuck_weight)
            + u32::from(self.config.offset_weight)
            + u32::from(self.config.silence_weight)
            + u32::from(self.config.overrun_weight)
            + u32::from(self.config.corrupt_weight);
        let mut roll = (self.next_random() % u64::from(total.max(1))) as u32;

        if roll < u32::from(self.config.stuck_weight) {
            return InjectedFault::StuckValue { value: last_value };
        }
        roll -= u32::from(self.config.stuck_weight);
        if roll < u32::from(self.config.offset_weight) {
            let unit = (self.next_random() % 2_001) as f64 / 1_000.0 - 1.0;
            return InjectedFault::Offset {
                bias: unit * self.config.max_offset,
            };
        }
        roll -= u32::from(self.config.offset_weight);
        if roll < u32::from(self.config.silence_weight) {
            return InjectedFault::Silence;
        }
        roll -= u32::from(self.config.silence_weight);
        if roll < u32::from(self.config.overrun_weight) {
            return InjectedFault::Overrun {
                extra_us: 1 + self.next_random() % self.config.max_overrun_us.max(1),
            };
        }
        InjectedFault::CorruptFrame
    }

    fn pick_duration(&mut self) -> u32 {
        let min = self.config.min_duration_frames.max(1);
        let max = self.config.max_duration_frames.max(min);
        min + (self.next_random() % u64::from(max - min + 1)) as u32
    }

    fn next_random(&mut self) -> u64 {
        // Knuth MMIX constants
        self.rng_state = self
            .rng_state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.rng_state >> 33
    }
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_faults() {
        let config = FaultInjectionConfig {
            rate_percent: 50.0,
            ..FaultInjectionConfig::default()
        };
        let targets = [NodeId(0), NodeId(1), NodeId(2)];
        let mut a = FaultInjector::new_with_config(config.clone(), 7);
        let mut b = FaultInjector::new_with_config(config, 7);
        for _ in 0..200 {
            assert_eq!(a.update(&targets, 100.0), b.update(&targets, 100.0));
        }
        assert!(a.get_stats().total_faults_injected > 0);
    }

    #[test]
    fn test_value_faults() {
        let mut injector = FaultInjector::new();
        injector.inject(NodeId(1), InjectedFault::Offset { bias: 5.0 }, 2);
        injector.inject(NodeId(2), InjectedFault::Silence, 2);
        assert_eq!(injector.apply_to_value(NodeId(1), 100.0), Some(105.0));
        assert_eq!(injector.apply_to_value(NodeId(2), 100.0), None);
        assert_eq!(injector.apply_to_value(NodeId(3), 100.0), Some(100.0));

        injector.update(&[], 0.0);
        injector.update(&[], 0.0);
        assert!(injector.get_active_faults().is_empty());
        assert_eq!(injector.get_stats().expired_faults, 2);
    }

    #[test]
    fn test_corrupt_only_touches_payload() {
        let mut injector = FaultInjector::new();
        let mut frame = [0u8; FRAME_HEADER_SIZE + 8 + FRAME_TRAILER_SIZE];
        assert!(injector.corrupt(&mut frame));
        assert!(frame[..FRAME_HEADER_SIZE].iter().all(|b| *b == 0));
        assert!(frame[FRAME_HEADER_SIZE + 8..].iter().all(|b| *b == 0));
        assert_eq!(frame.iter().map(|b| b.count_ones()).sum::<u32>(), 1);

        let mut empty = [0u8; FRAME_HEADER_SIZE + FRAME_TRAILER_SIZE];
        assert!(!injector.corrupt(&mut empty));
    }
}
