//! Mission clock with relativistic correction, and the time sources used to
//! measure node execution budgets.

use crate::error::{BusError, BusResult};
use crate::protocol::MissionTime;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub const SPEED_OF_LIGHT_M_S: f64 = 299_792_458.0;

/// Microsecond time source for execution-budget measurement.
pub trait TimeSource: Send {
    fn now_us(&self) -> u64;
}

#[derive(Debug, Clone, Copy)]
pub struct MonotonicTime {
    origin: Instant,
}

impl MonotonicTime {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Deterministic time source. Clones share the same counter, so a test node
/// holding a clone can "spend" time inside its slot.
#[derive(Debug, Clone, Default)]
pub struct ManualTime {
    now: Arc<AtomicU64>,
}

impl ManualTime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, us: u64) {
        self.now.fetch_add(us, Ordering::AcqRel);
    }

    pub fn set(&self, us: u64) {
        self.now.fetch_max(us, Ordering::AcqRel);
    }
}

impl TimeSource for ManualTime {
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

/// Amount a clock moving at `speed_m_s` falls behind over `dt_us`.
pub fn dilation_offset_us(dt_us: u64, speed_m_s: f64) -> f64 {
    let beta_sq = (speed_m_s / SPEED_OF_LIGHT_M_S).powi(2);
    dt_us as f64 * (1.0 - (1.0 - beta_sq).sqrt())
}

#[derive(Debug, Clone)]
pub struct MissionClock {
    frame_period_us: u64,
    correction_interval_frames: u64,
    frames: u64,
    raw_us: u64,
    offset_us: f64,
    speed_m_s: f64,
    corrected: MissionTime,
}

impl MissionClock {
    pub fn new(frame_period_us: u64, correction_interval_frames: u64) -> BusResult<Self> {
        if frame_period_us == 0 {
            return Err(BusError::config("frame period must be positive"));
        }
        if correction_interval_frames == 0 {
            return Err(BusError::config("clock correction interval must be positive"));
        }
        Ok(Self {
            frame_period_us,
            correction_interval_frames,
            frames: 0,
            raw_us: 0,
            offset_us: 0.0,
            speed_m_s: 0.0,
            corrected: MissionTime::EPOCH,
        })
    }

    /// Latest speed estimate; consumed at the next correction point.
    pub fn set_speed(&mut self, speed_m_s: f64) {
        if !speed_m_s.is_finite() || speed_m_s.abs() >= SPEED_OF_LIGHT_M_S {
            warn!(speed_m_s, "ignoring non-physical speed for clock correction");
            return;
        }
        self.speed_m_s = speed_m_s.abs();
    }

    /// Advances one frame and returns the corrected time that stamps it.
    pub fn tick(&mut self) -> MissionTime {
        self.frames += 1;
        self.raw_us = self.raw_us.saturating_add(self.frame_period_us);

        if self.frames % self.correction_interval_frames == 0 {
            let window_us = self.frame_period_us.saturating_mul(self.correction_interval_frames);
            let delta = dilation_offset_us(window_us, self.speed_m_s);
            self.offset_us += delta;
            debug!(frame = self.frames, delta_us = delta, total_us = self.offset_us, "clock correction");
        }

        let candidate = MissionTime::from_micros(self.raw_us.saturating_add(self.offset_us as u64));
        // NASA Rule 5: corrected time never runs backwards
        debug_assert!(candidate >= self.corrected);
        self.corrected = self.corrected.max(candidate);
        self.corrected
    }

    pub fn now(&self) -> MissionTime {
        self.corrected
    }

    pub fn raw(&self) -> MissionTime {
        MissionTime::from_micros(self.raw_us)
    }

    pub fn offset_us(&self) -> f64 {
        self.offset_us
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn frame_period_us(&self) -> u64 {
        self.frame_period_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_correction_at_rest() {
        let mut clock = MissionClock::new(10_000, 5).unwrap();
        for _ in 0..20 {
            clock.tick();
        }
        assert_eq!(clock.now(), MissionTime::from_micros(200_000));
        assert_eq!(clock.offset_us(), 0.0);
    }

    #[test]
    fn test_correction_applied_on_interval() {
        let mut clock = MissionClock::new(1_000_000, 2).unwrap();
        clock.set_speed(0.6 * SPEED_OF_LIGHT_M_S);
        let first = clock.tick();
        assert_eq!(first, MissionTime::from_micros(1_000_000));
        let second = clock.tick();
        // gamma = 1.25, so the moving clock loses 20% of the 2 s window
        assert_eq!(second, MissionTime::from_micros(2_400_000));
        assert!(second > first);
    }

    #[test]
    fn test_long_correction_window_saturates() {
        let mut clock = MissionClock::new(u64::MAX / 2, 4).unwrap();
        clock.set_speed(7_800.0);
        let mut previous = MissionTime::EPOCH;
        for _ in 0..4 {
            let now = clock.tick();
            assert!(now >= previous);
            previous = now;
        }
        assert_eq!(clock.raw(), MissionTime::from_micros(u64::MAX));
        assert!(clock.offset_us().is_finite());
    }

    #[test]
    fn test_superluminal_speed_ignored() {
        let mut clock = MissionClock::new(1_000, 1).unwrap();
        clock.set_speed(2.0 * SPEED_OF_LIGHT_M_S);
        clock.tick();
        assert_eq!(clock.offset_us(), 0.0);
    }

    #[test]
    fn test_manual_time_shared_between_clones() {
        let time = ManualTime::new();
        let handle = time.clone();
        handle.advance(250);
        assert_eq!(time.now_us(), 250);
        time.set(100);
        assert_eq!(handle.now_us(), 250);
    }
}
