//! # Module: safety
//!
//! ## Responsibility
//! Observe process CPU and resident memory at a fixed interval, derive a
//! [`SafetyLevel`], and publish transitions to subscribers.
//!
//! Modeled on a `self_tune::telemetry_bus::TelemetryBus`
//! publish-to-`tokio::sync::broadcast` model, generalized from raw metric
//! snapshots to level transitions. Process stat reads use `sysinfo`, the
//! conventional crate for this (see `DESIGN.md`).
//!
//! ## NOT Responsible For
//! Deciding what a processor *does* in response to a level — Governance and
//! the Adaptive Controller read `current_level()` and act on it themselves.

use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sysinfo::{Pid, System};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::util::smoothed::SmoothedSeries;

/// Ordered safety levels, `Normal < Warning < Critical < Emergency`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SafetyLevel {
    Normal = 0,
    Warning = 1,
    Critical = 2,
    Emergency = 3,
}

impl SafetyLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SafetyLevel::Normal,
            1 => SafetyLevel::Warning,
            2 => SafetyLevel::Critical,
            _ => SafetyLevel::Emergency,
        }
    }
}

impl std::fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SafetyLevel::Normal => "normal",
            SafetyLevel::Warning => "warning",
            SafetyLevel::Critical => "critical",
            SafetyLevel::Emergency => "emergency",
        };
        write!(f, "{s}")
    }
}

/// Per-dimension warning/critical/emergency thresholds.
#[derive(Debug, Clone)]
pub struct DimensionThresholds {
    pub warning: f64,
    pub critical: f64,
    pub emergency: f64,
}

impl DimensionThresholds {
    fn level_for(&self, value: f64) -> SafetyLevel {
        if value >= self.emergency {
            SafetyLevel::Emergency
        } else if value >= self.critical {
            SafetyLevel::Critical
        } else if value >= self.warning {
            SafetyLevel::Warning
        } else {
            SafetyLevel::Normal
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub poll_interval: Duration,
    pub cpu_millicores: DimensionThresholds,
    pub memory_mib: DimensionThresholds,
    /// De-escalation requires readings below `recovery_multiplier *
    /// threshold` for `recovery_time_seconds` continuously.
    pub recovery_multiplier: f64,
    pub recovery_time_seconds: u64,
    pub channel_capacity: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            cpu_millicores: DimensionThresholds {
                warning: 700.0,
                critical: 900.0,
                emergency: 980.0,
            },
            memory_mib: DimensionThresholds {
                warning: 768.0,
                critical: 1024.0,
                emergency: 1536.0,
            },
            recovery_multiplier: 0.8,
            recovery_time_seconds: 30,
            channel_capacity: 32,
        }
    }
}

struct Reading {
    cpu_millicores: f64,
    memory_mib: f64,
}

/// Mutable sampling state, isolated behind one lock so `SafetyMonitor`
/// itself can expose cheap `&self` reads (`current_level`, `subscribe`).
struct SamplingState {
    cpu_history: SmoothedSeries,
    mem_history: SmoothedSeries,
}

/// Owns the periodic sampling task and the current level. Construction is
/// separate from `start()`/`stop()` so callers can register subscribers
/// before the first tick starts publishing.
pub struct SafetyMonitor {
    cfg: SafetyConfig,
    pid: Pid,
    level: AtomicU8,
    tx: broadcast::Sender<SafetyLevel>,
    cancel: CancellationToken,
    /// Ticks (at `poll_interval`) a reading must hold inside the recovery
    /// band before de-escalation fires; also the smoothing window's size.
    recovery_ticks: usize,
    state: Mutex<SamplingState>,
}

impl SafetyMonitor {
    pub fn new(cfg: SafetyConfig) -> Self {
        let (tx, _rx) = broadcast::channel(cfg.channel_capacity.max(1));
        let recovery_ticks = ((cfg.recovery_time_seconds as f64 / cfg.poll_interval.as_secs_f64().max(0.001))
            .ceil() as usize)
            .max(1);
        Self {
            pid: sysinfo::get_current_pid().unwrap_or(Pid::from(0)),
            level: AtomicU8::new(SafetyLevel::Normal as u8),
            tx,
            cancel: CancellationToken::new(),
            recovery_ticks,
            state: Mutex::new(SamplingState {
                cpu_history: SmoothedSeries::new(recovery_ticks, 0.3),
                mem_history: SmoothedSeries::new(recovery_ticks, 0.3),
            }),
            cfg,
        }
    }

    pub fn current_level(&self) -> SafetyLevel {
        SafetyLevel::from_u8(self.level.load(AtomicOrdering::Acquire))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SafetyLevel> {
        self.tx.subscribe()
    }

    fn read_stats(&self, sys: &mut System) -> Option<Reading> {
        sys.refresh_process(self.pid);
        let process = sys.process(self.pid)?;
        Some(Reading {
            cpu_millicores: process.cpu_usage() as f64 * 10.0,
            memory_mib: process.memory() as f64 / (1024.0 * 1024.0),
        })
    }

    fn candidate_level(&self, cpu_millicores: f64, memory_mib: f64) -> SafetyLevel {
        self.cfg
            .cpu_millicores
            .level_for(cpu_millicores)
            .max(self.cfg.memory_mib.level_for(memory_mib))
    }

    fn is_within_recovery_band(&self, cpu_millicores: f64, memory_mib: f64) -> bool {
        cpu_millicores < self.cfg.cpu_millicores.warning * self.cfg.recovery_multiplier
            && memory_mib < self.cfg.memory_mib.warning * self.cfg.recovery_multiplier
    }

    /// De-escalation gate: the smoothed (EWMA-windowed) mean of both
    /// dimensions must sit inside the recovery band, and every individual
    /// sample over a full `recovery_ticks`-sized window must too — one
    /// noisy spike inside an otherwise-good window still blocks recovery.
    fn recovery_sustained(&self, state: &SamplingState) -> bool {
        if state.cpu_history.len() < self.recovery_ticks || state.mem_history.len() < self.recovery_ticks {
            return false;
        }
        let cpu_mean = state.cpu_history.window_mean().unwrap_or(f64::INFINITY);
        let mem_mean = state.mem_history.window_mean().unwrap_or(f64::INFINITY);
        if !self.is_within_recovery_band(cpu_mean, mem_mean) {
            return false;
        }
        let cpu_band = self.cfg.cpu_millicores.warning * self.cfg.recovery_multiplier;
        let mem_band = self.cfg.memory_mib.warning * self.cfg.recovery_multiplier;
        state.cpu_history.all_recent_satisfy(self.recovery_ticks, |v| v < cpu_band)
            && state.mem_history.all_recent_satisfy(self.recovery_ticks, |v| v < mem_band)
    }

    /// One sampling tick: read stats, compute candidate level off the
    /// smoothed reading, apply the immediate-escalation /
    /// sustained-recovery-gated-de-escalation rule, publish on change.
    /// Exposed directly for unit testing without a live process.
    fn tick_with(&self, reading: Option<Reading>) {
        let Some(reading) = reading else {
            warn!("safety monitor: failed to read process stats, keeping previous level");
            return;
        };

        let mut state = self.state.lock();
        state.cpu_history.push(reading.cpu_millicores);
        state.mem_history.push(reading.memory_mib);

        let smoothed_cpu = state.cpu_history.ewma().unwrap_or(reading.cpu_millicores);
        let smoothed_mem = state.mem_history.ewma().unwrap_or(reading.memory_mib);
        let candidate = self.candidate_level(smoothed_cpu, smoothed_mem);
        let current = self.current_level();

        let next = if candidate > current {
            candidate
        } else if candidate < current && self.recovery_sustained(&state) {
            candidate
        } else {
            current
        };
        drop(state);

        if next != current {
            self.level.store(next as u8, AtomicOrdering::Release);
            info!(from = %current, to = %next, "safety level transition");
            let _ = self.tx.send(next); // no subscribers is not an error
        }
    }

    /// Spawn the periodic sampling loop, returning a handle the caller
    /// should await on shutdown. Cancellation is via the token triggered by
    /// `stop()`.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut sys = System::new();
            let mut interval = tokio::time::interval(self.cfg.poll_interval);
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        info!("safety monitor stopping");
                        return;
                    }
                    _ = interval.tick() => {
                        let reading = self.read_stats(&mut sys);
                        self.tick_with(reading);
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> SafetyMonitor {
        SafetyMonitor::new(SafetyConfig {
            poll_interval: Duration::from_millis(10),
            recovery_time_seconds: 1,
            ..SafetyConfig::default()
        })
    }

    fn reading(cpu: f64, mem: f64) -> Option<Reading> {
        Some(Reading {
            cpu_millicores: cpu,
            memory_mib: mem,
        })
    }

    /// Small, explicit `recovery_ticks` so de-escalation tests don't need a
    /// long tick sequence: `recovery_time_seconds / poll_interval` = 2.
    fn monitor_with_short_recovery() -> SafetyMonitor {
        SafetyMonitor::new(SafetyConfig {
            poll_interval: Duration::from_secs(1),
            recovery_time_seconds: 2,
            ..SafetyConfig::default()
        })
    }

    #[test]
    fn escalates_immediately_on_high_reading() {
        let m = monitor();
        m.tick_with(reading(950.0, 100.0));
        assert_eq!(m.current_level(), SafetyLevel::Critical);
    }

    #[test]
    fn missing_reading_keeps_previous_level() {
        let m = monitor();
        m.tick_with(reading(950.0, 100.0));
        m.tick_with(None);
        assert_eq!(m.current_level(), SafetyLevel::Critical);
    }

    #[test]
    fn deescalation_requires_sustained_recovery() {
        let m = monitor_with_short_recovery();
        assert_eq!(m.recovery_ticks, 2);

        m.tick_with(reading(950.0, 100.0));
        assert_eq!(m.current_level(), SafetyLevel::Critical);

        // One recovered reading is not yet a full recovery_ticks window.
        m.tick_with(reading(10.0, 10.0));
        assert_eq!(m.current_level(), SafetyLevel::Critical);

        // Second consecutive recovered reading fills the window.
        m.tick_with(reading(10.0, 10.0));
        assert_eq!(m.current_level(), SafetyLevel::Normal);
    }

    #[test]
    fn deescalation_resets_if_a_later_reading_spikes() {
        let m = monitor_with_short_recovery();

        m.tick_with(reading(950.0, 100.0));
        m.tick_with(reading(10.0, 10.0));
        // Spike breaks the otherwise-recovered window.
        m.tick_with(reading(950.0, 100.0));
        assert_eq!(m.current_level(), SafetyLevel::Critical);

        m.tick_with(reading(10.0, 10.0));
        assert_eq!(m.current_level(), SafetyLevel::Critical);
        m.tick_with(reading(10.0, 10.0));
        assert_eq!(m.current_level(), SafetyLevel::Normal);
    }

    #[test]
    fn candidate_takes_max_of_dimensions() {
        let m = monitor();
        assert_eq!(m.candidate_level(10.0, 2000.0), SafetyLevel::Emergency);
    }
}
