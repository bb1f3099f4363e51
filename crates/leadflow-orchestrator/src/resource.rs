//! CPU/memory sampling and the throttle → stretch → pause escalation ladder.

use crate::config::OrchestratorConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Point-in-time system load, both values in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

impl ResourceSample {
    pub fn new(cpu_percent: f32, memory_percent: f32) -> Self {
        Self {
            cpu_percent,
            memory_percent,
        }
    }

    /// Worst of `cpu / max_cpu` and `mem / max_mem`.
    pub fn pressure_ratio(&self, config: &OrchestratorConfig) -> f64 {
        let cpu = f64::from(self.cpu_percent) / f64::from(config.max_cpu_percent);
        let mem = f64::from(self.memory_percent) / f64::from(config.max_memory_percent);
        let ratio = cpu.max(mem);
        if ratio.is_finite() {
            ratio.max(0.0)
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    /// Both gauges at or under their thresholds.
    Normal,
    /// Over threshold, by at most 20%.
    Elevated,
    /// Between 1.2× and 1.5× threshold.
    Moderate,
    /// Above 1.5× threshold.
    Critical,
}

impl PressureLevel {
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio > 1.5 {
            PressureLevel::Critical
        } else if ratio > 1.2 {
            PressureLevel::Moderate
        } else if ratio > 1.0 {
            PressureLevel::Elevated
        } else {
            PressureLevel::Normal
        }
    }
}

/// Source of resource samples. Swappable so tests can script load.
pub trait ResourceProbe: Send {
    fn sample(&mut self) -> ResourceSample;
}

/// Samples the host through `sysinfo`.
///
/// CPU usage is a delta between two refreshes, so the first sample after
/// construction reads low; the monitor loop's fixed interval provides the
/// spacing for every sample after that.
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self { system }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&mut self) -> ResourceSample {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        let total = self.system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            (self.system.used_memory() as f64 / total as f64 * 100.0) as f32
        };
        ResourceSample {
            cpu_percent: self.system.global_cpu_usage(),
            memory_percent,
        }
    }
}

/// Steps the monitor decided on for one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPlan {
    pub level: PressureLevel,
    /// Lower `max_concurrent_sources` by one.
    pub throttle: bool,
    /// Stretch the lowest-priority schedules.
    pub stretch: bool,
    /// Pause the orchestrator with auto-resume.
    pub pause: bool,
    /// Pressure is gone: restore concurrency and clear stretches.
    pub relieve: bool,
}

/// Tracks consecutive severe checks and turns samples into escalation plans.
pub struct ResourceMonitor {
    probe: Mutex<Box<dyn ResourceProbe>>,
    severe_streak: Mutex<u32>,
}

impl ResourceMonitor {
    pub fn new(probe: Box<dyn ResourceProbe>) -> Self {
        Self {
            probe: Mutex::new(probe),
            severe_streak: Mutex::new(0),
        }
    }

    pub fn sample(&self) -> ResourceSample {
        self.probe.lock().sample()
    }

    /// Decide the ladder steps for `sample`.
    ///
    /// Over threshold always throttles. Over 1.2× also stretches schedules.
    /// Over 1.2× on two checks in a row (the stretch did not help) pauses.
    pub fn assess(&self, sample: &ResourceSample, config: &OrchestratorConfig) -> EscalationPlan {
        let ratio = sample.pressure_ratio(config);
        let level = PressureLevel::from_ratio(ratio);
        let severe = ratio > 1.2;

        let mut streak = self.severe_streak.lock();
        let pause = severe && *streak >= 1;
        *streak = if severe { streak.saturating_add(1) } else { 0 };

        EscalationPlan {
            level,
            throttle: ratio > 1.0,
            stretch: severe,
            pause,
            relieve: level == PressureLevel::Normal,
        }
    }

    pub fn reset(&self) {
        *self.severe_streak.lock() = 0;
    }
}
