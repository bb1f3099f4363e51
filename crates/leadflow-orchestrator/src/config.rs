use crate::export::parse_cron;
use leadflow_core::{LeadflowError, LeadflowResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upper bound for minute-valued knobs (one week).
const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;
/// Upper bound for second-valued timer knobs (one week).
const MAX_TIMER_SECONDS: u64 = 7 * 24 * 60 * 60;
/// Upper bound for `max_interval_multiplier`.
pub const MAX_INTERVAL_MULTIPLIER: f64 = 1000.0;

/// Weights of the composite priority score.
///
/// `priority = quality·q + success·s + volume·min(1, valid_leads / volume_target)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityWeights {
    #[serde(default = "default_quality_weight")]
    pub quality: f64,
    #[serde(default = "default_success_weight")]
    pub success: f64,
    #[serde(default = "default_volume_weight")]
    pub volume: f64,
    /// Valid-lead count at which the volume term saturates.
    #[serde(default = "default_volume_target")]
    pub volume_target: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            quality: default_quality_weight(),
            success: default_success_weight(),
            volume: default_volume_weight(),
            volume_target: default_volume_target(),
        }
    }
}

/// Coefficients of the interval adjustment factor.
///
/// `adjustment = 1 + quality·(1 − q) + success·(1 − s) + error·min(1, consecutive / error_saturation)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyCoefficients {
    #[serde(default = "default_quality_coefficient")]
    pub quality: f64,
    #[serde(default = "default_success_coefficient")]
    pub success: f64,
    #[serde(default = "default_error_coefficient")]
    pub error: f64,
    #[serde(default = "default_error_saturation")]
    pub error_saturation: u32,
}

impl Default for FrequencyCoefficients {
    fn default() -> Self {
        Self {
            quality: default_quality_coefficient(),
            success: default_success_coefficient(),
            error: default_error_coefficient(),
            error_saturation: default_error_saturation(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default)]
    pub enabled: bool,
    /// 6- or 7-field cron expression (seconds first).
    #[serde(default = "default_export_cron")]
    pub cron: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cron: default_export_cron(),
        }
    }
}

/// Tunables of the orchestration engine, usually read from `leadflow.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Size of the worker pool that runs source jobs.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Upper bound on simultaneously executing sources. Lowered at runtime
    /// under resource pressure.
    #[serde(default = "default_max_concurrent_sources")]
    pub max_concurrent_sources: usize,
    #[serde(default = "default_min_source_interval_minutes")]
    pub min_source_interval_minutes: u64,
    #[serde(default = "default_max_interval_multiplier")]
    pub max_interval_multiplier: f64,
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: f32,
    #[serde(default = "default_max_memory_percent")]
    pub max_memory_percent: f32,
    #[serde(default = "default_resource_check_interval_seconds")]
    pub resource_check_interval_seconds: u64,
    #[serde(default = "default_pause_cooldown_minutes")]
    pub pause_cooldown_minutes: u64,
    #[serde(default = "default_lead_batch_size")]
    pub lead_batch_size: usize,
    /// Number of samples kept per source by the performance tracker.
    #[serde(default = "default_metrics_window")]
    pub metrics_window: usize,
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
    #[serde(default)]
    pub priority_weights: PriorityWeights,
    #[serde(default)]
    pub frequency: FrequencyCoefficients,
    #[serde(default)]
    pub export: ExportConfig,
}

fn default_max_workers() -> usize {
    10
}
fn default_max_concurrent_sources() -> usize {
    5
}
fn default_min_source_interval_minutes() -> u64 {
    5
}
fn default_max_interval_multiplier() -> f64 {
    12.0
}
fn default_max_cpu_percent() -> f32 {
    80.0
}
fn default_max_memory_percent() -> f32 {
    85.0
}
fn default_resource_check_interval_seconds() -> u64 {
    60
}
fn default_pause_cooldown_minutes() -> u64 {
    15
}
fn default_lead_batch_size() -> usize {
    50
}
fn default_metrics_window() -> usize {
    10
}
fn default_shutdown_timeout_seconds() -> u64 {
    30
}
fn default_quality_weight() -> f64 {
    0.4
}
fn default_success_weight() -> f64 {
    0.4
}
fn default_volume_weight() -> f64 {
    0.2
}
fn default_volume_target() -> f64 {
    100.0
}
fn default_quality_coefficient() -> f64 {
    0.5
}
fn default_success_coefficient() -> f64 {
    0.3
}
fn default_error_coefficient() -> f64 {
    1.0
}
fn default_error_saturation() -> u32 {
    5
}
fn default_export_cron() -> String {
    "0 0 * * * *".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_concurrent_sources: default_max_concurrent_sources(),
            min_source_interval_minutes: default_min_source_interval_minutes(),
            max_interval_multiplier: default_max_interval_multiplier(),
            max_cpu_percent: default_max_cpu_percent(),
            max_memory_percent: default_max_memory_percent(),
            resource_check_interval_seconds: default_resource_check_interval_seconds(),
            pause_cooldown_minutes: default_pause_cooldown_minutes(),
            lead_batch_size: default_lead_batch_size(),
            metrics_window: default_metrics_window(),
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
            priority_weights: PriorityWeights::default(),
            frequency: FrequencyCoefficients::default(),
            export: ExportConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> LeadflowResult<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> LeadflowResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            LeadflowError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> LeadflowResult<()> {
        if self.max_workers == 0 {
            return Err(LeadflowError::Config("max_workers must be at least 1".into()));
        }
        if self.max_concurrent_sources == 0 {
            return Err(LeadflowError::Config(
                "max_concurrent_sources must be at least 1".into(),
            ));
        }
        for (name, value, limit) in [
            (
                "min_source_interval_minutes",
                self.min_source_interval_minutes,
                MAX_INTERVAL_MINUTES,
            ),
            (
                "pause_cooldown_minutes",
                self.pause_cooldown_minutes,
                MAX_INTERVAL_MINUTES,
            ),
            (
                "resource_check_interval_seconds",
                self.resource_check_interval_seconds,
                MAX_TIMER_SECONDS,
            ),
            (
                "shutdown_timeout_seconds",
                self.shutdown_timeout_seconds,
                MAX_TIMER_SECONDS,
            ),
        ] {
            if value > limit {
                return Err(LeadflowError::Config(format!(
                    "{name} must be at most {limit}, got {value}"
                )));
            }
        }
        if self.min_source_interval_minutes == 0 {
            return Err(LeadflowError::Config(
                "min_source_interval_minutes must be at least 1".into(),
            ));
        }
        if !(self.max_interval_multiplier.is_finite()
            && (1.0..=MAX_INTERVAL_MULTIPLIER).contains(&self.max_interval_multiplier))
        {
            return Err(LeadflowError::Config(format!(
                "max_interval_multiplier must be in [1, {MAX_INTERVAL_MULTIPLIER}], got {}",
                self.max_interval_multiplier
            )));
        }
        for (name, value) in [
            ("max_cpu_percent", self.max_cpu_percent),
            ("max_memory_percent", self.max_memory_percent),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(LeadflowError::Config(format!(
                    "{name} must be in (0, 100], got {value}"
                )));
            }
        }
        if self.resource_check_interval_seconds == 0 {
            return Err(LeadflowError::Config(
                "resource_check_interval_seconds must be at least 1".into(),
            ));
        }
        if self.lead_batch_size == 0 || self.metrics_window == 0 {
            return Err(LeadflowError::Config(
                "lead_batch_size and metrics_window must be at least 1".into(),
            ));
        }
        let w = &self.priority_weights;
        if [w.quality, w.success, w.volume]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
            || !(w.volume_target > 0.0)
        {
            return Err(LeadflowError::Config(
                "priority weights must be non-negative and volume_target positive".into(),
            ));
        }
        let f = &self.frequency;
        if [f.quality, f.success, f.error]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
            || f.error_saturation == 0
        {
            return Err(LeadflowError::Config(
                "frequency coefficients must be non-negative and error_saturation positive".into(),
            ));
        }
        if self.export.enabled {
            parse_cron(&self.export.cron)?;
        }
        Ok(())
    }

    /// Floor of every scheduled interval.
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_source_interval_minutes.saturating_mul(60))
    }

    /// Ceiling of every scheduled interval. Never below `min_interval`.
    pub fn max_interval(&self) -> Duration {
        let min = self.min_interval();
        let multiplier = if self.max_interval_multiplier.is_finite() {
            self.max_interval_multiplier
                .clamp(1.0, MAX_INTERVAL_MULTIPLIER)
        } else {
            MAX_INTERVAL_MULTIPLIER
        };
        Duration::try_from_secs_f64(min.as_secs_f64() * multiplier)
            .unwrap_or(min)
            .max(min)
    }

    pub fn resource_check_interval(&self) -> Duration {
        Duration::from_secs(self.resource_check_interval_seconds.min(MAX_TIMER_SECONDS))
    }

    pub fn pause_cooldown(&self) -> Duration {
        Duration::from_secs(
            self.pause_cooldown_minutes
                .min(MAX_INTERVAL_MINUTES)
                .saturating_mul(60),
        )
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds.min(MAX_TIMER_SECONDS))
    }
}
