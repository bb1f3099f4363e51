use crate::types::OrchestratorStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-source slice of the metrics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMetricsSnapshot {
    pub source_id: String,
    pub name: String,
    pub active: bool,
    pub running: bool,
    pub executions: u64,
    /// Executions currently inside the averaging window.
    pub window_samples: usize,
    pub priority_score: f64,
    pub success_rate: f64,
    pub quality_score: f64,
    pub consecutive_errors: u32,
    pub avg_execution_time: f64,
    pub total_leads_found: u64,
    pub valid_leads_found: u64,
    pub last_execution_time: Option<DateTime<Utc>>,
    /// Currently armed interval, if the source is scheduled.
    pub interval_seconds: Option<u64>,
}

/// Immutable view of the orchestrator for dashboards and health checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetricsSnapshot {
    pub status: OrchestratorStatus,
    pub uptime_seconds: u64,
    pub active_sources: usize,
    pub total_sources: usize,
    pub active_jobs: usize,
    pub max_concurrent_sources: usize,
    pub total_leads_processed: u64,
    pub leads_exported: u64,
    pub total_errors: u64,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub sources: Vec<SourceMetricsSnapshot>,
}

impl SystemMetricsSnapshot {
    pub fn source(&self, id: &str) -> Option<&SourceMetricsSnapshot> {
        self.sources.iter().find(|s| s.source_id == id)
    }

    /// Serialize for a dashboard feed.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({ "status": self.status, "error": e.to_string() })
        })
    }
}
