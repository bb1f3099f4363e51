use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorStatus {
    Initialized,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    /// Initialization failed; `start` retries initialization.
    Error,
}

impl OrchestratorStatus {
    /// States from which `start` is allowed.
    pub fn can_start(self) -> bool {
        matches!(
            self,
            OrchestratorStatus::Initialized | OrchestratorStatus::Stopped | OrchestratorStatus::Error
        )
    }
}

impl std::fmt::Display for OrchestratorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestratorStatus::Initialized => write!(f, "initialized"),
            OrchestratorStatus::Starting => write!(f, "starting"),
            OrchestratorStatus::Running => write!(f, "running"),
            OrchestratorStatus::Paused => write!(f, "paused"),
            OrchestratorStatus::Stopping => write!(f, "stopping"),
            OrchestratorStatus::Stopped => write!(f, "stopped"),
            OrchestratorStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Admitted, waiting for a worker-pool slot.
    Queued,
    Running,
}

/// A source execution currently admitted by the gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveJob {
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub status: JobStatus,
}

/// Aggregate counters kept alongside the per-source metrics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SystemCounters {
    pub total_leads_processed: u64,
    pub leads_exported: u64,
    pub total_errors: u64,
}

/// Result of a control operation. Control operations report failures here
/// instead of returning errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlOutcome {
    pub success: bool,
    pub status: OrchestratorStatus,
    pub message: String,
}

impl ControlOutcome {
    pub fn ok(status: OrchestratorStatus, message: impl Into<String>) -> Self {
        Self {
            success: true,
            status,
            message: message.into(),
        }
    }

    pub fn failed(status: OrchestratorStatus, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status,
            message: message.into(),
        }
    }
}

/// What happened to a manual or scheduled dispatch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Admitted and handed to the worker pool.
    Dispatched,
    /// Turned away by the concurrency gate; the next tick retries.
    Rejected { reason: String },
    /// The orchestrator is not running or the source is unknown/inactive.
    Skipped { reason: String },
}
