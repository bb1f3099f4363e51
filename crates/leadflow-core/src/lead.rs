use crate::LeadflowError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a lead once it has left the source worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Validated,
    Enriched,
    Exported,
}

/// A candidate record produced by a source worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub source_id: String,
    pub status: LeadStatus,
    /// Extracted fields, opaque to the orchestrator.
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(source_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id: source_id.into(),
            status: LeadStatus::New,
            data,
            created_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: LeadStatus) -> Self {
        self.status = status;
        self
    }
}

/// Result of running a lead through one pipeline stage.
///
/// Rejections are ordinary outcomes, not errors: the pipeline drops the lead
/// and moves on. `Failed` covers the stage itself breaking.
#[derive(Debug)]
pub enum LeadOutcome {
    Accepted(Lead),
    Rejected { reason: String },
    Failed(LeadflowError),
}

impl LeadOutcome {
    pub fn rejected(reason: impl Into<String>) -> Self {
        LeadOutcome::Rejected {
            reason: reason.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, LeadOutcome::Accepted(_))
    }
}
