use crate::lead::{Lead, LeadOutcome, LeadStatus};
use crate::source::{Source, SourceKind};
use crate::LeadflowResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// What a worker hands back after one run against a source.
///
/// Expected failures (HTTP 5xx, parse errors) are reported through `error`
/// and may come with whatever leads were extracted before the failure.
#[derive(Debug, Default)]
pub struct WorkerOutput {
    pub leads: Vec<Lead>,
    pub error: Option<String>,
}

impl WorkerOutput {
    pub fn ok(leads: Vec<Lead>) -> Self {
        Self { leads, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            leads: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Pulls leads out of one kind of source (feed, crawler, portal, API).
#[async_trait]
pub trait SourceWorker: Send + Sync {
    /// The source kind this worker handles.
    fn kind(&self) -> SourceKind;

    async fn execute(&self, source: &Source, timeout: Duration) -> WorkerOutput;
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, lead: Lead) -> LeadOutcome;
}

#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, lead: Lead) -> LeadOutcome;
}

/// Durable lead storage. Upserts must be idempotent: delivery is at-least-once.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn save_lead(&self, lead: &Lead) -> LeadflowResult<()>;
    async fn update_lead_status(&self, id: Uuid, status: LeadStatus) -> LeadflowResult<()>;
}

/// Durable catalogue of configured sources.
#[async_trait]
pub trait SourceRegistry: Send + Sync {
    async fn load(&self) -> LeadflowResult<Vec<Source>>;
    async fn add(&self, source: &Source) -> LeadflowResult<()>;
    async fn update(&self, source: &Source) -> LeadflowResult<()>;
    async fn remove(&self, id: &str) -> LeadflowResult<()>;
}

/// Statistics returned by one export run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportStats {
    pub exported: u64,
    pub failed: u64,
    /// Ids of the leads that reached the downstream system.
    #[serde(default)]
    pub exported_ids: Vec<Uuid>,
}

/// Pushes stored leads to the downstream CRM.
#[async_trait]
pub trait ExportScheduler: Send + Sync {
    async fn run_export(&self) -> LeadflowResult<ExportStats>;
}
