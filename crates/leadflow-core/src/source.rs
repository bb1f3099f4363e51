use crate::{LeadflowError, LeadflowResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kind of worker that knows how to pull leads out of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// RSS/Atom or JSON feed reader.
    Feed,
    /// Generic site crawler.
    Crawler,
    /// Building/permit portal scraper.
    PermitPortal,
    /// Document API puller (search or filing APIs).
    DocumentApi,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Feed => write!(f, "feed"),
            SourceKind::Crawler => write!(f, "crawler"),
            SourceKind::PermitPortal => write!(f, "permit_portal"),
            SourceKind::DocumentApi => write!(f, "document_api"),
        }
    }
}

/// A configured external data origin the orchestrator schedules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub endpoint: String,
    /// Worker-specific settings, passed through untouched.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub config: serde_json::Value,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Minimum spacing between two executions of this source.
    #[serde(default)]
    pub cooldown_minutes: u64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_active() -> bool {
    true
}

fn default_timeout_seconds() -> u64 {
    300
}

impl Source {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: SourceKind,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            endpoint: endpoint.into(),
            config: serde_json::Value::Null,
            active: true,
            cooldown_minutes: 0,
            timeout_seconds: default_timeout_seconds(),
        }
    }

    pub fn with_cooldown_minutes(mut self, minutes: u64) -> Self {
        self.cooldown_minutes = minutes;
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_minutes.saturating_mul(60))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Reject definitions the engine cannot schedule.
    pub fn validate(&self) -> LeadflowResult<()> {
        if self.id.trim().is_empty() {
            return Err(LeadflowError::Source("source id must not be empty".into()));
        }
        if self.timeout_seconds == 0 {
            return Err(LeadflowError::Source(format!(
                "source '{}' has a zero timeout",
                self.id
            )));
        }
        Ok(())
    }
}
