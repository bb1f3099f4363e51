//! Core types and error definitions for the leadflow orchestrator.
//!
//! This crate provides the foundational types shared by the orchestration
//! engine and by the collaborators it drives: the error type, the source and
//! lead data model, and the narrow contracts the engine consumes.
//!
//! # Main types
//!
//! - [`LeadflowError`] — Unified error enum for all leadflow subsystems.
//! - [`LeadflowResult`] — Convenience alias for `Result<T, LeadflowError>`.
//! - [`Source`] / [`SourceKind`] — A configured data origin and its worker type.
//! - [`Lead`] / [`LeadStatus`] — A candidate record extracted by a worker.
//! - [`LeadOutcome`] — Explicit `Accepted | Rejected | Failed` result of a lead stage.
//! - [`SourceWorker`], [`Validator`], [`Enricher`], [`Storage`],
//!   [`SourceRegistry`], [`ExportScheduler`] — external collaborator contracts.

/// Candidate records and per-stage outcomes.
pub mod lead;
/// Source catalogue implementations (in-memory and TOML file).
pub mod registry;
/// Configured data sources.
pub mod source;
/// Collaborator contracts consumed by the orchestrator.
pub mod traits;

pub use lead::{Lead, LeadOutcome, LeadStatus};
pub use registry::{FileSourceRegistry, InMemorySourceRegistry};
pub use source::{Source, SourceKind};
pub use traits::{
    Enricher, ExportScheduler, ExportStats, SourceRegistry, SourceWorker, Storage, Validator,
    WorkerOutput,
};

// --- Error types ---

/// Top-level error type for leadflow.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Debug, thiserror::Error)]
pub enum LeadflowError {
    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A source definition is invalid or unknown.
    #[error("Source error: {0}")]
    Source(String),

    /// A source worker failed to execute.
    #[error("Worker error: {0}")]
    Worker(String),

    /// A lead failed validation unexpectedly (not a plain rejection).
    #[error("Validation error: {0}")]
    Validation(String),

    /// A lead failed enrichment.
    #[error("Enrichment error: {0}")]
    Enrichment(String),

    /// Persisting or updating a lead failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The source catalogue could not be read or written.
    #[error("Registry error: {0}")]
    Registry(String),

    /// The export pipeline failed.
    #[error("Export error: {0}")]
    Export(String),

    /// An error from the orchestration engine itself.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// An operation exceeded its deadline.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`LeadflowError`].
pub type LeadflowResult<T> = Result<T, LeadflowError>;
