//! Lead-source orchestration engine with adaptive scheduling, admission
//! control and resource-pressure handling.
//!
//! Drives a catalogue of heterogeneous lead sources: each source gets a
//! recurring timer whose period adapts to its track record, executions pass
//! through a non-blocking concurrency gate into a bounded worker pool, and
//! extracted leads flow through validate → enrich → persist in batches.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Lifecycle, scheduling, dispatch and control surface.
//! - [`OrchestratorConfig`] — TOML-loadable tuning knobs.
//! - [`PerformanceMetrics`] — Per-source sliding-window performance tracker.
//! - [`Scheduler`] — One recurring timer per active source.
//! - [`ConcurrencyGate`] — Admission control for source executions.
//! - [`ResourceMonitor`] — CPU/memory escalation ladder.
//! - [`LeadPipeline`] — Batched validate → enrich → persist.
//! - [`SystemMetricsSnapshot`] — Read-only view for dashboards.

/// Orchestrator configuration.
pub mod config;
/// The orchestrator itself.
pub mod engine;
/// Cron helpers for the export loop.
pub mod export;
/// Admission control.
pub mod gate;
/// Metrics snapshots.
pub mod metrics;
/// Per-source performance tracking.
pub mod performance;
/// Batched lead processing.
pub mod pipeline;
/// Resource sampling and escalation.
pub mod resource;
/// Prioritization, interval computation and timers.
pub mod scheduler;
/// Tracing subscriber setup.
pub mod telemetry;
/// Status enums and control results.
pub mod types;
/// Source-kind → worker dispatch table.
pub mod workers;

mod state;

pub use config::{ExportConfig, FrequencyCoefficients, OrchestratorConfig, PriorityWeights};
pub use engine::{BalanceAction, BalanceReport, Orchestrator, OrchestratorBuilder};
pub use gate::{AdmissionTicket, ConcurrencyGate, Rejection};
pub use metrics::{SourceMetricsSnapshot, SystemMetricsSnapshot};
pub use performance::{compute_priority, ExecutionSample, PerformanceMetrics};
pub use pipeline::{BatchReport, LeadPipeline};
pub use resource::{
    EscalationPlan, PressureLevel, ResourceMonitor, ResourceProbe, ResourceSample, SysinfoProbe,
};
pub use scheduler::Scheduler;
pub use telemetry::init_tracing;
pub use types::{
    ActiveJob, ControlOutcome, DispatchOutcome, JobStatus, OrchestratorStatus, SystemCounters,
};
pub use workers::WorkerRegistry;
