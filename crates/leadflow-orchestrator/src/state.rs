use crate::performance::PerformanceMetrics;
use crate::resource::ResourceSample;
use crate::types::{ActiveJob, OrchestratorStatus, SystemCounters};
use leadflow_core::Source;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

/// Everything the scheduler callbacks, job completions and the resource
/// monitor mutate. Guarded by a single `parking_lot::Mutex`; never held
/// across an `.await`.
pub(crate) struct SharedState {
    pub status: OrchestratorStatus,
    /// Catalogue order is preserved for stable prioritization.
    pub sources: Vec<Source>,
    pub metrics: HashMap<String, PerformanceMetrics>,
    pub active_jobs: HashMap<String, ActiveJob>,
    pub last_completed: HashMap<String, Instant>,
    /// Per-source execution locks, only ever try-acquired.
    pub source_locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    pub max_concurrent_sources: usize,
    pub counters: SystemCounters,
    pub last_sample: ResourceSample,
    pub started_at: Option<Instant>,
}

impl SharedState {
    pub fn new(max_concurrent_sources: usize) -> Self {
        Self {
            status: OrchestratorStatus::Initialized,
            sources: Vec::new(),
            metrics: HashMap::new(),
            active_jobs: HashMap::new(),
            last_completed: HashMap::new(),
            source_locks: HashMap::new(),
            max_concurrent_sources,
            counters: SystemCounters::default(),
            last_sample: ResourceSample::default(),
            started_at: None,
        }
    }

    pub fn source(&self, id: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.id == id)
    }

    pub fn active_source_count(&self) -> usize {
        self.sources.iter().filter(|s| s.active).count()
    }

    /// Metrics for `id`, created on first use.
    pub fn metrics_entry(&mut self, id: &str, window: usize) -> &mut PerformanceMetrics {
        self.metrics
            .entry(id.to_string())
            .or_insert_with(|| PerformanceMetrics::new(window))
    }
}
