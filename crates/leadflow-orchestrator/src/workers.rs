use leadflow_core::{LeadflowError, LeadflowResult, Source, SourceKind, SourceWorker};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Maps each source kind to the worker that executes it. Filled once when
/// the orchestrator is built.
pub struct WorkerRegistry {
    workers: HashMap<SourceKind, Arc<dyn SourceWorker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }

    /// Register a worker under its own kind, replacing any previous one.
    pub fn register(&mut self, worker: Arc<dyn SourceWorker>) {
        let kind = worker.kind();
        info!(kind = %kind, "Registered source worker");
        self.workers.insert(kind, worker);
    }

    pub fn get(&self, kind: SourceKind) -> Option<&Arc<dyn SourceWorker>> {
        self.workers.get(&kind)
    }

    /// Worker for `source`, or a `Worker` error naming the missing kind.
    pub fn resolve(&self, source: &Source) -> LeadflowResult<Arc<dyn SourceWorker>> {
        self.workers.get(&source.kind).cloned().ok_or_else(|| {
            LeadflowError::Worker(format!(
                "No worker registered for source type '{}' (source '{}')",
                source.kind, source.id
            ))
        })
    }

    pub fn kinds(&self) -> Vec<SourceKind> {
        self.workers.keys().copied().collect()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
