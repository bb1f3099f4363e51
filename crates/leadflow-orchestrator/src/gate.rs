//! Admission control for source executions.
//!
//! A due source is admitted only when no job for it is active, the number of
//! active jobs is below `max_concurrent_sources`, its cooldown has elapsed,
//! and its execution lock can be taken without waiting. Rejections are plain
//! values; the scheduler simply retries on the next tick.

use crate::state::SharedState;
use crate::types::{ActiveJob, JobStatus};
use chrono::Utc;
use leadflow_core::Source;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::debug;

/// Why a due source was not admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    AlreadyActive,
    AtCapacity { active: usize, limit: usize },
    CoolingDown { remaining: Duration },
    /// The source's execution lock is held elsewhere.
    LockBusy,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::AlreadyActive => write!(f, "a job for this source is already active"),
            Rejection::AtCapacity { active, limit } => {
                write!(f, "at capacity ({active}/{limit} sources running)")
            }
            Rejection::CoolingDown { remaining } => {
                write!(f, "cooling down for another {}s", remaining.as_secs())
            }
            Rejection::LockBusy => write!(f, "source lock busy"),
        }
    }
}

/// Proof of admission. Dropping it removes the ActiveJob, records the
/// completion time for cooldown purposes and releases the source lock,
/// whatever the job's outcome (including a panic).
pub struct AdmissionTicket {
    source_id: String,
    state: Arc<Mutex<SharedState>>,
    started: Instant,
    _lock: OwnedMutexGuard<()>,
}

impl AdmissionTicket {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Flip the ActiveJob from queued to running once a pool slot is held.
    pub fn mark_running(&self) {
        if let Some(job) = self.state.lock().active_jobs.get_mut(&self.source_id) {
            job.status = JobStatus::Running;
        }
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.active_jobs.remove(&self.source_id);
        state
            .last_completed
            .insert(self.source_id.clone(), Instant::now());
        debug!(source_id = %self.source_id, active = state.active_jobs.len(), "Gate: job released");
    }
}

/// Handle onto the shared state that performs admission.
#[derive(Clone)]
pub struct ConcurrencyGate {
    state: Arc<Mutex<SharedState>>,
}

impl ConcurrencyGate {
    pub(crate) fn new(state: Arc<Mutex<SharedState>>) -> Self {
        Self { state }
    }

    /// Admit `source` or say why not. Never waits.
    pub fn try_admit(&self, source: &Source) -> Result<AdmissionTicket, Rejection> {
        let mut state = self.state.lock();

        if state.active_jobs.contains_key(&source.id) {
            return Err(Rejection::AlreadyActive);
        }
        let active = state.active_jobs.len();
        let limit = state.max_concurrent_sources;
        if active >= limit {
            return Err(Rejection::AtCapacity { active, limit });
        }
        let cooldown = source.cooldown();
        if let Some(last) = state.last_completed.get(&source.id) {
            let since = last.elapsed();
            if since < cooldown {
                return Err(Rejection::CoolingDown {
                    remaining: cooldown - since,
                });
            }
        }

        let lock = state
            .source_locks
            .entry(source.id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = lock.try_lock_owned().map_err(|_| Rejection::LockBusy)?;

        state.active_jobs.insert(
            source.id.clone(),
            ActiveJob {
                source_id: source.id.clone(),
                started_at: Utc::now(),
                status: JobStatus::Queued,
            },
        );

        Ok(AdmissionTicket {
            source_id: source.id.clone(),
            state: Arc::clone(&self.state),
            started: Instant::now(),
            _lock: guard,
        })
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active_jobs.len()
    }

    pub fn is_active(&self, source_id: &str) -> bool {
        self.state.lock().active_jobs.contains_key(source_id)
    }

    pub fn limit(&self) -> usize {
        self.state.lock().max_concurrent_sources
    }

    /// Lower the limit by one, never below one. Returns `(old, new)`.
    pub fn reduce_limit(&self) -> (usize, usize) {
        let mut state = self.state.lock();
        let old = state.max_concurrent_sources;
        state.max_concurrent_sources = old.saturating_sub(1).max(1);
        (old, state.max_concurrent_sources)
    }

    /// Raise the limit by one, never above `ceiling`. Returns `(old, new)`.
    pub fn raise_limit(&self, ceiling: usize) -> (usize, usize) {
        let mut state = self.state.lock();
        let old = state.max_concurrent_sources;
        if old < ceiling {
            state.max_concurrent_sources = old + 1;
        }
        (old, state.max_concurrent_sources)
    }

    pub(crate) fn forget(&self, source_id: &str) {
        let mut state = self.state.lock();
        state.last_completed.remove(source_id);
        if !state.active_jobs.contains_key(source_id) {
            state.source_locks.remove(source_id);
        }
    }
}
