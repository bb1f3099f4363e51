use crate::config::OrchestratorConfig;
use crate::performance::PerformanceMetrics;
use crate::resource::PressureLevel;
use leadflow_core::Source;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Active sources ordered by descending priority score.
///
/// The sort is stable, so sources with equal scores keep catalogue order.
/// Sources that have never run score zero.
pub fn prioritize_sources(
    sources: &[Source],
    metrics: &HashMap<String, PerformanceMetrics>,
) -> Vec<Source> {
    let score = |s: &Source| metrics.get(&s.id).map_or(0.0, |m| m.priority_score);
    let mut active: Vec<Source> = sources.iter().filter(|s| s.active).cloned().collect();
    active.sort_by(|a, b| score(b).total_cmp(&score(a)));
    active
}

/// Interval at which a source should run, derived from its track record.
///
/// Always within `[min_interval, max_interval]`; sources that have not run
/// yet run at `min_interval`.
pub fn determine_optimal_frequency(
    metrics: Option<&PerformanceMetrics>,
    config: &OrchestratorConfig,
) -> Duration {
    let min = config.min_interval();
    let Some(m) = metrics.filter(|m| m.executions > 0) else {
        return min;
    };
    let c = &config.frequency;
    let error_term =
        (f64::from(m.consecutive_errors) / f64::from(c.error_saturation.max(1))).min(1.0);
    let adjustment = 1.0
        + c.quality * (1.0 - m.quality_score)
        + c.success * (1.0 - m.success_rate)
        + c.error * error_term;
    clamp_interval(min.as_secs_f64() * adjustment, config)
}

/// `now + delay`, saturating at roughly thirty years out instead of
/// overflowing.
pub(crate) fn deadline_after(delay: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);
    let now = Instant::now();
    now.checked_add(delay.min(FAR_FUTURE))
        .or_else(|| now.checked_add(Duration::from_secs(86_400)))
        .unwrap_or(now)
}

/// Clamp a raw interval (seconds) into the configured window.
pub fn clamp_interval(seconds: f64, config: &OrchestratorConfig) -> Duration {
    let min = config.min_interval().as_secs_f64();
    let max = config.max_interval().as_secs_f64();
    let seconds = if seconds.is_finite() { seconds } else { max };
    Duration::try_from_secs_f64(seconds.clamp(min, max)).unwrap_or_else(|_| config.max_interval())
}

/// Stretch multiplier for a given pressure ratio, in `[1.2, 2.0]`.
pub fn stretch_factor(pressure_ratio: f64) -> f64 {
    let factor = 1.2 + 2.0 * (pressure_ratio - 1.0);
    if factor.is_finite() {
        factor.clamp(1.2, 2.0)
    } else {
        2.0
    }
}

/// How many of `total` sources to stretch at the given pressure level.
pub fn stretch_quota(total: usize, level: PressureLevel) -> usize {
    match level {
        PressureLevel::Critical => total.div_ceil(2),
        PressureLevel::Moderate => total.div_ceil(3),
        PressureLevel::Normal | PressureLevel::Elevated => total.min(1),
    }
}

struct ArmedTimer {
    interval: Duration,
    token: CancellationToken,
}

#[derive(Default)]
struct SchedulerState {
    timers: HashMap<String, ArmedTimer>,
    stretch: HashMap<String, f64>,
}

/// Owns one recurring timer per scheduled source.
///
/// Each timer pushes its source id into the fire channel every period; the
/// orchestrator's dispatch loop decides whether the firing is admitted. A
/// full channel drops the tick, the next one retries.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    fire_tx: mpsc::Sender<String>,
}

impl Scheduler {
    pub fn new(fire_tx: mpsc::Sender<String>) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            fire_tx,
        }
    }

    #[cfg(test)]
    pub(crate) fn fire_sender(&self) -> mpsc::Sender<String> {
        self.fire_tx.clone()
    }

    /// Compute the interval of every source in `prioritized`, applying any
    /// active pressure stretch.
    pub fn plan(
        &self,
        prioritized: &[Source],
        metrics: &HashMap<String, PerformanceMetrics>,
        config: &OrchestratorConfig,
    ) -> Vec<(String, Duration)> {
        let state = self.state.lock();
        prioritized
            .iter()
            .map(|s| {
                let base = determine_optimal_frequency(metrics.get(&s.id), config);
                let factor = state.stretch.get(&s.id).copied().unwrap_or(1.0);
                (s.id.clone(), clamp_interval(base.as_secs_f64() * factor, config))
            })
            .collect()
    }

    /// Cancel every timer and arm exactly the given set.
    pub fn arm_all(&self, plan: &[(String, Duration)], parent: &CancellationToken) {
        let mut state = self.state.lock();
        for (_, timer) in state.timers.drain() {
            timer.token.cancel();
        }
        for (id, interval) in plan {
            let timer = self.spawn_timer(id.clone(), *interval, parent);
            state.timers.insert(id.clone(), timer);
        }
        info!(timers = state.timers.len(), "Scheduler: timers armed");
    }

    /// Re-arm a single source at a new interval.
    pub fn rearm(&self, source_id: &str, interval: Duration, parent: &CancellationToken) {
        let mut state = self.state.lock();
        if let Some(old) = state.timers.remove(source_id) {
            old.token.cancel();
        }
        let timer = self.spawn_timer(source_id.to_string(), interval, parent);
        state.timers.insert(source_id.to_string(), timer);
    }

    /// Cancel every timer. Stretch factors survive so a later re-arm keeps them.
    pub fn cancel_all(&self) {
        let mut state = self.state.lock();
        let count = state.timers.len();
        for (_, timer) in state.timers.drain() {
            timer.token.cancel();
        }
        debug!(timers = count, "Scheduler: timers cancelled");
    }

    pub fn interval_of(&self, source_id: &str) -> Option<Duration> {
        self.state.lock().timers.get(source_id).map(|t| t.interval)
    }

    pub fn intervals(&self) -> HashMap<String, Duration> {
        self.state
            .lock()
            .timers
            .iter()
            .map(|(id, t)| (id.clone(), t.interval))
            .collect()
    }

    pub fn armed_count(&self) -> usize {
        self.state.lock().timers.len()
    }

    pub fn set_stretch(&self, source_id: &str, factor: f64) {
        self.state.lock().stretch.insert(source_id.to_string(), factor);
    }

    pub fn stretch_of(&self, source_id: &str) -> f64 {
        self.state.lock().stretch.get(source_id).copied().unwrap_or(1.0)
    }

    /// Drop all stretches. Returns whether any were set.
    pub fn clear_stretches(&self) -> bool {
        let mut state = self.state.lock();
        let had_any = !state.stretch.is_empty();
        state.stretch.clear();
        had_any
    }

    pub fn forget(&self, source_id: &str) {
        let mut state = self.state.lock();
        if let Some(timer) = state.timers.remove(source_id) {
            timer.token.cancel();
        }
        state.stretch.remove(source_id);
    }

    fn spawn_timer(
        &self,
        source_id: String,
        interval: Duration,
        parent: &CancellationToken,
    ) -> ArmedTimer {
        let token = parent.child_token();
        let task_token = token.clone();
        let tx = self.fire_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(deadline_after(interval), interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        match tx.try_send(source_id.clone()) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                debug!(source_id = %source_id, "Scheduler: dispatch backlog full, tick dropped");
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                }
            }
        });
        ArmedTimer { interval, token }
    }
}
