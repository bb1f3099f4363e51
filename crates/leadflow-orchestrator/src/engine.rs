use crate::config::OrchestratorConfig;
use crate::export::{delay_until_next, parse_cron};
use crate::gate::{AdmissionTicket, ConcurrencyGate};
use crate::metrics::{SourceMetricsSnapshot, SystemMetricsSnapshot};
use crate::pipeline::{BatchReport, LeadPipeline};
use crate::resource::{PressureLevel, ResourceMonitor, ResourceProbe, ResourceSample, SysinfoProbe};
use crate::scheduler::{
    clamp_interval, deadline_after, determine_optimal_frequency, prioritize_sources,
    stretch_factor, stretch_quota, Scheduler,
};
use crate::state::SharedState;
use crate::types::{ControlOutcome, DispatchOutcome, OrchestratorStatus};
use crate::workers::WorkerRegistry;
use chrono::Utc;
use futures_util::FutureExt;
use leadflow_core::{
    Enricher, ExportScheduler, ExportStats, Lead, LeadStatus, LeadflowError, LeadflowResult,
    Source, SourceRegistry, SourceWorker, Storage, Validator, WorkerOutput,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Capacity of the timer → dispatcher channel. Ticks beyond it are dropped.
const FIRE_CHANNEL_CAPACITY: usize = 1024;

/// What made a source run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Scheduled,
    Manual,
}

/// One step the resource monitor took.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceAction {
    Throttled { from: usize, to: usize },
    SchedulesStretched { sources: usize },
    Paused,
    ConcurrencyRestored { from: usize, to: usize },
    StretchesCleared,
}

/// Outcome of one resource check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceReport {
    pub sample: ResourceSample,
    pub pressure_ratio: f64,
    pub level: PressureLevel,
    pub actions: Vec<BalanceAction>,
}

/// Background machinery of one start → shutdown cycle.
struct Runtime {
    token: CancellationToken,
    jobs: TaskTracker,
    loops: Vec<JoinHandle<()>>,
}

struct Inner {
    config: OrchestratorConfig,
    state: Arc<Mutex<SharedState>>,
    gate: ConcurrencyGate,
    scheduler: Scheduler,
    fire_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    workers: WorkerRegistry,
    pipeline: Option<LeadPipeline>,
    registry: Option<Arc<dyn SourceRegistry>>,
    exporter: Option<Arc<dyn ExportScheduler>>,
    monitor: ResourceMonitor,
    pool: Arc<Semaphore>,
    runtime: Mutex<Option<Runtime>>,
    auto_resume: Mutex<Option<CancellationToken>>,
    /// Serializes start and shutdown.
    lifecycle: tokio::sync::Mutex<()>,
    init_error: Option<String>,
}

/// Assembles an [`Orchestrator`] from its collaborators.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    workers: WorkerRegistry,
    validator: Option<Arc<dyn Validator>>,
    enricher: Option<Arc<dyn Enricher>>,
    storage: Option<Arc<dyn Storage>>,
    registry: Option<Arc<dyn SourceRegistry>>,
    exporter: Option<Arc<dyn ExportScheduler>>,
    probe: Option<Box<dyn ResourceProbe>>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            workers: WorkerRegistry::new(),
            validator: None,
            enricher: None,
            storage: None,
            registry: None,
            exporter: None,
            probe: None,
        }
    }

    pub fn worker(mut self, worker: Arc<dyn SourceWorker>) -> Self {
        self.workers.register(worker);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn SourceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn exporter(mut self, exporter: Arc<dyn ExportScheduler>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Replace the default `sysinfo` probe.
    pub fn resource_probe(mut self, probe: Box<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Build the orchestrator. Missing required collaborators do not fail
    /// here: the orchestrator comes up in `Error` and refuses to start.
    pub fn build(self) -> Orchestrator {
        let mut missing = Vec::new();
        if self.validator.is_none() {
            missing.push("validator");
        }
        if self.enricher.is_none() {
            missing.push("enricher");
        }
        if self.storage.is_none() {
            missing.push("storage");
        }
        if self.registry.is_none() {
            missing.push("source registry");
        }
        if self.workers.worker_count() == 0 {
            missing.push("source workers");
        }

        let pipeline = match (self.validator, self.enricher, self.storage) {
            (Some(v), Some(e), Some(s)) => {
                Some(LeadPipeline::new(v, e, s, self.config.lead_batch_size))
            }
            _ => None,
        };

        let init_error = if missing.is_empty() {
            None
        } else {
            Some(format!("missing required collaborators: {}", missing.join(", ")))
        };

        let mut shared = SharedState::new(self.config.max_concurrent_sources);
        if let Some(reason) = &init_error {
            error!(reason = %reason, "Orchestrator: initialization failed");
            shared.status = OrchestratorStatus::Error;
        }
        let state = Arc::new(Mutex::new(shared));
        let (fire_tx, fire_rx) = mpsc::channel(FIRE_CHANNEL_CAPACITY);
        let probe = self.probe.unwrap_or_else(|| Box::new(SysinfoProbe::new()));

        Orchestrator {
            inner: Arc::new(Inner {
                gate: ConcurrencyGate::new(Arc::clone(&state)),
                state,
                scheduler: Scheduler::new(fire_tx),
                fire_rx: tokio::sync::Mutex::new(fire_rx),
                workers: self.workers,
                pipeline,
                registry: self.registry,
                exporter: self.exporter,
                monitor: ResourceMonitor::new(probe),
                pool: Arc::new(Semaphore::new(self.config.max_workers.max(1))),
                runtime: Mutex::new(None),
                auto_resume: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                init_error,
                config: self.config,
            }),
        }
    }
}

/// Root of the engine: lifecycle, scheduling, admission, lead pipeline.
///
/// Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn status(&self) -> OrchestratorStatus {
        self.inner.state.lock().status
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.inner.gate
    }

    pub fn sources(&self) -> Vec<Source> {
        self.inner.state.lock().sources.clone()
    }

    fn set_status(&self, status: OrchestratorStatus) {
        let mut state = self.inner.state.lock();
        if state.status != status {
            info!(from = %state.status, to = %status, "Orchestrator: status change");
            state.status = status;
        }
    }

    fn runtime_token(&self) -> Option<CancellationToken> {
        self.inner
            .runtime
            .lock()
            .as_ref()
            .filter(|rt| !rt.token.is_cancelled())
            .map(|rt| rt.token.clone())
    }

    // --- Lifecycle ---

    /// Load sources, start the background loops and arm the schedule.
    ///
    /// A no-op unless the orchestrator is `Initialized`, `Stopped` or
    /// `Error`. From `Error` initialization is attempted again.
    pub async fn start_processing(&self) -> ControlOutcome {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let current = self.status();
        if !current.can_start() {
            info!(status = %current, "Orchestrator: start ignored");
            return ControlOutcome::ok(current, format!("start ignored: orchestrator is {current}"));
        }
        self.set_status(OrchestratorStatus::Starting);

        let sources = match self.initialize().await {
            Ok(sources) => sources,
            Err(e) => {
                error!(error = %e, "Orchestrator: initialization failed");
                self.set_status(OrchestratorStatus::Error);
                return ControlOutcome::failed(OrchestratorStatus::Error, e.to_string());
            }
        };

        {
            let mut state = self.inner.state.lock();
            let known: Vec<&str> = sources.iter().map(|s| s.id.as_str()).collect();
            state.metrics.retain(|id, _| known.contains(&id.as_str()));
            state.sources = sources;
            state.max_concurrent_sources = self.inner.config.max_concurrent_sources;
            state.started_at = Some(Instant::now());
        }
        self.inner.monitor.reset();

        let token = CancellationToken::new();
        let mut loops = vec![
            tokio::spawn(self.clone().dispatch_loop(token.clone())),
            tokio::spawn(self.clone().resource_loop(token.clone())),
        ];
        if self.inner.config.export.enabled {
            if self.inner.exporter.is_some() {
                loops.push(tokio::spawn(self.clone().export_loop(token.clone())));
            } else {
                warn!("Orchestrator: export enabled but no export scheduler configured");
            }
        }
        *self.inner.runtime.lock() = Some(Runtime {
            token,
            jobs: TaskTracker::new(),
            loops,
        });

        self.set_status(OrchestratorStatus::Running);
        let scheduled = self.schedule_source_processing();
        info!(scheduled, "Orchestrator: processing started");
        ControlOutcome::ok(
            OrchestratorStatus::Running,
            format!("started with {scheduled} scheduled sources"),
        )
    }

    async fn initialize(&self) -> LeadflowResult<Vec<Source>> {
        if let Some(reason) = &self.inner.init_error {
            return Err(LeadflowError::Orchestrator(reason.clone()));
        }
        self.inner.config.validate()?;
        let registry = self
            .inner
            .registry
            .as_ref()
            .ok_or_else(|| LeadflowError::Orchestrator("no source registry".into()))?;
        let loaded = registry.load().await?;

        let mut sources: Vec<Source> = Vec::with_capacity(loaded.len());
        for source in loaded {
            if let Err(e) = source.validate() {
                warn!(source_id = %source.id, error = %e, "Orchestrator: skipping invalid source");
                continue;
            }
            if sources.iter().any(|s| s.id == source.id) {
                warn!(source_id = %source.id, "Orchestrator: skipping duplicate source id");
                continue;
            }
            if self.inner.workers.get(source.kind).is_none() {
                warn!(
                    source_id = %source.id,
                    kind = %source.kind,
                    "Orchestrator: no worker for source type, runs will fail"
                );
            }
            sources.push(source);
        }
        info!(
            sources = sources.len(),
            worker_kinds = ?self.inner.workers.kinds(),
            "Orchestrator: sources loaded"
        );
        Ok(sources)
    }

    /// Suspend the scheduler. An auto-resume fires after `pause_cooldown`.
    pub fn pause_processing(&self) -> ControlOutcome {
        {
            let mut state = self.inner.state.lock();
            if state.status != OrchestratorStatus::Running {
                return ControlOutcome::failed(
                    state.status,
                    format!("cannot pause: orchestrator is {}", state.status),
                );
            }
            state.status = OrchestratorStatus::Paused;
        }
        self.inner.scheduler.cancel_all();

        let cooldown = self.inner.config.pause_cooldown();
        if let Some(parent) = self.runtime_token() {
            let token = parent.child_token();
            if let Some(previous) = self.inner.auto_resume.lock().replace(token.clone()) {
                previous.cancel();
            }
            let this = self.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(cooldown) => {
                        info!("Orchestrator: pause cooldown elapsed, resuming");
                        this.resume_processing();
                    }
                }
            });
        }
        warn!(cooldown_secs = cooldown.as_secs(), "Orchestrator: processing paused");
        ControlOutcome::ok(
            OrchestratorStatus::Paused,
            format!("paused, auto-resume in {}s", cooldown.as_secs()),
        )
    }

    /// Resume a paused orchestrator and re-arm the schedule.
    pub fn resume_processing(&self) -> ControlOutcome {
        {
            let mut state = self.inner.state.lock();
            if state.status != OrchestratorStatus::Paused {
                return ControlOutcome::failed(
                    state.status,
                    format!("cannot resume: orchestrator is {}", state.status),
                );
            }
            state.status = OrchestratorStatus::Running;
        }
        if let Some(token) = self.inner.auto_resume.lock().take() {
            token.cancel();
        }
        let scheduled = self.schedule_source_processing();
        info!(scheduled, "Orchestrator: processing resumed");
        ControlOutcome::ok(OrchestratorStatus::Running, "resumed")
    }

    /// Stop everything and wait (bounded) for in-flight jobs. Safe to call
    /// any number of times and from any state.
    pub async fn shutdown_gracefully(&self) -> ControlOutcome {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.status() == OrchestratorStatus::Stopped {
            return ControlOutcome::ok(OrchestratorStatus::Stopped, "already stopped");
        }
        self.set_status(OrchestratorStatus::Stopping);

        if let Some(token) = self.inner.auto_resume.lock().take() {
            token.cancel();
        }
        self.inner.scheduler.cancel_all();

        let runtime = self.inner.runtime.lock().take();
        let mut clean = true;
        if let Some(runtime) = runtime {
            runtime.token.cancel();
            runtime.jobs.close();
            let deadline = deadline_after(self.inner.config.shutdown_timeout());

            if tokio::time::timeout_at(deadline, runtime.jobs.wait())
                .await
                .is_err()
            {
                clean = false;
                warn!(
                    in_flight = runtime.jobs.len(),
                    "Orchestrator: shutdown timeout reached with jobs still running"
                );
            }
            for handle in runtime.loops {
                match tokio::time::timeout_at(deadline, handle).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        clean = false;
                        error!(error = %e, "Orchestrator: background loop ended abnormally");
                    }
                    Err(_) => {
                        clean = false;
                        warn!("Orchestrator: background loop did not stop in time");
                    }
                }
            }
        }

        {
            let mut state = self.inner.state.lock();
            state.started_at = None;
        }
        self.set_status(OrchestratorStatus::Stopped);
        info!(clean, "Orchestrator: shutdown complete");
        ControlOutcome::ok(
            OrchestratorStatus::Stopped,
            if clean {
                "stopped"
            } else {
                "stopped (some tasks did not finish in time)"
            },
        )
    }

    /// Wait for Ctrl-C, then shut down.
    pub async fn shutdown_on_signal(&self) -> ControlOutcome {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Orchestrator: failed to listen for shutdown signal");
            return ControlOutcome::failed(self.status(), format!("signal listener failed: {e}"));
        }
        info!("Orchestrator: shutdown signal received");
        self.shutdown_gracefully().await
    }

    // --- Scheduling ---

    /// Active sources by descending priority.
    pub fn prioritize_sources(&self) -> Vec<Source> {
        let state = self.inner.state.lock();
        prioritize_sources(&state.sources, &state.metrics)
    }

    /// Unstretched interval for `source_id`; `None` for unknown sources.
    pub fn determine_optimal_frequency(&self, source_id: &str) -> Option<Duration> {
        let state = self.inner.state.lock();
        state.source(source_id)?;
        Some(determine_optimal_frequency(
            state.metrics.get(source_id),
            &self.inner.config,
        ))
    }

    /// Currently armed interval for `source_id`.
    pub fn scheduled_interval(&self, source_id: &str) -> Option<Duration> {
        self.inner.scheduler.interval_of(source_id)
    }

    /// Cancel every timer and re-arm one per active source at its computed
    /// interval. Does nothing unless running. Returns the number armed.
    pub fn schedule_source_processing(&self) -> usize {
        let Some(token) = self.runtime_token() else {
            return 0;
        };
        let plan = {
            let mut state = self.inner.state.lock();
            if state.status != OrchestratorStatus::Running {
                return 0;
            }
            let prioritized = prioritize_sources(&state.sources, &state.metrics);
            for source in &prioritized {
                state.metrics_entry(&source.id, self.inner.config.metrics_window);
            }
            self.inner
                .scheduler
                .plan(&prioritized, &state.metrics, &self.inner.config)
        };
        self.inner.scheduler.arm_all(&plan, &token);
        plan.len()
    }

    /// Stretch the lowest-priority schedules according to the last resource
    /// sample. Returns the sources adjusted and their new intervals.
    /// Does nothing while load is within thresholds.
    pub fn adjust_schedules_dynamically(&self) -> Vec<(String, Duration)> {
        let sample = self.inner.state.lock().last_sample;
        let ratio = sample.pressure_ratio(&self.inner.config);
        self.stretch_schedules(PressureLevel::from_ratio(ratio), ratio)
    }

    fn stretch_schedules(&self, level: PressureLevel, ratio: f64) -> Vec<(String, Duration)> {
        if level == PressureLevel::Normal {
            return Vec::new();
        }
        let config = &self.inner.config;
        let (prioritized, bases, running) = {
            let state = self.inner.state.lock();
            let prioritized = prioritize_sources(&state.sources, &state.metrics);
            let bases: Vec<Duration> = prioritized
                .iter()
                .map(|s| determine_optimal_frequency(state.metrics.get(&s.id), config))
                .collect();
            (prioritized, bases, state.status == OrchestratorStatus::Running)
        };
        let quota = stretch_quota(prioritized.len(), level);
        let factor = stretch_factor(ratio);
        let ceiling = config.max_interval();
        let token = self.runtime_token();

        let mut adjusted = Vec::new();
        for (source, base) in prioritized.iter().zip(bases).rev() {
            if adjusted.len() >= quota {
                break;
            }
            let current = self
                .inner
                .scheduler
                .interval_of(&source.id)
                .unwrap_or_else(|| {
                    clamp_interval(
                        base.as_secs_f64() * self.inner.scheduler.stretch_of(&source.id),
                        config,
                    )
                });
            if current >= ceiling {
                continue;
            }
            let stretched = clamp_interval(current.as_secs_f64() * factor, config);
            self.inner
                .scheduler
                .set_stretch(&source.id, stretched.as_secs_f64() / base.as_secs_f64());
            if let (true, Some(token)) = (running, token.as_ref()) {
                self.inner.scheduler.rearm(&source.id, stretched, token);
            }
            adjusted.push((source.id.clone(), stretched));
        }

        if !adjusted.is_empty() {
            warn!(
                adjusted = adjusted.len(),
                factor,
                level = ?level,
                "Orchestrator: schedules stretched under resource pressure"
            );
        }
        adjusted
    }

    // --- Resources ---

    /// Sample the host and apply the escalation ladder.
    pub fn check_resources(&self) -> BalanceReport {
        let sample = self.inner.monitor.sample();
        self.balance_resource_usage(sample)
    }

    /// Apply the escalation ladder to `sample`: throttle, then stretch
    /// schedules, then pause. Relieves throttling once load is back under
    /// both thresholds.
    pub fn balance_resource_usage(&self, sample: ResourceSample) -> BalanceReport {
        let config = &self.inner.config;
        self.inner.state.lock().last_sample = sample;
        let ratio = sample.pressure_ratio(config);
        let plan = self.inner.monitor.assess(&sample, config);
        let mut actions = Vec::new();

        if plan.throttle {
            let (from, to) = self.inner.gate.reduce_limit();
            if from != to {
                warn!(
                    cpu = sample.cpu_percent,
                    memory = sample.memory_percent,
                    from,
                    to,
                    "Orchestrator: resource pressure, reducing concurrency"
                );
                actions.push(BalanceAction::Throttled { from, to });
            }
        }
        if plan.stretch {
            let adjusted = self.stretch_schedules(plan.level, ratio);
            actions.push(BalanceAction::SchedulesStretched {
                sources: adjusted.len(),
            });
        }
        if plan.pause
            && self.status() == OrchestratorStatus::Running
            && self.pause_processing().success
        {
            actions.push(BalanceAction::Paused);
        }
        if plan.relieve {
            let (from, to) = self.inner.gate.raise_limit(config.max_concurrent_sources);
            if from != to {
                info!(from, to, "Orchestrator: load normal, restoring concurrency");
                actions.push(BalanceAction::ConcurrencyRestored { from, to });
            }
            if self.inner.scheduler.clear_stretches() {
                actions.push(BalanceAction::StretchesCleared);
                self.schedule_source_processing();
            }
        }

        BalanceReport {
            sample,
            pressure_ratio: ratio,
            level: plan.level,
            actions,
        }
    }

    // --- Dispatch ---

    /// Run one source now, bypassing its schedule but not the gate.
    pub fn run_source(&self, source_id: &str) -> DispatchOutcome {
        self.dispatch(source_id, Trigger::Manual)
    }

    /// Run every active source now, highest priority first.
    pub fn generate_leads(&self) -> Vec<(String, DispatchOutcome)> {
        self.prioritize_sources()
            .into_iter()
            .map(|s| {
                let outcome = self.dispatch(&s.id, Trigger::Manual);
                (s.id, outcome)
            })
            .collect()
    }

    /// Wait until no job is active, up to `timeout`. Returns whether idle.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        loop {
            if self.inner.gate.active_count() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn dispatch(&self, source_id: &str, trigger: Trigger) -> DispatchOutcome {
        let (token, jobs) = match self.inner.runtime.lock().as_ref() {
            Some(rt) if !rt.token.is_cancelled() => (rt.token.clone(), rt.jobs.clone()),
            _ => {
                return DispatchOutcome::Skipped {
                    reason: "orchestrator is not running".into(),
                }
            }
        };

        let source = {
            let mut state = self.inner.state.lock();
            let allowed = match trigger {
                Trigger::Scheduled => state.status == OrchestratorStatus::Running,
                Trigger::Manual => matches!(
                    state.status,
                    OrchestratorStatus::Running | OrchestratorStatus::Paused
                ),
            };
            if !allowed {
                return DispatchOutcome::Skipped {
                    reason: format!("orchestrator is {}", state.status),
                };
            }
            let Some(source) = state.source(source_id).cloned() else {
                return DispatchOutcome::Skipped {
                    reason: format!("unknown source '{source_id}'"),
                };
            };
            if !source.active {
                return DispatchOutcome::Skipped {
                    reason: format!("source '{source_id}' is inactive"),
                };
            }
            state.metrics_entry(source_id, self.inner.config.metrics_window);
            source
        };

        let ticket = match self.inner.gate.try_admit(&source) {
            Ok(ticket) => ticket,
            Err(rejection) => {
                debug!(source_id = %source_id, reason = %rejection, "Orchestrator: dispatch rejected");
                return DispatchOutcome::Rejected {
                    reason: rejection.to_string(),
                };
            }
        };

        debug!(source_id = %source_id, trigger = ?trigger, "Orchestrator: source admitted");
        let this = self.clone();
        jobs.spawn(async move {
            let permit = tokio::select! {
                permit = Arc::clone(&this.inner.pool).acquire_owned() => permit,
                _ = token.cancelled() => return,
            };
            let Ok(_permit) = permit else {
                return;
            };
            ticket.mark_running();
            let job = AssertUnwindSafe(this.process_source_job(&source, &ticket)).catch_unwind();
            if let Err(panic) = job.await {
                let message = panic_message(panic.as_ref());
                error!(source_id = %source.id, panic = %message, "Orchestrator: source job panicked");
                this.record_execution(&source.id, ticket.elapsed(), 0, 0, true);
                this.inner.state.lock().counters.total_errors += 1;
            }
            drop(ticket);
            this.refresh_schedule(&source.id);
        });
        DispatchOutcome::Dispatched
    }

    /// Execute an admitted source: worker call under timeout, lead pipeline,
    /// performance update. The ticket is released by the caller.
    async fn process_source_job(&self, source: &Source, _ticket: &AdmissionTicket) {
        let started = Instant::now();
        info!(source_id = %source.id, kind = %source.kind, "Orchestrator: executing source");

        let worker = match self.inner.workers.resolve(source) {
            Ok(worker) => worker,
            Err(e) => {
                error!(source_id = %source.id, error = %e, "Orchestrator: cannot execute source");
                self.fail_execution(source, started.elapsed());
                return;
            }
        };

        let output = match run_worker(worker.as_ref(), source).await {
            Ok(output) => output,
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "Orchestrator: source worker timed out");
                self.fail_execution(source, started.elapsed());
                return;
            }
        };

        let leads_found = output.leads.len() as u64;
        let report = if output.leads.is_empty() {
            BatchReport::default()
        } else {
            match self.handle_new_leads(output.leads).await {
                Ok(report) => report,
                Err(e) => {
                    error!(source_id = %source.id, error = %e, "Orchestrator: lead pipeline unavailable");
                    self.fail_execution(source, started.elapsed());
                    return;
                }
            }
        };

        let elapsed = started.elapsed();
        match output.error {
            None => {
                self.record_execution(&source.id, elapsed, leads_found, report.valid as u64, false);
                info!(
                    source_id = %source.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    leads_found,
                    valid = report.valid,
                    persisted = report.persisted,
                    "Orchestrator: source execution complete"
                );
            }
            Some(reason) => {
                warn!(
                    source_id = %source.id,
                    error = %reason,
                    partial_leads = leads_found,
                    "Orchestrator: source worker reported failure"
                );
                self.fail_execution(source, elapsed);
            }
        }
    }

    /// Re-arm an armed source whose computed interval moved after a run.
    fn refresh_schedule(&self, source_id: &str) {
        let Some(token) = self.runtime_token() else {
            return;
        };
        let config = &self.inner.config;
        let next = {
            let state = self.inner.state.lock();
            if state.status != OrchestratorStatus::Running {
                return;
            }
            if !state.source(source_id).is_some_and(|s| s.active) {
                return;
            }
            let base = determine_optimal_frequency(state.metrics.get(source_id), config);
            clamp_interval(
                base.as_secs_f64() * self.inner.scheduler.stretch_of(source_id),
                config,
            )
        };
        if let Some(current) = self.inner.scheduler.interval_of(source_id) {
            if current != next {
                debug!(
                    source_id = %source_id,
                    from_secs = current.as_secs(),
                    to_secs = next.as_secs(),
                    "Orchestrator: interval adapted"
                );
                self.inner.scheduler.rearm(source_id, next, &token);
            }
        }
    }

    fn fail_execution(&self, source: &Source, elapsed: Duration) {
        self.record_execution(&source.id, elapsed, 0, 0, true);
        self.inner.state.lock().counters.total_errors += 1;
    }

    fn record_execution(
        &self,
        source_id: &str,
        elapsed: Duration,
        leads_found: u64,
        valid_leads: u64,
        had_error: bool,
    ) {
        let config = &self.inner.config;
        let mut state = self.inner.state.lock();
        if state.source(source_id).is_none() {
            return;
        }
        state.metrics_entry(source_id, config.metrics_window).update(
            elapsed.as_secs_f64(),
            leads_found,
            valid_leads,
            had_error,
            &config.priority_weights,
        );
    }

    // --- Leads ---

    /// Validate, enrich and persist `leads` in batches.
    pub async fn handle_new_leads(&self, leads: Vec<Lead>) -> LeadflowResult<BatchReport> {
        let pipeline = self.inner.pipeline.as_ref().ok_or_else(|| {
            LeadflowError::Orchestrator("lead pipeline is not configured".into())
        })?;
        let report = pipeline.handle_new_leads(leads).await;
        let mut state = self.inner.state.lock();
        state.counters.total_leads_processed += report.persisted as u64;
        state.counters.total_errors += (report.storage_failures + report.panics) as u64;
        Ok(report)
    }

    /// Run the external export pipeline once and mark exported leads.
    pub async fn trigger_export_pipeline(&self) -> LeadflowResult<ExportStats> {
        let exporter = self
            .inner
            .exporter
            .as_ref()
            .ok_or_else(|| LeadflowError::Export("no export scheduler configured".into()))?;

        let stats = match exporter.run_export().await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "Orchestrator: export run failed");
                self.inner.state.lock().counters.total_errors += 1;
                return Err(e);
            }
        };

        if let Some(pipeline) = &self.inner.pipeline {
            for id in &stats.exported_ids {
                if let Err(e) = pipeline
                    .storage()
                    .update_lead_status(*id, LeadStatus::Exported)
                    .await
                {
                    warn!(lead_id = %id, error = %e, "Orchestrator: failed to mark lead exported");
                }
            }
        }
        self.inner.state.lock().counters.leads_exported += stats.exported;
        info!(exported = stats.exported, failed = stats.failed, "Orchestrator: export run complete");
        Ok(stats)
    }

    // --- Source management ---

    /// Register a new source and schedule it.
    pub async fn add_source(&self, source: Source) -> LeadflowResult<()> {
        source.validate()?;
        if self.inner.state.lock().source(&source.id).is_some() {
            return Err(LeadflowError::Source(format!(
                "source '{}' already exists",
                source.id
            )));
        }
        self.registry()?.add(&source).await?;
        info!(source_id = %source.id, kind = %source.kind, "Orchestrator: source added");
        self.inner.state.lock().sources.push(source);
        self.schedule_source_processing();
        Ok(())
    }

    /// Replace an existing source definition and reschedule.
    pub async fn update_source(&self, source: Source) -> LeadflowResult<()> {
        source.validate()?;
        if self.inner.state.lock().source(&source.id).is_none() {
            return Err(LeadflowError::Source(format!("unknown source '{}'", source.id)));
        }
        self.registry()?.update(&source).await?;
        {
            let mut state = self.inner.state.lock();
            if let Some(slot) = state.sources.iter_mut().find(|s| s.id == source.id) {
                *slot = source.clone();
            }
        }
        if !source.active {
            self.inner.scheduler.forget(&source.id);
        }
        info!(source_id = %source.id, active = source.active, "Orchestrator: source updated");
        self.schedule_source_processing();
        Ok(())
    }

    /// Remove a source, its timer and its metrics.
    pub async fn remove_source(&self, source_id: &str) -> LeadflowResult<()> {
        if self.inner.state.lock().source(source_id).is_none() {
            return Err(LeadflowError::Source(format!("unknown source '{source_id}'")));
        }
        self.registry()?.remove(source_id).await?;
        {
            let mut state = self.inner.state.lock();
            state.sources.retain(|s| s.id != source_id);
            state.metrics.remove(source_id);
        }
        self.inner.scheduler.forget(source_id);
        self.inner.gate.forget(source_id);
        info!(source_id = %source_id, "Orchestrator: source removed");
        self.schedule_source_processing();
        Ok(())
    }

    fn registry(&self) -> LeadflowResult<&Arc<dyn SourceRegistry>> {
        self.inner
            .registry
            .as_ref()
            .ok_or_else(|| LeadflowError::Orchestrator("no source registry".into()))
    }

    // --- Metrics ---

    pub fn get_system_metrics(&self) -> SystemMetricsSnapshot {
        let intervals = self.inner.scheduler.intervals();
        let state = self.inner.state.lock();
        let sources = state
            .sources
            .iter()
            .map(|s| {
                let m = state.metrics.get(&s.id);
                SourceMetricsSnapshot {
                    source_id: s.id.clone(),
                    name: s.name.clone(),
                    active: s.active,
                    running: state.active_jobs.contains_key(&s.id),
                    executions: m.map_or(0, |m| m.executions),
                    window_samples: m.map_or(0, |m| m.window_len()),
                    priority_score: m.map_or(0.0, |m| m.priority_score),
                    success_rate: m.map_or(0.0, |m| m.success_rate),
                    quality_score: m.map_or(0.0, |m| m.quality_score),
                    consecutive_errors: m.map_or(0, |m| m.consecutive_errors),
                    avg_execution_time: m.map_or(0.0, |m| m.avg_execution_time),
                    total_leads_found: m.map_or(0, |m| m.total_leads_found),
                    valid_leads_found: m.map_or(0, |m| m.valid_leads_found),
                    last_execution_time: m.and_then(|m| m.last_execution_time),
                    interval_seconds: intervals.get(&s.id).map(Duration::as_secs),
                }
            })
            .collect();

        SystemMetricsSnapshot {
            status: state.status,
            uptime_seconds: state.started_at.map_or(0, |t| t.elapsed().as_secs()),
            active_sources: state.active_source_count(),
            total_sources: state.sources.len(),
            active_jobs: state.active_jobs.len(),
            max_concurrent_sources: state.max_concurrent_sources,
            total_leads_processed: state.counters.total_leads_processed,
            leads_exported: state.counters.leads_exported,
            total_errors: state.counters.total_errors,
            cpu_percent: state.last_sample.cpu_percent,
            memory_percent: state.last_sample.memory_percent,
            sources,
        }
    }

    // --- Background loops ---

    async fn dispatch_loop(self, token: CancellationToken) {
        let mut rx = self.inner.fire_rx.lock().await;
        let stale = drain_stale_ticks(&mut rx);
        debug!(stale, "Orchestrator: dispatch loop started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                fired = rx.recv() => match fired {
                    Some(source_id) => {
                        self.dispatch(&source_id, Trigger::Scheduled);
                    }
                    None => break,
                },
            }
        }
        debug!("Orchestrator: dispatch loop stopped");
    }

    async fn resource_loop(self, token: CancellationToken) {
        let period = self.inner.config.resource_check_interval();
        let mut ticker = tokio::time::interval_at(deadline_after(period), period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debug!(period_secs = period.as_secs(), "Orchestrator: resource monitor started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.check_resources();
                    debug!(
                        cpu = report.sample.cpu_percent,
                        memory = report.sample.memory_percent,
                        level = ?report.level,
                        "Orchestrator: resource check"
                    );
                }
            }
        }
        debug!("Orchestrator: resource monitor stopped");
    }

    async fn export_loop(self, token: CancellationToken) {
        let schedule = match parse_cron(&self.inner.config.export.cron) {
            Ok(schedule) => schedule,
            Err(e) => {
                error!(error = %e, "Orchestrator: export loop disabled");
                return;
            }
        };
        info!(cron = %self.inner.config.export.cron, "Orchestrator: export loop started");
        loop {
            let delay = match delay_until_next(&schedule, Utc::now()) {
                Ok(delay) => delay,
                Err(e) => {
                    warn!(error = %e, "Orchestrator: export schedule exhausted");
                    break;
                }
            };
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {
                    if self.status() == OrchestratorStatus::Running {
                        // Failures are logged and counted inside.
                        let _ = self.trigger_export_pipeline().await;
                    }
                }
            }
        }
        debug!("Orchestrator: export loop stopped");
    }
}

/// Discard ticks queued before the current run started. Returns how many.
fn drain_stale_ticks(rx: &mut mpsc::Receiver<String>) -> usize {
    let mut stale = 0;
    while rx.try_recv().is_ok() {
        stale += 1;
    }
    stale
}

/// Run `worker` against `source` under the source's timeout.
async fn run_worker(worker: &dyn SourceWorker, source: &Source) -> LeadflowResult<WorkerOutput> {
    let timeout = source.timeout();
    tokio::time::timeout(timeout, worker.execute(source, timeout))
        .await
        .map_err(|_| LeadflowError::Timeout(timeout))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
