//! End-to-end orchestration tests.
//!
//! Drives the full engine with mock workers, pipeline stages, storage and a
//! scripted resource probe. Checks: lifecycle transitions, admission control
//! under contention, the resource escalation ladder, the lead pipeline,
//! export bookkeeping and dynamic source management.

use async_trait::async_trait;
use leadflow_core::{
    Enricher, ExportScheduler, ExportStats, InMemorySourceRegistry, Lead, LeadOutcome, LeadStatus,
    LeadflowError, LeadflowResult, Source, SourceKind, SourceRegistry, SourceWorker, Storage,
    Validator, WorkerOutput,
};
use leadflow_orchestrator::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Mock collaborators
// ---------------------------------------------------------------------------

/// Feed worker that sleeps, then returns `leads` numbered leads. Tracks how
/// many executions overlap.
struct MockWorker {
    delay: Duration,
    leads: usize,
    fail: bool,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockWorker {
    fn new(delay: Duration, leads: usize) -> Self {
        Self {
            delay,
            leads,
            fail: false,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Duration::from_millis(10), 2)
        }
    }
}

#[async_trait]
impl SourceWorker for MockWorker {
    fn kind(&self) -> SourceKind {
        SourceKind::Feed
    }

    async fn execute(&self, source: &Source, _timeout: Duration) -> WorkerOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let leads = (1..=self.leads)
            .map(|n| Lead::new(&source.id, serde_json::json!({ "n": n })))
            .collect();
        if self.fail {
            WorkerOutput {
                leads,
                error: Some("upstream returned 503".into()),
            }
        } else {
            WorkerOutput::ok(leads)
        }
    }
}

struct PanickingWorker;

#[async_trait]
impl SourceWorker for PanickingWorker {
    fn kind(&self) -> SourceKind {
        SourceKind::Crawler
    }

    async fn execute(&self, _source: &Source, _timeout: Duration) -> WorkerOutput {
        panic!("crawler exploded");
    }
}

/// Rejects every lead whose `n` is 3.
struct RejectThird;

#[async_trait]
impl Validator for RejectThird {
    async fn validate(&self, lead: Lead) -> LeadOutcome {
        if lead.data["n"] == 3 {
            LeadOutcome::rejected("missing permit number")
        } else {
            LeadOutcome::Accepted(lead)
        }
    }
}

/// Enricher that blows up on lead `n == 2`.
struct PanicsOnSecond;

#[async_trait]
impl Enricher for PanicsOnSecond {
    async fn enrich(&self, lead: Lead) -> LeadOutcome {
        if lead.data["n"] == 2 {
            panic!("enricher bug");
        }
        LeadOutcome::Accepted(lead)
    }
}

struct TagEnricher;

#[async_trait]
impl Enricher for TagEnricher {
    async fn enrich(&self, mut lead: Lead) -> LeadOutcome {
        lead.data["enriched"] = serde_json::json!(true);
        LeadOutcome::Accepted(lead)
    }
}

#[derive(Default)]
struct RecordingStorage {
    leads: Mutex<HashMap<Uuid, Lead>>,
}

impl RecordingStorage {
    fn count(&self) -> usize {
        self.leads.lock().len()
    }

    fn ids(&self) -> Vec<Uuid> {
        self.leads.lock().keys().copied().collect()
    }

    fn status_of(&self, id: Uuid) -> Option<LeadStatus> {
        self.leads.lock().get(&id).map(|l| l.status)
    }
}

#[async_trait]
impl Storage for RecordingStorage {
    async fn save_lead(&self, lead: &Lead) -> LeadflowResult<()> {
        self.leads.lock().insert(lead.id, lead.clone());
        Ok(())
    }

    async fn update_lead_status(&self, id: Uuid, status: LeadStatus) -> LeadflowResult<()> {
        match self.leads.lock().get_mut(&id) {
            Some(lead) => {
                lead.status = status;
                Ok(())
            }
            None => Err(LeadflowError::Storage(format!("unknown lead {id}"))),
        }
    }
}

/// Exports every stored lead.
struct StoreExporter {
    storage: Arc<RecordingStorage>,
}

#[async_trait]
impl ExportScheduler for StoreExporter {
    async fn run_export(&self) -> LeadflowResult<ExportStats> {
        let ids = self.storage.ids();
        Ok(ExportStats {
            exported: ids.len() as u64,
            failed: 0,
            exported_ids: ids,
        })
    }
}

/// Registry whose first `load` fails.
struct FlakyRegistry {
    inner: InMemorySourceRegistry,
    failed_once: AtomicBool,
}

#[async_trait]
impl SourceRegistry for FlakyRegistry {
    async fn load(&self) -> LeadflowResult<Vec<Source>> {
        if !self.failed_once.swap(true, Ordering::SeqCst) {
            return Err(LeadflowError::Registry("catalogue unreachable".into()));
        }
        self.inner.load().await
    }

    async fn add(&self, source: &Source) -> LeadflowResult<()> {
        self.inner.add(source).await
    }

    async fn update(&self, source: &Source) -> LeadflowResult<()> {
        self.inner.update(source).await
    }

    async fn remove(&self, source_id: &str) -> LeadflowResult<()> {
        self.inner.remove(source_id).await
    }
}

/// Probe that reports whatever the test last set.
#[derive(Clone)]
struct ScriptedProbe(Arc<Mutex<ResourceSample>>);

impl ScriptedProbe {
    fn idle() -> Self {
        Self(Arc::new(Mutex::new(ResourceSample::new(10.0, 20.0))))
    }
}

impl ResourceProbe for ScriptedProbe {
    fn sample(&mut self) -> ResourceSample {
        *self.0.lock()
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

struct Harness {
    orch: Orchestrator,
    worker: Arc<MockWorker>,
    storage: Arc<RecordingStorage>,
    probe: ScriptedProbe,
}

fn feed(id: &str) -> Source {
    Source::new(id, format!("Feed {id}"), SourceKind::Feed, "https://permits.example.com/rss")
}

fn harness_with(config: OrchestratorConfig, sources: Vec<Source>, worker: MockWorker) -> Harness {
    let worker = Arc::new(worker);
    let storage = Arc::new(RecordingStorage::default());
    let probe = ScriptedProbe::idle();
    let orch = Orchestrator::builder(config)
        .worker(worker.clone())
        .worker(Arc::new(PanickingWorker))
        .validator(Arc::new(RejectThird))
        .enricher(Arc::new(TagEnricher))
        .storage(storage.clone())
        .registry(Arc::new(InMemorySourceRegistry::new(sources)))
        .exporter(Arc::new(StoreExporter {
            storage: storage.clone(),
        }))
        .resource_probe(Box::new(probe.clone()))
        .build();
    Harness {
        orch,
        worker,
        storage,
        probe,
    }
}

fn harness(sources: Vec<Source>) -> Harness {
    harness_with(
        OrchestratorConfig::default(),
        sources,
        MockWorker::new(Duration::from_millis(50), 5),
    )
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_lifecycle_start_pause_resume_shutdown() {
    let h = harness(vec![feed("a"), feed("b")]);
    assert_eq!(h.orch.status(), OrchestratorStatus::Initialized);

    let started = h.orch.start_processing().await;
    assert!(started.success, "{}", started.message);
    assert_eq!(h.orch.status(), OrchestratorStatus::Running);

    let paused = h.orch.pause_processing();
    assert!(paused.success);
    assert_eq!(h.orch.status(), OrchestratorStatus::Paused);
    assert!(h.orch.scheduled_interval("a").is_none());

    assert!(!h.orch.pause_processing().success);

    let resumed = h.orch.resume_processing();
    assert!(resumed.success);
    assert_eq!(h.orch.status(), OrchestratorStatus::Running);
    assert!(h.orch.scheduled_interval("a").is_some());

    let stopped = h.orch.shutdown_gracefully().await;
    assert!(stopped.success);
    assert_eq!(stopped.status, OrchestratorStatus::Stopped);
    assert!(h.orch.scheduled_interval("a").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_twice_is_idempotent() {
    let h = harness(vec![feed("a")]);
    h.orch.start_processing().await;
    let first = h.orch.shutdown_gracefully().await;
    let second = h.orch.shutdown_gracefully().await;
    assert!(first.success && second.success);
    assert_eq!(second.status, OrchestratorStatus::Stopped);
    assert_eq!(h.orch.status(), OrchestratorStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_stop() {
    let h = harness(vec![feed("a")]);
    h.orch.start_processing().await;
    h.orch.shutdown_gracefully().await;
    let again = h.orch.start_processing().await;
    assert!(again.success);
    assert_eq!(h.orch.status(), OrchestratorStatus::Running);
    h.orch.shutdown_gracefully().await;
}

#[tokio::test(start_paused = true)]
async fn test_auto_resume_after_cooldown() {
    let h = harness(vec![feed("a")]);
    h.orch.start_processing().await;
    h.orch.pause_processing();

    tokio::time::sleep(Duration::from_secs(14 * 60)).await;
    assert_eq!(h.orch.status(), OrchestratorStatus::Paused);

    tokio::time::sleep(Duration::from_secs(2 * 60)).await;
    assert_eq!(h.orch.status(), OrchestratorStatus::Running);
    h.orch.shutdown_gracefully().await;
}

#[tokio::test(start_paused = true)]
async fn test_manual_resume_cancels_auto_resume() {
    let h = harness(vec![feed("a")]);
    h.orch.start_processing().await;
    h.orch.pause_processing();
    h.orch.resume_processing();

    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    h.orch.pause_processing();

    // Past the first pause's cooldown: it must not resume.
    tokio::time::sleep(Duration::from_secs(6 * 60)).await;
    assert_eq!(h.orch.status(), OrchestratorStatus::Paused);

    // Past the second pause's cooldown.
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert_eq!(h.orch.status(), OrchestratorStatus::Running);
    h.orch.shutdown_gracefully().await;
}

#[tokio::test]
async fn test_missing_collaborators_put_orchestrator_in_error() {
    let orch = Orchestrator::builder(OrchestratorConfig::default())
        .worker(Arc::new(MockWorker::new(Duration::ZERO, 1)))
        .build();
    assert_eq!(orch.status(), OrchestratorStatus::Error);

    let outcome = orch.start_processing().await;
    assert!(!outcome.success);
    assert_eq!(outcome.status, OrchestratorStatus::Error);
    assert!(outcome.message.contains("validator"));
}

#[tokio::test(start_paused = true)]
async fn test_start_from_error_retries_initialization() {
    let storage = Arc::new(RecordingStorage::default());
    let orch = Orchestrator::builder(OrchestratorConfig::default())
        .worker(Arc::new(MockWorker::new(Duration::ZERO, 1)))
        .validator(Arc::new(RejectThird))
        .enricher(Arc::new(TagEnricher))
        .storage(storage)
        .registry(Arc::new(FlakyRegistry {
            inner: InMemorySourceRegistry::new(vec![feed("a")]),
            failed_once: AtomicBool::new(false),
        }))
        .resource_probe(Box::new(ScriptedProbe::idle()))
        .build();

    let first = orch.start_processing().await;
    assert!(!first.success);
    assert_eq!(orch.status(), OrchestratorStatus::Error);
    assert!(first.message.contains("catalogue unreachable"));

    let second = orch.start_processing().await;
    assert!(second.success);
    assert_eq!(orch.status(), OrchestratorStatus::Running);
    orch.shutdown_gracefully().await;
}

#[tokio::test]
async fn test_invalid_config_fails_start() {
    let config = OrchestratorConfig {
        max_concurrent_sources: 0,
        ..OrchestratorConfig::default()
    };
    let h = harness_with(config, vec![feed("a")], MockWorker::new(Duration::ZERO, 1));
    let outcome = h.orch.start_processing().await;
    assert!(!outcome.success);
    assert_eq!(h.orch.status(), OrchestratorStatus::Error);
}

#[tokio::test]
async fn test_unbounded_interval_multiplier_fails_start() {
    for multiplier in [f64::INFINITY, f64::NAN, 1e300] {
        let config = OrchestratorConfig {
            max_interval_multiplier: multiplier,
            ..OrchestratorConfig::default()
        };
        let h = harness_with(config, vec![feed("a")], MockWorker::new(Duration::ZERO, 1));
        let outcome = h.orch.start_processing().await;
        assert!(!outcome.success);
        assert_eq!(h.orch.status(), OrchestratorStatus::Error);
        let stopped = h.orch.shutdown_gracefully().await;
        assert_eq!(stopped.status, OrchestratorStatus::Stopped);
    }
}

#[tokio::test]
async fn test_huge_shutdown_timeout_fails_start() {
    let config = OrchestratorConfig {
        shutdown_timeout_seconds: u64::MAX,
        ..OrchestratorConfig::default()
    };
    let h = harness_with(config, vec![feed("a")], MockWorker::new(Duration::ZERO, 1));
    assert!(!h.orch.start_processing().await.success);
    assert_eq!(h.orch.status(), OrchestratorStatus::Error);
}

// ---------------------------------------------------------------------------
// Dispatch and admission
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_scheduled_timer_runs_source() {
    let h = harness(vec![feed("a")]);
    h.orch.start_processing().await;
    assert_eq!(h.worker.calls.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;
    assert!(h.orch.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(h.worker.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.orch.get_system_metrics().source("a").unwrap().executions, 1);
    h.orch.shutdown_gracefully().await;
}

#[tokio::test(start_paused = true)]
async fn test_same_source_twice_is_rejected() {
    let h = harness_with(
        OrchestratorConfig::default(),
        vec![feed("a")],
        MockWorker::new(Duration::from_secs(10), 1),
    );
    h.orch.start_processing().await;

    assert_eq!(h.orch.run_source("a"), DispatchOutcome::Dispatched);
    assert!(matches!(
        h.orch.run_source("a"),
        DispatchOutcome::Rejected { .. }
    ));
    assert!(h.orch.gate().is_active("a"));

    assert!(h.orch.wait_idle(Duration::from_secs(30)).await);
    assert_eq!(h.worker.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.worker.peak.load(Ordering::SeqCst), 1);
    h.orch.shutdown_gracefully().await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_and_inactive_sources_are_skipped() {
    let h = harness(vec![feed("a"), feed("off").inactive()]);
    h.orch.start_processing().await;
    assert!(matches!(h.orch.run_source("nope"), DispatchOutcome::Skipped { .. }));
    assert!(matches!(h.orch.run_source("off"), DispatchOutcome::Skipped { .. }));
    h.orch.shutdown_gracefully().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_never_exceeds_limit() {
    let config = OrchestratorConfig {
        max_concurrent_sources: 3,
        ..OrchestratorConfig::default()
    };
    let sources: Vec<Source> = (0..10).map(|i| feed(&format!("s{i}"))).collect();
    let h = harness_with(config, sources, MockWorker::new(Duration::from_millis(700), 1));
    h.orch.start_processing().await;

    // Bursts of dispatches at irregular offsets.
    let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
    for _ in 0..25 {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        let target = format!("s{}", seed % 10);
        h.orch.run_source(&target);
        if seed % 3 == 0 {
            h.orch.generate_leads();
        }
        assert!(h.orch.gate().active_count() <= 3);
        tokio::time::sleep(Duration::from_millis(seed % 400)).await;
    }

    assert!(h.orch.wait_idle(Duration::from_secs(30)).await);
    assert!(h.worker.peak.load(Ordering::SeqCst) <= 3);
    assert!(h.worker.calls.load(Ordering::SeqCst) >= 1);
    h.orch.shutdown_gracefully().await;
}

#[tokio::test(start_paused = true)]
async fn test_generate_leads_respects_capacity() {
    let config = OrchestratorConfig {
        max_concurrent_sources: 2,
        ..OrchestratorConfig::default()
    };
    let sources = vec![feed("a"), feed("b"), feed("c"), feed("d")];
    let h = harness_with(config, sources, MockWorker::new(Duration::from_secs(1), 1));
    h.orch.start_processing().await;

    let outcomes = h.orch.generate_leads();
    let dispatched = outcomes
        .iter()
        .filter(|(_, o)| *o == DispatchOutcome::Dispatched)
        .count();
    assert_eq!(dispatched, 2);
    assert_eq!(outcomes.len(), 4);
    h.orch.shutdown_gracefully().await;
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_blocks_immediate_rerun() {
    let h = harness(vec![feed("a").with_cooldown_minutes(10)]);
    h.orch.start_processing().await;

    assert_eq!(h.orch.run_source("a"), DispatchOutcome::Dispatched);
    assert!(h.orch.wait_idle(Duration::from_secs(5)).await);
    assert!(matches!(h.orch.run_source("a"), DispatchOutcome::Rejected { .. }));

    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert!(h.orch.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(h.orch.run_source("a"), DispatchOutcome::Dispatched);
    h.orch.shutdown_gracefully().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_in_flight_jobs() {
    let h = harness_with(
        OrchestratorConfig::default(),
        vec![feed("a")],
        MockWorker::new(Duration::from_secs(5), 2),
    );
    h.orch.start_processing().await;
    h.orch.run_source("a");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.orch.gate().is_active("a"));

    let outcome = h.orch.shutdown_gracefully().await;
    assert!(outcome.success);
    assert_eq!(h.storage.count(), 2);
    assert_eq!(h.orch.gate().active_count(), 0);
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_worker_failure_counts_error_but_keeps_partial_leads() {
    let h = harness_with(OrchestratorConfig::default(), vec![feed("a")], MockWorker::failing());
    h.orch.start_processing().await;
    h.orch.run_source("a");
    assert!(h.orch.wait_idle(Duration::from_secs(5)).await);

    let metrics = h.orch.get_system_metrics();
    let a = metrics.source("a").unwrap();
    assert_eq!(a.consecutive_errors, 1);
    assert_eq!(a.success_rate, 0.0);
    assert_eq!(metrics.total_errors, 1);
    assert_eq!(h.storage.count(), 2);
    h.orch.shutdown_gracefully().await;
}

#[tokio::test(start_paused = true)]
async fn test_worker_timeout_is_an_error() {
    let h = harness_with(
        OrchestratorConfig::default(),
        vec![feed("slow").with_timeout_seconds(1)],
        MockWorker::new(Duration::from_secs(30), 3),
    );
    h.orch.start_processing().await;
    h.orch.run_source("slow");
    assert!(h.orch.wait_idle(Duration::from_secs(5)).await);

    let metrics = h.orch.get_system_metrics();
    assert_eq!(metrics.total_errors, 1);
    assert_eq!(metrics.source("slow").unwrap().consecutive_errors, 1);
    assert_eq!(h.storage.count(), 0);
    h.orch.shutdown_gracefully().await;
}

#[tokio::test(start_paused = true)]
async fn test_panicking_worker_is_contained() {
    let crawler = Source::new("c", "Crawler", SourceKind::Crawler, "https://city.example.com");
    let h = harness(vec![crawler, feed("a")]);
    h.orch.start_processing().await;

    assert_eq!(h.orch.run_source("c"), DispatchOutcome::Dispatched);
    assert!(h.orch.wait_idle(Duration::from_secs(5)).await);
    assert!(!h.orch.gate().is_active("c"));
    assert_eq!(h.orch.get_system_metrics().total_errors, 1);

    // The engine keeps working.
    assert_eq!(h.orch.run_source("a"), DispatchOutcome::Dispatched);
    assert!(h.orch.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(h.orch.status(), OrchestratorStatus::Running);
    h.orch.shutdown_gracefully().await;
}

#[tokio::test(start_paused = true)]
async fn test_source_without_worker_fails_execution() {
    let portal = Source::new("p", "Portal", SourceKind::PermitPortal, "https://portal.example.com");
    let h = harness(vec![portal]);
    h.orch.start_processing().await;
    h.orch.run_source("p");
    assert!(h.orch.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(h.orch.get_system_metrics().total_errors, 1);
    h.orch.shutdown_gracefully().await;
}

// ---------------------------------------------------------------------------
// Lead pipeline and export
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_rejected_lead_is_not_persisted() {
    let h = harness(vec![feed("a")]);
    h.orch.start_processing().await;
    h.orch.run_source("a");
    assert!(h.orch.wait_idle(Duration::from_secs(5)).await);

    // Five leads, the third rejected.
    assert_eq!(h.storage.count(), 4);
    for id in h.storage.ids() {
        assert_eq!(h.storage.status_of(id), Some(LeadStatus::Enriched));
    }
    let metrics = h.orch.get_system_metrics();
    assert_eq!(metrics.total_leads_processed, 4);
    let a = metrics.source("a").unwrap();
    assert_eq!(a.total_leads_found, 5);
    assert_eq!(a.valid_leads_found, 4);
    assert!((a.quality_score - 0.8).abs() < 1e-9);
    h.orch.shutdown_gracefully().await;
}

#[tokio::test]
async fn test_handle_new_leads_directly() {
    let h = harness(vec![]);
    let leads = (1..=3)
        .map(|n| Lead::new("manual", serde_json::json!({ "n": n })))
        .collect();
    let report = h.orch.handle_new_leads(leads).await.unwrap();
    assert_eq!(report.received, 3);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.persisted, 2);
    assert_eq!(h.orch.get_system_metrics().total_leads_processed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_enricher_panic_skips_lead_and_keeps_counters() {
    let storage = Arc::new(RecordingStorage::default());
    let orch = Orchestrator::builder(OrchestratorConfig::default())
        .worker(Arc::new(MockWorker::new(Duration::from_millis(10), 5)))
        .validator(Arc::new(RejectThird))
        .enricher(Arc::new(PanicsOnSecond))
        .storage(storage.clone())
        .registry(Arc::new(InMemorySourceRegistry::new(vec![feed("a")])))
        .resource_probe(Box::new(ScriptedProbe::idle()))
        .build();
    orch.start_processing().await;
    assert_eq!(orch.run_source("a"), DispatchOutcome::Dispatched);
    assert!(orch.wait_idle(Duration::from_secs(5)).await);

    // n=2 panics in enrichment, n=3 is rejected, the rest are persisted.
    assert_eq!(storage.count(), 3);
    let metrics = orch.get_system_metrics();
    assert_eq!(metrics.total_leads_processed, 3);
    assert_eq!(metrics.total_errors, 1);
    assert_eq!(metrics.status, OrchestratorStatus::Running);
    orch.shutdown_gracefully().await;
}

#[tokio::test(start_paused = true)]
async fn test_export_marks_leads_exported() {
    let h = harness(vec![feed("a")]);
    h.orch.start_processing().await;
    h.orch.run_source("a");
    assert!(h.orch.wait_idle(Duration::from_secs(5)).await);

    let stats = h.orch.trigger_export_pipeline().await.unwrap();
    assert_eq!(stats.exported, 4);
    for id in h.storage.ids() {
        assert_eq!(h.storage.status_of(id), Some(LeadStatus::Exported));
    }
    assert_eq!(h.orch.get_system_metrics().leads_exported, 4);
    h.orch.shutdown_gracefully().await;
}

#[tokio::test]
async fn test_export_without_exporter_is_error() {
    let orch = Orchestrator::builder(OrchestratorConfig::default())
        .worker(Arc::new(MockWorker::new(Duration::ZERO, 1)))
        .validator(Arc::new(RejectThird))
        .enricher(Arc::new(TagEnricher))
        .storage(Arc::new(RecordingStorage::default()))
        .registry(Arc::new(InMemorySourceRegistry::new(vec![])))
        .resource_probe(Box::new(ScriptedProbe::idle()))
        .build();
    assert!(matches!(
        orch.trigger_export_pipeline().await,
        Err(LeadflowError::Export(_))
    ));
}

// ---------------------------------------------------------------------------
// Resource pressure
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_high_cpu_reduces_concurrency_by_one() {
    let h = harness(vec![feed("a"), feed("b")]);
    h.orch.start_processing().await;
    assert_eq!(h.orch.gate().limit(), 5);

    let report = h.orch.balance_resource_usage(ResourceSample::new(95.0, 40.0));
    assert_eq!(report.level, PressureLevel::Elevated);
    assert_eq!(
        report.actions,
        vec![BalanceAction::Throttled { from: 5, to: 4 }]
    );
    assert_eq!(h.orch.gate().limit(), 4);
    assert_eq!(h.orch.status(), OrchestratorStatus::Running);
    h.orch.shutdown_gracefully().await;
}

#[tokio::test(start_paused = true)]
async fn test_escalation_ladder_and_relief() {
    let h = harness(vec![feed("a"), feed("b")]);
    h.orch.start_processing().await;
    assert_eq!(h.orch.scheduled_interval("b"), Some(Duration::from_secs(300)));

    // Critical: throttle and stretch the lowest-priority half.
    let first = h.orch.balance_resource_usage(ResourceSample::new(130.0, 40.0));
    assert_eq!(first.level, PressureLevel::Critical);
    assert!(first.actions.contains(&BalanceAction::Throttled { from: 5, to: 4 }));
    assert!(first
        .actions
        .contains(&BalanceAction::SchedulesStretched { sources: 1 }));
    assert_eq!(h.orch.scheduled_interval("b"), Some(Duration::from_secs(600)));
    assert_eq!(h.orch.scheduled_interval("a"), Some(Duration::from_secs(300)));
    assert_eq!(h.orch.status(), OrchestratorStatus::Running);

    // Still critical on the next check: pause.
    let second = h.orch.balance_resource_usage(ResourceSample::new(130.0, 40.0));
    assert!(second.actions.contains(&BalanceAction::Paused));
    assert_eq!(h.orch.status(), OrchestratorStatus::Paused);
    assert_eq!(h.orch.gate().limit(), 3);

    // Load drops: concurrency comes back one step per calm check.
    let calm = h.orch.balance_resource_usage(ResourceSample::new(20.0, 30.0));
    assert!(calm
        .actions
        .contains(&BalanceAction::ConcurrencyRestored { from: 3, to: 4 }));
    assert!(calm.actions.contains(&BalanceAction::StretchesCleared));

    h.orch.resume_processing();
    assert_eq!(h.orch.scheduled_interval("b"), Some(Duration::from_secs(300)));
    h.orch.shutdown_gracefully().await;
}

#[tokio::test(start_paused = true)]
async fn test_throttle_never_goes_below_one() {
    let h = harness(vec![feed("a")]);
    h.orch.start_processing().await;
    for _ in 0..10 {
        h.orch.balance_resource_usage(ResourceSample::new(90.0, 10.0));
    }
    assert_eq!(h.orch.gate().limit(), 1);
    h.orch.shutdown_gracefully().await;
}

#[tokio::test(start_paused = true)]
async fn test_monitor_loop_samples_probe() {
    let h = harness(vec![feed("a")]);
    h.orch.start_processing().await;
    *h.probe.0.lock() = ResourceSample::new(90.0, 10.0);

    tokio::time::sleep(Duration::from_secs(61)).await;
    let metrics = h.orch.get_system_metrics();
    assert_eq!(metrics.cpu_percent, 90.0);
    assert_eq!(metrics.max_concurrent_sources, 4);
    h.orch.shutdown_gracefully().await;
}

// ---------------------------------------------------------------------------
// Source management and metrics
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_add_update_remove_source() {
    let h = harness(vec![feed("a")]);
    h.orch.start_processing().await;

    h.orch.add_source(feed("z")).await.unwrap();
    assert!(h.orch.scheduled_interval("z").is_some());
    assert!(h.orch.add_source(feed("z")).await.is_err());

    h.orch.update_source(feed("z").inactive()).await.unwrap();
    assert!(h.orch.scheduled_interval("z").is_none());
    assert!(h.orch.prioritize_sources().iter().all(|s| s.id != "z"));

    h.orch.remove_source("z").await.unwrap();
    assert!(h.orch.get_system_metrics().source("z").is_none());
    assert!(h.orch.remove_source("z").await.is_err());
    h.orch.shutdown_gracefully().await;
}

#[tokio::test(start_paused = true)]
async fn test_metrics_snapshot() {
    let h = harness(vec![feed("a"), feed("b").inactive()]);
    h.orch.start_processing().await;
    h.orch.run_source("a");
    assert!(h.orch.wait_idle(Duration::from_secs(5)).await);
    tokio::time::sleep(Duration::from_secs(3)).await;

    let snapshot = h.orch.get_system_metrics();
    assert_eq!(snapshot.status, OrchestratorStatus::Running);
    assert_eq!(snapshot.total_sources, 2);
    assert_eq!(snapshot.active_sources, 1);
    assert_eq!(snapshot.active_jobs, 0);
    assert!(snapshot.uptime_seconds >= 3);
    // quality 0.8, success 1.0: 5 min × 1.1
    assert_eq!(snapshot.source("a").unwrap().interval_seconds, Some(330));
    assert_eq!(snapshot.source("a").unwrap().executions, 1);
    assert!(snapshot.source("b").unwrap().interval_seconds.is_none());

    let json = snapshot.to_json();
    assert_eq!(json["status"], "running");
    assert_eq!(json["total_leads_processed"], 4);
    h.orch.shutdown_gracefully().await;
}

#[tokio::test(start_paused = true)]
async fn test_determine_optimal_frequency_tracks_performance() {
    let h = harness_with(OrchestratorConfig::default(), vec![feed("a")], MockWorker::failing());
    h.orch.start_processing().await;
    assert_eq!(
        h.orch.determine_optimal_frequency("a"),
        Some(Duration::from_secs(300))
    );

    h.orch.run_source("a");
    assert!(h.orch.wait_idle(Duration::from_secs(5)).await);
    let after = h.orch.determine_optimal_frequency("a").unwrap();
    assert!(after > Duration::from_secs(300));
    assert!(h.orch.determine_optimal_frequency("missing").is_none());
    h.orch.shutdown_gracefully().await;
}
