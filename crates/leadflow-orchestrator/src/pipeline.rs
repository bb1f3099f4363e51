use futures_util::FutureExt;
use leadflow_core::{Enricher, Lead, LeadOutcome, LeadStatus, Storage, Validator};
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counts from one `handle_new_leads` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub received: usize,
    pub batches: usize,
    /// Leads that passed validation.
    pub valid: usize,
    pub rejected: usize,
    /// Validator itself failed; lead skipped.
    pub validation_failures: usize,
    pub enriched: usize,
    /// Enrichment rejected or failed; lead kept unenriched.
    pub enrichment_fallbacks: usize,
    pub persisted: usize,
    pub storage_failures: usize,
    /// A collaborator panicked while handling the lead; lead skipped.
    pub panics: usize,
}

/// validate → enrich → persist, in fixed-size batches.
pub struct LeadPipeline {
    validator: Arc<dyn Validator>,
    enricher: Arc<dyn Enricher>,
    storage: Arc<dyn Storage>,
    batch_size: usize,
}

impl LeadPipeline {
    pub fn new(
        validator: Arc<dyn Validator>,
        enricher: Arc<dyn Enricher>,
        storage: Arc<dyn Storage>,
        batch_size: usize,
    ) -> Self {
        Self {
            validator,
            enricher,
            storage,
            batch_size: batch_size.max(1),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Run every lead through the pipeline. A failing lead is logged and
    /// skipped; it never aborts its batch.
    pub async fn handle_new_leads(&self, leads: Vec<Lead>) -> BatchReport {
        let mut report = BatchReport {
            received: leads.len(),
            ..BatchReport::default()
        };
        let mut leads = leads.into_iter().peekable();

        while leads.peek().is_some() {
            let batch: Vec<Lead> = leads.by_ref().take(self.batch_size).collect();
            report.batches += 1;
            debug!(batch = report.batches, size = batch.len(), "Pipeline: processing batch");
            for lead in batch {
                let lead_id = lead.id;
                let handled = AssertUnwindSafe(self.process_lead(lead, &mut report))
                    .catch_unwind()
                    .await;
                if handled.is_err() {
                    warn!(lead_id = %lead_id, "Pipeline: collaborator panicked, skipping lead");
                    report.panics += 1;
                }
            }
        }

        if report.received > 0 {
            info!(
                received = report.received,
                valid = report.valid,
                rejected = report.rejected,
                persisted = report.persisted,
                storage_failures = report.storage_failures,
                panics = report.panics,
                "Pipeline: leads processed"
            );
        }
        report
    }

    async fn process_lead(&self, lead: Lead, report: &mut BatchReport) {
        let lead_id = lead.id;
        let validated = match self.validator.validate(lead).await {
            LeadOutcome::Accepted(lead) => lead.with_status(LeadStatus::Validated),
            LeadOutcome::Rejected { reason } => {
                debug!(lead_id = %lead_id, reason = %reason, "Pipeline: lead rejected");
                report.rejected += 1;
                return;
            }
            LeadOutcome::Failed(e) => {
                warn!(lead_id = %lead_id, error = %e, "Pipeline: validation failed, skipping lead");
                report.validation_failures += 1;
                return;
            }
        };
        report.valid += 1;

        let fallback = validated.clone();
        let lead = match self.enricher.enrich(validated).await {
            LeadOutcome::Accepted(lead) => {
                report.enriched += 1;
                lead.with_status(LeadStatus::Enriched)
            }
            LeadOutcome::Rejected { reason } => {
                debug!(lead_id = %lead_id, reason = %reason, "Pipeline: enrichment declined, keeping lead");
                report.enrichment_fallbacks += 1;
                fallback
            }
            LeadOutcome::Failed(e) => {
                warn!(lead_id = %lead_id, error = %e, "Pipeline: enrichment failed, keeping lead");
                report.enrichment_fallbacks += 1;
                fallback
            }
        };

        match self.storage.save_lead(&lead).await {
            Ok(()) => report.persisted += 1,
            Err(e) => {
                warn!(lead_id = %lead_id, error = %e, "Pipeline: failed to persist lead");
                report.storage_failures += 1;
            }
        }
    }
}
