//! Rolling execution metrics per source and the derived priority score.

use crate::config::PriorityWeights;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One finished execution of a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSample {
    pub at: DateTime<Utc>,
    /// Wall time of the run, in seconds.
    pub execution_time: f64,
    pub leads_found: u64,
    pub valid_leads: u64,
    pub had_error: bool,
}

/// Rolling metrics for a single source.
///
/// Only the last `capacity` samples are kept for the average execution time;
/// lead and error counters are lifetime totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    samples: VecDeque<ExecutionSample>,
    capacity: usize,
    pub executions: u64,
    pub avg_execution_time: f64,
    pub total_leads_found: u64,
    pub valid_leads_found: u64,
    pub error_count: u64,
    pub consecutive_errors: u32,
    pub success_rate: f64,
    pub quality_score: f64,
    pub priority_score: f64,
    pub last_execution_time: Option<DateTime<Utc>>,
}

impl PerformanceMetrics {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            executions: 0,
            avg_execution_time: 0.0,
            total_leads_found: 0,
            valid_leads_found: 0,
            error_count: 0,
            consecutive_errors: 0,
            success_rate: 0.0,
            quality_score: 0.0,
            priority_score: 0.0,
            last_execution_time: None,
        }
    }

    /// Fold one execution into the metrics. Never fails: non-finite or
    /// negative times count as zero and `valid_leads` is capped at
    /// `leads_found`.
    pub fn update(
        &mut self,
        execution_time: f64,
        leads_found: u64,
        valid_leads: u64,
        had_error: bool,
        weights: &PriorityWeights,
    ) {
        let execution_time = if execution_time.is_finite() {
            execution_time.max(0.0)
        } else {
            0.0
        };
        let valid_leads = valid_leads.min(leads_found);
        let now = Utc::now();

        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(ExecutionSample {
            at: now,
            execution_time,
            leads_found,
            valid_leads,
            had_error,
        });
        self.executions += 1;
        self.last_execution_time = Some(now);

        self.avg_execution_time = self.samples.iter().map(|s| s.execution_time).sum::<f64>()
            / self.samples.len() as f64;

        self.total_leads_found = self.total_leads_found.saturating_add(leads_found);
        self.valid_leads_found = self.valid_leads_found.saturating_add(valid_leads);

        if had_error {
            self.error_count += 1;
            self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        } else {
            self.consecutive_errors = 0;
        }

        self.success_rate =
            (self.executions - self.error_count) as f64 / self.executions as f64;
        self.quality_score = if self.total_leads_found == 0 {
            0.0
        } else {
            self.valid_leads_found as f64 / self.total_leads_found as f64
        };
        self.priority_score = compute_priority(
            self.quality_score,
            self.success_rate,
            self.valid_leads_found,
            weights,
        );
    }

    /// Number of samples currently held in the window.
    pub fn window_len(&self) -> usize {
        self.samples.len()
    }
}

/// Weighted composite of quality, success and volume, clamped to `[0, 1]`.
pub fn compute_priority(
    quality_score: f64,
    success_rate: f64,
    valid_leads_found: u64,
    weights: &PriorityWeights,
) -> f64 {
    let volume = (valid_leads_found as f64 / weights.volume_target).min(1.0);
    let score =
        weights.quality * quality_score + weights.success * success_rate + weights.volume * volume;
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
