//! Long-running generation scheduler
//!
//! Re-runs the generation stage with `resume` on a fixed interval so newly
//! consolidated phrases and earlier failures are picked up without operator
//! action. Stops when the pipeline's cancellation token fires, either between
//! batches or during the wait between runs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::batch::cancellable_sleep;
use crate::stages::{Stage, StageSummary};
use crate::{Pipeline, PipelineReport, RunOptions};

/// Cumulative scheduler counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerState {
    pub runs: usize,
    pub phrases_completed: usize,
    pub phrases_failed: usize,
    pub worlds_generated: usize,
    pub estimated_cost: f64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Periodic generation runner
pub struct Scheduler {
    pipeline: Pipeline,
    interval: Duration,
    options: RunOptions,
    max_runs: Option<usize>,
    state: SchedulerState,
}

impl Scheduler {
    /// Create a scheduler running generation every `interval`
    pub fn new(pipeline: Pipeline, interval: Duration) -> Self {
        Self {
            pipeline,
            interval,
            options: RunOptions::stage(Stage::Generation).with_resume(true),
            max_runs: None,
            state: SchedulerState::default(),
        }
    }

    /// Set batch size for every run
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.options = self.options.with_batch_size(batch_size);
        self
    }

    /// Stop after `max_runs` runs
    pub fn with_max_runs(mut self, max_runs: usize) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    /// Get the cumulative state
    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    /// Loop until cancelled (or `max_runs` is reached)
    pub async fn run(&mut self) -> SchedulerState {
        let cancel = self.pipeline.cancel_token();
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            max_runs = ?self.max_runs,
            "Scheduler started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let report = self.pipeline.run(&self.options).await;
            self.record(&report);
            tracing::info!(
                run = self.state.runs,
                completed = self.state.phrases_completed,
                failed = self.state.phrases_failed,
                estimated_cost = self.state.estimated_cost,
                "Scheduled run finished"
            );

            if self.max_runs.is_some_and(|max| self.state.runs >= max) {
                break;
            }
            if !cancellable_sleep(self.interval, &cancel).await {
                break;
            }
        }

        tracing::info!(runs = self.state.runs, "Scheduler stopped");
        self.state.clone()
    }

    fn record(&mut self, report: &PipelineReport) {
        self.state.runs += 1;
        self.state.last_run = Some(Utc::now());

        let Some(entry) = report.get(Stage::Generation) else {
            return;
        };
        self.state.last_error = entry.error.clone();
        if let Some(StageSummary::Generation(summary)) = &entry.summary {
            self.state.phrases_completed += summary.completed;
            self.state.phrases_failed += summary.failed;
            self.state.worlds_generated += summary.worlds_generated;
            self.state.estimated_cost += summary.estimated_cost;
        }
    }
}
