//! NKO Pipeline - Stage orchestration for the N'Ko corpus
//!
//! This crate composes the corpus pipeline:
//! - Extraction: page raw detections out of the upstream store
//! - Consolidation: deduplicate detections into canonical phrases
//! - Generation: produce and persist usage worlds per phrase, in
//!   checkpointed batches that survive crashes and interrupts
//!
//! Stages hand off through JSON artifacts in the data directory, so any
//! stage can be run alone once its input exists.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use nko_core::{
    AppConfig, CostEstimate, DetectionSource, NkoError, PipelineConfig, Result, TrajectoryStore,
    WorldGenerator,
};

pub mod batch;
pub mod checkpoint;
pub mod http;
pub mod llm;
pub mod scheduler;
pub mod source;
pub mod stages;
pub mod store;
pub mod worlds;

pub use batch::{cancellable_sleep, BatchConfig, BatchReport, BatchRunner, ItemOutcome};
pub use checkpoint::{CheckpointStore, JsonCheckpointStore};
pub use llm::{create_llm_client, GeminiClient, OllamaClient, OpenAiClient};
pub use scheduler::{Scheduler, SchedulerState};
pub use source::{FileDetectionSource, RestDetectionSource};
pub use stages::{
    ConsolidationSummary, ExtractionSummary, GenerationSummary, Stage, StageReport, StageSummary,
};
pub use store::RestTrajectoryStore;
pub use worlds::LlmWorldGenerator;

use stages::GenerationDeps;

// ============================================================================
// Run Options
// ============================================================================

/// Parameters of one pipeline invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    /// Run only this stage (all stages when `None`)
    pub stage: Option<Stage>,

    /// Discover volumes and estimate cost without writing anything
    pub dry_run: bool,

    /// Cap every stage's input at `test_limit`
    pub test_mode: bool,

    /// Skip phrases the checkpoint already marks completed
    pub resume: bool,

    /// Explicit input cap, takes precedence over test mode
    pub limit: Option<usize>,

    /// Batch size override
    pub batch_size: Option<usize>,

    /// Similarity threshold override
    pub similarity_threshold: Option<f64>,
}

impl RunOptions {
    /// Run a single stage
    pub fn stage(stage: Stage) -> Self {
        Self {
            stage: Some(stage),
            ..Default::default()
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = Some(threshold);
        self
    }

    /// Stages this invocation covers, in execution order
    pub fn stages(&self) -> Vec<Stage> {
        match self.stage {
            Some(stage) => vec![stage],
            None => Stage::ALL.to_vec(),
        }
    }

    /// Input cap applied by every stage
    pub fn effective_limit(&self, pipeline: &PipelineConfig) -> Option<usize> {
        match (self.limit, self.test_mode) {
            (Some(limit), _) => Some(limit),
            (None, true) => Some(pipeline.test_limit),
            (None, false) => None,
        }
    }
}

// ============================================================================
// Pipeline Report
// ============================================================================

/// Result map of one invocation
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub stages: BTreeMap<Stage, StageReport>,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimate: Option<CostEstimate>,
}

impl PipelineReport {
    fn new(dry_run: bool) -> Self {
        Self {
            stages: BTreeMap::new(),
            dry_run,
            estimate: None,
        }
    }

    /// Get one stage's entry
    pub fn get(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.get(&stage)
    }

    /// Check if any stage failed outright
    pub fn has_fatal_errors(&self) -> bool {
        self.stages.values().any(StageReport::is_fatal)
    }

    /// Item-level failures across stages (reported, not fatal)
    pub fn item_failures(&self) -> usize {
        self.stages.values().map(StageReport::item_failures).sum()
    }

    /// Process exit status: 1 when a stage failed outright
    pub fn exit_code(&self) -> i32 {
        if self.has_fatal_errors() {
            1
        } else {
            0
        }
    }
}

// ============================================================================
// Pipeline Orchestrator
// ============================================================================

/// World generator, or the reason none could be built
///
/// Only generation needs the LLM, so a missing key fails that stage alone.
pub(crate) enum GeneratorSlot {
    Ready(Arc<dyn WorldGenerator>),
    Unavailable(String),
}

impl GeneratorSlot {
    pub(crate) fn get(&self) -> Result<&Arc<dyn WorldGenerator>> {
        match self {
            Self::Ready(generator) => Ok(generator),
            Self::Unavailable(reason) => Err(NkoError::Config(format!(
                "World generator unavailable: {reason}"
            ))),
        }
    }
}

/// Three-stage corpus pipeline
pub struct Pipeline {
    /// Application configuration
    config: AppConfig,

    /// Upstream detection source
    source: Arc<dyn DetectionSource>,

    /// World generator
    generator: GeneratorSlot,

    /// Trajectory persistence
    store: Arc<dyn TrajectoryStore>,

    /// Generation checkpoint
    checkpoint: Arc<dyn CheckpointStore>,

    /// Cooperative stop flag
    cancel: CancellationToken,
}

impl Pipeline {
    /// Create a pipeline over explicit collaborators
    ///
    /// The checkpoint is kept as JSON files in the configured data directory.
    pub fn new(
        config: AppConfig,
        source: Arc<dyn DetectionSource>,
        generator: Arc<dyn WorldGenerator>,
        store: Arc<dyn TrajectoryStore>,
    ) -> Self {
        Self::assemble(config, source, GeneratorSlot::Ready(generator), store)
    }

    fn assemble(
        config: AppConfig,
        source: Arc<dyn DetectionSource>,
        generator: GeneratorSlot,
        store: Arc<dyn TrajectoryStore>,
    ) -> Self {
        let checkpoint = Arc::new(JsonCheckpointStore::new(
            config.pipeline.checkpoint_path(),
            config.pipeline.progress_path(),
        ));
        Self {
            config,
            source,
            generator,
            store,
            checkpoint,
            cancel: CancellationToken::new(),
        }
    }

    /// Create a pipeline wired to the REST collaborators and configured LLM
    ///
    /// An LLM client that cannot be built (e.g. no API key) does not fail
    /// construction; the generation stage reports it as a configuration error.
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let source = Arc::new(RestDetectionSource::from_config(&config.database)?);
        let store = Arc::new(RestTrajectoryStore::from_config(&config.database)?);
        let generator = match create_llm_client(&config.llm) {
            Ok(llm) => GeneratorSlot::Ready(Arc::new(LlmWorldGenerator::new(
                Arc::from(llm),
                config.pipeline.worlds_per_phrase,
            ))),
            Err(e) => {
                tracing::warn!(error = %e, "LLM client unavailable; generation will fail");
                GeneratorSlot::Unavailable(e.to_string())
            }
        };

        tracing::info!(
            database = %config.database.url,
            llm = ?config.llm.provider,
            model = %config.llm.model,
            "Pipeline configured"
        );
        Ok(Self::assemble(config, source, generator, store))
    }

    /// Replace the detection source
    pub fn with_source(mut self, source: Arc<dyn DetectionSource>) -> Self {
        self.source = source;
        self
    }

    /// Replace the checkpoint store
    pub fn with_checkpoint_store(mut self, checkpoint: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Share a cancellation token with the caller
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Get the checkpoint store
    pub fn checkpoint_store(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoint
    }

    /// Get a handle on the cancellation token
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the stages `options` selects
    ///
    /// A stage error is recorded under that stage's `error` key. Stages after
    /// it are skipped rather than run against artifacts of an earlier run. A
    /// cancelled pipeline stops before the next stage.
    pub async fn run(&self, options: &RunOptions) -> PipelineReport {
        let mut report = PipelineReport::new(options.dry_run);
        let mut failed_upstream: Option<Stage> = None;

        for stage in options.stages() {
            if self.cancel.is_cancelled() {
                tracing::info!(stage = %stage, "Cancelled, not starting stage");
                break;
            }

            if let Some(failed) = failed_upstream {
                let reason = format!("{failed} failed in this run");
                tracing::warn!(stage = %stage, reason = %reason, "Skipping stage");
                report.stages.insert(stage, StageReport::skipped(reason));
                continue;
            }

            if let Some(reason) = self.dry_run_skip(stage, options, &report) {
                tracing::info!(stage = %stage, reason = %reason, "Skipping stage");
                report.stages.insert(stage, StageReport::skipped(reason));
                continue;
            }

            tracing::info!(stage = %stage, dry_run = options.dry_run, "Starting stage");
            let entry = match self.run_stage(stage, options).await {
                Ok(summary) => {
                    if let StageSummary::Extraction(extraction) = &summary {
                        report.estimate = extraction.estimate.clone();
                    }
                    tracing::info!(stage = %stage, "Stage finished");
                    StageReport::succeeded(summary)
                }
                Err(e) => {
                    tracing::error!(stage = %stage, error = %e, "Stage failed");
                    failed_upstream = Some(stage);
                    StageReport::failed(&e)
                }
            };
            report.stages.insert(stage, entry);
        }

        tracing::info!(
            stages = report.stages.len(),
            fatal = report.has_fatal_errors(),
            item_failures = report.item_failures(),
            "Pipeline run finished"
        );
        report
    }

    /// Run one stage, propagating its error
    pub async fn run_stage(&self, stage: Stage, options: &RunOptions) -> Result<StageSummary> {
        match stage {
            Stage::Extraction => stages::run_extraction(
                self.source.as_ref(),
                &self.config,
                options,
                &self.cancel,
            )
            .await
            .map(StageSummary::Extraction),
            Stage::Consolidation => {
                stages::run_consolidation(&self.config, options).map(StageSummary::Consolidation)
            }
            Stage::Generation => stages::run_generation(
                GenerationDeps {
                    generator: &self.generator,
                    store: &self.store,
                    checkpoint: &self.checkpoint,
                    cancel: &self.cancel,
                },
                &self.config,
                options,
            )
            .await
            .map(StageSummary::Generation),
        }
    }

    /// In a dry run, a stage whose input the same run would have produced
    /// is covered by the upstream estimate instead of failing
    fn dry_run_skip(
        &self,
        stage: Stage,
        options: &RunOptions,
        report: &PipelineReport,
    ) -> Option<String> {
        if !options.dry_run {
            return None;
        }
        let previous = stage.previous()?;
        let artifact = stage.input_artifact(&self.config.pipeline)?;
        if report.stages.contains_key(&previous) && !artifact.exists() {
            Some(format!(
                "{} not written in dry run; covered by the estimate",
                artifact.display()
            ))
        } else {
            None
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_options_stages() {
        assert_eq!(RunOptions::default().stages(), Stage::ALL.to_vec());
        assert_eq!(
            RunOptions::stage(Stage::Generation).stages(),
            vec![Stage::Generation]
        );
    }

    #[test]
    fn test_effective_limit() {
        let pipeline = PipelineConfig::default();
        assert_eq!(RunOptions::default().effective_limit(&pipeline), None);
        assert_eq!(
            RunOptions::default()
                .with_test_mode(true)
                .effective_limit(&pipeline),
            Some(5)
        );
        assert_eq!(
            RunOptions::default()
                .with_test_mode(true)
                .with_limit(2)
                .effective_limit(&pipeline),
            Some(2)
        );
    }

    #[test]
    fn test_exit_code() {
        let mut report = PipelineReport::new(false);
        report.stages.insert(
            Stage::Generation,
            StageReport::succeeded(StageSummary::Generation(GenerationSummary {
                failed: 2,
                ..Default::default()
            })),
        );
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.item_failures(), 2);

        report.stages.insert(
            Stage::Consolidation,
            StageReport::failed(&nko_core::NkoError::DataIntegrity("missing".into())),
        );
        assert_eq!(report.exit_code(), 1);

        let json = serde_json::to_value(&report).unwrap();
        assert!(json["stages"]["consolidation"]["error"].is_string());
        assert_eq!(json["stages"]["generation"]["failed"], 2);
    }
}
