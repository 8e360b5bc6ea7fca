//! Pipeline stages
//!
//! Stages communicate only through artifacts in the data directory:
//! extraction writes `detections.json`, consolidation turns it into
//! `vocabulary.json`, generation reads the vocabulary and drives the
//! checkpointed batch runner.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use nko_core::{
    retry_with_backoff, AppConfig, CostEstimate, Detection, DetectionSource, ErrorKind, NkoError,
    PipelineConfig, Result, TrajectoryStore,
};
use nko_dedup::{read_json, write_json_atomic, ConsolidationStats, PhraseDeduplicator, VocabularyArtifact};

use crate::batch::{BatchConfig, BatchRunner, ItemOutcome};
use crate::checkpoint::CheckpointStore;
use crate::{GeneratorSlot, RunOptions};

// ============================================================================
// Stage
// ============================================================================

/// Named pipeline stage, ordered by execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extraction,
    Consolidation,
    Generation,
}

impl Stage {
    /// All stages in execution order
    pub const ALL: [Stage; 3] = [Stage::Extraction, Stage::Consolidation, Stage::Generation];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Consolidation => "consolidation",
            Stage::Generation => "generation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = NkoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "extraction" | "extract" => Ok(Stage::Extraction),
            "consolidation" | "consolidate" => Ok(Stage::Consolidation),
            "generation" | "generate" => Ok(Stage::Generation),
            other => Err(NkoError::Validation(format!("Unknown stage: {other}"))),
        }
    }
}

impl Stage {
    /// Stage whose artifact this stage consumes
    pub fn previous(&self) -> Option<Stage> {
        match self {
            Stage::Extraction => None,
            Stage::Consolidation => Some(Stage::Extraction),
            Stage::Generation => Some(Stage::Consolidation),
        }
    }

    /// Artifact this stage requires on disk
    pub fn input_artifact(&self, pipeline: &PipelineConfig) -> Option<PathBuf> {
        match self {
            Stage::Extraction => None,
            Stage::Consolidation => Some(pipeline.detections_path()),
            Stage::Generation => Some(pipeline.vocabulary_path()),
        }
    }
}

// ============================================================================
// Stage Reports
// ============================================================================

/// Extraction stage outcome
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionSummary {
    pub pages: usize,
    pub detections: usize,
    /// Distinct source references (frames) seen
    pub frames: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub written: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimate: Option<CostEstimate>,
}

/// Consolidation stage outcome
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationSummary {
    pub detections: usize,
    pub threshold: f64,
    pub canonical_phrases: usize,
    pub reduction_ratio: f64,
    pub stats: ConsolidationStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub written: Option<PathBuf>,
}

/// Generation stage outcome
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationSummary {
    pub phrases: usize,
    pub pending: usize,
    pub skipped: usize,
    pub completed: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_phrases: Vec<String>,
    pub worlds_generated: usize,
    pub batches: usize,
    pub cancelled: bool,
    pub estimated_cost: f64,
}

/// Per-stage summary
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StageSummary {
    Extraction(ExtractionSummary),
    Consolidation(ConsolidationSummary),
    Generation(GenerationSummary),
}

/// Entry in the orchestrator's per-stage result map
///
/// Serializes the summary fields inline, plus `error` and `error_kind` when
/// the stage failed outright.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    #[serde(flatten)]
    pub summary: Option<StageSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl StageReport {
    pub fn succeeded(summary: StageSummary) -> Self {
        Self {
            summary: Some(summary),
            skip_reason: None,
            error: None,
            error_kind: None,
        }
    }

    pub fn failed(error: &NkoError) -> Self {
        Self {
            summary: None,
            skip_reason: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            summary: None,
            skip_reason: Some(reason.into()),
            error: None,
            error_kind: None,
        }
    }

    /// The stage raised instead of producing a summary
    pub fn is_fatal(&self) -> bool {
        self.error.is_some()
    }

    /// Items that failed inside an otherwise successful stage
    pub fn item_failures(&self) -> usize {
        match &self.summary {
            Some(StageSummary::Generation(summary)) => summary.failed,
            _ => 0,
        }
    }
}

// ============================================================================
// Extraction
// ============================================================================

/// Page the detection source and write `detections.json`
pub(crate) async fn run_extraction(
    source: &dyn DetectionSource,
    config: &AppConfig,
    options: &RunOptions,
    cancel: &CancellationToken,
) -> Result<ExtractionSummary> {
    let limit = options.effective_limit(&config.pipeline);
    let page_size = config.pipeline.page_size.max(1);

    let mut detections: Vec<Detection> = Vec::new();
    let mut pages = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(NkoError::Cancelled);
        }

        let want = match limit {
            Some(limit) if detections.len() >= limit => break,
            Some(limit) => page_size.min(limit - detections.len()),
            None => page_size,
        };
        let offset = detections.len();

        let page = retry_with_backoff("fetch_detections", &config.retry.database, || {
            source.fetch_page(offset, want)
        })
        .await?;

        if page.is_empty() {
            break;
        }
        pages += 1;
        tracing::debug!(source = source.name(), offset, count = page.len(), "Fetched page");
        detections.extend(page);
    }

    if let Some(limit) = limit {
        detections.truncate(limit);
    }

    let frames = count_frames(&detections);
    tracing::info!(
        source = source.name(),
        pages,
        detections = detections.len(),
        frames,
        "Extraction collected detections"
    );

    let mut summary = ExtractionSummary {
        pages,
        detections: detections.len(),
        frames,
        ..Default::default()
    };

    if options.dry_run {
        summary.estimate = Some(config.cost.estimate(frames));
    } else {
        let path = config.pipeline.detections_path();
        write_json_atomic(&path, &detections)?;
        tracing::info!(path = %path.display(), "Wrote detections");
        summary.written = Some(path);
    }

    Ok(summary)
}

/// Distinct frames; a detection without a frame counts on its own
fn count_frames(detections: &[Detection]) -> usize {
    let mut frames = HashSet::new();
    let mut unframed = 0;
    for detection in detections {
        match &detection.frame_id {
            Some(frame) => {
                frames.insert(frame.as_str());
            }
            None => unframed += 1,
        }
    }
    frames.len() + unframed
}

// ============================================================================
// Consolidation
// ============================================================================

/// Deduplicate `detections.json` into `vocabulary.json`
pub(crate) fn run_consolidation(
    config: &AppConfig,
    options: &RunOptions,
) -> Result<ConsolidationSummary> {
    let detections_path = config.pipeline.detections_path();
    let mut detections: Vec<Detection> = read_json(&detections_path)?;
    if let Some(limit) = options.effective_limit(&config.pipeline) {
        detections.truncate(limit);
    }

    let threshold = options
        .similarity_threshold
        .unwrap_or(config.pipeline.similarity_threshold);
    if !(0.0..=1.0).contains(&threshold) {
        return Err(NkoError::Validation(format!(
            "Similarity threshold must be within [0, 1], got {threshold}"
        )));
    }

    if options.dry_run {
        tracing::info!(detections = detections.len(), "Dry run: consolidation skipped");
        return Ok(ConsolidationSummary {
            detections: detections.len(),
            threshold,
            ..Default::default()
        });
    }

    let consolidation = PhraseDeduplicator::new()
        .with_threshold(threshold)
        .deduplicate(&detections);
    let stats = consolidation.stats.clone();
    tracing::info!("\n{}", stats.report());

    let artifact = VocabularyArtifact::from_consolidation(consolidation, threshold);
    let vocabulary_path = config.pipeline.vocabulary_path();
    artifact.save(&vocabulary_path)?;
    tracing::info!(
        path = %vocabulary_path.display(),
        phrases = artifact.len(),
        "Wrote vocabulary"
    );

    Ok(ConsolidationSummary {
        detections: detections.len(),
        threshold,
        canonical_phrases: artifact.len(),
        reduction_ratio: stats.reduction_ratio(),
        stats,
        written: Some(vocabulary_path),
    })
}

// ============================================================================
// Generation
// ============================================================================

/// Collaborators the generation stage drives
pub(crate) struct GenerationDeps<'a> {
    pub generator: &'a GeneratorSlot,
    pub store: &'a Arc<dyn TrajectoryStore>,
    pub checkpoint: &'a Arc<dyn CheckpointStore>,
    pub cancel: &'a CancellationToken,
}

/// Generate and store worlds for every pending vocabulary phrase
pub(crate) async fn run_generation(
    deps: GenerationDeps<'_>,
    config: &AppConfig,
    options: &RunOptions,
) -> Result<GenerationSummary> {
    let artifact = VocabularyArtifact::load(&config.pipeline.vocabulary_path())?;
    let mut phrases = artifact.vocabulary;
    if let Some(limit) = options.effective_limit(&config.pipeline) {
        phrases.truncate(limit);
    }
    let total = phrases.len();

    let mut batch_config = BatchConfig::from_pipeline(&config.pipeline, &config.cost);
    if let Some(batch_size) = options.batch_size {
        batch_config = batch_config.with_batch_size(batch_size);
    }
    let runner = BatchRunner::new(batch_config, deps.checkpoint.clone())
        .with_cancel_token(deps.cancel.clone());

    if options.dry_run {
        let pending = runner.candidates(phrases, options.resume)?.len();
        let estimated_cost = config.cost.generation_cost(pending);
        tracing::info!(total, pending, estimated_cost, "Dry run: generation skipped");
        return Ok(GenerationSummary {
            phrases: total,
            pending,
            skipped: total - pending,
            estimated_cost,
            ..Default::default()
        });
    }

    let generator = deps.generator.get()?.clone();
    let store = deps.store.clone();
    let llm_policy = config.retry.llm.clone();
    let database_policy = config.retry.database.clone();

    let report = runner
        .run(phrases, options.resume, move |phrase| {
            let generator = generator.clone();
            let store = store.clone();
            let llm_policy = llm_policy.clone();
            let database_policy = database_policy.clone();
            async move {
                let worlds = retry_with_backoff("generate_worlds", &llm_policy, || {
                    generator.generate(&phrase)
                })
                .await?;
                retry_with_backoff("save_worlds", &database_policy, || {
                    store.save_worlds(&phrase, &worlds)
                })
                .await?;
                Ok::<_, NkoError>(ItemOutcome {
                    units: worlds.len(),
                })
            }
        })
        .await?;

    let progress = &report.progress;
    Ok(GenerationSummary {
        phrases: total,
        pending: progress.total,
        skipped: report.skipped,
        completed: progress.completed,
        failed: progress.failed,
        failed_phrases: report.failed.clone(),
        worlds_generated: progress.worlds_generated,
        batches: report.batches(),
        cancelled: report.cancelled,
        estimated_cost: progress.estimated_cost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_parse_and_order() {
        assert_eq!("generation".parse::<Stage>().unwrap(), Stage::Generation);
        assert_eq!("Extract".parse::<Stage>().unwrap(), Stage::Extraction);
        assert!("publish".parse::<Stage>().is_err());

        let mut stages = vec![Stage::Generation, Stage::Extraction, Stage::Consolidation];
        stages.sort();
        assert_eq!(stages, Stage::ALL.to_vec());
        assert_eq!(Stage::Consolidation.to_string(), "consolidation");
        assert_eq!(Stage::Generation.previous(), Some(Stage::Consolidation));
        assert_eq!(Stage::Extraction.input_artifact(&PipelineConfig::default()), None);
    }

    #[test]
    fn test_count_frames() {
        let detections = vec![
            Detection::new("1", "ߊ").with_frame("f1"),
            Detection::new("2", "ߋ").with_frame("f1"),
            Detection::new("3", "ߌ").with_frame("f2"),
            Detection::new("4", "ߍ"),
        ];
        assert_eq!(count_frames(&detections), 3);
    }

    #[test]
    fn test_failed_report_serializes_error_key() {
        let report = StageReport::failed(&NkoError::DataIntegrity("vocabulary.json missing".into()));
        let json = serde_json::to_value(&report).unwrap();
        assert!(json["error"].as_str().unwrap().contains("vocabulary.json"));
        assert_eq!(json["error_kind"], "data_integrity");
        assert!(report.is_fatal());
    }

    #[test]
    fn test_success_report_inlines_summary() {
        let report = StageReport::succeeded(StageSummary::Generation(GenerationSummary {
            phrases: 3,
            completed: 2,
            failed: 1,
            failed_phrases: vec!["ߞ".to_string()],
            ..Default::default()
        }));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["completed"], 2);
        assert!(json.get("error").is_none());
        assert!(!report.is_fatal());
        assert_eq!(report.item_failures(), 1);
    }
}
