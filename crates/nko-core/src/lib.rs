//! NKO Core - Domain models, traits, and shared types
//!
//! This crate defines the core abstractions used throughout the corpus pipeline:
//! - Corpus models (detections, canonical phrases, generated worlds)
//! - Resumable batch state (checkpoint, progress)
//! - Common error types
//! - Collaborator traits (detection source, world generator, trajectory store, LLM)
//! - Configuration management
//! - Exponential-backoff retry executor

pub mod config;
pub mod cost;
pub mod retry;

pub use config::{
    AppConfig, ConfigError, DatabaseConfig, LlmConfig, LlmProvider, LoggingConfig,
    PipelineConfig, RetryConfig,
};
pub use cost::{CostEstimate, CostModel};
pub use retry::{retry_with_backoff, RetryExecutor, RetryPolicy};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Error Types
// ============================================================================

/// Core error types for pipeline operations
#[derive(Error, Debug)]
pub enum NkoError {
    #[error("Transient collaborator error: {0}")]
    Transient(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("LLM request rejected: {0}")]
    LlmRejected(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Giving up after {attempts} attempt(s): {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<NkoError>,
    },

    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, NkoError>;

/// Coarse classification of an [`NkoError`], used by retry policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    RateLimited,
    Llm,
    LlmRejected,
    Database,
    RetryExhausted,
    DataIntegrity,
    Validation,
    Config,
    Cancelled,
    Io,
    Serialization,
    Other,
}

impl NkoError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Llm(_) => ErrorKind::Llm,
            Self::LlmRejected(_) => ErrorKind::LlmRejected,
            Self::Database(_) => ErrorKind::Database,
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Self::DataIntegrity(_) => ErrorKind::DataIntegrity,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Config(_) => ErrorKind::Config,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Other(_) => ErrorKind::Other,
        }
    }

    /// Number of attempts recorded by a terminal retry error
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetryExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

// ============================================================================
// Corpus Models
// ============================================================================

/// A single raw recognized text occurrence produced by the extraction collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Upstream identifier (numeric ids are kept as their decimal text)
    #[serde(default, deserialize_with = "id_from_string_or_number")]
    pub id: String,

    /// Raw recognized N'Ko text
    pub nko_text: String,

    /// Latin transliteration, if the recognizer produced one
    #[serde(default)]
    pub latin_transliteration: Option<String>,

    /// English translation, if the recognizer produced one
    #[serde(default)]
    pub english_translation: Option<String>,

    /// Recognition confidence (0.0 - 1.0)
    #[serde(default)]
    pub confidence: f64,

    /// Source reference (frame identifier)
    #[serde(default)]
    pub frame_id: Option<String>,
}

impl Detection {
    /// Create a new detection
    pub fn new(id: impl Into<String>, nko_text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nko_text: nko_text.into(),
            latin_transliteration: None,
            english_translation: None,
            confidence: 0.0,
            frame_id: None,
        }
    }

    /// Set confidence score
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Set source frame
    pub fn with_frame(mut self, frame_id: impl Into<String>) -> Self {
        self.frame_id = Some(frame_id.into());
        self
    }

    /// Set transliteration
    pub fn with_transliteration(mut self, latin: impl Into<String>) -> Self {
        self.latin_transliteration = Some(latin.into());
        self
    }

    /// Set translation
    pub fn with_translation(mut self, english: impl Into<String>) -> Self {
        self.english_translation = Some(english.into());
        self
    }
}

fn id_from_string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(id) => Ok(id),
        serde_json::Value::Number(id) => Ok(id.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

/// The deduplicated representative of a cluster of near-identical detections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPhrase {
    /// Canonical N'Ko text (longest member of the cluster)
    pub nko_text: String,

    /// Transliteration from the highest-confidence member detection
    #[serde(default)]
    pub latin_transliteration: Option<String>,

    /// Translation from the highest-confidence member detection
    #[serde(default)]
    pub english_translation: Option<String>,

    /// Confidence of the best member detection
    #[serde(default)]
    pub confidence: f64,

    /// Number of detections merged into this phrase
    pub occurrences: usize,

    /// Unique source references that contributed
    #[serde(default)]
    pub sources: BTreeSet<String>,

    /// Non-canonical member texts merged into this phrase
    #[serde(default)]
    pub variants: Vec<String>,
}

/// One generated usage context ("world") for a canonical phrase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct World {
    /// Variant name (e.g. "everyday", "proverb")
    pub variant: String,

    /// Short description of the situation
    pub scenario: String,

    /// Example sentence in N'Ko
    pub nko_sentence: String,

    /// English rendering of the example
    #[serde(default)]
    pub translation: String,
}

/// Word pending enrichment in the expansion queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpansionQueueItem {
    pub id: Uuid,
    pub word: String,
    pub source_type: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl ExpansionQueueItem {
    /// Create a new queue item
    pub fn new(word: impl Into<String>, source_type: impl Into<String>, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            word: word.into(),
            source_type: source_type.into(),
            priority,
            created_at: Utc::now(),
        }
    }
}

/// A uniquely keyed unit of work for the batch runner
pub trait WorkItem {
    /// Stable key recorded in the checkpoint
    fn key(&self) -> String;
}

impl WorkItem for CanonicalPhrase {
    fn key(&self) -> String {
        self.nko_text.clone()
    }
}

impl WorkItem for ExpansionQueueItem {
    fn key(&self) -> String {
        self.word.clone()
    }
}

// ============================================================================
// Batch State
// ============================================================================

/// Persistent record of which work items completed or failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub completed_phrases: BTreeSet<String>,
    pub failed_phrases: BTreeSet<String>,
    pub last_updated: DateTime<Utc>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            completed_phrases: BTreeSet::new(),
            failed_phrases: BTreeSet::new(),
            last_updated: Utc::now(),
        }
    }
}

impl Checkpoint {
    /// Record a successful item
    pub fn mark_completed(&mut self, key: impl Into<String>) {
        let key = key.into();
        self.failed_phrases.remove(&key);
        self.completed_phrases.insert(key);
        self.last_updated = Utc::now();
    }

    /// Record a failed item
    pub fn mark_failed(&mut self, key: impl Into<String>) {
        self.failed_phrases.insert(key.into());
        self.last_updated = Utc::now();
    }

    /// Check whether an item already completed
    pub fn is_completed(&self, key: &str) -> bool {
        self.completed_phrases.contains(key)
    }

    /// Items still to be attempted; previously failed items are included
    pub fn pending<I: WorkItem>(&self, items: Vec<I>) -> Vec<I> {
        items
            .into_iter()
            .filter(|item| !self.is_completed(&item.key()))
            .collect()
    }
}

/// Ephemeral run statistics, persisted for observability only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub run_id: Uuid,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub worlds_generated: usize,
    pub batches_processed: usize,
    pub estimated_cost: f64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Progress {
    /// Start a new run over `total` items
    pub fn new(total: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            total,
            completed: 0,
            failed: 0,
            skipped: 0,
            worlds_generated: 0,
            batches_processed: 0,
            estimated_cost: 0.0,
            started_at: now,
            updated_at: now,
        }
    }

    /// Items attempted so far in this run
    pub fn processed(&self) -> usize {
        self.completed + self.failed
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Upstream extraction collaborator, read page by page
#[async_trait::async_trait]
pub trait DetectionSource: Send + Sync {
    /// Fetch one page; an empty page signals end of data
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<Detection>>;

    /// Get source name for logging
    fn name(&self) -> &str;
}

/// Downstream generation collaborator
#[async_trait::async_trait]
pub trait WorldGenerator: Send + Sync {
    /// Generate usage worlds for a canonical phrase
    async fn generate(&self, phrase: &CanonicalPhrase) -> Result<Vec<World>>;
}

/// Persistence collaborator for generated worlds
#[async_trait::async_trait]
pub trait TrajectoryStore: Send + Sync {
    /// Persist the worlds generated for a phrase
    async fn save_worlds(&self, phrase: &CanonicalPhrase, worlds: &[World]) -> Result<()>;
}

/// Trait for LLM clients
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a response
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Get client name for logging
    fn name(&self) -> &str;
}

// ============================================================================
// Tests
// ============================================================================
