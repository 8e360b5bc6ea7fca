//! NKO Dedup - Phrase consolidation
//!
//! Turns raw detections into a canonical vocabulary:
//! normalization, character-set similarity, single-linkage
//! deduplication and the vocabulary artifact the generation
//! stage consumes.

pub mod dedup;
pub mod normalize;
pub mod similarity;
pub mod stats;
pub mod vocabulary;

pub use dedup::{deduplicate, Consolidation, PhraseDeduplicator, DEFAULT_SIMILARITY_THRESHOLD};
pub use normalize::{normalize, normalize_opt};
pub use similarity::similarity;
pub use stats::ConsolidationStats;
pub use vocabulary::{read_json, write_json_atomic, VocabularyArtifact};
