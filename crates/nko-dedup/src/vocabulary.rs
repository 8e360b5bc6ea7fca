//! Vocabulary artifact
//!
//! The consolidation stage hands its output to generation through
//! `vocabulary.json`: `{ vocabulary: [...], phrase_to_detections: {...} }`
//! plus run metadata. Files are written atomically as indented UTF-8 JSON.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use nko_core::{CanonicalPhrase, NkoError, Result};

use crate::dedup::Consolidation;
use crate::stats::ConsolidationStats;

/// Serialized consolidation output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocabularyArtifact {
    pub vocabulary: Vec<CanonicalPhrase>,
    pub phrase_to_detections: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub stats: ConsolidationStats,
    #[serde(default)]
    pub similarity_threshold: Option<f64>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl VocabularyArtifact {
    /// Build an artifact from a consolidation run
    pub fn from_consolidation(consolidation: Consolidation, threshold: f64) -> Self {
        Self {
            vocabulary: consolidation.phrases,
            phrase_to_detections: consolidation.phrase_to_detections,
            stats: consolidation.stats,
            similarity_threshold: Some(threshold),
            created_at: Utc::now(),
        }
    }

    /// Load from disk; a missing file is a data integrity error
    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }

    /// Write to disk atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    /// Number of canonical phrases
    pub fn len(&self) -> usize {
        self.vocabulary.len()
    }

    /// Check if the vocabulary is empty
    pub fn is_empty(&self) -> bool {
        self.vocabulary.is_empty()
    }
}

/// Read a required JSON artifact
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(NkoError::DataIntegrity(format!(
            "required artifact not found: {}",
            path.display()
        )));
    }

    let file = File::open(path)?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| {
        NkoError::DataIntegrity(format!("corrupt artifact {}: {e}", path.display()))
    })
}

/// Write pretty JSON through a temp file in the same directory, then rename
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let parent_dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent_dir)?;

    let temp_file = NamedTempFile::new_in(parent_dir)?;
    {
        let mut writer = BufWriter::new(&temp_file);
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }

    temp_file
        .persist(path)
        .map_err(|e| NkoError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::deduplicate;
    use nko_core::Detection;

    #[test]
    fn test_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vocabulary.json");

        let detections = vec![
            Detection::new("1", "ߒߞߏ").with_confidence(0.9),
            Detection::new("2", "ߒߞߏ ").with_confidence(0.4),
        ];
        let artifact = VocabularyArtifact::from_consolidation(deduplicate(&detections, 0.85), 0.85);
        artifact.save(&path).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\n  \"vocabulary\""));
        assert!(raw.contains("ߒߞߏ"));

        let loaded = VocabularyArtifact::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.vocabulary[0].occurrences, 2);
        assert_eq!(loaded.phrase_to_detections["ߒߞߏ"].len(), 2);
        assert_eq!(loaded.similarity_threshold, Some(0.85));
    }

    #[test]
    fn test_missing_artifact_is_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = VocabularyArtifact::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, NkoError::DataIntegrity(_)));
    }

    #[test]
    fn test_minimal_artifact_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocabulary.json");
        fs::write(
            &path,
            r#"{"vocabulary":[{"nko_text":"ABC","occurrences":2}],"phrase_to_detections":{"ABC":["a","b"]}}"#,
        )
        .unwrap();

        let loaded = VocabularyArtifact::load(&path).unwrap();
        assert_eq!(loaded.vocabulary[0].nko_text, "ABC");
        assert!(loaded.similarity_threshold.is_none());
    }
}
