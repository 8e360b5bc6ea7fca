//! Checkpoint persistence
//!
//! The checkpoint file is authoritative for resumption; the progress file is
//! written alongside it for observability only. One batch runner owns a
//! given pair of files at a time.

use std::path::{Path, PathBuf};

use nko_core::{Checkpoint, NkoError, Progress, Result};
use nko_dedup::{read_json, write_json_atomic};

/// Durable storage for batch state
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint; an absent checkpoint is empty
    fn load(&self) -> Result<Checkpoint>;

    /// Persist checkpoint and progress after a batch
    fn save(&self, checkpoint: &Checkpoint, progress: &Progress) -> Result<()>;

    /// Load the last persisted progress, if any
    fn load_progress(&self) -> Result<Option<Progress>>;

    /// Remove all persisted state
    fn clear(&self) -> Result<()>;
}

/// Checkpoint and progress stored as two JSON files
#[derive(Debug, Clone)]
pub struct JsonCheckpointStore {
    checkpoint_path: PathBuf,
    progress_path: PathBuf,
}

impl JsonCheckpointStore {
    /// Create a store over explicit paths
    pub fn new(checkpoint_path: impl Into<PathBuf>, progress_path: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_path: checkpoint_path.into(),
            progress_path: progress_path.into(),
        }
    }

    /// Get the checkpoint file path
    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    /// Get the progress file path
    pub fn progress_path(&self) -> &Path {
        &self.progress_path
    }
}

impl CheckpointStore for JsonCheckpointStore {
    fn load(&self) -> Result<Checkpoint> {
        if !self.checkpoint_path.exists() {
            tracing::debug!(path = %self.checkpoint_path.display(), "No checkpoint, starting fresh");
            return Ok(Checkpoint::default());
        }
        read_json(&self.checkpoint_path)
    }

    fn save(&self, checkpoint: &Checkpoint, progress: &Progress) -> Result<()> {
        write_json_atomic(&self.checkpoint_path, checkpoint)?;
        write_json_atomic(&self.progress_path, progress)?;
        Ok(())
    }

    fn load_progress(&self) -> Result<Option<Progress>> {
        if !self.progress_path.exists() {
            return Ok(None);
        }
        read_json(&self.progress_path).map(Some)
    }

    fn clear(&self) -> Result<()> {
        for path in [&self.checkpoint_path, &self.progress_path] {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::info!(path = %path.display(), "Removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(NkoError::Io(e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> JsonCheckpointStore {
        JsonCheckpointStore::new(dir.join("checkpoint.json"), dir.join("progress.json"))
    }

    #[test]
    fn test_missing_checkpoint_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = store(dir.path()).load().unwrap();
        assert!(checkpoint.completed_phrases.is_empty());
        assert!(checkpoint.failed_phrases.is_empty());
        assert!(store(dir.path()).load_progress().unwrap().is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let mut checkpoint = Checkpoint::default();
        checkpoint.mark_completed("ߒߞߏ");
        checkpoint.mark_failed("ߞߊ߲");
        let mut progress = Progress::new(2);
        progress.completed = 1;
        progress.failed = 1;

        store.save(&checkpoint, &progress).unwrap();

        let reloaded = store.load().unwrap();
        assert!(reloaded.is_completed("ߒߞߏ"));
        assert!(reloaded.failed_phrases.contains("ߞߊ߲"));

        let progress = store.load_progress().unwrap().unwrap();
        assert_eq!(progress.completed, 1);

        let raw = std::fs::read_to_string(store.checkpoint_path()).unwrap();
        assert!(raw.contains("\"completed_phrases\""));
        assert!(raw.contains("\"last_updated\""));
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store
            .save(&Checkpoint::default(), &Progress::new(0))
            .unwrap();

        store.clear().unwrap();
        assert!(!store.checkpoint_path().exists());
        assert!(!store.progress_path().exists());
        // clearing twice is fine
        store.clear().unwrap();
    }

    #[test]
    fn test_corrupt_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        std::fs::write(store.checkpoint_path(), "{not json").unwrap();
        assert!(matches!(store.load(), Err(NkoError::DataIntegrity(_))));
    }
}
