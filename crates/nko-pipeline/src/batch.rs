//! Checkpointed batch runner
//!
//! Items are split into fixed-size batches in input order and processed
//! strictly sequentially. Each item ends COMPLETED or FAILED for the run;
//! failures never abort the batch. After every batch the checkpoint and
//! progress are persisted, so a crash loses at most the batch in flight.
//! Cancellation is checked before each batch and during the inter-batch
//! wait; a batch that has started always runs to the end.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use nko_core::{Checkpoint, CostModel, PipelineConfig, Progress, Result, WorkItem};

use crate::checkpoint::CheckpointStore;

/// Longest single sleep while waiting on a cancellable delay
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Batch runner configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Items per batch
    pub batch_size: usize,
    /// Pause between items of a batch
    pub inter_item_delay: Duration,
    /// Pause between batches
    pub inter_batch_delay: Duration,
    /// Estimated cost added per completed item
    pub cost_per_item: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::from_pipeline(&PipelineConfig::default(), &CostModel::default())
    }
}

impl BatchConfig {
    /// Derive from pipeline settings and the cost model
    pub fn from_pipeline(pipeline: &PipelineConfig, cost: &CostModel) -> Self {
        Self {
            batch_size: pipeline.batch_size,
            inter_item_delay: pipeline.inter_item_delay(),
            inter_batch_delay: pipeline.inter_batch_delay(),
            cost_per_item: cost.cost_per_phrase(),
        }
    }

    /// Set batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Remove both rate-limiting delays
    pub fn without_delays(mut self) -> Self {
        self.inter_item_delay = Duration::ZERO;
        self.inter_batch_delay = Duration::ZERO;
        self
    }
}

/// What a successful item produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemOutcome {
    /// Derived units (e.g. worlds generated)
    pub units: usize,
}

/// Result of one batch run
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// Keys completed in this run, in processing order
    pub completed: Vec<String>,
    /// Keys failed in this run, in processing order
    pub failed: Vec<String>,
    /// Items skipped because the checkpoint already had them
    pub skipped: usize,
    /// Size of each processed batch
    pub batch_sizes: Vec<usize>,
    /// Stopped early by cancellation
    pub cancelled: bool,
    /// Final run statistics
    pub progress: Progress,
}

impl BatchReport {
    /// Number of batches processed
    pub fn batches(&self) -> usize {
        self.batch_sizes.len()
    }

    /// Check if any item failed
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Drives per-item operations in checkpointed batches
pub struct BatchRunner {
    config: BatchConfig,
    store: Arc<dyn CheckpointStore>,
    cancel: CancellationToken,
}

impl BatchRunner {
    /// Create a new runner
    pub fn new(config: BatchConfig, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            config,
            store,
            cancel: CancellationToken::new(),
        }
    }

    /// Share a cancellation token with the caller
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Items a run would attempt: all of them, or those not yet completed on resume
    pub fn candidates<I: WorkItem>(&self, items: Vec<I>, resume: bool) -> Result<Vec<I>> {
        if resume {
            Ok(self.store.load()?.pending(items))
        } else {
            Ok(items)
        }
    }

    /// Process `items` through `operation`
    ///
    /// With `resume`, items already completed in the stored checkpoint are
    /// skipped (previously failed items are attempted again). Without it the
    /// run starts from an empty checkpoint.
    pub async fn run<I, F, Fut>(&self, items: Vec<I>, resume: bool, mut operation: F) -> Result<BatchReport>
    where
        I: WorkItem,
        F: FnMut(I) -> Fut,
        Fut: Future<Output = Result<ItemOutcome>>,
    {
        let mut checkpoint = if resume {
            self.store.load()?
        } else {
            Checkpoint::default()
        };

        let input_count = items.len();
        let pending = checkpoint.pending(items);
        let skipped = input_count - pending.len();

        let batch_size = self.config.batch_size.max(1);
        let total_batches = pending.len().div_ceil(batch_size);

        let mut progress = Progress::new(pending.len());
        progress.skipped = skipped;

        let mut report = BatchReport {
            completed: Vec::new(),
            failed: Vec::new(),
            skipped,
            batch_sizes: Vec::new(),
            cancelled: false,
            progress: progress.clone(),
        };

        tracing::info!(
            total = pending.len(),
            skipped,
            batch_size,
            batches = total_batches,
            resume,
            "Starting batch run"
        );

        let mut remaining = pending.into_iter();
        for batch_index in 0..total_batches {
            if self.cancel.is_cancelled() {
                tracing::info!(batch = batch_index + 1, "Cancelled before batch, stopping");
                report.cancelled = true;
                break;
            }

            let batch: Vec<I> = remaining.by_ref().take(batch_size).collect();
            let batch_len = batch.len();
            tracing::info!(
                batch = batch_index + 1,
                of = total_batches,
                items = batch_len,
                "Processing batch"
            );

            for (position, item) in batch.into_iter().enumerate() {
                let key = item.key();
                match operation(item).await {
                    Ok(outcome) => {
                        checkpoint.mark_completed(key.as_str());
                        progress.completed += 1;
                        progress.worlds_generated += outcome.units;
                        progress.estimated_cost += self.config.cost_per_item;
                        tracing::debug!(item = %key, units = outcome.units, "Item completed");
                        report.completed.push(key);
                    }
                    Err(e) => {
                        checkpoint.mark_failed(key.as_str());
                        progress.failed += 1;
                        tracing::warn!(item = %key, error = %e, "Item failed");
                        report.failed.push(key);
                    }
                }

                if position + 1 < batch_len && !self.config.inter_item_delay.is_zero() {
                    tokio::time::sleep(self.config.inter_item_delay).await;
                }
            }

            progress.batches_processed += 1;
            progress.updated_at = chrono::Utc::now();
            self.store.save(&checkpoint, &progress)?;
            report.batch_sizes.push(batch_len);

            tracing::info!(
                batch = batch_index + 1,
                completed = progress.completed,
                failed = progress.failed,
                estimated_cost = progress.estimated_cost,
                "Batch checkpointed"
            );

            let is_last = batch_index + 1 == total_batches;
            if !is_last && !cancellable_sleep(self.config.inter_batch_delay, &self.cancel).await {
                tracing::info!("Cancelled during inter-batch wait, stopping");
                report.cancelled = true;
                break;
            }
        }

        report.progress = progress;
        tracing::info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            skipped = report.skipped,
            cancelled = report.cancelled,
            "Batch run finished"
        );
        Ok(report)
    }
}

/// Sleep for `duration`, waking early on cancellation
///
/// Returns `false` if cancelled. The token is also polled at least every
/// [`CANCEL_POLL_INTERVAL`].
pub async fn cancellable_sleep(duration: Duration, cancel: &CancellationToken) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        let step = (deadline - now).min(CANCEL_POLL_INTERVAL);
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(step) => {}
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use nko_core::{ExpansionQueueItem, NkoError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct Item(u32);

    impl WorkItem for Item {
        fn key(&self) -> String {
            self.0.to_string()
        }
    }

    /// In-memory store that counts saves
    #[derive(Default)]
    struct MemoryStore {
        checkpoint: Mutex<Checkpoint>,
        saves: AtomicUsize,
    }

    impl CheckpointStore for MemoryStore {
        fn load(&self) -> Result<Checkpoint> {
            Ok(self.checkpoint.lock().unwrap().clone())
        }

        fn save(&self, checkpoint: &Checkpoint, _progress: &Progress) -> Result<()> {
            *self.checkpoint.lock().unwrap() = checkpoint.clone();
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn load_progress(&self) -> Result<Option<Progress>> {
            Ok(None)
        }

        fn clear(&self) -> Result<()> {
            *self.checkpoint.lock().unwrap() = Checkpoint::default();
            Ok(())
        }
    }

    fn config(batch_size: usize) -> BatchConfig {
        BatchConfig {
            batch_size,
            inter_item_delay: Duration::ZERO,
            inter_batch_delay: Duration::ZERO,
            cost_per_item: 0.5,
        }
    }

    fn keys(values: &[u32]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_batch() {
        let store = Arc::new(MemoryStore::default());
        let runner = BatchRunner::new(config(2), store.clone());

        let items: Vec<Item> = (1..=5).map(Item).collect();
        let report = runner
            .run(items, false, |item| async move {
                if item.0 == 3 {
                    Err(NkoError::Llm("bad output".into()))
                } else {
                    Ok(ItemOutcome { units: 5 })
                }
            })
            .await
            .unwrap();

        assert_eq!(report.completed, keys(&[1, 2, 4, 5]));
        assert_eq!(report.failed, keys(&[3]));
        assert_eq!(report.batch_sizes, vec![2, 2, 1]);
        assert_eq!(report.batches(), 3);
        assert_eq!(store.saves.load(Ordering::SeqCst), 3);

        assert_eq!(report.progress.completed, 4);
        assert_eq!(report.progress.failed, 1);
        assert_eq!(report.progress.worlds_generated, 20);
        assert!((report.progress.estimated_cost - 2.0).abs() < 1e-9);

        let checkpoint = store.load().unwrap();
        assert_eq!(checkpoint.completed_phrases.len(), 4);
        assert!(checkpoint.failed_phrases.contains("3"));
    }

    #[tokio::test]
    async fn test_resume_skips_completed_and_retries_failed() {
        let store = Arc::new(MemoryStore::default());
        {
            let mut checkpoint = store.checkpoint.lock().unwrap();
            checkpoint.mark_completed("1");
            checkpoint.mark_failed("2");
        }
        let runner = BatchRunner::new(config(10), store.clone());

        let candidates = runner.candidates((1..=3).map(Item).collect(), true).unwrap();
        let candidate_keys: Vec<String> = candidates.iter().map(|i| i.key()).collect();
        assert_eq!(candidate_keys, keys(&[2, 3]));

        let seen = Mutex::new(Vec::new());
        let report = runner
            .run((1..=3).map(Item).collect(), true, |item| {
                seen.lock().unwrap().push(item.0);
                async { Ok(ItemOutcome::default()) }
            })
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![2, 3]);
        assert_eq!(report.skipped, 1);
        let checkpoint = store.load().unwrap();
        assert_eq!(checkpoint.completed_phrases.len(), 3);
        assert!(checkpoint.failed_phrases.is_empty());
    }

    #[tokio::test]
    async fn test_without_resume_processes_everything() {
        let store = Arc::new(MemoryStore::default());
        store.checkpoint.lock().unwrap().mark_completed("1");
        let runner = BatchRunner::new(config(10), store.clone());

        let report = runner
            .run((1..=2).map(Item).collect(), false, |_| async {
                Ok(ItemOutcome::default())
            })
            .await
            .unwrap();

        assert_eq!(report.completed, keys(&[1, 2]));
        assert_eq!(report.skipped, 0);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let store = Arc::new(MemoryStore::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runner = BatchRunner::new(config(2), store.clone()).with_cancel_token(cancel);

        let report = runner
            .run((1..=4).map(Item).collect(), false, |_| async {
                Ok(ItemOutcome::default())
            })
            .await
            .unwrap();

        assert!(report.cancelled);
        assert!(report.completed.is_empty());
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_batch_finishes_in_flight_batch() {
        let store = Arc::new(MemoryStore::default());
        let cancel = CancellationToken::new();
        let runner = BatchRunner::new(
            BatchConfig {
                inter_batch_delay: Duration::from_secs(30),
                ..config(2)
            },
            store.clone(),
        )
        .with_cancel_token(cancel.clone());

        let report = runner
            .run((1..=6).map(Item).collect(), false, |item| {
                if item.0 == 1 {
                    cancel.cancel();
                }
                async { Ok(ItemOutcome::default()) }
            })
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.completed, keys(&[1, 2]));
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inter_item_and_batch_delays() {
        let store = Arc::new(MemoryStore::default());
        let runner = BatchRunner::new(
            BatchConfig {
                inter_item_delay: Duration::from_millis(500),
                inter_batch_delay: Duration::from_secs(2),
                ..config(2)
            },
            store,
        );

        let started = Instant::now();
        runner
            .run((1..=3).map(Item).collect(), false, |_| async {
                Ok(ItemOutcome::default())
            })
            .await
            .unwrap();

        // one inter-item pause in batch 1, one inter-batch pause
        assert_eq!(started.elapsed(), Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_queue_items_are_opaque_work() {
        let store = Arc::new(MemoryStore::default());
        let runner = BatchRunner::new(config(5), store);
        let items = vec![
            ExpansionQueueItem::new("ߞߊ߲", "dictionary", 1),
            ExpansionQueueItem::new("ߛߓߍ", "corpus", 2),
        ];

        let report = runner
            .run(items, false, |_| async { Ok(ItemOutcome { units: 1 }) })
            .await
            .unwrap();
        assert_eq!(report.completed, vec!["ߞߊ߲".to_string(), "ߛߓߍ".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellable_sleep() {
        let cancel = CancellationToken::new();
        assert!(cancellable_sleep(Duration::from_secs(3), &cancel).await);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        assert!(!cancellable_sleep(Duration::from_secs(60), &cancel).await);
        assert!(started.elapsed() <= Duration::from_secs(2));
    }
}
