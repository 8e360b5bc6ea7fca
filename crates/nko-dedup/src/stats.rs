//! Consolidation statistics

use serde::{Deserialize, Serialize};

/// Counters describing one deduplication run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationStats {
    /// Detections handed to the deduplicator
    pub input_detections: usize,
    /// Detections whose normalized text was empty
    pub discarded_empty: usize,
    /// Distinct normalized texts
    pub exact_buckets: usize,
    /// Clusters emitted
    pub canonical_phrases: usize,
    /// Distinct texts folded into another canonical text
    pub merged_variants: usize,
}

impl ConsolidationStats {
    /// Detections that took part in clustering
    pub fn kept_detections(&self) -> usize {
        self.input_detections - self.discarded_empty
    }

    /// Canonical phrases per kept detection (lower means more duplication)
    pub fn reduction_ratio(&self) -> f64 {
        if self.kept_detections() == 0 {
            0.0
        } else {
            self.canonical_phrases as f64 / self.kept_detections() as f64
        }
    }

    /// Human-readable summary
    pub fn report(&self) -> String {
        format!(
            "=== Consolidation Report ===\n\
             Detections:        {} ({} empty after normalization)\n\
             Exact buckets:     {}\n\
             Canonical phrases: {}\n\
             Merged variants:   {}\n\
             Reduction ratio:   {:.1}%\n",
            self.input_detections,
            self.discarded_empty,
            self.exact_buckets,
            self.canonical_phrases,
            self.merged_variants,
            self.reduction_ratio() * 100.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduction_ratio() {
        let stats = ConsolidationStats {
            input_detections: 12,
            discarded_empty: 2,
            exact_buckets: 6,
            canonical_phrases: 4,
            merged_variants: 2,
        };
        assert_eq!(stats.kept_detections(), 10);
        assert!((stats.reduction_ratio() - 0.4).abs() < 1e-9);
        assert!(stats.report().contains("Canonical phrases: 4"));
    }

    #[test]
    fn test_empty_ratio() {
        assert_eq!(ConsolidationStats::default().reduction_ratio(), 0.0);
    }
}
