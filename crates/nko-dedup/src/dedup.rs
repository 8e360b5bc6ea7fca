//! Phrase deduplication
//!
//! Groups raw detections into canonical phrases in two passes:
//!
//! 1. Exact buckets keyed by normalized text, in first-encounter order.
//! 2. Single-linkage fuzzy merge over the distinct texts: each unprocessed
//!    text seeds a cluster and absorbs every later unprocessed text whose
//!    character-set similarity *to the seed* is at least the threshold.
//!    Earlier clusters are never re-scanned, so the result depends on input
//!    order. That order sensitivity is part of the contract.
//!
//! Within a cluster the longest text becomes canonical (first one wins on
//! ties) and the highest-confidence detection supplies the metadata.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use nko_core::{CanonicalPhrase, Detection};

use crate::normalize::normalize;
use crate::similarity::similarity;
use crate::stats::ConsolidationStats;

/// Default similarity needed to merge two distinct texts
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;

/// Output of a consolidation run
#[derive(Debug, Clone, Default)]
pub struct Consolidation {
    /// Canonical phrases in cluster order
    pub phrases: Vec<CanonicalPhrase>,

    /// Canonical text -> identifiers of the detections merged into it
    pub phrase_to_detections: BTreeMap<String, Vec<String>>,

    /// Run statistics
    pub stats: ConsolidationStats,
}

impl Consolidation {
    /// Look up a phrase by canonical text
    pub fn get(&self, canonical: &str) -> Option<&CanonicalPhrase> {
        self.phrases.iter().find(|p| p.nko_text == canonical)
    }

    /// Sum of occurrence counts across all phrases
    pub fn total_occurrences(&self) -> usize {
        self.phrases.iter().map(|p| p.occurrences).sum()
    }

    /// Check if nothing survived normalization
    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }
}

/// Exact-match bucket: one distinct normalized text and its detections
struct Bucket<'a> {
    text: String,
    detections: Vec<&'a Detection>,
}

/// Groups detections into canonical phrases
#[derive(Debug, Clone)]
pub struct PhraseDeduplicator {
    threshold: f64,
}

impl Default for PhraseDeduplicator {
    fn default() -> Self {
        Self::new()
    }
}

impl PhraseDeduplicator {
    /// Create a deduplicator with the default threshold
    pub fn new() -> Self {
        Self {
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }

    /// Set similarity threshold
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Get the similarity threshold
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Deduplicate detections into canonical phrases
    pub fn deduplicate(&self, detections: &[Detection]) -> Consolidation {
        let (buckets, discarded_empty) = exact_buckets(detections);
        let clusters = self.cluster(&buckets);

        let mut consolidation = Consolidation {
            stats: ConsolidationStats {
                input_detections: detections.len(),
                discarded_empty,
                exact_buckets: buckets.len(),
                ..Default::default()
            },
            ..Default::default()
        };

        for members in clusters {
            let (phrase, ids) = merge_cluster(&buckets, &members);
            consolidation.stats.merged_variants += phrase.variants.len();
            consolidation
                .phrase_to_detections
                .insert(phrase.nko_text.clone(), ids);
            consolidation.phrases.push(phrase);
        }
        consolidation.stats.canonical_phrases = consolidation.phrases.len();

        tracing::debug!(
            input = consolidation.stats.input_detections,
            buckets = consolidation.stats.exact_buckets,
            phrases = consolidation.stats.canonical_phrases,
            threshold = self.threshold,
            "Deduplication finished"
        );

        consolidation
    }

    /// Single-linkage clustering over bucket indices, seeded in encounter order
    fn cluster(&self, buckets: &[Bucket<'_>]) -> Vec<Vec<usize>> {
        let mut processed = vec![false; buckets.len()];
        let mut clusters = Vec::new();

        for seed in 0..buckets.len() {
            if processed[seed] {
                continue;
            }
            processed[seed] = true;

            let mut members = vec![seed];
            for candidate in (seed + 1)..buckets.len() {
                if processed[candidate] {
                    continue;
                }
                if similarity(&buckets[seed].text, &buckets[candidate].text) >= self.threshold {
                    processed[candidate] = true;
                    members.push(candidate);
                }
            }
            clusters.push(members);
        }

        clusters
    }
}

/// Deduplicate with an explicit threshold
pub fn deduplicate(detections: &[Detection], threshold: f64) -> Consolidation {
    PhraseDeduplicator::new()
        .with_threshold(threshold)
        .deduplicate(detections)
}

fn exact_buckets(detections: &[Detection]) -> (Vec<Bucket<'_>>, usize) {
    let mut buckets: Vec<Bucket<'_>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut discarded = 0;

    for detection in detections {
        let text = normalize(&detection.nko_text);
        if text.is_empty() {
            discarded += 1;
            continue;
        }

        match index.get(&text) {
            Some(&i) => buckets[i].detections.push(detection),
            None => {
                index.insert(text.clone(), buckets.len());
                buckets.push(Bucket {
                    text,
                    detections: vec![detection],
                });
            }
        }
    }

    (buckets, discarded)
}

fn merge_cluster(buckets: &[Bucket<'_>], members: &[usize]) -> (CanonicalPhrase, Vec<String>) {
    // Longest text wins; strict comparison keeps the first on ties
    let mut canonical = members[0];
    for &member in &members[1..] {
        if buckets[member].text.chars().count() > buckets[canonical].text.chars().count() {
            canonical = member;
        }
    }

    let detections: Vec<&Detection> = members
        .iter()
        .flat_map(|&m| buckets[m].detections.iter().copied())
        .collect();

    let mut best = detections[0];
    for &detection in &detections[1..] {
        if detection.confidence > best.confidence {
            best = detection;
        }
    }

    let sources: BTreeSet<String> = detections
        .iter()
        .filter_map(|d| d.frame_id.clone())
        .collect();

    let variants = members
        .iter()
        .filter(|&&m| m != canonical)
        .map(|&m| buckets[m].text.clone())
        .collect();

    let ids = detections.iter().map(|d| d.id.clone()).collect();

    let phrase = CanonicalPhrase {
        nko_text: buckets[canonical].text.clone(),
        latin_transliteration: best.latin_transliteration.clone(),
        english_translation: best.english_translation.clone(),
        confidence: best.confidence,
        occurrences: detections.len(),
        sources,
        variants,
    };

    (phrase, ids)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn det(id: &str, text: &str, confidence: f64) -> Detection {
        Detection::new(id, text).with_confidence(confidence)
    }

    #[test]
    fn test_exact_and_distinct() {
        let detections = vec![
            det("1", "ABC", 0.9),
            det("2", "ABC ", 0.5),
            det("3", "XYZ", 0.7),
        ];

        let result = deduplicate(&detections, 0.85);
        assert_eq!(result.phrases.len(), 2);

        let abc = result.get("ABC").unwrap();
        assert_eq!(abc.occurrences, 2);
        assert_eq!(abc.confidence, 0.9);
        assert!(abc.variants.is_empty());

        let xyz = result.get("XYZ").unwrap();
        assert_eq!(xyz.occurrences, 1);

        assert_eq!(
            result.phrase_to_detections["ABC"],
            vec!["1".to_string(), "2".to_string()]
        );
    }

    #[test]
    fn test_fuzzy_merge_picks_longest() {
        // "ABCD" and "ABCDD" share the same character set
        let detections = vec![det("1", "ABCD", 0.4), det("2", "ABCDD", 0.6)];

        let result = deduplicate(&detections, 0.85);
        assert_eq!(result.phrases.len(), 1);

        let phrase = &result.phrases[0];
        assert_eq!(phrase.nko_text, "ABCDD");
        assert_eq!(phrase.variants, vec!["ABCD".to_string()]);
        assert_eq!(phrase.occurrences, 2);
        assert_eq!(phrase.confidence, 0.6);
    }

    #[test]
    fn test_length_tie_keeps_first_encountered() {
        let detections = vec![det("1", "AB", 0.1), det("2", "BA", 0.2)];
        let result = deduplicate(&detections, 0.85);
        assert_eq!(result.phrases.len(), 1);
        assert_eq!(result.phrases[0].nko_text, "AB");
        assert_eq!(result.phrases[0].variants, vec!["BA".to_string()]);
    }

    #[test]
    fn test_single_linkage_is_seed_only_and_order_sensitive() {
        // sim(A, B) = 3/5, sim(B, C) = 3/5, sim(A, C) = 2/6
        let a = "abcd";
        let b = "bcde";
        let c = "cdef";
        let detections = vec![det("a", a, 0.5), det("b", b, 0.5), det("c", c, 0.5)];

        let result = deduplicate(&detections, 0.6);
        // A absorbs B; C is compared only against seed A, so it stays apart
        assert_eq!(result.phrases.len(), 2);
        assert_eq!(result.phrases[0].occurrences, 2);
        assert_eq!(result.phrases[1].nko_text, c);

        let reordered = vec![det("b", b, 0.5), det("a", a, 0.5), det("c", c, 0.5)];
        let result = deduplicate(&reordered, 0.6);
        // B seeds and absorbs both neighbours
        assert_eq!(result.phrases.len(), 1);
        assert_eq!(result.phrases[0].occurrences, 3);
    }

    #[test]
    fn test_empty_detections_discarded() {
        let detections = vec![det("1", " .,", 0.9), det("2", "", 0.9), det("3", "ߒߞߏ", 0.9)];
        let result = deduplicate(&detections, 0.85);

        assert_eq!(result.phrases.len(), 1);
        assert_eq!(result.stats.discarded_empty, 2);
        assert_eq!(result.stats.input_detections, 3);
        assert_eq!(result.total_occurrences(), 1);
    }

    #[test]
    fn test_metadata_and_sources() {
        let detections = vec![
            det("1", "ߒߞߏ", 0.5)
                .with_frame("f1")
                .with_transliteration("nko-low"),
            det("2", "ߒߞߏ!", 0.95)
                .with_frame("f2")
                .with_transliteration("n'ko")
                .with_translation("I say"),
            det("3", "ߒߞߏ", 0.7).with_frame("f1"),
        ];

        let result = deduplicate(&detections, 0.85);
        let phrase = result.get("ߒߞߏ").unwrap();

        assert_eq!(phrase.latin_transliteration.as_deref(), Some("n'ko"));
        assert_eq!(phrase.english_translation.as_deref(), Some("I say"));
        assert_eq!(phrase.sources.len(), 2);
        assert_eq!(phrase.occurrences, 3);
    }

    #[test]
    fn test_deterministic() {
        let detections: Vec<Detection> = ["ab", "abc", "ba", "xyz", "zyx", "abcc"]
            .iter()
            .enumerate()
            .map(|(i, t)| det(&i.to_string(), t, 0.5))
            .collect();

        let first = deduplicate(&detections, 0.7);
        let second = deduplicate(&detections, 0.7);
        assert_eq!(first.phrases, second.phrases);
        assert_eq!(first.phrase_to_detections, second.phrase_to_detections);
    }

    #[test]
    fn test_threshold_clamped() {
        let dedup = PhraseDeduplicator::new().with_threshold(3.0);
        assert_eq!(dedup.threshold(), 1.0);
        assert_eq!(PhraseDeduplicator::default().threshold(), 0.85);
    }

    proptest! {
        #[test]
        fn prop_counts_conserved_and_canonical_longest(
            texts in proptest::collection::vec("[abcd .,]{0,6}", 0..30),
            threshold in 0.0f64..=1.0,
        ) {
            let detections: Vec<Detection> = texts
                .iter()
                .enumerate()
                .map(|(i, t)| det(&i.to_string(), t, 0.5))
                .collect();
            let kept = texts.iter().filter(|t| !normalize(t).is_empty()).count();

            let result = deduplicate(&detections, threshold);
            prop_assert_eq!(result.total_occurrences(), kept);

            let mapped: usize = result.phrase_to_detections.values().map(Vec::len).sum();
            prop_assert_eq!(mapped, kept);

            for phrase in &result.phrases {
                let len = phrase.nko_text.chars().count();
                for variant in &phrase.variants {
                    prop_assert!(len >= variant.chars().count());
                }
            }
        }
    }
}
