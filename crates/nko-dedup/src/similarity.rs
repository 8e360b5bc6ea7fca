//! Character-set Jaccard similarity

use std::collections::HashSet;

/// Jaccard index of the unique-character sets of `a` and `b`
///
/// Order and repetition are ignored. Returns 0.0 when either side is empty.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let left: HashSet<char> = a.chars().collect();
    let right: HashSet<char> = b.chars().collect();

    let intersection = left.intersection(&right).count();
    let union = left.union(&right).count();

    intersection as f64 / union as f64
}
