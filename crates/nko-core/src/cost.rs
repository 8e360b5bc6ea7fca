//! Linear cost estimator
//!
//! Expected volumes flow from source units (frames) through the pre-filter,
//! detection, deduplication and generation ratios; each stage costs
//! `count * unit_cost`. No feedback from actual runs.

use serde::{Deserialize, Serialize};

/// Fixed per-unit cost assumptions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    /// Fraction of source units surviving the pre-filter
    pub prefilter_pass_rate: f64,

    /// Detections produced per analyzed unit
    pub detections_per_unit: f64,

    /// Canonical phrases per detection after deduplication
    pub dedup_ratio: f64,

    /// Worlds generated per canonical phrase
    pub worlds_per_phrase: usize,

    /// USD per analyzed unit
    pub extraction_cost_per_unit: f64,

    /// USD per consolidated detection
    pub consolidation_cost_per_detection: f64,

    /// USD per generated world
    pub generation_cost_per_world: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            prefilter_pass_rate: 0.35,
            detections_per_unit: 0.6,
            dedup_ratio: 0.25,
            worlds_per_phrase: 5,
            extraction_cost_per_unit: 0.0004,
            consolidation_cost_per_detection: 0.0,
            generation_cost_per_world: 0.0003,
        }
    }
}

/// Expected volumes and costs for a given number of source units
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub units: usize,
    pub analyzed_units: f64,
    pub detections: f64,
    pub phrases: f64,
    pub worlds: f64,
    pub extraction_cost: f64,
    pub consolidation_cost: f64,
    pub generation_cost: f64,
    pub total_cost: f64,
}

impl CostModel {
    /// Estimate the full pipeline for `units` source units
    pub fn estimate(&self, units: usize) -> CostEstimate {
        let analyzed_units = units as f64 * self.prefilter_pass_rate;
        let detections = analyzed_units * self.detections_per_unit;
        let phrases = detections * self.dedup_ratio;
        let worlds = phrases * self.worlds_per_phrase as f64;

        let extraction_cost = analyzed_units * self.extraction_cost_per_unit;
        let consolidation_cost = detections * self.consolidation_cost_per_detection;
        let generation_cost = worlds * self.generation_cost_per_world;

        CostEstimate {
            units,
            analyzed_units,
            detections,
            phrases,
            worlds,
            extraction_cost,
            consolidation_cost,
            generation_cost,
            total_cost: extraction_cost + consolidation_cost + generation_cost,
        }
    }

    /// Generation cost attributed to one completed phrase
    pub fn cost_per_phrase(&self) -> f64 {
        self.worlds_per_phrase as f64 * self.generation_cost_per_world
    }

    /// Generation cost for `phrases` pending phrases
    pub fn generation_cost(&self, phrases: usize) -> f64 {
        phrases as f64 * self.cost_per_phrase()
    }
}
