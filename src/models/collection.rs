//! Per-region collection aggregate

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::decision::SourceStatus;
use super::observation::Observation;
use super::run::{RegionInput, WarningSnapshot};

/// Everything the fusion pipeline needs about one region for one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionResult {
    pub region: RegionInput,
    /// source name -> normalized observation (successful sources only)
    pub observations: BTreeMap<String, Observation>,
    pub source_status: SourceStatus,
    /// Count of non-test warnings of level >= yellow in the rolling window.
    pub history_events: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<WarningSnapshot>,
    pub change_score: f64,
    pub changed_fields: Vec<String>,
    /// Filled by the validation stage.
    #[serde(default)]
    pub quality_penalty: f64,
    #[serde(default)]
    pub data_quality_notes: Vec<String>,
}

impl CollectionResult {
    pub fn new(region: RegionInput) -> Self {
        Self {
            region,
            observations: BTreeMap::new(),
            source_status: SourceStatus::default(),
            history_events: 0,
            previous: None,
            change_score: 0.0,
            changed_fields: Vec::new(),
            quality_penalty: 0.0,
            data_quality_notes: Vec::new(),
        }
    }

    /// Observations with their source reliability for one channel, in
    /// registry order.
    pub fn channel_observations<'a>(
        &'a self,
        channel: &str,
        reliability_of: impl Fn(&str) -> f64,
    ) -> Vec<(f64, &'a Observation)> {
        self.source_status
            .successes_for(channel)
            .iter()
            .filter_map(|name| {
                self.observations
                    .get(name)
                    .map(|obs| (reliability_of(name), obs))
            })
            .collect()
    }
}
