//! Collection orchestrator
//!
//! Fans out every registered source for every region in a batch, bounded by
//! the global concurrency cap. Non-fatal source errors never abort a
//! region's other sources; cancellation propagates to in-flight fetches via
//! the shared watch signal.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{watch, Semaphore};

use crate::config::Config;
use crate::external::{DataSource, SourceRegistry};
use crate::models::{CollectionResult, Observation, RegionInput, WarningSnapshot};
use crate::services::pipeline;
use crate::services::warnings::WarningStore;

/// Fields compared against the previous snapshot for change detection.
const CHANGE_FIELDS: [&str; 6] = [
    "rain_24h",
    "rain_1h",
    "soil_moisture",
    "wind_speed",
    "slope",
    "fault_distance",
];

pub struct CollectionService {
    registry: Arc<SourceRegistry>,
    store: Arc<WarningStore>,
    semaphore: Arc<Semaphore>,
    history_years: i64,
}

impl CollectionService {
    pub fn new(registry: Arc<SourceRegistry>, store: Arc<WarningStore>, config: &Config) -> Self {
        Self {
            registry,
            store,
            semaphore: Arc::new(Semaphore::new(config.collector_max_concurrency.max(1))),
            history_years: 10,
        }
    }

    pub async fn collect_batch(
        &self,
        batch: &[RegionInput],
        cancel: &watch::Receiver<bool>,
    ) -> Vec<CollectionResult> {
        join_all(
            batch
                .iter()
                .map(|region| self.collect_region(region, cancel)),
        )
        .await
    }

    async fn collect_region(
        &self,
        region: &RegionInput,
        cancel: &watch::Receiver<bool>,
    ) -> CollectionResult {
        let fetches = self.registry.sources().iter().map(|source| {
            let source: Arc<DataSource> = source.clone();
            let semaphore = self.semaphore.clone();
            let region = region.clone();
            let cancel = cancel.clone();
            async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let raw = source.fetch(&region, &cancel).await;
                (source, raw)
            }
        });
        let outcomes = join_all(fetches).await;

        let mut result = CollectionResult::new(region.clone());
        for (source, raw) in outcomes {
            let name = source.name().to_string();
            if let Some(err) = raw.error.clone() {
                result.source_status.errors.insert(name, err);
                continue;
            }
            if raw.cache_hit {
                result.source_status.cache_hits.push(name.clone());
            }
            match source.normalize(&raw) {
                Ok(observation) => {
                    result
                        .source_status
                        .success
                        .entry(source.channel().as_str().to_string())
                        .or_default()
                        .push(name.clone());
                    result.observations.insert(name, observation);
                }
                Err(err) => {
                    result.source_status.errors.insert(name, err);
                }
            }
        }

        result.history_events = self
            .store
            .count_active_warnings(&region.code, self.history_years)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(region = %region.code, error = %err, "history count failed");
                0
            });
        result.previous = self
            .store
            .latest_snapshot(&region.code)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(region = %region.code, error = %err, "snapshot load failed");
                None
            });

        let merged = self.quick_merge(&result);
        let (change_score, changed_fields) =
            change_against_previous(&merged, result.previous.as_ref());
        result.change_score = change_score;
        result.changed_fields = changed_fields;
        result
    }

    fn quick_merge(&self, result: &CollectionResult) -> Observation {
        let pairs: Vec<(f64, &Observation)> = result
            .observations
            .iter()
            .map(|(name, obs)| (self.registry.reliability_of(name), obs))
            .collect();
        pipeline::merge_observations(&pairs)
    }
}

/// Relative-diff change score against the previous merged observation.
/// A field counts as changed when its relative diff exceeds 12%.
pub fn change_against_previous(
    current: &Observation,
    previous: Option<&WarningSnapshot>,
) -> (f64, Vec<String>) {
    let Some(previous) = previous else {
        return (0.0, Vec::new());
    };

    let mut score = 0.0;
    let mut changed = Vec::new();
    for field in CHANGE_FIELDS {
        let (Some(current_value), Some(previous_value)) = (
            effective_field(current, field),
            effective_field(&previous.observation, field),
        ) else {
            continue;
        };
        let base = previous_value.abs().max(1.0);
        let ratio = (current_value - previous_value).abs() / base;
        if ratio > 0.12 {
            changed.push(field.to_string());
            score += ratio.min(0.35);
        }
    }
    (score.clamp(0.0, 1.0), changed)
}

fn effective_field(obs: &Observation, field: &str) -> Option<f64> {
    match field {
        "rain_24h" => obs.effective_rain_24h(),
        "rain_1h" => obs.effective_rain_1h(),
        other => obs.get(other),
    }
}
