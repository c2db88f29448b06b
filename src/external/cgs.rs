//! CGS geology source
//!
//! Slow-moving per-region geological attributes: terrain slope, distance to
//! the nearest fault, lithology. Lithology is mapped to a numeric risk so
//! the scoring stage can weight it.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::Config;
use crate::models::{error_kinds, DataMode, Observation, RawPayload, RegionInput, SourceError};

use super::http::{FetchClient, FetchOptions};
use super::{key_mode, lithology_risk_of, round_to, value_f64, KeyMode, SimRng};

pub struct CgsGeologySource {
    config: Arc<Config>,
    http: Arc<FetchClient>,
}

impl CgsGeologySource {
    pub const NAME: &'static str = "geology_cgs";
    pub const RELIABILITY: f64 = 0.88;

    pub fn new(config: Arc<Config>, http: Arc<FetchClient>) -> Self {
        Self { config, http }
    }

    pub async fn fetch(&self, region: &RegionInput, cancel: &watch::Receiver<bool>) -> RawPayload {
        match key_mode(&self.config.cgs_api_key) {
            KeyMode::Simulate => {
                let mut rng = SimRng::new(&format!("{}_geo", region.code));
                let rocks = ["granite", "sandstone", "shale", "limestone"];
                let body = serde_json::json!({
                    "simulated": true,
                    "terrain_slope": round_to(rng.uniform(5.0, 42.0), 1),
                    "fault_distance_km": round_to(rng.uniform(0.8, 30.0), 1),
                    "lithology": *rng.pick(&rocks),
                });
                RawPayload::ok(Self::NAME, &region.code, body)
            }
            KeyMode::Disabled => RawPayload::err(
                Self::NAME,
                &region.code,
                SourceError::with_message(error_kinds::DISABLED, "missing_cgs_api_key"),
            ),
            KeyMode::Live => {
                let url = format!(
                    "{}/hazard/geology/by_region",
                    self.config.cgs_base_url.trim_end_matches('/')
                );
                let opts = FetchOptions {
                    query: vec![
                        ("region_code".into(), region.code.clone()),
                        ("key".into(), self.config.cgs_api_key.clone()),
                    ],
                    ..FetchOptions::default()
                };
                match self.http.fetch_with_retry(&url, opts, cancel).await {
                    Ok(body) => RawPayload::ok(Self::NAME, &region.code, body.into_value()),
                    Err(err) => RawPayload::err(Self::NAME, &region.code, err),
                }
            }
        }
    }

    pub fn normalize(&self, raw: &RawPayload) -> Result<Observation, SourceError> {
        if let Some(err) = &raw.error {
            return Err(err.clone());
        }
        let body = &raw.body;

        let slope = body
            .get("terrain_slope")
            .or_else(|| body.get("slope"))
            .or_else(|| body.get("slope_degree"))
            .and_then(value_f64);
        let fault_distance = body
            .get("fault_distance_km")
            .or_else(|| body.get("fault_distance"))
            .or_else(|| body.get("fault_km"))
            .and_then(value_f64);
        let lithology = body
            .get("lithology")
            .or_else(|| body.get("rock_type"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        if slope.is_none() && fault_distance.is_none() && lithology.is_none() {
            return Err(SourceError::with_message(
                error_kinds::HTML_PARSE_NO_METRICS,
                "cgs_empty_body",
            ));
        }

        Ok(Observation {
            slope,
            fault_distance,
            lithology_risk: lithology.as_deref().and_then(lithology_risk_of),
            lithology,
            data_mode: if body.get("simulated").and_then(|v| v.as_bool()) == Some(true) {
                DataMode::Simulated
            } else {
                DataMode::Live
            },
            ..Observation::default()
        })
    }
}
