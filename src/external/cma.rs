//! CMA national surface observation source (station-based)
//!
//! Live mode queries the hourly surface dataset for the station mapped to
//! the region and derives `rain_24h` by accumulating 3-hour precipitation
//! over the most recent eight samples. `rain_1h` cannot be derived from
//! PRE_3h and stays absent.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::watch;

use crate::config::Config;
use crate::models::{error_kinds, DataMode, Observation, RawPayload, RegionInput, SourceError};

use super::http::{FetchClient, FetchOptions};
use super::{key_mode, round_to, value_f64, KeyMode, SimRng};

pub struct CmaWeatherSource {
    config: Arc<Config>,
    http: Arc<FetchClient>,
    stations: Arc<HashMap<String, String>>,
}

impl CmaWeatherSource {
    pub const NAME: &'static str = "weather_cma";
    pub const RELIABILITY: f64 = 0.92;

    pub fn new(
        config: Arc<Config>,
        http: Arc<FetchClient>,
        stations: Arc<HashMap<String, String>>,
    ) -> Self {
        Self {
            config,
            http,
            stations,
        }
    }

    pub async fn fetch(&self, region: &RegionInput, cancel: &watch::Receiver<bool>) -> RawPayload {
        if key_mode(&self.config.cma_api_key) == KeyMode::Simulate {
            let mut rng = SimRng::new(&region.code);
            let body = serde_json::json!({
                "simulated": true,
                "precipitation_24h": round_to(rng.uniform(5.0, 110.0), 1),
                "precipitation_1h": round_to(rng.uniform(0.0, 28.0), 1),
                "soil_moisture": round_to(rng.uniform(0.15, 0.55), 2),
                "wind_speed": round_to(rng.uniform(1.0, 12.0), 1),
                "humidity": round_to(rng.uniform(40.0, 95.0), 0),
                "temperature": round_to(rng.uniform(-5.0, 32.0), 1),
            });
            return RawPayload::ok(Self::NAME, &region.code, body);
        }

        if self.config.cma_user_id.is_empty() || self.config.cma_password.is_empty() {
            return RawPayload::err(
                Self::NAME,
                &region.code,
                SourceError::with_message(error_kinds::DISABLED, "missing_cma_credentials"),
            );
        }

        let Some(station_id) = self.stations.get(&region.code) else {
            return RawPayload::err(
                Self::NAME,
                &region.code,
                SourceError::with_message(error_kinds::NO_STATION_MAPPED, region.code.clone()),
            );
        };

        // timeRange is interpreted in China local time.
        let offset = Duration::hours(self.config.cma_time_zone_offset_hours);
        let local_now = Utc::now() + offset;
        let end = local_now.format("%Y%m%d%H%M%S").to_string();
        let start = (local_now - Duration::hours(24))
            .format("%Y%m%d%H%M%S")
            .to_string();

        let base = self.config.cma_base_url.trim_end_matches('/');
        let url = if base.ends_with("/api") {
            base.to_string()
        } else {
            format!("{base}/api")
        };

        let opts = FetchOptions {
            query: vec![
                ("userId".into(), self.config.cma_user_id.clone()),
                ("pwd".into(), self.config.cma_password.clone()),
                ("dataFormat".into(), "json".into()),
                ("interfaceId".into(), self.config.cma_interface_id.clone()),
                ("dataCode".into(), self.config.cma_data_code.clone()),
                ("timeRange".into(), format!("[{start},{end}]")),
                ("staIDs".into(), station_id.clone()),
                (
                    "elements".into(),
                    "Station_Id_C,Year,Mon,Day,Hour,PRE_3h,RHU,WIN_S_Avg_2mi,TEM,Datetime".into(),
                ),
            ],
            ..FetchOptions::default()
        };

        match self.http.fetch_with_retry(&url, opts, cancel).await {
            Ok(body) => RawPayload::ok(Self::NAME, &region.code, body.into_value()),
            Err(err) => RawPayload::err(Self::NAME, &region.code, err),
        }
    }

    pub fn normalize(&self, raw: &RawPayload) -> Result<Observation, SourceError> {
        if let Some(err) = &raw.error {
            return Err(err.clone());
        }

        if raw.body.get("simulated").and_then(|v| v.as_bool()) == Some(true) {
            return Ok(Observation {
                rain_24h: raw.body.get("precipitation_24h").and_then(value_f64),
                rain_1h: raw.body.get("precipitation_1h").and_then(value_f64),
                soil_moisture: raw.body.get("soil_moisture").and_then(value_f64),
                wind_speed: raw.body.get("wind_speed").and_then(value_f64),
                humidity: raw.body.get("humidity").and_then(value_f64),
                temperature: raw.body.get("temperature").and_then(value_f64),
                data_mode: DataMode::Simulated,
                ..Observation::default()
            });
        }

        let rows = locate_rows(&raw.body).ok_or_else(|| {
            SourceError::with_message(error_kinds::HTML_PARSE_NO_METRICS, "cma_empty_rows")
        })?;

        let mut parsed: Vec<&serde_json::Map<String, serde_json::Value>> =
            rows.iter().filter_map(|r| r.as_object()).collect();
        if parsed.is_empty() {
            return Err(SourceError::with_message(
                error_kinds::HTML_PARSE_NO_METRICS,
                "cma_rows_not_objects",
            ));
        }
        parsed.sort_by_key(|row| row_datetime(row));

        // 8 x PRE_3h samples cover the trailing 24 hours.
        let recent = &parsed[parsed.len().saturating_sub(8)..];
        let mut pre_sum = 0.0;
        let mut pre_count = 0usize;
        for row in recent {
            if let Some(v) = row.get("PRE_3h").and_then(value_f64) {
                pre_sum += v;
                pre_count += 1;
            }
        }

        let latest = parsed[parsed.len() - 1];
        Ok(Observation {
            rain_24h: (pre_count > 0).then(|| round_to(pre_sum, 2)),
            rain_1h: None,
            humidity: latest.get("RHU").and_then(value_f64),
            wind_speed: latest.get("WIN_S_Avg_2mi").and_then(value_f64),
            temperature: latest.get("TEM").and_then(value_f64),
            data_mode: DataMode::Live,
            ..Observation::default()
        })
    }
}

fn locate_rows(body: &serde_json::Value) -> Option<&Vec<serde_json::Value>> {
    for key in ["data", "Data", "DS", "datas", "rows", "result"] {
        if let Some(rows) = body.get(key).and_then(|v| v.as_array()) {
            if !rows.is_empty() {
                return Some(rows);
            }
        }
    }
    None
}

fn row_datetime(row: &serde_json::Map<String, serde_json::Value>) -> String {
    if let Some(dt) = row.get("Datetime").and_then(|v| v.as_str()) {
        if !dt.trim().is_empty() {
            return dt.trim().to_string();
        }
    }
    let pad = |key: &str, width: usize| {
        let text = row
            .get(key)
            .map(|v| match v {
                serde_json::Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        format!("{text:0>width$}")
    };
    format!(
        "{}-{}-{} {}:00:00",
        pad("Year", 4),
        pad("Mon", 2),
        pad("Day", 2),
        pad("Hour", 2)
    )
}
