//! AMap (Gaode) web-service weather source
//!
//! The realtime endpoint carries no millimetric precipitation, so normalize
//! emits only `rain_24h_est` / `rain_1h_est` derived from the weather
//! phenomenon text, tagged `precipitation_estimated`. Estimates enter
//! scoring only when every non-estimated source is missing.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::Config;
use crate::models::{error_kinds, DataMode, Observation, RawPayload, RegionInput, SourceError};

use super::http::{FetchClient, FetchOptions};
use super::{key_mode, round_to, value_f64, KeyMode, SimRng};

pub struct AmapWeatherSource {
    config: Arc<Config>,
    http: Arc<FetchClient>,
}

impl AmapWeatherSource {
    pub const NAME: &'static str = "weather_amap";
    pub const RELIABILITY: f64 = 0.70;

    pub fn new(config: Arc<Config>, http: Arc<FetchClient>) -> Self {
        Self { config, http }
    }

    pub async fn fetch(&self, region: &RegionInput, cancel: &watch::Receiver<bool>) -> RawPayload {
        match key_mode(&self.config.amap_api_key) {
            KeyMode::Simulate => {
                let mut rng = SimRng::new(&format!("{}_amap", region.code));
                let conditions = ["晴", "多云", "阴", "小雨", "中雨", "阵雨", "雷阵雨"];
                let directions = ["东北", "东", "东南", "南", "西南", "西", "西北", "北"];
                let body = serde_json::json!({
                    "simulated": true,
                    "adcode": region.code,
                    "weather": *rng.pick(&conditions),
                    "temperature": round_to(rng.uniform(0.0, 30.0), 1),
                    "humidity": round_to(rng.uniform(30.0, 98.0), 1),
                    "windpower": format!("{}", (rng.uniform(1.0, 7.0) as i64)),
                    "winddirection": *rng.pick(&directions),
                });
                RawPayload::ok(Self::NAME, &region.code, body)
            }
            KeyMode::Disabled => RawPayload::err(
                Self::NAME,
                &region.code,
                SourceError::with_message(error_kinds::DISABLED, "missing_amap_api_key"),
            ),
            KeyMode::Live => {
                let url = format!(
                    "{}/v3/weather/weatherInfo",
                    self.config.amap_base_url.trim_end_matches('/')
                );
                let opts = FetchOptions {
                    query: vec![
                        ("key".into(), self.config.amap_api_key.clone()),
                        ("city".into(), region.code.clone()),
                        ("extensions".into(), "base".into()),
                        ("output".into(), "JSON".into()),
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

        let simulated = raw.body.get("simulated").and_then(|v| v.as_bool()) == Some(true);
        let live = if simulated {
            raw.body
                .as_object()
                .cloned()
                .unwrap_or_default()
        } else {
            parse_live_item(&raw.body)?
        };

        let weather_text = live
            .get("weather")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        let (rain_1h_est, rain_24h_est) = estimate_rain_from_weather_text(&weather_text);
        let wind_level = live
            .get("windpower")
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .as_deref()
            .and_then(parse_leading_int);
        let wind_speed = wind_level.and_then(wind_level_to_speed_ms);

        let mut obs = Observation {
            rain_24h_est,
            rain_1h_est,
            wind_speed,
            temperature: live
                .get("temperature_float")
                .or_else(|| live.get("temperature"))
                .and_then(value_f64),
            humidity: live
                .get("humidity_float")
                .or_else(|| live.get("humidity"))
                .and_then(value_f64),
            weather_text: (!weather_text.is_empty()).then(|| weather_text.clone()),
            data_mode: if simulated {
                DataMode::Simulated
            } else {
                DataMode::Live
            },
            data_quality_note: Some("precipitation_estimated".to_string()),
            ..Observation::default()
        };
        if let Some(direction) = live.get("winddirection").and_then(|v| v.as_str()) {
            obs.notes.insert(
                "wind_direction".to_string(),
                serde_json::Value::String(direction.to_string()),
            );
        }
        Ok(obs)
    }
}

fn parse_live_item(
    body: &serde_json::Value,
) -> Result<serde_json::Map<String, serde_json::Value>, SourceError> {
    let status_ok = body.get("status").map(|v| match v {
        serde_json::Value::String(s) => s == "1",
        serde_json::Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    });
    if status_ok != Some(true) {
        return Err(SourceError::with_message(
            error_kinds::HTML_PARSE_NO_METRICS,
            "amap_status_not_1",
        ));
    }
    body.get("lives")
        .and_then(|v| v.as_array())
        .and_then(|lives| lives.first())
        .and_then(|item| item.as_object())
        .cloned()
        .ok_or_else(|| {
            SourceError::with_message(error_kinds::HTML_PARSE_NO_METRICS, "amap_no_lives")
        })
}

/// First run of digits in the text, e.g. AMap wind power "≤3" -> 3.
pub fn parse_leading_int(text: &str) -> Option<i64> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<i64>().ok().map(|v| v.clamp(0, 12))
}

/// Rough wind power level (0-12) to m/s mapping used for risk scoring only.
pub fn wind_level_to_speed_ms(level: i64) -> Option<f64> {
    const TABLE: [f64; 13] = [
        0.0, 1.5, 2.5, 4.0, 5.5, 7.9, 10.8, 13.9, 17.2, 20.8, 24.5, 28.5, 32.7,
    ];
    TABLE.get(level.clamp(0, 12) as usize).copied()
}

/// Heuristic (rain_1h_mm, rain_24h_mm) estimates from the phenomenon text.
/// Returns (None, None) when the text is empty.
pub fn estimate_rain_from_weather_text(text: &str) -> (Option<f64>, Option<f64>) {
    let text = text.trim();
    if text.is_empty() {
        return (None, None);
    }

    // Ranges first, then specific intensities; order matters because the
    // specific tokens are substrings of the range tokens.
    const TABLE: [(&str, f64, f64); 18] = [
        ("大暴雨-特大暴雨", 38.0, 260.0),
        ("暴雨-大暴雨", 26.0, 140.0),
        ("大雨-暴雨", 14.0, 70.0),
        ("中雨-大雨", 7.0, 35.0),
        ("小雨-中雨", 3.0, 18.0),
        ("特大暴雨", 45.0, 320.0),
        ("大暴雨", 35.0, 220.0),
        ("暴雨", 25.0, 140.0),
        ("大雨", 15.0, 80.0),
        ("中雨", 7.0, 40.0),
        ("毛毛雨", 0.5, 2.0),
        ("小雨", 3.0, 18.0),
        ("强雷阵雨", 25.0, 120.0),
        ("雷阵雨", 12.0, 55.0),
        ("阵雨", 12.0, 55.0),
        ("雨夹雪", 1.0, 8.0),
        ("冻雨", 1.0, 8.0),
        ("雪", 1.0, 8.0),
    ];
    for (token, rain_1h, rain_24h) in TABLE {
        if text.contains(token) {
            return (Some(rain_1h), Some(rain_24h));
        }
    }
    if text.contains('雨') {
        return (Some(6.0), Some(25.0));
    }
    (Some(0.0), Some(0.0))
}
