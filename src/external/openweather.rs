//! OpenWeatherMap backup source
//!
//! Coordinate-based current conditions; used as a low-weight backup when
//! the primary meteorology sources are unavailable.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::Config;
use crate::models::{error_kinds, DataMode, Observation, RawPayload, RegionInput, SourceError};

use super::http::{FetchClient, FetchOptions};
use super::{key_mode, round_to, value_f64, KeyMode, SimRng};

pub struct OpenWeatherSource {
    config: Arc<Config>,
    http: Arc<FetchClient>,
}

impl OpenWeatherSource {
    pub const NAME: &'static str = "weather_openweather";
    pub const RELIABILITY: f64 = 0.65;

    pub fn new(config: Arc<Config>, http: Arc<FetchClient>) -> Self {
        Self { config, http }
    }

    pub async fn fetch(&self, region: &RegionInput, cancel: &watch::Receiver<bool>) -> RawPayload {
        match key_mode(&self.config.openweather_api_key) {
            KeyMode::Simulate => {
                let mut rng = SimRng::new(&format!("{}_ow", region.code));
                let body = serde_json::json!({
                    "simulated": true,
                    "main": {
                        "temp": round_to(rng.uniform(-5.0, 33.0), 1),
                        "humidity": round_to(rng.uniform(35.0, 98.0), 0),
                    },
                    "wind": { "speed": round_to(rng.uniform(0.5, 14.0), 1) },
                    "rain": { "1h": round_to(rng.uniform(0.0, 12.0), 1) },
                });
                RawPayload::ok(Self::NAME, &region.code, body)
            }
            KeyMode::Disabled => RawPayload::err(
                Self::NAME,
                &region.code,
                SourceError::with_message(error_kinds::DISABLED, "missing_openweather_api_key"),
            ),
            KeyMode::Live => {
                let (Some(lat), Some(lon)) = (region.latitude, region.longitude) else {
                    return RawPayload::err(
                        Self::NAME,
                        &region.code,
                        SourceError::with_message(
                            error_kinds::DISABLED,
                            "region_coordinates_missing",
                        ),
                    );
                };
                let url = format!(
                    "{}/weather",
                    self.config.openweather_base_url.trim_end_matches('/')
                );
                let opts = FetchOptions {
                    query: vec![
                        ("lat".into(), format!("{lat}")),
                        ("lon".into(), format!("{lon}")),
                        ("appid".into(), self.config.openweather_api_key.clone()),
                        ("units".into(), "metric".into()),
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

        let main = body.get("main");
        let rain = body.get("rain");
        // `rain.1h` is mm over the last hour; the endpoint carries no 24h
        // accumulation, so rain_24h stays absent.
        let rain_1h = rain
            .and_then(|r| r.get("1h"))
            .and_then(value_f64)
            .or_else(|| {
                rain.and_then(|r| r.get("3h"))
                    .and_then(value_f64)
                    .map(|v| v / 3.0)
            });

        let weather_text = body
            .get("weather")
            .and_then(|w| w.as_array())
            .and_then(|items| items.first())
            .and_then(|item| item.get("description").or_else(|| item.get("main")))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        if main.is_none() && rain_1h.is_none() {
            return Err(SourceError::with_message(
                error_kinds::HTML_PARSE_NO_METRICS,
                "openweather_empty_body",
            ));
        }

        Ok(Observation {
            rain_1h,
            humidity: main.and_then(|m| m.get("humidity")).and_then(value_f64),
            wind_speed: body
                .get("wind")
                .and_then(|w| w.get("speed"))
                .and_then(value_f64),
            temperature: main.and_then(|m| m.get("temp")).and_then(value_f64),
            weather_text,
            data_mode: if body.get("simulated").and_then(|v| v.as_bool()) == Some(true) {
                DataMode::Simulated
            } else {
                DataMode::Live
            },
            ..Observation::default()
        })
    }
}
