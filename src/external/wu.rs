//! Weather Underground supplemental source (api.weather.com)
//!
//! The API key may be statically configured or discovered by scraping a
//! public WU page for an embedded token. Discovered keys live in the durable
//! cache (`cache:wu:key_pool` + `cache:wu:active_key`); a 401/403 on use
//! invalidates the active key and triggers exactly one forced re-discovery.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::models::{error_kinds, DataMode, Observation, RawPayload, RegionInput, SourceError};
use crate::services::cache::CacheService;

use super::http::{FetchClient, FetchOptions};
use super::{key_mode, round_to, value_f64, KeyMode, SimRng};

pub struct WuApiSource {
    config: Arc<Config>,
    http: Arc<FetchClient>,
    cache: Arc<CacheService>,
    key_pattern: Regex,
}

impl WuApiSource {
    pub const NAME: &'static str = "weather_wu_api";

    pub fn new(
        config: Arc<Config>,
        http: Arc<FetchClient>,
        cache: Arc<CacheService>,
    ) -> EngineResult<Self> {
        let key_pattern = Regex::new(r"(?i)apiKey(?:=|%3D)([A-Za-z0-9]{20,64})")
            .map_err(|e| EngineError::Internal(format!("bad wu key pattern: {e}")))?;
        Ok(Self {
            config,
            http,
            cache,
            key_pattern,
        })
    }

    pub fn reliability(&self) -> f64 {
        self.config.wu_reliability
    }

    fn cache_key(&self, region_code: &str) -> String {
        CacheService::scraper_key(Self::NAME, region_code)
    }

    fn fresh_ttl(&self) -> f64 {
        (self.config.scraper_cache_minutes.max(1) * 60) as f64
    }

    fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.config.wu_key_refresh_minutes.max(30) as u64 * 60)
    }

    /// Extract every embedded apiKey token from a page body, in order.
    pub fn extract_keys(&self, text: &str) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for captures in self.key_pattern.captures_iter(text) {
            if let Some(m) = captures.get(1) {
                let key = m.as_str().to_string();
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    async fn discover_keys(&self, force: bool, cancel: &watch::Receiver<bool>) -> Vec<String> {
        if !self.config.wu_key_discovery_enabled {
            return Vec::new();
        }

        if !force {
            if let Ok(Some(hit)) = self.cache.get_json::<Vec<String>>(CacheService::WU_KEY_POOL).await
            {
                if hit.age_seconds <= self.refresh_ttl().as_secs_f64() {
                    return hit.value;
                }
            }
        }

        let url = self.config.wu_key_discovery_url.trim();
        if url.is_empty() {
            return Vec::new();
        }

        let opts = FetchOptions {
            headers: vec![(
                "Accept-Language".into(),
                "en-US,en;q=0.9,zh-CN;q=0.7".into(),
            )],
            max_retries: self.config.wu_max_retries.max(1),
            timeout_seconds: self.config.wu_timeout_seconds.max(3.0),
            require_allowlist: false,
            ..FetchOptions::default()
        };
        let Ok(body) = self.http.fetch_with_retry(url, opts, cancel).await else {
            return Vec::new();
        };
        let text = match &body {
            super::FetchedBody::Text(t) => t.clone(),
            super::FetchedBody::Json(v) => v.to_string(),
        };

        let keys = self.extract_keys(&text);
        if !keys.is_empty() {
            let _ = self
                .cache
                .put_json(CacheService::WU_KEY_POOL, &keys, self.refresh_ttl())
                .await;
        }
        keys
    }

    async fn observe(
        &self,
        key: &str,
        lat: f64,
        lon: f64,
        cancel: &watch::Receiver<bool>,
    ) -> Result<serde_json::Value, SourceError> {
        let url = format!(
            "{}/v3/wx/observations/current",
            self.config.wu_api_base_url.trim_end_matches('/')
        );
        let opts = FetchOptions {
            query: vec![
                ("apiKey".into(), key.to_string()),
                ("geocode".into(), format!("{lat:.6},{lon:.6}")),
                ("language".into(), self.config.wu_language.clone()),
                ("units".into(), self.config.wu_units.clone()),
                ("format".into(), "json".into()),
            ],
            headers: vec![
                ("Accept".into(), "application/json, text/plain, */*".into()),
                ("Referer".into(), self.config.wu_key_discovery_url.clone()),
            ],
            max_retries: self.config.wu_max_retries.max(1),
            timeout_seconds: self.config.wu_timeout_seconds.max(3.0),
            require_allowlist: false,
        };
        self.http
            .fetch_with_retry(&url, opts, cancel)
            .await
            .map(|body| body.into_value())
    }

    pub async fn fetch(&self, region: &RegionInput, cancel: &watch::Receiver<bool>) -> RawPayload {
        if !self.config.wu_enabled {
            return RawPayload::err(
                Self::NAME,
                &region.code,
                SourceError::of(error_kinds::DISABLED),
            );
        }

        let cache_key = self.cache_key(&region.code);
        if let Ok(Some(hit)) = self.cache.get_json::<serde_json::Value>(&cache_key).await {
            if hit.age_seconds <= self.fresh_ttl() {
                let mut payload = RawPayload::ok(Self::NAME, &region.code, hit.value);
                payload.cache_hit = true;
                return payload;
            }
        }

        let mode = key_mode(&self.config.wu_api_key);
        if mode == KeyMode::Simulate {
            let mut rng = SimRng::new(&format!("{}_wu", region.code));
            let phrases = [
                "Cloudy",
                "Mostly Cloudy",
                "Light Rain",
                "Rain Shower",
                "Partly Cloudy",
            ];
            let body = serde_json::json!({
                "simulated": true,
                "precip1Hour": round_to(rng.uniform(0.0, 8.0), 2),
                "precip24Hour": round_to(rng.uniform(0.0, 80.0), 2),
                "relativeHumidity": round_to(rng.uniform(35.0, 98.0), 0),
                // weather.com metric wind speed is km/h.
                "windSpeed": round_to(rng.uniform(2.0, 45.0), 1),
                "temperature": round_to(rng.uniform(-10.0, 35.0), 1),
                "wxPhraseLong": *rng.pick(&phrases),
            });
            return RawPayload::ok(Self::NAME, &region.code, body);
        }

        let (Some(lat), Some(lon)) = (region.latitude, region.longitude) else {
            return RawPayload::err(
                Self::NAME,
                &region.code,
                SourceError::with_message(error_kinds::DISABLED, "region_coordinates_missing"),
            );
        };

        let mut candidates: Vec<String> = Vec::new();
        if let Ok(Some(active)) = self.cache.get_json::<String>(CacheService::WU_ACTIVE_KEY).await {
            if !active.value.trim().is_empty() {
                candidates.push(active.value);
            }
        }
        if mode == KeyMode::Live {
            candidates.push(self.config.wu_api_key.trim().to_string());
        }
        for key in self.discover_keys(false, cancel).await {
            if !candidates.contains(&key) {
                candidates.push(key);
            }
        }

        if candidates.is_empty() {
            return RawPayload::err(
                Self::NAME,
                &region.code,
                SourceError::of(error_kinds::KEY_DISCOVERY_FAILED),
            );
        }

        let mut rejected = false;
        let mut last_error = SourceError::of(error_kinds::KEY_DISCOVERY_FAILED);
        for key in &candidates {
            match self.observe(key, lat, lon, cancel).await {
                Ok(body) => {
                    let _ = self
                        .cache
                        .put_json(CacheService::WU_ACTIVE_KEY, key, self.refresh_ttl())
                        .await;
                    let _ = self
                        .cache
                        .put_json(&cache_key, &body, self.stale_ttl())
                        .await;
                    return RawPayload::ok(Self::NAME, &region.code, body);
                }
                Err(err) => {
                    if err.is_auth_rejection() {
                        rejected = true;
                        let _ = self.cache.delete(CacheService::WU_ACTIVE_KEY).await;
                    }
                    last_error = err;
                }
            }
        }

        // One forced re-discovery when every known key was rejected.
        if rejected {
            let refreshed = self.discover_keys(true, cancel).await;
            for key in refreshed.iter().filter(|k| !candidates.contains(k)) {
                if let Ok(body) = self.observe(key, lat, lon, cancel).await {
                    let _ = self
                        .cache
                        .put_json(CacheService::WU_ACTIVE_KEY, key, self.refresh_ttl())
                        .await;
                    let _ = self
                        .cache
                        .put_json(&cache_key, &body, self.stale_ttl())
                        .await;
                    return RawPayload::ok(Self::NAME, &region.code, body);
                }
            }
            last_error = if self.config.wu_key_discovery_enabled {
                SourceError::with_message(error_kinds::KEY_DISCOVERY_FAILED, "all_keys_rejected")
            } else {
                SourceError::of(error_kinds::AUTH_FAILED)
            };
        }

        // Outlived fresh TTL but still on disk: better stale than nothing.
        if let Ok(Some(hit)) = self.cache.get_json::<serde_json::Value>(&cache_key).await {
            let mut payload = RawPayload::ok(Self::NAME, &region.code, hit.value);
            payload.cache_hit = true;
            payload.stale_cache = true;
            return payload;
        }

        RawPayload::err(Self::NAME, &region.code, last_error)
    }

    fn stale_ttl(&self) -> Duration {
        let fresh = self.config.scraper_cache_minutes.max(1) as u64 * 60;
        Duration::from_secs((fresh + 300).max(fresh * 3))
    }

    pub fn normalize(&self, raw: &RawPayload) -> Result<Observation, SourceError> {
        if let Some(err) = &raw.error {
            return Err(err.clone());
        }
        let body = &raw.body;

        let wind_kmh = body.get("windSpeed").and_then(value_f64);
        let simulated = body.get("simulated").and_then(|v| v.as_bool()) == Some(true);

        let mut obs = Observation {
            rain_24h: body.get("precip24Hour").and_then(value_f64),
            rain_1h: body.get("precip1Hour").and_then(value_f64),
            humidity: body.get("relativeHumidity").and_then(value_f64),
            // metric units: km/h -> m/s
            wind_speed: wind_kmh.map(|v| round_to(v / 3.6, 2)),
            temperature: body.get("temperature").and_then(value_f64),
            weather_text: body
                .get("wxPhraseLong")
                .or_else(|| body.get("wxPhraseShort"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            data_mode: if simulated {
                DataMode::Simulated
            } else {
                DataMode::Live
            },
            ..Observation::default()
        };
        obs.notes.insert(
            "source_note".to_string(),
            serde_json::Value::String("weather_com_api".to_string()),
        );
        Ok(obs)
    }
}
