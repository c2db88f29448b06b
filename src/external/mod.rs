//! External data-source adapters and clients
//!
//! Each source is a concrete adapter with a `fetch` that never raises (all
//! failures are encoded into the payload) and a pure `normalize`. The
//! registry is an explicit list built once at startup; sources are
//! process-lifetime singletons.

pub mod amap;
pub mod cgs;
pub mod cma;
pub mod http;
pub mod llm;
pub mod openweather;
pub mod scraper;
pub mod wu;

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::models::{Channel, Observation, RawPayload, SourceError};
use crate::services::cache::CacheService;
use crate::services::scraper_runtime::ScraperRuntime;

pub use amap::AmapWeatherSource;
pub use cgs::CgsGeologySource;
pub use cma::CmaWeatherSource;
pub use http::{FetchClient, FetchOptions, FetchedBody};
pub use llm::{LlmClient, LlmRefinement};
pub use openweather::OpenWeatherSource;
pub use scraper::{PageParser, ScraperKind, ScraperSource, SlugResolver};
pub use wu::WuApiSource;

/// Credential mode decided at construction from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    Live,
    Simulate,
    Disabled,
}

const PLACEHOLDER_KEYS: [&str; 7] = [
    "",
    "your_api_key_here",
    "replace_me",
    "changeme",
    "null",
    "none",
    "test",
];

const SIMULATION_KEYS: [&str; 5] = [
    "simulate",
    "simulated",
    "simulate_test",
    "mock",
    "demo_simulate",
];

pub fn key_mode(value: &str) -> KeyMode {
    let normalized = value.trim().to_lowercase();
    if SIMULATION_KEYS.contains(&normalized.as_str()) {
        KeyMode::Simulate
    } else if PLACEHOLDER_KEYS.contains(&normalized.as_str()) {
        KeyMode::Disabled
    } else {
        KeyMode::Live
    }
}

/// Deterministic value stream seeded from a string. Simulated payloads must
/// be stable per region so repeated runs agree.
pub struct SimRng {
    seed: [u8; 32],
    counter: u64,
}

impl SimRng {
    pub fn new(seed: &str) -> Self {
        let digest = Sha256::digest(seed.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self {
            seed: bytes,
            counter: 0,
        }
    }

    pub fn next_f64(&mut self) -> f64 {
        let mut hasher = Sha256::new();
        hasher.update(self.seed);
        hasher.update(self.counter.to_be_bytes());
        self.counter += 1;
        let digest = hasher.finalize();
        let mut chunk = [0u8; 8];
        chunk.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(chunk) as f64) / (u64::MAX as f64)
    }

    pub fn uniform(&mut self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.next_f64()
    }

    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        let index = (self.next_f64() * items.len() as f64) as usize;
        &items[index.min(items.len() - 1)]
    }
}

/// Rounds to the given number of decimal places.
pub(crate) fn round_to(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}

/// Lenient numeric extraction: numbers, or numeric strings.
pub(crate) fn value_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                trimmed.parse::<f64>().ok()
            }
        }
        _ => None,
    }
}

/// Maps rock type names (English or Chinese) to a lithology risk in [0, 1].
pub fn lithology_risk_of(name: &str) -> Option<f64> {
    let lowered = name.trim().to_lowercase();
    if lowered.is_empty() || lowered == "unknown" {
        return None;
    }
    let risk = if lowered.contains("granite") || lowered.contains("花岗岩") {
        0.25
    } else if lowered.contains("limestone") || lowered.contains("石灰岩") {
        0.45
    } else if lowered.contains("sandstone") || lowered.contains("砂岩") {
        0.55
    } else if lowered.contains("shale") || lowered.contains("页岩") {
        0.70
    } else {
        0.50
    };
    Some(risk)
}

/// Tagged variant over the concrete source kinds (shared capability surface:
/// name + channel + reliability + fetch + normalize).
pub enum DataSource {
    Cma(CmaWeatherSource),
    Amap(AmapWeatherSource),
    Wu(WuApiSource),
    OpenWeather(OpenWeatherSource),
    Cgs(CgsGeologySource),
    Scraper(ScraperSource),
}

impl DataSource {
    pub fn name(&self) -> &'static str {
        match self {
            DataSource::Cma(_) => CmaWeatherSource::NAME,
            DataSource::Amap(_) => AmapWeatherSource::NAME,
            DataSource::Wu(_) => WuApiSource::NAME,
            DataSource::OpenWeather(_) => OpenWeatherSource::NAME,
            DataSource::Cgs(_) => CgsGeologySource::NAME,
            DataSource::Scraper(s) => s.name(),
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            DataSource::Cgs(_) => Channel::Geology,
            DataSource::Scraper(s) => s.channel(),
            _ => Channel::Meteorology,
        }
    }

    pub fn reliability(&self) -> f64 {
        match self {
            DataSource::Cma(_) => CmaWeatherSource::RELIABILITY,
            DataSource::Amap(_) => AmapWeatherSource::RELIABILITY,
            DataSource::Wu(s) => s.reliability(),
            DataSource::OpenWeather(_) => OpenWeatherSource::RELIABILITY,
            DataSource::Cgs(_) => CgsGeologySource::RELIABILITY,
            DataSource::Scraper(s) => s.reliability(),
        }
    }

    pub async fn fetch(
        &self,
        region: &crate::models::RegionInput,
        cancel: &watch::Receiver<bool>,
    ) -> RawPayload {
        match self {
            DataSource::Cma(s) => s.fetch(region, cancel).await,
            DataSource::Amap(s) => s.fetch(region, cancel).await,
            DataSource::Wu(s) => s.fetch(region, cancel).await,
            DataSource::OpenWeather(s) => s.fetch(region, cancel).await,
            DataSource::Cgs(s) => s.fetch(region, cancel).await,
            DataSource::Scraper(s) => s.fetch(region, cancel).await,
        }
    }

    pub fn normalize(&self, raw: &RawPayload) -> Result<Observation, SourceError> {
        match self {
            DataSource::Cma(s) => s.normalize(raw),
            DataSource::Amap(s) => s.normalize(raw),
            DataSource::Wu(s) => s.normalize(raw),
            DataSource::OpenWeather(s) => s.normalize(raw),
            DataSource::Cgs(s) => s.normalize(raw),
            DataSource::Scraper(s) => s.normalize(raw),
        }
    }
}

/// Explicit, ordered source list registered at startup.
pub struct SourceRegistry {
    sources: Vec<Arc<DataSource>>,
}

impl SourceRegistry {
    pub fn build(
        config: Arc<Config>,
        http: Arc<FetchClient>,
        cache: Arc<CacheService>,
        runtime: Arc<ScraperRuntime>,
        stations: Arc<HashMap<String, String>>,
    ) -> EngineResult<Self> {
        let parser = Arc::new(
            PageParser::new().map_err(|e| EngineError::Internal(format!("bad parser regex: {e}")))?,
        );
        let slugs = Arc::new(SlugResolver::new(config.clone(), http.clone()));

        let sources = vec![
            Arc::new(DataSource::Cma(CmaWeatherSource::new(
                config.clone(),
                http.clone(),
                stations,
            ))),
            Arc::new(DataSource::Amap(AmapWeatherSource::new(
                config.clone(),
                http.clone(),
            ))),
            Arc::new(DataSource::Wu(WuApiSource::new(
                config.clone(),
                http.clone(),
                cache.clone(),
            )?)),
            Arc::new(DataSource::OpenWeather(OpenWeatherSource::new(
                config.clone(),
                http.clone(),
            ))),
            Arc::new(DataSource::Cgs(CgsGeologySource::new(
                config.clone(),
                http.clone(),
            ))),
            Arc::new(DataSource::Scraper(ScraperSource::new(
                ScraperKind::Weather,
                config.clone(),
                http.clone(),
                cache.clone(),
                runtime.clone(),
                slugs.clone(),
                parser.clone(),
            ))),
            Arc::new(DataSource::Scraper(ScraperSource::new(
                ScraperKind::Geology,
                config,
                http,
                cache,
                runtime,
                slugs,
                parser,
            ))),
        ];

        Ok(Self { sources })
    }

    pub fn sources(&self) -> &[Arc<DataSource>] {
        &self.sources
    }

    pub fn reliability_of(&self, name: &str) -> f64 {
        self.sources
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.reliability())
            .unwrap_or(0.5)
    }

    /// Clears scraper parser cooldowns and the cached slug index.
    pub fn reset_scrapers(&self) {
        for source in &self.sources {
            if let DataSource::Scraper(scraper) = source.as_ref() {
                scraper.reset_parser_state();
            }
        }
    }
}
