//! Source payloads and normalized observations
//!
//! Observations keep every field optional: a source that did not report a
//! value leaves it absent, never zero. Estimated precipitation travels in the
//! `_est` fields so it can be gated separately during merge and scoring.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Data source category
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Meteorology,
    Geology,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Meteorology => "meteorology",
            Channel::Geology => "geology",
        }
    }
}

/// How a payload was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataMode {
    #[default]
    Live,
    Simulated,
    Scraped,
}

/// Error kinds understood by the rest of the system. `http_status_<code>` is
/// produced by [`SourceError::http_status`].
pub mod error_kinds {
    pub const DISABLED: &str = "disabled";
    pub const DOMAIN_NOT_ALLOWED: &str = "domain_not_allowed";
    pub const SLUG_NOT_FOUND: &str = "slug_not_found";
    pub const HTML_PARSE_NO_METRICS: &str = "html_parse_no_metrics";
    pub const URL_COLLISION: &str = "url_collision";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const CONNECT_ERROR: &str = "connect_error";
    pub const TIMEOUT: &str = "timeout";
    pub const CANCELLED: &str = "cancelled";
    pub const AUTH_FAILED: &str = "auth_failed";
    pub const KEY_DISCOVERY_FAILED: &str = "key_discovery_failed";
    pub const NO_STATION_MAPPED: &str = "no_station_mapped";
}

/// A typed source failure. Never raised through the orchestrator; recorded
/// per region in `source_status.errors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl SourceError {
    pub fn of(kind: &str) -> Self {
        Self {
            error: kind.to_string(),
            message: None,
            status_code: None,
            url: None,
        }
    }

    pub fn with_message(kind: &str, message: impl Into<String>) -> Self {
        Self {
            error: kind.to_string(),
            message: Some(message.into()),
            status_code: None,
            url: None,
        }
    }

    pub fn http_status(code: u16, url: impl Into<String>) -> Self {
        Self {
            error: format!("http_status_{code}"),
            message: None,
            status_code: Some(code),
            url: Some(url.into()),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// 401/403 responses indicate a rejected credential.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self.status_code, Some(401) | Some(403))
    }
}

/// Raw fetch output: opaque body plus metadata. All failures are encoded in
/// `error`; `fetch` never raises.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPayload {
    pub source: String,
    pub region_code: String,
    pub fetched_at: DateTime<Utc>,
    pub body: serde_json::Value,
    #[serde(default)]
    pub cache_hit: bool,
    #[serde(default)]
    pub stale_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SourceError>,
}

impl RawPayload {
    pub fn ok(source: &str, region_code: &str, body: serde_json::Value) -> Self {
        Self {
            source: source.to_string(),
            region_code: region_code.to_string(),
            fetched_at: Utc::now(),
            body,
            cache_hit: false,
            stale_cache: false,
            error: None,
        }
    }

    pub fn err(source: &str, region_code: &str, error: SourceError) -> Self {
        Self {
            source: source.to_string(),
            region_code: region_code.to_string(),
            fetched_at: Utc::now(),
            body: serde_json::Value::Null,
            cache_hit: false,
            stale_cache: false,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Numeric observation fields, in merge order. Estimated precipitation is
/// listed so merges cover it; scoring gates it separately.
pub const NUMERIC_FIELDS: [&str; 11] = [
    "rain_24h",
    "rain_1h",
    "rain_24h_est",
    "rain_1h_est",
    "humidity",
    "wind_speed",
    "soil_moisture",
    "temperature",
    "slope",
    "fault_distance",
    "lithology_risk",
];

/// A channel-specific normalized observation. Missing = unknown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rain_24h: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rain_1h: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rain_24h_est: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rain_1h_est: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wind_speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soil_moisture: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slope: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault_distance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lithology_risk: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lithology: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weather_text: Option<String>,
    #[serde(default)]
    pub data_mode: DataMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_quality_note: Option<String>,
    /// Free-form notes bag for source-specific extras.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub notes: BTreeMap<String, serde_json::Value>,
}

impl Observation {
    pub fn get(&self, field: &str) -> Option<f64> {
        match field {
            "rain_24h" => self.rain_24h,
            "rain_1h" => self.rain_1h,
            "rain_24h_est" => self.rain_24h_est,
            "rain_1h_est" => self.rain_1h_est,
            "humidity" => self.humidity,
            "wind_speed" => self.wind_speed,
            "soil_moisture" => self.soil_moisture,
            "temperature" => self.temperature,
            "slope" => self.slope,
            "fault_distance" => self.fault_distance,
            "lithology_risk" => self.lithology_risk,
            _ => None,
        }
    }

    pub fn set(&mut self, field: &str, value: Option<f64>) {
        match field {
            "rain_24h" => self.rain_24h = value,
            "rain_1h" => self.rain_1h = value,
            "rain_24h_est" => self.rain_24h_est = value,
            "rain_1h_est" => self.rain_1h_est = value,
            "humidity" => self.humidity = value,
            "wind_speed" => self.wind_speed = value,
            "soil_moisture" => self.soil_moisture = value,
            "temperature" => self.temperature = value,
            "slope" => self.slope = value,
            "fault_distance" => self.fault_distance = value,
            "lithology_risk" => self.lithology_risk = value,
            _ => {}
        }
    }

    /// Effective 24h rain: real value, falling back to the estimate only
    /// when no real measurement exists.
    pub fn effective_rain_24h(&self) -> Option<f64> {
        self.rain_24h.or(self.rain_24h_est)
    }

    pub fn effective_rain_1h(&self) -> Option<f64> {
        self.rain_1h.or(self.rain_1h_est)
    }

    pub fn is_simulated(&self) -> bool {
        self.data_mode == DataMode::Simulated
    }

    /// True when any numeric field carries a value.
    pub fn has_any_numeric(&self) -> bool {
        NUMERIC_FIELDS.iter().any(|f| self.get(f).is_some())
    }
}
