//! Run lifecycle state and persisted rows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::decision::RiskLevel;
use super::observation::Observation;

/// How a run was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Fast,
    Full,
    Manual,
    Scheduled,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Fast => "fast",
            RunMode::Full => "full",
            RunMode::Manual => "manual",
            RunMode::Scheduled => "scheduled",
        }
    }
}

/// Region handed to the collection orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionInput {
    pub code: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

/// `regions` table row. Externally owned; the engine updates only
/// `risk_level` and `last_updated_at`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Region {
    pub code: String,
    pub name: String,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub risk_level: String,
    pub last_updated_at: DateTime<Utc>,
}

impl Region {
    pub fn level(&self) -> RiskLevel {
        RiskLevel::parse_or_green(&self.risk_level)
    }

    pub fn as_input(&self) -> RegionInput {
        RegionInput {
            code: self.code.clone(),
            name: self.name.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

/// `warnings` table row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WarningRecord {
    pub id: i64,
    pub region_code: String,
    pub level: String,
    pub reason: Option<String>,
    pub meteorology: Option<String>,
    pub confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub source: String,
}

/// Previous-warning snapshot used for change detection and fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarningSnapshot {
    pub level: RiskLevel,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
    pub observation: Observation,
    pub created_at: DateTime<Utc>,
}

impl WarningSnapshot {
    /// Best-effort parse of a persisted warning row. The stored meteorology
    /// JSON is the `DecisionDetail` contract; rows written by older versions
    /// degrade to an empty observation.
    pub fn from_record(record: &WarningRecord) -> Self {
        #[derive(Deserialize, Default)]
        struct StoredDetail {
            #[serde(default)]
            merged_observation: Observation,
            #[serde(default)]
            risk_score: Option<f64>,
            #[serde(default)]
            confidence: Option<f64>,
        }

        let detail: StoredDetail = record
            .meteorology
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();

        WarningSnapshot {
            level: RiskLevel::parse_or_green(&record.level),
            confidence: record
                .confidence
                .or(detail.confidence)
                .unwrap_or(0.5)
                .clamp(0.0, 1.0),
            risk_score: detail.risk_score,
            observation: detail.merged_observation,
            created_at: record.created_at,
        }
    }
}

/// Durable single-flight lock payload (kv key `run:lock`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLock {
    pub request_id: String,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

/// Process-wide run state, also projected through `status()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<RunMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub total_regions: usize,
    pub selected_regions: usize,
    pub processed_regions: usize,
    pub abort_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub last_processed_regions: usize,
}

/// Outcome of a trigger request.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerOutcome {
    pub accepted: bool,
    pub running: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Outcome of an abort request.
#[derive(Debug, Clone, Serialize)]
pub struct AbortOutcome {
    pub ok: bool,
    pub running: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}
