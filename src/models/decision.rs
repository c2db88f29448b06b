//! Risk levels, pipeline decisions, and the delta wire shape

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::observation::{Observation, SourceError};

/// Warning level thresholds on the [0, 1] score scale:
/// green < 0.30 <= yellow < 0.55 <= orange < 0.80 <= red.
pub const LEVEL_THRESHOLDS: [f64; 3] = [0.30, 0.55, 0.80];

/// Margin a rising score must clear past a threshold before promoting.
pub const HYSTERESIS_UP: f64 = 0.02;
/// Margin a falling score must clear below a threshold before demoting.
pub const HYSTERESIS_DOWN: f64 = 0.04;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Green,
    Yellow,
    Orange,
    Red,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Green => "green",
            RiskLevel::Yellow => "yellow",
            RiskLevel::Orange => "orange",
            RiskLevel::Red => "red",
        }
    }

    /// Parses level names, defaulting unknown text to green.
    pub fn parse_or_green(text: &str) -> Self {
        match text.trim() {
            "yellow" => RiskLevel::Yellow,
            "orange" => RiskLevel::Orange,
            "red" => RiskLevel::Red,
            _ => RiskLevel::Green,
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            RiskLevel::Green => 0,
            RiskLevel::Yellow => 1,
            RiskLevel::Orange => 2,
            RiskLevel::Red => 3,
        }
    }

    pub fn from_rank(rank: u8) -> Self {
        match rank {
            0 => RiskLevel::Green,
            1 => RiskLevel::Yellow,
            2 => RiskLevel::Orange,
            _ => RiskLevel::Red,
        }
    }

    /// Lower score threshold of this level.
    pub fn lower_threshold(&self) -> f64 {
        match self {
            RiskLevel::Green => 0.0,
            RiskLevel::Yellow => LEVEL_THRESHOLDS[0],
            RiskLevel::Orange => LEVEL_THRESHOLDS[1],
            RiskLevel::Red => LEVEL_THRESHOLDS[2],
        }
    }

    /// Plain threshold mapping without hysteresis.
    pub fn from_score(score: f64) -> Self {
        if score < LEVEL_THRESHOLDS[0] {
            RiskLevel::Green
        } else if score < LEVEL_THRESHOLDS[1] {
            RiskLevel::Yellow
        } else if score < LEVEL_THRESHOLDS[2] {
            RiskLevel::Orange
        } else {
            RiskLevel::Red
        }
    }

    /// Clamp `target` to at most one step away from `self`.
    pub fn step_towards(&self, target: RiskLevel) -> RiskLevel {
        let from = self.rank() as i8;
        let to = target.rank() as i8;
        let stepped = from + (to - from).clamp(-1, 1);
        RiskLevel::from_rank(stepped as u8)
    }

    /// Midpoint of the level's score band, used when re-anchoring a score
    /// from a persisted level.
    pub fn band_midpoint(&self) -> f64 {
        match self {
            RiskLevel::Green => 0.15,
            RiskLevel::Yellow => 0.425,
            RiskLevel::Orange => 0.675,
            RiskLevel::Red => 0.90,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hysteresis level mapping against the previous level.
///
/// Promotions must clear each crossed threshold by `HYSTERESIS_UP`.
/// Demotions move at most one step per run and require the score to sit
/// below the previous level's lower threshold by `HYSTERESIS_DOWN`.
pub fn level_with_hysteresis(score: f64, previous: Option<RiskLevel>) -> RiskLevel {
    let raw = RiskLevel::from_score(score);
    let Some(prev) = previous else {
        return raw;
    };

    if raw > prev {
        let mut candidate = raw;
        while candidate > prev && score < candidate.lower_threshold() + HYSTERESIS_UP {
            candidate = RiskLevel::from_rank(candidate.rank() - 1);
        }
        candidate
    } else if raw < prev {
        if score < prev.lower_threshold() - HYSTERESIS_DOWN {
            RiskLevel::from_rank(prev.rank() - 1)
        } else {
            prev
        }
    } else {
        prev
    }
}

/// Per-channel source outcome partitioning for one region.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceStatus {
    /// channel name -> sources that succeeded
    pub success: BTreeMap<String, Vec<String>>,
    /// source name -> error detail
    pub errors: BTreeMap<String, SourceError>,
    /// sources served from cache this round
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cache_hits: Vec<String>,
}

impl SourceStatus {
    pub fn successes_for(&self, channel: &str) -> &[String] {
        self.success
            .get(channel)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn any_success(&self) -> bool {
        self.success.values().any(|v| !v.is_empty())
    }
}

/// Enumerated confidence components, exposed verbatim in the stored JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub formula: String,
    pub final_confidence: f64,
    pub components: BTreeMap<String, f64>,
}

/// The meteorology blob persisted with every warning and mirrored into the
/// delta broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionDetail {
    pub merged_observation: Observation,
    pub source_status: SourceStatus,
    pub hazard_candidates: Vec<String>,
    pub confidence_breakdown: ConfidenceBreakdown,
    pub risk_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub neighbor_influence: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_quality_note: String,
    pub confidence: f64,
}

/// Per-region pipeline output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub region_code: String,
    pub region_name: String,
    pub level: RiskLevel,
    pub reason: String,
    pub confidence: f64,
    pub meteorology: DecisionDetail,
    /// All sources failed and a previous warning exists: keep the previous
    /// record, do not persist a new one.
    #[serde(default)]
    pub retained: bool,
}

/// One region entry inside a delta broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarningUpdate {
    pub region_code: String,
    pub region_name: String,
    pub level: RiskLevel,
    pub reason: String,
    pub confidence: f64,
    pub meteorology: serde_json::Value,
}

impl WarningUpdate {
    pub fn from_decision(decision: &Decision) -> Self {
        Self {
            region_code: decision.region_code.clone(),
            region_name: decision.region_name.clone(),
            level: decision.level,
            reason: decision.reason.clone(),
            confidence: decision.confidence,
            meteorology: serde_json::to_value(&decision.meteorology)
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Batch delta pushed to subscribers after each commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaMessage {
    pub timestamp: DateTime<Utc>,
    pub results: Vec<WarningUpdate>,
    pub total_regions: usize,
    pub selected_regions: usize,
    pub processed_regions: usize,
    pub partial: bool,
}
