//! Fusion & scoring pipeline
//!
//! Six ordered stages over a batch of collection results: validation,
//! reliability-weighted channel merge, transparent local scoring, neighbor
//! influence, cost-bounded LLM refinement, and the final decision with
//! hysteresis. A stage never aborts the run; anything it cannot compute
//! becomes a quality note.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::config::{Config, RiskWeights};
use crate::external::{LlmClient, SourceRegistry};
use crate::models::{
    error_kinds, level_with_hysteresis, CollectionResult, ConfidenceBreakdown, DataMode, Decision,
    DecisionDetail, Observation, RiskLevel, SourceStatus, WarningSnapshot, NUMERIC_FIELDS,
};

const CONFIDENCE_FORMULA: &str =
    "0.38 + 0.30*quality + 0.16*change + 0.14*coverage + 0.10*threshold_distance + stability + neighbor + llm";

const MET_REUSE_FIELDS: [&str; 5] = [
    "rain_24h",
    "rain_1h",
    "soil_moisture",
    "wind_speed",
    "humidity",
];
const GEO_REUSE_FIELDS: [&str; 3] = ["slope", "fault_distance", "lithology_risk"];

/// Source errors that describe an intentionally absent source rather than a
/// real failure; they do not reduce data quality.
const BENIGN_ERROR_KINDS: [&str; 6] = [
    error_kinds::DISABLED,
    error_kinds::DOMAIN_NOT_ALLOWED,
    error_kinds::NO_STATION_MAPPED,
    error_kinds::SLUG_NOT_FOUND,
    error_kinds::RATE_LIMITED,
    error_kinds::CANCELLED,
];

/// Intermediate per-region state threaded through the stages.
#[derive(Debug, Clone)]
pub struct RegionAnalysis {
    pub region_code: String,
    pub region_name: String,
    pub merged: Observation,
    pub source_status: SourceStatus,
    pub score: f64,
    pub confidence: f64,
    pub components: BTreeMap<String, f64>,
    pub hazards: Vec<String>,
    pub quality_score: f64,
    pub notes: Vec<String>,
    pub change_score: f64,
    pub changed_fields: Vec<String>,
    pub previous: Option<WarningSnapshot>,
    pub neighbor_influence: Option<f64>,
    pub retained: bool,
    pub summary: String,
    pub history_events: i64,
    pub llm_level: Option<RiskLevel>,
    pub llm_delta: f64,
    pub llm_append: String,
}

pub struct PipelineService {
    config: Arc<Config>,
    registry: Arc<SourceRegistry>,
    llm: Arc<LlmClient>,
}

impl PipelineService {
    pub fn new(config: Arc<Config>, registry: Arc<SourceRegistry>, llm: Arc<LlmClient>) -> Self {
        Self {
            config,
            registry,
            llm,
        }
    }

    /// Runs the full stage sequence for one batch.
    pub async fn process(
        &self,
        results: &mut [CollectionResult],
        force_llm: bool,
    ) -> Vec<Decision> {
        validate_batch(results);

        let reliability = |name: &str| self.registry.reliability_of(name);
        let mut analyses: Vec<RegionAnalysis> = results
            .iter()
            .map(|result| analyze_region(&self.config, result, &reliability))
            .collect();

        apply_neighbor_influence(
            &mut analyses,
            self.config.neighbor_influence_weight.clamp(0.0, 0.5),
        );
        self.refine(&mut analyses, force_llm).await;

        analyses.into_iter().map(finalize_decision).collect()
    }

    async fn refine(&self, analyses: &mut [RegionAnalysis], force_llm: bool) {
        if !self.config.enable_llm_refinement && !force_llm {
            return;
        }
        if !self.llm.enabled() {
            return;
        }

        let candidates = select_llm_candidates(analyses, &self.config, force_llm);
        if candidates.is_empty() {
            return;
        }

        let payload: Vec<serde_json::Value> = candidates
            .iter()
            .map(|&idx| {
                let a = &analyses[idx];
                serde_json::json!({
                    "region_code": a.region_code,
                    "region_name": a.region_name,
                    "current_level": RiskLevel::from_score(a.score).as_str(),
                    "current_confidence": a.confidence,
                    "risk_score": a.score,
                    "change_score": a.change_score,
                    "changed_fields": a.changed_fields,
                    "meteorology": {
                        "rain_24h": a.merged.effective_rain_24h(),
                        "rain_1h": a.merged.effective_rain_1h(),
                        "soil_moisture": a.merged.soil_moisture,
                        "wind_speed": a.merged.wind_speed,
                    },
                    "geology": {
                        "slope": a.merged.slope,
                        "fault_distance": a.merged.fault_distance,
                    },
                    "previous_level": a.previous.as_ref().map(|p| p.level.as_str()),
                    "previous_confidence": a.previous.as_ref().map(|p| p.confidence),
                    "history_count": a.history_events,
                    "data_quality_note": a.notes.join("；"),
                })
            })
            .collect();

        match self.llm.refine(payload).await {
            Ok(rows) => {
                for row in rows {
                    let Some(analysis) = analyses
                        .iter_mut()
                        .find(|a| a.region_code == row.region_code && !a.retained)
                    else {
                        continue;
                    };
                    analysis.llm_delta = row.confidence_delta;
                    analysis.confidence =
                        (analysis.confidence + row.confidence_delta).clamp(0.0, 1.0);
                    analysis
                        .components
                        .insert("llm_delta".to_string(), row.confidence_delta);
                    analysis.llm_level = row.level;
                    analysis.llm_append = row.reason_append;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err.error, "llm refinement failed");
                for &idx in &candidates {
                    analyses[idx].notes.push("llm_parse_failed".to_string());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stage 1: validation
// ---------------------------------------------------------------------------

/// Flags outliers per source observation and accumulates quality penalties.
pub fn validate_batch(results: &mut [CollectionResult]) {
    for result in results.iter_mut() {
        let mut penalty = 0.0;
        let mut notes: Vec<String> = Vec::new();
        let mut negatives = false;
        let mut inverted_rain = false;
        let mut suspicious_rain = false;

        for obs in result.observations.values_mut() {
            for field in [
                "rain_24h",
                "rain_1h",
                "rain_24h_est",
                "rain_1h_est",
                "humidity",
                "wind_speed",
                "soil_moisture",
                "slope",
                "fault_distance",
            ] {
                if let Some(value) = obs.get(field) {
                    if value < 0.0 {
                        obs.set(field, None);
                        negatives = true;
                    }
                }
            }
            if let (Some(rain_1h), Some(rain_24h)) = (obs.rain_1h, obs.rain_24h) {
                if rain_1h > rain_24h {
                    obs.rain_1h = Some(0.0);
                    inverted_rain = true;
                }
            }
            if obs.rain_24h.map(|v| v > 600.0).unwrap_or(false) {
                suspicious_rain = true;
            }
        }

        if negatives {
            penalty += 0.05;
            notes.push("负值观测已剔除".to_string());
        }
        if inverted_rain {
            penalty += 0.04;
            notes.push("1小时降雨大于24小时降雨，短窗口按0处理".to_string());
        }
        if suspicious_rain {
            penalty += 0.10;
            notes.push("24小时降雨疑似异常".to_string());
        }

        let severe_errors = result
            .source_status
            .errors
            .values()
            .filter(|err| !BENIGN_ERROR_KINDS.contains(&err.error.as_str()))
            .count();
        if severe_errors > 0 {
            penalty += (0.05 * severe_errors as f64).min(0.25);
            notes.push(format!("存在{severe_errors}个关键数据源错误"));
        }

        result.quality_penalty = penalty;
        result.data_quality_notes = notes;
    }
}

// ---------------------------------------------------------------------------
// Stage 3 (invoked by stage 2): channel merge
// ---------------------------------------------------------------------------

/// Reliability-weighted fusion: numeric fields are weighted means over the
/// sources that reported them; non-numeric fields come from the most
/// reliable source providing them. Estimates merge only with estimates.
pub fn merge_observations(pairs: &[(f64, &Observation)]) -> Observation {
    let mut merged = Observation::default();
    if pairs.is_empty() {
        return merged;
    }

    for field in NUMERIC_FIELDS {
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        for (reliability, obs) in pairs {
            if let Some(value) = obs.get(field) {
                let w = reliability.max(0.001);
                weighted_sum += value * w;
                weight_total += w;
            }
        }
        if weight_total > 0.0 {
            merged.set(field, Some(weighted_sum / weight_total));
        }
    }

    let mut ranked: Vec<&(f64, &Observation)> = pairs.iter().collect();
    ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    for (_, obs) in &ranked {
        if merged.lithology.is_none() {
            merged.lithology = obs.lithology.clone();
        }
        if merged.weather_text.is_none() {
            merged.weather_text = obs.weather_text.clone();
        }
        for (key, value) in &obs.notes {
            merged.notes.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    if let Some((_, top)) = ranked.first() {
        merged.data_mode = top.data_mode;
    }

    let mut quality_notes: Vec<&str> = Vec::new();
    for (_, obs) in &ranked {
        if let Some(note) = obs.data_quality_note.as_deref() {
            if !quality_notes.contains(&note) {
                quality_notes.push(note);
            }
        }
    }
    if !quality_notes.is_empty() {
        merged.data_quality_note = Some(quality_notes.join("；"));
    }

    merged
}

// ---------------------------------------------------------------------------
// Stage 2: local risk scoring
// ---------------------------------------------------------------------------

pub struct LocalRisk {
    pub score: f64,
    /// Sum of the weights of features that were actually present.
    pub present_weight: f64,
    pub used_estimates: bool,
}

/// Transparent weighted score over the merged observation. Absent features
/// redistribute their weight proportionally over present ones; estimated
/// precipitation participates only when no real measurement exists.
pub fn local_risk(weights: &RiskWeights, merged: &Observation, history_events: i64) -> LocalRisk {
    let rain_24h = merged.effective_rain_24h();
    let rain_1h = merged.effective_rain_1h();

    let features: [(f64, Option<f64>); 8] = [
        (weights.rain_24h, rain_24h.map(|v| (v / 100.0).min(1.0))),
        (weights.rain_1h, rain_1h.map(|v| (v / 40.0).min(1.0))),
        (
            weights.soil_moisture,
            merged.soil_moisture.map(|v| v.clamp(0.0, 1.0)),
        ),
        (weights.wind_speed, merged.wind_speed.map(|v| (v / 25.0).min(1.0))),
        (weights.slope, merged.slope.map(|v| (v / 40.0).min(1.0))),
        (
            weights.fault_distance,
            merged
                .fault_distance
                .map(|v| (2.5 / v.max(0.5)).min(1.0)),
        ),
        (
            weights.lithology,
            merged.lithology_risk.map(|v| v.clamp(0.0, 1.0)),
        ),
        (
            weights.history,
            Some(((history_events.max(0) as f64) / 8.0).min(1.0)),
        ),
    ];

    let mut weighted_sum = 0.0;
    let mut present_weight = 0.0;
    for (weight, value) in features {
        if let Some(value) = value {
            weighted_sum += weight * value;
            present_weight += weight;
        }
    }

    let score = if present_weight > 0.0 {
        (weighted_sum / present_weight).clamp(0.0, 1.0)
    } else {
        0.0
    };

    LocalRisk {
        score,
        present_weight,
        used_estimates: (merged.rain_24h.is_none() && merged.rain_24h_est.is_some())
            || (merged.rain_1h.is_none() && merged.rain_1h_est.is_some()),
    }
}

/// Normalized distance of a score to the nearest level threshold. Closer to
/// a threshold means higher ambiguity and lower confidence.
pub fn threshold_distance(score: f64) -> f64 {
    let score = score.clamp(0.0, 1.0);
    crate::models::LEVEL_THRESHOLDS
        .iter()
        .map(|t| (score - t).abs())
        .fold(f64::MAX, f64::min)
        / 0.25
}

/// Conservative deterministic baseline for regions with no observations and
/// no history. Lands in the green/low-yellow band.
pub fn baseline_score(region_code: &str) -> f64 {
    let digest = Sha256::digest(region_code.as_bytes());
    let raw = u16::from_be_bytes([digest[0], digest[1]]) as f64 / 65535.0;
    ((0.18 + raw * 0.28) * 10_000.0).round() / 10_000.0
}

// ---------------------------------------------------------------------------
// Hazard inference
// ---------------------------------------------------------------------------

/// Gated hazard rules ordered by match strength. Identifiers are stable;
/// display names are resolved at reason-composition time.
pub fn hazard_candidates(merged: &Observation) -> Vec<(String, f64)> {
    let rain_24h = merged.effective_rain_24h().unwrap_or(0.0);
    let rain_1h = merged.effective_rain_1h().unwrap_or(0.0);
    let soil = merged.soil_moisture.unwrap_or(0.0).clamp(0.0, 1.0);
    let slope = merged.slope;
    let fault = merged.fault_distance;

    let f_rain_24h = (rain_24h / 100.0).min(1.0);
    let f_rain_1h = (rain_1h / 40.0).min(1.0);
    let f_slope = slope.map(|v| (v / 40.0).min(1.0)).unwrap_or(0.0);
    let f_fault = fault.map(|v| (2.5 / v.max(0.5)).min(1.0)).unwrap_or(0.0);

    let mut candidates: Vec<(String, f64)> = Vec::new();

    // Heavy daily rain on a steep slope.
    if rain_24h >= 50.0 && slope.map(|s| s >= 20.0).unwrap_or(false) {
        let strength = 0.35 * f_rain_24h + 0.45 * f_slope + 0.20 * soil;
        candidates.push(("landslide".to_string(), strength));
    }
    // Short intense rain near a fault.
    if (rain_1h >= 15.0 || rain_24h >= 60.0) && fault.map(|f| f <= 5.0).unwrap_or(false) {
        let strength = 0.40 * f_rain_1h + 0.30 * f_rain_24h + 0.30 * f_fault;
        candidates.push(("debris_flow".to_string(), strength));
    }
    // Sustained rain on flat ground (or unknown slope).
    if rain_24h >= 60.0 && slope.map(|s| s <= 12.0).unwrap_or(true) {
        let strength = 0.60 * f_rain_24h + 0.40 * (1.0 - f_slope);
        candidates.push(("flood".to_string(), strength));
    }

    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    candidates
}

pub fn hazard_display_name(id: &str) -> &'static str {
    match id {
        "landslide" => "滑坡",
        "debris_flow" => "泥石流",
        "flood" => "洪涝",
        _ => "地质灾害",
    }
}

// ---------------------------------------------------------------------------
// Per-region analysis (stages 1-3 assembled)
// ---------------------------------------------------------------------------

pub fn analyze_region(
    config: &Config,
    result: &CollectionResult,
    reliability_of: &impl Fn(&str) -> f64,
) -> RegionAnalysis {
    let code = result.region.code.clone();
    let name = result.region.name.clone();
    let mut notes = result.data_quality_notes.clone();
    let mut penalty = result.quality_penalty;

    let pairs: Vec<(f64, &Observation)> = result
        .observations
        .iter()
        .map(|(source, obs)| (reliability_of(source), obs))
        .collect();
    let mut merged = merge_observations(&pairs);

    let has_met = !result.source_status.successes_for("meteorology").is_empty();
    let has_geo = !result.source_status.successes_for("geology").is_empty();

    // Simulated-data disclosure per channel.
    for (channel, label) in [("meteorology", "气象为模拟数据"), ("geology", "地质为模拟数据")] {
        let simulated = result
            .source_status
            .successes_for(channel)
            .iter()
            .filter_map(|s| result.observations.get(s))
            .any(|o| o.data_mode == DataMode::Simulated);
        if simulated {
            notes.push(label.to_string());
        }
    }

    // Channel-level reuse of the previous round's valid observations, to
    // avoid replacing real risk with artificial low values.
    if let Some(previous) = &result.previous {
        if !has_met {
            let mut reused = false;
            for field in MET_REUSE_FIELDS {
                if merged.get(field).is_none() {
                    if let Some(value) = previous.observation.get(field) {
                        merged.set(field, Some(value));
                        reused = true;
                    }
                }
            }
            if reused {
                penalty += 0.08;
                notes.push("气象源缺失，沿用上轮有效观测".to_string());
            }
        }
        if !has_geo {
            let mut reused = false;
            for field in GEO_REUSE_FIELDS {
                if merged.get(field).is_none() {
                    if let Some(value) = previous.observation.get(field) {
                        merged.set(field, Some(value));
                        reused = true;
                    }
                }
            }
            if merged.lithology.is_none() {
                merged.lithology = previous.observation.lithology.clone();
            }
            if reused {
                penalty += 0.06;
                notes.push("地质源缺失，沿用上轮有效观测".to_string());
            }
        }
    }

    // All sources failed: retain the previous record, or fall back to the
    // conservative regional baseline.
    if !result.source_status.any_success() {
        if let Some(previous) = &result.previous {
            let score = previous
                .risk_score
                .unwrap_or_else(|| previous.level.band_midpoint());
            let confidence = (previous.confidence - 0.12).clamp(0.25, 0.88);
            let mut components = BTreeMap::new();
            components.insert("quality_score".to_string(), 0.2);
            components.insert("source_coverage".to_string(), 0.0);
            notes.push("数据缺失，沿用上次预警并下调置信度".to_string());
            return RegionAnalysis {
                region_code: code,
                region_name: name,
                merged,
                source_status: result.source_status.clone(),
                score,
                confidence,
                components,
                hazards: Vec::new(),
                quality_score: 0.2,
                notes,
                change_score: result.change_score,
                changed_fields: result.changed_fields.clone(),
                previous: result.previous.clone(),
                neighbor_influence: None,
                retained: true,
                summary: "本轮未获取到有效气象/地质数据，沿用上次预警".to_string(),
                history_events: result.history_events,
                llm_level: None,
                llm_delta: 0.0,
                llm_append: String::new(),
            };
        }

        let score = baseline_score(&code);
        let mut components = BTreeMap::new();
        components.insert("quality_score".to_string(), 0.2);
        components.insert("source_coverage".to_string(), 0.0);
        notes.push("数据缺失，采用保守地区基线".to_string());
        return RegionAnalysis {
            region_code: code,
            region_name: name,
            merged,
            source_status: result.source_status.clone(),
            score,
            confidence: 0.30,
            components,
            hazards: Vec::new(),
            quality_score: 0.2,
            notes,
            change_score: result.change_score,
            changed_fields: result.changed_fields.clone(),
            previous: None,
            neighbor_influence: None,
            retained: false,
            summary: "本轮无有效外部观测，采用保守地区基线估算".to_string(),
            history_events: result.history_events,
            llm_level: None,
            llm_delta: 0.0,
            llm_append: String::new(),
        };
    }

    let risk = local_risk(&config.risk_weights, &merged, result.history_events);
    if risk.used_estimates {
        penalty += 0.06;
        if !notes.iter().any(|n| n.contains("降雨为估算")) {
            notes.push("降雨为估算值".to_string());
        }
    }

    let quality = (risk.present_weight - penalty).clamp(0.2, 1.0);
    let coverage = (if has_met { 0.5 } else { 0.0 }) + (if has_geo { 0.5 } else { 0.0 });
    let change = result.change_score.clamp(0.0, 1.0);
    let distance = threshold_distance(risk.score).clamp(0.0, 1.0);
    let raw_level = RiskLevel::from_score(risk.score);
    let stability = match &result.previous {
        Some(previous) if previous.level == raw_level => 0.03,
        Some(_) => -0.02,
        None => -0.04,
    };

    let confidence = (0.38 + 0.30 * quality + 0.16 * change + 0.14 * coverage + 0.10 * distance
        + stability)
        .clamp(0.30, 0.96);

    let mut components = BTreeMap::new();
    components.insert("quality_score".to_string(), round3(quality));
    components.insert("change_score".to_string(), round3(change));
    components.insert("source_coverage".to_string(), round3(coverage));
    components.insert("threshold_distance".to_string(), round3(distance));
    components.insert("stability_bonus".to_string(), round3(stability));
    components.insert("raw_confidence_before_neighbor".to_string(), round3(confidence));

    let hazards: Vec<String> = hazard_candidates(&merged)
        .into_iter()
        .map(|(id, _)| id)
        .collect();

    let summary = build_summary(&merged, result.history_events, has_met, has_geo);

    RegionAnalysis {
        region_code: code,
        region_name: name,
        merged,
        source_status: result.source_status.clone(),
        score: risk.score,
        confidence,
        components,
        hazards,
        quality_score: quality,
        notes,
        change_score: change,
        changed_fields: result.changed_fields.clone(),
        previous: result.previous.clone(),
        neighbor_influence: None,
        retained: false,
        summary,
        history_events: result.history_events,
        llm_level: None,
        llm_delta: 0.0,
        llm_append: String::new(),
    }
}

fn build_summary(merged: &Observation, history_events: i64, show_met: bool, show_geo: bool) -> String {
    let mut pieces: Vec<String> = Vec::new();

    if show_met {
        if let Some(rain) = merged.rain_24h {
            pieces.push(format!("24h降雨{rain:.1}mm"));
        } else if let Some(rain) = merged.rain_24h_est {
            pieces.push(format!("24h降雨约{rain:.1}mm（估算）"));
        }
        if let Some(rain) = merged.rain_1h {
            pieces.push(format!("1h降雨{rain:.1}mm"));
        }
        if let Some(humidity) = merged.humidity.filter(|v| *v > 0.0) {
            pieces.push(format!("湿度{humidity:.0}%"));
        }
        if let Some(wind) = merged.wind_speed.filter(|v| *v > 0.0) {
            pieces.push(format!("风速{wind:.1}m/s"));
        }
    }
    if show_geo {
        if let Some(slope) = merged.slope.filter(|v| *v > 0.0) {
            pieces.push(format!("坡度{slope:.1}°"));
        }
        if let Some(fault) = merged.fault_distance.filter(|v| *v > 0.0 && *v < 999.0) {
            pieces.push(format!("断层距离{fault:.1}km"));
        }
    }
    if history_events > 0 {
        pieces.push(format!("历史主动预警次数{history_events}次"));
    }

    if pieces.is_empty() {
        "关键观测项不足".to_string()
    } else {
        pieces.join(", ")
    }
}

// ---------------------------------------------------------------------------
// Stage 4: neighbor influence
// ---------------------------------------------------------------------------

/// Blends each region's score with the mean of its prefix-neighbors within
/// the batch. Fewer than two resolved neighbors: stage skipped for that
/// region and `neighbor_influence` stays null.
pub fn apply_neighbor_influence(analyses: &mut [RegionAnalysis], weight: f64) {
    let locals: Vec<f64> = analyses.iter().map(|a| a.score).collect();

    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, analysis) in analyses.iter().enumerate() {
        if analysis.retained {
            continue;
        }
        let prefix: String = analysis.region_code.chars().take(2).collect();
        groups.entry(prefix).or_default().push(idx);
    }

    for indices in groups.values() {
        for &idx in indices {
            let neighbor_scores: Vec<f64> = indices
                .iter()
                .filter(|&&other| other != idx)
                .map(|&other| locals[other])
                .collect();
            if neighbor_scores.len() < 2 {
                analyses[idx].notes.push("neighbor_missing".to_string());
                continue;
            }
            let mean = neighbor_scores.iter().sum::<f64>() / neighbor_scores.len() as f64;
            let adjusted = (1.0 - weight) * locals[idx] + weight * mean;

            let analysis = &mut analyses[idx];
            analysis.score = adjusted;
            analysis.neighbor_influence = Some(round3(mean));
            analysis.confidence = (analysis.confidence + 0.03).clamp(0.0, 0.96);
            analysis
                .components
                .insert("neighbor_bonus".to_string(), 0.03);
            analysis
                .components
                .insert("neighbor_mean".to_string(), round3(mean));
        }
    }
}

// ---------------------------------------------------------------------------
// Stage 5: LLM candidate selection
// ---------------------------------------------------------------------------

/// OR-combined criteria: score moved past the change threshold, confidence
/// below the floor, or force. Capped, preferring the riskiest regions.
pub fn select_llm_candidates(
    analyses: &[RegionAnalysis],
    config: &Config,
    force_llm: bool,
) -> Vec<usize> {
    let mut candidates: Vec<usize> = analyses
        .iter()
        .enumerate()
        .filter(|(_, a)| !a.retained)
        .filter(|(_, a)| {
            let previous_score = a
                .previous
                .as_ref()
                .map(|p| p.risk_score.unwrap_or_else(|| p.level.band_midpoint()));
            let moved = previous_score
                .map(|p| (a.score - p).abs() >= config.llm_change_threshold)
                .unwrap_or(true);
            moved || a.confidence < config.llm_confidence_threshold
        })
        .map(|(idx, _)| idx)
        .collect();

    if candidates.is_empty() && force_llm {
        candidates = analyses
            .iter()
            .enumerate()
            .filter(|(_, a)| !a.retained)
            .map(|(idx, _)| idx)
            .collect();
    }

    candidates.sort_by(|&a, &b| {
        analyses[b]
            .score
            .partial_cmp(&analyses[a].score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(config.llm_refine_max_regions.max(1));
    candidates
}

// ---------------------------------------------------------------------------
// Stage 6: decision
// ---------------------------------------------------------------------------

pub fn finalize_decision(mut analysis: RegionAnalysis) -> Decision {
    let previous_level = analysis.previous.as_ref().map(|p| p.level);

    let level = if analysis.retained {
        previous_level.unwrap_or(RiskLevel::Green)
    } else {
        let mut level = level_with_hysteresis(analysis.score, previous_level);
        if let Some(requested) = analysis.llm_level {
            let stepped = level.step_towards(requested);
            if stepped != requested {
                analysis.notes.push("llm_override_rejected".to_string());
            }
            level = stepped;
        }
        level
    };

    let mut reason = analysis.summary.clone();
    let note_text = analysis.notes.join("；");
    if !note_text.is_empty() {
        reason = format!("{reason}。{note_text}");
    }
    if let Some(mean) = analysis.neighbor_influence {
        reason = format!(
            "{reason}；邻区影响均值{mean:.2}，融合后风险分{:.2}",
            analysis.score
        );
    }
    if !analysis.llm_append.is_empty() {
        reason = format!("{reason}；LLM复核：{}", analysis.llm_append);
    }
    if !analysis.hazards.is_empty() {
        let display: Vec<&str> = analysis
            .hazards
            .iter()
            .map(|id| hazard_display_name(id))
            .collect();
        let phrase = format!("最可能灾害：{}", display.join("、"));
        if !reason.contains(&phrase) {
            reason = format!("{reason}；{phrase}");
        }
    }

    let mut components = analysis.components.clone();
    components
        .entry("llm_delta".to_string())
        .or_insert(round3(analysis.llm_delta));
    let confidence = analysis.confidence.clamp(0.0, 1.0);

    let detail = DecisionDetail {
        merged_observation: analysis.merged,
        source_status: analysis.source_status,
        hazard_candidates: analysis.hazards,
        confidence_breakdown: ConfidenceBreakdown {
            formula: CONFIDENCE_FORMULA.to_string(),
            final_confidence: round3(confidence),
            components,
        },
        risk_score: round3(analysis.score),
        neighbor_influence: analysis.neighbor_influence,
        changed_fields: analysis.changed_fields,
        data_quality_note: note_text,
        confidence: round3(confidence),
    };

    Decision {
        region_code: analysis.region_code,
        region_name: analysis.region_name,
        level,
        reason,
        confidence: round3(confidence),
        meteorology: detail,
        retained: analysis.retained,
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
