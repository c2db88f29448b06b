//! Fusion pipeline tests
//!
//! Covers the staged pipeline over fabricated collection results: the happy
//! path, the all-sources-failed retention path, hysteresis at the level
//! thresholds, merge bounds, and absent-vs-zero semantics.

use chrono::Utc;
use proptest::prelude::*;

use ghw_engine::config::Config;
use ghw_engine::models::{
    error_kinds, level_with_hysteresis, CollectionResult, Observation, RegionInput, RiskLevel,
    SourceError, WarningSnapshot,
};
use ghw_engine::services::pipeline::{
    analyze_region, apply_neighbor_influence, baseline_score, finalize_decision,
    hazard_candidates, local_risk, merge_observations, select_llm_candidates, threshold_distance,
    validate_batch,
};

fn region(code: &str, name: &str) -> RegionInput {
    RegionInput {
        code: code.to_string(),
        name: name.to_string(),
        latitude: Some(30.2),
        longitude: Some(120.1),
    }
}

fn met_success(result: &mut CollectionResult, source: &str, obs: Observation) {
    result
        .source_status
        .success
        .entry("meteorology".to_string())
        .or_default()
        .push(source.to_string());
    result.observations.insert(source.to_string(), obs);
}

fn geo_success(result: &mut CollectionResult, source: &str, obs: Observation) {
    result
        .source_status
        .success
        .entry("geology".to_string())
        .or_default()
        .push(source.to_string());
    result.observations.insert(source.to_string(), obs);
}

fn snapshot(level: RiskLevel, confidence: f64, risk_score: Option<f64>) -> WarningSnapshot {
    WarningSnapshot {
        level,
        confidence,
        risk_score,
        observation: Observation::default(),
        created_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Scenario: happy path
// ---------------------------------------------------------------------------

#[test]
fn happy_path_produces_orange_with_landslide_and_debris_flow() {
    let config = Config::default();
    let mut result = CollectionResult::new(region("R001", "演示一区"));
    met_success(
        &mut result,
        "weather_cma",
        Observation {
            rain_24h: Some(80.0),
            soil_moisture: Some(0.42),
            ..Observation::default()
        },
    );
    geo_success(
        &mut result,
        "geology_cgs",
        Observation {
            slope: Some(25.0),
            fault_distance: Some(3.0),
            ..Observation::default()
        },
    );

    let mut batch = vec![result];
    validate_batch(&mut batch);
    let analysis = analyze_region(&config, &batch[0], &|_: &str| 0.9);
    let decision = finalize_decision(analysis);

    assert_eq!(decision.level, RiskLevel::Orange);
    assert_eq!(
        decision.meteorology.hazard_candidates,
        vec!["landslide".to_string(), "debris_flow".to_string()]
    );
    assert!(
        decision.confidence >= 0.7,
        "confidence {} below 0.7",
        decision.confidence
    );
    assert!(!decision.retained);
    assert!(decision.reason.contains("滑坡"));
}

// ---------------------------------------------------------------------------
// Scenario: all sources fail
// ---------------------------------------------------------------------------

#[test]
fn all_sources_failed_retains_previous_warning() {
    let config = Config::default();
    let mut result = CollectionResult::new(region("R001", "演示一区"));
    for source in ["weather_cma", "weather_amap", "geology_cgs"] {
        result
            .source_status
            .errors
            .insert(source.to_string(), SourceError::of(error_kinds::TIMEOUT));
    }
    result.previous = Some(snapshot(RiskLevel::Yellow, 0.6, Some(0.4)));

    let mut batch = vec![result];
    validate_batch(&mut batch);
    let analysis = analyze_region(&config, &batch[0], &|_: &str| 0.9);
    assert!(analysis.retained);

    let decision = finalize_decision(analysis);
    assert!(decision.retained, "region must be reported as retained");
    assert_eq!(decision.level, RiskLevel::Yellow, "no overwrite to green");
    assert!(decision.confidence < 0.6, "confidence is lowered");
}

#[test]
fn all_sources_failed_without_history_uses_conservative_baseline() {
    let config = Config::default();
    let mut result = CollectionResult::new(region("R009", "演示九区"));
    result
        .source_status
        .errors
        .insert("weather_cma".to_string(), SourceError::of(error_kinds::TIMEOUT));

    let mut batch = vec![result];
    validate_batch(&mut batch);
    let analysis = analyze_region(&config, &batch[0], &|_: &str| 0.9);

    assert!(!analysis.retained, "baseline decisions persist");
    assert!((0.18..=0.46).contains(&analysis.score));
    assert!((analysis.confidence - 0.30).abs() < 1e-9);
    assert_eq!(analysis.score, baseline_score("R009"));
}

// ---------------------------------------------------------------------------
// Hysteresis
// ---------------------------------------------------------------------------

#[test]
fn hysteresis_blocks_marginal_promotions_and_demotions() {
    // Upward: must clear the threshold by 0.02.
    assert_eq!(
        level_with_hysteresis(0.56, Some(RiskLevel::Yellow)),
        RiskLevel::Yellow
    );
    assert_eq!(
        level_with_hysteresis(0.575, Some(RiskLevel::Yellow)),
        RiskLevel::Orange
    );
    // Downward: below the previous band by 0.04, one step at a time.
    assert_eq!(
        level_with_hysteresis(0.54, Some(RiskLevel::Orange)),
        RiskLevel::Orange
    );
    assert_eq!(
        level_with_hysteresis(0.50, Some(RiskLevel::Orange)),
        RiskLevel::Yellow
    );
    assert_eq!(
        level_with_hysteresis(0.10, Some(RiskLevel::Red)),
        RiskLevel::Orange
    );
    // No previous level: plain threshold mapping.
    assert_eq!(level_with_hysteresis(0.56, None), RiskLevel::Orange);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// A score oscillating within ±0.01 of a threshold never flips the
    /// level across consecutive runs.
    #[test]
    fn prop_hysteresis_stable_near_thresholds(offset in -0.01f64..=0.01f64) {
        for threshold in [0.30, 0.55, 0.80] {
            let score = threshold + offset;
            let below = RiskLevel::from_score(threshold - 0.02);
            let above = RiskLevel::from_score(threshold + 0.02);
            prop_assert_eq!(level_with_hysteresis(score, Some(below)), below);
            prop_assert_eq!(level_with_hysteresis(score, Some(above)), above);
        }
    }

    /// Merged numeric values stay within [min, max] of the inputs.
    #[test]
    fn prop_merge_within_bounds(
        values in prop::collection::vec(0.0f64..200.0, 1..6),
        reliabilities in prop::collection::vec(0.05f64..1.0, 6)
    ) {
        let observations: Vec<Observation> = values
            .iter()
            .map(|v| Observation { rain_24h: Some(*v), ..Observation::default() })
            .collect();
        let pairs: Vec<(f64, &Observation)> = observations
            .iter()
            .enumerate()
            .map(|(i, obs)| (reliabilities[i % reliabilities.len()], obs))
            .collect();

        let merged = merge_observations(&pairs);
        let merged_value = merged.rain_24h.expect("field reported by every source");
        let min = values.iter().cloned().fold(f64::MAX, f64::min);
        let max = values.iter().cloned().fold(f64::MIN, f64::max);
        prop_assert!(merged_value >= min - 1e-9 && merged_value <= max + 1e-9);
    }

    /// A field no source reported stays absent after merging.
    #[test]
    fn prop_merge_keeps_absent_fields_absent(values in prop::collection::vec(0.0f64..200.0, 1..6)) {
        let observations: Vec<Observation> = values
            .iter()
            .map(|v| Observation { rain_24h: Some(*v), ..Observation::default() })
            .collect();
        let pairs: Vec<(f64, &Observation)> = observations.iter().map(|o| (0.8, o)).collect();
        let merged = merge_observations(&pairs);
        prop_assert!(merged.rain_1h.is_none());
        prop_assert!(merged.soil_moisture.is_none());
        prop_assert!(merged.slope.is_none());
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

#[test]
fn absent_feature_weight_is_redistributed_not_zeroed() {
    let config = Config::default();
    let weights = &config.risk_weights;

    let only_rain = Observation {
        rain_24h: Some(100.0),
        ..Observation::default()
    };
    let rain_and_zero_soil = Observation {
        rain_24h: Some(100.0),
        soil_moisture: Some(0.0),
        ..Observation::default()
    };

    let absent = local_risk(weights, &only_rain, 0);
    let zeroed = local_risk(weights, &rain_and_zero_soil, 0);

    // rain_24h saturates at 100mm; only rain + history carry weight.
    let expected = weights.rain_24h / (weights.rain_24h + weights.history);
    assert!((absent.score - expected).abs() < 1e-9);
    // A real zero participates with its weight and drags the score down.
    assert!(zeroed.score < absent.score);
}

#[test]
fn estimated_rain_only_used_when_real_measurement_missing() {
    let config = Config::default();
    let estimated_only = Observation {
        rain_24h_est: Some(40.0),
        ..Observation::default()
    };
    let with_real = Observation {
        rain_24h: Some(30.0),
        rain_24h_est: Some(40.0),
        ..Observation::default()
    };

    let est = local_risk(&config.risk_weights, &estimated_only, 0);
    assert!(est.used_estimates);
    assert_eq!(estimated_only.effective_rain_24h(), Some(40.0));

    let real = local_risk(&config.risk_weights, &with_real, 0);
    assert!(!real.used_estimates);
    assert_eq!(with_real.effective_rain_24h(), Some(30.0));
}

#[test]
fn threshold_distance_is_low_near_thresholds() {
    assert!(threshold_distance(0.55) < 1e-9);
    assert!(threshold_distance(0.675) > 0.4);
    assert!(threshold_distance(0.0) > 0.9);
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[test]
fn validation_zeroes_inverted_rain_windows_and_drops_negatives() {
    let mut result = CollectionResult::new(region("330102", "上城区"));
    met_success(
        &mut result,
        "weather_cma",
        Observation {
            rain_24h: Some(10.0),
            rain_1h: Some(25.0),
            wind_speed: Some(-3.0),
            ..Observation::default()
        },
    );

    let mut batch = vec![result];
    validate_batch(&mut batch);

    let obs = &batch[0].observations["weather_cma"];
    assert_eq!(obs.rain_1h, Some(0.0), "shorter window zeroed");
    assert_eq!(obs.rain_24h, Some(10.0));
    assert!(obs.wind_speed.is_none(), "negative value becomes absent");
    assert!(batch[0].quality_penalty > 0.0);
    assert!(!batch[0].data_quality_notes.is_empty());
}

#[test]
fn severe_source_errors_reduce_quality_but_benign_do_not() {
    let mut benign = CollectionResult::new(region("330102", "上城区"));
    met_success(&mut benign, "weather_cma", Observation::default());
    benign
        .source_status
        .errors
        .insert("weather_scraper".into(), SourceError::of(error_kinds::DISABLED));

    let mut severe = CollectionResult::new(region("330103", "下城区"));
    met_success(&mut severe, "weather_cma", Observation::default());
    severe
        .source_status
        .errors
        .insert("weather_scraper".into(), SourceError::http_status(500, "http://x"));

    let mut batch = vec![benign, severe];
    validate_batch(&mut batch);
    assert_eq!(batch[0].quality_penalty, 0.0);
    assert!(batch[1].quality_penalty > 0.0);
}

// ---------------------------------------------------------------------------
// Neighbor influence
// ---------------------------------------------------------------------------

#[test]
fn neighbor_influence_blends_scores_within_prefix_group() {
    let config = Config::default();
    let mut analyses: Vec<_> = [("330102", 0.2), ("330103", 0.4), ("330104", 0.6)]
        .iter()
        .map(|(code, score)| {
            let mut result = CollectionResult::new(region(code, "测试"));
            met_success(
                &mut result,
                "weather_cma",
                Observation {
                    rain_24h: Some(10.0),
                    ..Observation::default()
                },
            );
            let mut analysis = analyze_region(&config, &result, &|_: &str| 0.9);
            analysis.score = *score;
            analysis
        })
        .collect();

    apply_neighbor_influence(&mut analyses, 0.2);

    // First region: neighbors average 0.5 -> 0.8*0.2 + 0.2*0.5 = 0.26.
    assert!((analyses[0].score - 0.26).abs() < 1e-9);
    assert_eq!(analyses[0].neighbor_influence, Some(0.5));
}

#[test]
fn fewer_than_two_neighbors_skips_influence() {
    let config = Config::default();
    let mut analyses: Vec<_> = [("330102", 0.2), ("440103", 0.9)]
        .iter()
        .map(|(code, score)| {
            let mut result = CollectionResult::new(region(code, "测试"));
            met_success(
                &mut result,
                "weather_cma",
                Observation {
                    rain_24h: Some(10.0),
                    ..Observation::default()
                },
            );
            let mut analysis = analyze_region(&config, &result, &|_: &str| 0.9);
            analysis.score = *score;
            analysis
        })
        .collect();

    apply_neighbor_influence(&mut analyses, 0.2);

    assert_eq!(analyses[0].neighbor_influence, None);
    assert!((analyses[0].score - 0.2).abs() < 1e-9, "score unchanged");
    assert!(analyses[0].notes.iter().any(|n| n == "neighbor_missing"));
}

// ---------------------------------------------------------------------------
// LLM candidate selection
// ---------------------------------------------------------------------------

#[test]
fn llm_candidates_follow_change_and_confidence_criteria() {
    let mut config = Config::default();
    config.llm_refine_max_regions = 2;

    let mut analyses = Vec::new();
    for (code, score, confidence, prev_score) in [
        ("110101", 0.70, 0.90, Some(0.30)), // big change
        ("110102", 0.40, 0.40, Some(0.40)), // low confidence
        ("110103", 0.50, 0.90, Some(0.50)), // stable and confident
        ("110104", 0.90, 0.95, Some(0.20)), // biggest change, highest score
    ] {
        let mut result = CollectionResult::new(region(code, "测试"));
        met_success(
            &mut result,
            "weather_cma",
            Observation {
                rain_24h: Some(10.0),
                ..Observation::default()
            },
        );
        result.previous = Some(snapshot(RiskLevel::Yellow, 0.6, prev_score));
        let mut analysis = analyze_region(&Config::default(), &result, &|_: &str| 0.9);
        analysis.score = score;
        analysis.confidence = confidence;
        analyses.push(analysis);
    }

    let picked = select_llm_candidates(&analyses, &config, false);
    assert_eq!(picked.len(), 2, "capped at llm_refine_max_regions");
    // Highest-risk candidates win the budget.
    assert_eq!(analyses[picked[0]].region_code, "110104");
    assert!(picked.iter().all(|&i| analyses[i].region_code != "110103"));
}

// ---------------------------------------------------------------------------
// Idempotence and hazard gating
// ---------------------------------------------------------------------------

#[test]
fn identical_inputs_yield_identical_decisions() {
    let config = Config::default();
    let build = || {
        let mut result = CollectionResult::new(region("R001", "演示一区"));
        met_success(
            &mut result,
            "weather_cma",
            Observation {
                rain_24h: Some(64.0),
                rain_1h: Some(12.0),
                ..Observation::default()
            },
        );
        geo_success(
            &mut result,
            "geology_cgs",
            Observation {
                slope: Some(18.0),
                fault_distance: Some(9.0),
                ..Observation::default()
            },
        );
        result.previous = Some(WarningSnapshot {
            level: RiskLevel::Yellow,
            confidence: 0.6,
            risk_score: Some(0.45),
            observation: Observation::default(),
            created_at: chrono::DateTime::from_timestamp(1_700_000_000, 0)
                .expect("valid timestamp"),
        });
        let mut batch = vec![result];
        validate_batch(&mut batch);
        finalize_decision(analyze_region(&config, &batch[0], &|_: &str| 0.9))
    };

    let first = build();
    let second = build();
    assert_eq!(first.level, second.level);
    assert_eq!(first.confidence, second.confidence);
    assert_eq!(first.reason, second.reason);
    assert_eq!(first.meteorology.risk_score, second.meteorology.risk_score);
}

#[test]
fn flood_requires_gentle_or_unknown_slope() {
    let heavy_rain_steep = Observation {
        rain_24h: Some(90.0),
        slope: Some(30.0),
        ..Observation::default()
    };
    let heavy_rain_flat = Observation {
        rain_24h: Some(90.0),
        slope: Some(5.0),
        ..Observation::default()
    };

    let steep: Vec<String> = hazard_candidates(&heavy_rain_steep)
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    let flat: Vec<String> = hazard_candidates(&heavy_rain_flat)
        .into_iter()
        .map(|(id, _)| id)
        .collect();

    assert!(!steep.contains(&"flood".to_string()));
    assert!(flat.contains(&"flood".to_string()));
    assert!(!flat.contains(&"landslide".to_string()), "flat ground cannot slide");
}
