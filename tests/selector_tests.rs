//! Region selection and batching tests
//!
//! Fast-mode head stability, rotating-window coverage, and the batching
//! invariants the run loop relies on.

use std::collections::BTreeSet;

use chrono::Utc;
use proptest::prelude::*;

use ghw_engine::config::Config;
use ghw_engine::models::{Region, RegionInput, RunMode};
use ghw_engine::services::selector::{
    group_into_batches, rotation_offset, rotation_window, select_regions,
};

fn make_region(code: &str, risk_level: &str) -> Region {
    Region {
        code: code.to_string(),
        name: format!("区域{code}"),
        longitude: Some(120.0),
        latitude: Some(30.0),
        risk_level: risk_level.to_string(),
        last_updated_at: Utc::now(),
    }
}

/// 100 regions; the first five carry orange/red levels.
fn hundred_regions() -> Vec<Region> {
    (0..100)
        .map(|i| {
            let code = format!("{:06}", 110000 + i);
            let level = match i {
                0 | 1 => "red",
                2..=4 => "orange",
                _ => "green",
            };
            make_region(&code, level)
        })
        .collect()
}

#[test]
fn full_mode_returns_all_regions_in_code_order() {
    let mut regions = hundred_regions();
    regions.reverse();

    let selection = select_regions(&regions, RunMode::Full, None, "req-x", 20);
    assert_eq!(selection.total, 100);
    assert_eq!(selection.selected, 100);
    let codes: Vec<&str> = selection.regions.iter().map(|r| r.code.as_str()).collect();
    let mut sorted = codes.clone();
    sorted.sort();
    assert_eq!(codes, sorted, "stable order by code");
}

#[test]
fn fast_mode_keeps_high_risk_head_across_request_ids() {
    let regions = hundred_regions();
    let head_codes: BTreeSet<String> = regions
        .iter()
        .filter(|r| r.risk_level == "red" || r.risk_level == "orange")
        .map(|r| r.code.clone())
        .collect();
    assert_eq!(head_codes.len(), 5);

    for request_id in ["req-a", "req-b", "req-c"] {
        let selection = select_regions(&regions, RunMode::Fast, Some(30), request_id, 5);
        assert_eq!(selection.selected, 30);
        assert!(selection.selected <= selection.total);
        let selected: BTreeSet<String> =
            selection.regions.iter().map(|r| r.code.clone()).collect();
        for code in &head_codes {
            assert!(selected.contains(code), "head region {code} missing");
        }
    }
}

#[test]
fn rotation_slots_tile_the_remaining_regions() {
    // Scenario shape: 95 remaining regions, window of 25 -> 4 slots.
    let remaining: usize = 95;
    let window: usize = 25;
    let slots = remaining.div_ceil(window);
    assert_eq!(slots, 4);

    let mut covered = BTreeSet::new();
    for slot in 0..slots {
        for index in rotation_window(remaining, window, slot) {
            covered.insert(index);
        }
    }
    assert_eq!(covered.len(), remaining, "slot union covers every region");
}

#[test]
fn rotation_offset_is_deterministic_and_bounded() {
    let a = rotation_offset("req-1", 7);
    let b = rotation_offset("req-1", 7);
    assert_eq!(a, b);
    for i in 0..50 {
        assert!(rotation_offset(&format!("req-{i}"), 7) < 7);
    }
    assert_eq!(rotation_offset("anything", 0), 0);
}

#[test]
fn fast_mode_with_distinct_ids_eventually_covers_every_region() {
    let regions = hundred_regions();
    let mut covered: BTreeSet<String> = BTreeSet::new();

    for i in 0..64 {
        let selection =
            select_regions(&regions, RunMode::Fast, Some(30), &format!("req-{i}"), 5);
        for region in &selection.regions {
            covered.insert(region.code.clone());
        }
        if covered.len() == 100 {
            break;
        }
    }
    assert_eq!(covered.len(), 100, "distinct request ids cover all regions");
}

#[test]
fn batches_group_by_prefix_and_respect_batch_size() {
    let config = Config::default();
    let inputs: Vec<RegionInput> = (0..60)
        .map(|i| {
            let prefix = if i < 45 { 33 } else { 44 };
            RegionInput {
                code: format!("{:02}{:04}", prefix, i),
                name: format!("区域{i}"),
                latitude: None,
                longitude: None,
            }
        })
        .collect();

    let batch_size = config.batch_size();
    assert!((15..=40).contains(&batch_size));

    let batches = group_into_batches(&inputs, batch_size);
    let flattened: Vec<&RegionInput> = batches.iter().flatten().collect();
    assert_eq!(flattened.len(), inputs.len(), "no region lost or duplicated");

    for batch in &batches {
        assert!(batch.len() <= batch_size);
        let prefixes: BTreeSet<&str> = batch.iter().map(|r| &r.code[..2]).collect();
        assert_eq!(prefixes.len(), 1, "one administrative prefix per batch");
    }
}

#[test]
fn batch_size_clamps_between_15_and_40() {
    let mut config = Config::default();
    config.collector_max_concurrency = 1;
    assert_eq!(config.batch_size(), 15);
    config.collector_max_concurrency = 12;
    assert_eq!(config.batch_size(), 24);
    config.collector_max_concurrency = 100;
    assert_eq!(config.batch_size(), 40);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// processed <= selected <= total for any limit and region count.
    #[test]
    fn prop_selection_counts_are_ordered(
        total in 0usize..200,
        limit in 1usize..250,
        seed in "[a-z0-9]{8}"
    ) {
        let regions: Vec<Region> = (0..total)
            .map(|i| make_region(&format!("{:06}", 110000 + i), "green"))
            .collect();
        let selection = select_regions(&regions, RunMode::Fast, Some(limit), &seed, 20);

        prop_assert!(selection.selected <= selection.total);
        prop_assert_eq!(selection.regions.len(), selection.selected);

        let batches = group_into_batches(&selection.regions, 15);
        let processed: usize = batches.iter().map(|b| b.len()).sum();
        prop_assert_eq!(processed, selection.selected);
    }

    /// Every rotation window has the requested size (or the whole remainder)
    /// and stays in range.
    #[test]
    fn prop_rotation_window_in_range(
        remaining in 1usize..300,
        window in 1usize..50,
        slot in 0usize..20
    ) {
        let indices = rotation_window(remaining, window, slot);
        prop_assert_eq!(indices.len(), window.min(remaining));
        prop_assert!(indices.iter().all(|&i| i < remaining));
    }
}
