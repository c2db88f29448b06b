//! Region selection and batching
//!
//! Full mode returns every region in stable code order. Fast mode keeps a
//! fixed high-risk head and rotates a window over the remainder, offset
//! deterministically from the request id, so repeated runs with distinct
//! ids cover every region.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::models::{Region, RegionInput, RunMode};

/// Selection outcome: the ordered region inputs plus the counters surfaced
/// through `status()`.
#[derive(Debug, Clone)]
pub struct Selection {
    pub regions: Vec<RegionInput>,
    pub total: usize,
    pub selected: usize,
}

/// Deterministic rotation slot for a request id.
pub fn rotation_offset(request_id: &str, slots: usize) -> usize {
    if slots == 0 {
        return 0;
    }
    let digest = Sha256::digest(request_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) % slots as u64) as usize
}

/// Indices of one rotating-window slot over the remainder. The union of all
/// slots covers every index.
pub fn rotation_window(remaining_len: usize, window: usize, slot: usize) -> Vec<usize> {
    if remaining_len == 0 || window == 0 {
        return Vec::new();
    }
    let offset = slot * window;
    (0..window.min(remaining_len))
        .map(|i| (offset + i) % remaining_len)
        .collect()
}

pub fn select_regions(
    all: &[Region],
    mode: RunMode,
    region_limit: Option<usize>,
    request_id: &str,
    head_size: usize,
) -> Selection {
    let total = all.len();

    let mut ordered: Vec<&Region> = all.iter().collect();
    ordered.sort_by(|a, b| a.code.cmp(&b.code));

    let limit = match (mode, region_limit) {
        (RunMode::Full, _) | (_, None) => None,
        (_, Some(limit)) if limit == 0 || limit >= total => None,
        (_, Some(limit)) => Some(limit),
    };

    let Some(limit) = limit else {
        return Selection {
            regions: ordered.iter().map(|r| r.as_input()).collect(),
            total,
            selected: total,
        };
    };

    // Fixed head: current orange/red regions, highest level first, then code.
    let mut head: Vec<&Region> = ordered
        .iter()
        .copied()
        .filter(|r| r.level().rank() >= 2)
        .collect();
    head.sort_by(|a, b| {
        b.level()
            .rank()
            .cmp(&a.level().rank())
            .then_with(|| a.code.cmp(&b.code))
    });
    head.truncate(head_size.min(limit));

    let head_codes: Vec<&str> = head.iter().map(|r| r.code.as_str()).collect();
    let remaining: Vec<&Region> = ordered
        .iter()
        .copied()
        .filter(|r| !head_codes.contains(&r.code.as_str()))
        .collect();

    let window = limit.saturating_sub(head.len());
    let mut selected: Vec<&Region> = head.clone();
    if window > 0 && !remaining.is_empty() {
        // Quantized offsets tile the remainder, so distinct request ids
        // visit every window slot.
        let slots = remaining.len().div_ceil(window);
        let slot = rotation_offset(request_id, slots);
        for index in rotation_window(remaining.len(), window, slot) {
            selected.push(remaining[index]);
        }
    }

    Selection {
        selected: selected.len(),
        regions: selected.iter().map(|r| r.as_input()).collect(),
        total,
    }
}

/// Groups regions by administrative prefix (first two code characters) for
/// scraper slug locality, then chunks each group into batches.
pub fn group_into_batches(inputs: &[RegionInput], batch_size: usize) -> Vec<Vec<RegionInput>> {
    let batch_size = batch_size.max(1);
    let mut groups: BTreeMap<String, Vec<RegionInput>> = BTreeMap::new();
    for input in inputs {
        let prefix: String = input.code.chars().take(2).collect();
        groups.entry(prefix).or_default().push(input.clone());
    }

    let mut batches = Vec::new();
    for group in groups.into_values() {
        for chunk in group.chunks(batch_size) {
            batches.push(chunk.to_vec());
        }
    }
    batches
}
