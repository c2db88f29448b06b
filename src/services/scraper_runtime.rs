//! Shared scraper guardrail state
//!
//! Explicitly constructed and injected (no module-level mutable state): the
//! rolling-window request budget, the pacing limiter, the per-domain
//! parallelism cap, and the per-run URL-collision map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::config::Config;
use crate::external::http::sleep_cancellable;

const WINDOW_SECONDS: i64 = 30 * 60;

#[derive(Default)]
struct WindowBudget {
    slot: i64,
    used: u32,
}

pub struct ScraperRuntime {
    interval_seconds: f64,
    parallel_limit: usize,
    max_requests_per_window: u32,
    window: Mutex<WindowBudget>,
    recent: Mutex<Vec<Instant>>,
    semaphore: Arc<Semaphore>,
    url_owners: Mutex<HashMap<String, String>>,
}

/// Projection returned by the reset operation.
#[derive(Debug, Clone, Serialize)]
pub struct ScraperRuntimeSnapshot {
    pub window_slot: i64,
    pub window_used: u32,
    pub url_claims: usize,
    pub cache_cleared: bool,
}

impl ScraperRuntime {
    pub fn new(config: &Config) -> Self {
        let parallel_limit = config.scraper_max_parallel_requests.max(1);
        Self {
            interval_seconds: config.scraper_request_interval_seconds.max(0.1),
            parallel_limit,
            max_requests_per_window: config.scraper_max_requests_per_window,
            window: Mutex::new(WindowBudget::default()),
            recent: Mutex::new(Vec::new()),
            semaphore: Arc::new(Semaphore::new(parallel_limit)),
            url_owners: Mutex::new(HashMap::new()),
        }
    }

    /// Clears per-run state; invoked at every run start.
    pub fn begin_run(&self) {
        if let Ok(mut owners) = self.url_owners.lock() {
            owners.clear();
        }
    }

    /// Rolling-window request budget. Zero or negative budget disables the
    /// check.
    pub fn acquire_budget(&self) -> bool {
        if self.max_requests_per_window == 0 {
            return true;
        }
        let slot = Utc::now().timestamp() / WINDOW_SECONDS;
        let Ok(mut window) = self.window.lock() else {
            return true;
        };
        if window.slot != slot {
            window.slot = slot;
            window.used = 0;
        }
        if window.used >= self.max_requests_per_window {
            return false;
        }
        window.used += 1;
        true
    }

    /// Paced admission: at most `parallel_limit` request starts per minimum
    /// interval. Returns true when cancelled while waiting.
    pub async fn pace(&self, cancel: &watch::Receiver<bool>) -> bool {
        let interval = Duration::from_secs_f64(self.interval_seconds);
        loop {
            let wait = {
                let Ok(mut recent) = self.recent.lock() else {
                    return false;
                };
                let now = Instant::now();
                recent.retain(|t| now.duration_since(*t) < interval);
                if recent.len() < self.parallel_limit {
                    recent.push(now);
                    return false;
                }
                let oldest = recent[0];
                interval
                    .checked_sub(now.duration_since(oldest))
                    .unwrap_or(Duration::from_millis(10))
                    + Duration::from_millis(10)
            };
            if sleep_cancellable(wait, cancel).await {
                return true;
            }
        }
    }

    /// Per-domain parallelism cap. The permit is held for the duration of
    /// the outbound request.
    pub async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }

    /// Refuses a second region's claim on the same canonical URL within a
    /// run; returns the owning region code on conflict.
    pub fn claim_url(&self, canonical: &str, region_code: &str) -> Result<(), String> {
        let Ok(mut owners) = self.url_owners.lock() else {
            return Ok(());
        };
        match owners.get(canonical) {
            Some(owner) if owner != region_code => Err(owner.clone()),
            Some(_) => Ok(()),
            None => {
                owners.insert(canonical.to_string(), region_code.to_string());
                Ok(())
            }
        }
    }

    /// Clears cooldown-adjacent counters; `cache_cleared` is stamped by the
    /// caller after flushing C3.
    pub fn reset(&self) -> ScraperRuntimeSnapshot {
        let (slot, used) = {
            let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
            window.slot = -1;
            window.used = 0;
            (window.slot, window.used)
        };
        if let Ok(mut recent) = self.recent.lock() {
            recent.clear();
        }
        let claims = {
            let mut owners = self.url_owners.lock().unwrap_or_else(|e| e.into_inner());
            let len = owners.len();
            owners.clear();
            len
        };
        ScraperRuntimeSnapshot {
            window_slot: slot,
            window_used: used,
            url_claims: claims,
            cache_cleared: false,
        }
    }
}
