//! Delta publisher
//!
//! Broadcasts one message per committed batch. Delivery is best-effort:
//! the send never blocks the commit path, and subscribers that fall behind
//! simply miss messages — the database stays authoritative. The latest run
//! snapshot is kept in memory (bounded) and mirrored to the durable kv
//! store for restart-surviving introspection.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

use crate::models::{DeltaMessage, WarningUpdate};
use crate::services::cache::CacheService;

pub const LAST_STATE_KEY: &str = "run:last_state";
const LAST_STATE_MAX_RESULTS: usize = 600;
const LAST_STATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const CHANNEL_CAPACITY: usize = 64;

/// Merged view of the most recent run, keyed by region code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastRunState {
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub results: Vec<WarningUpdate>,
    pub total_regions: usize,
    pub selected_regions: usize,
    pub processed_regions: usize,
    pub partial: bool,
    pub aborted: bool,
}

pub struct DeltaPublisher {
    tx: broadcast::Sender<DeltaMessage>,
    cache: Arc<CacheService>,
    last: Mutex<Option<LastRunState>>,
}

impl DeltaPublisher {
    pub fn new(cache: Arc<CacheService>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            cache,
            last: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeltaMessage> {
        self.tx.subscribe()
    }

    /// Seeds the last-run snapshot at run start.
    pub async fn begin_run(
        &self,
        request_id: &str,
        timestamp: DateTime<Utc>,
        total_regions: usize,
        selected_regions: usize,
    ) {
        let state = LastRunState {
            request_id: Some(request_id.to_string()),
            timestamp,
            results: Vec::new(),
            total_regions,
            selected_regions,
            processed_regions: 0,
            partial: true,
            aborted: false,
        };
        *self.last.lock().await = Some(state.clone());
        self.persist(&state).await;
    }

    /// Broadcasts one batch delta and folds it into the last-run snapshot.
    pub async fn publish_batch(&self, request_id: &str, delta: DeltaMessage, aborted: bool) {
        // No receivers is fine; the send must never block the commit.
        let _ = self.tx.send(delta.clone());

        let mut guard = self.last.lock().await;
        let state = guard.get_or_insert_with(|| LastRunState {
            request_id: Some(request_id.to_string()),
            timestamp: delta.timestamp,
            results: Vec::new(),
            total_regions: delta.total_regions,
            selected_regions: delta.selected_regions,
            processed_regions: 0,
            partial: true,
            aborted: false,
        });

        for update in &delta.results {
            match state
                .results
                .iter_mut()
                .find(|r| r.region_code == update.region_code)
            {
                Some(existing) => *existing = update.clone(),
                None => state.results.push(update.clone()),
            }
        }
        if state.results.len() > LAST_STATE_MAX_RESULTS {
            let excess = state.results.len() - LAST_STATE_MAX_RESULTS;
            state.results.drain(..excess);
        }
        state.processed_regions = delta.processed_regions;
        state.total_regions = delta.total_regions;
        state.selected_regions = delta.selected_regions;
        state.partial = delta.partial;
        state.aborted = aborted;

        let snapshot = state.clone();
        drop(guard);
        self.persist(&snapshot).await;
    }

    /// Stamps the final partial/aborted flags after a run ends.
    pub async fn finish_run(&self, request_id: &str, partial: bool, aborted: bool) {
        let snapshot = {
            let mut guard = self.last.lock().await;
            match guard.as_mut() {
                Some(state) if state.request_id.as_deref() == Some(request_id) => {
                    state.partial = partial;
                    state.aborted = aborted;
                    Some(state.clone())
                }
                _ => None,
            }
        };
        if let Some(state) = snapshot {
            self.persist(&state).await;
        }
    }

    /// One-shot snapshot push (debug randomize); replaces the last state
    /// without marking a run.
    pub async fn publish_snapshot(&self, delta: DeltaMessage) {
        let _ = self.tx.send(delta.clone());
        let state = LastRunState {
            request_id: None,
            timestamp: delta.timestamp,
            results: delta.results.clone(),
            total_regions: delta.total_regions,
            selected_regions: delta.selected_regions,
            processed_regions: delta.processed_regions,
            partial: delta.partial,
            aborted: false,
        };
        *self.last.lock().await = Some(state.clone());
        self.persist(&state).await;
    }

    /// Most recent run snapshot: memory first, durable store second.
    pub async fn last_state(&self) -> Option<LastRunState> {
        if let Some(state) = self.last.lock().await.clone() {
            return Some(state);
        }
        match self.cache.get_json::<LastRunState>(LAST_STATE_KEY).await {
            Ok(Some(hit)) => Some(hit.value),
            _ => None,
        }
    }

    async fn persist(&self, state: &LastRunState) {
        if let Err(err) = self.cache.put_json(LAST_STATE_KEY, state, LAST_STATE_TTL).await {
            tracing::debug!(error = %err, "failed to persist last run state");
        }
    }
}
