//! Run controller
//!
//! Single-flight lifecycle: a durable lock with heartbeat-based stale
//! eviction, prefix-grouped batch scheduling, cooperative abort and deadline
//! checks at batch boundaries, one transaction per batch, and delta
//! publication after each commit. One process drives at most one run; the
//! durable lock enforces at-most-one across processes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::external::{FetchClient, SimRng, SourceRegistry};
use crate::models::{
    AbortOutcome, CollectionResult, ConfidenceBreakdown, DataMode, DecisionDetail, DeltaMessage,
    Observation, RiskLevel, RunLock, RunMode, RunState, SourceStatus, TriggerOutcome,
    WarningUpdate,
};
use crate::services::cache::CacheService;
use crate::services::collector::CollectionService;
use crate::services::pipeline::{self, PipelineService};
use crate::services::publisher::DeltaPublisher;
use crate::services::scraper_runtime::{ScraperRuntime, ScraperRuntimeSnapshot};
use crate::services::selector;
use crate::services::warnings::WarningStore;

pub const LOCK_KEY: &str = "run:lock";

const ABORT_FLAG_TTL: Duration = Duration::from_secs(6 * 60 * 60);
const HEARTBEAT_REFRESH_SECONDS: u64 = 20;
const DEBUG_COLLECTION_CAP: usize = 200;

fn abort_key(request_id: &str) -> String {
    format!("run:abort:{request_id}")
}

pub struct RunController {
    config: Arc<Config>,
    store: Arc<WarningStore>,
    cache: Arc<CacheService>,
    collector: Arc<CollectionService>,
    pipeline: Arc<PipelineService>,
    publisher: Arc<DeltaPublisher>,
    runtime: Arc<ScraperRuntime>,
    registry: Arc<SourceRegistry>,
    http: Arc<FetchClient>,
    state: Mutex<RunState>,
    cancel: Mutex<Option<watch::Sender<bool>>>,
    last_collections: Mutex<Vec<CollectionResult>>,
}

impl RunController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        store: Arc<WarningStore>,
        cache: Arc<CacheService>,
        collector: Arc<CollectionService>,
        pipeline: Arc<PipelineService>,
        publisher: Arc<DeltaPublisher>,
        runtime: Arc<ScraperRuntime>,
        registry: Arc<SourceRegistry>,
        http: Arc<FetchClient>,
    ) -> Self {
        Self {
            config,
            store,
            cache,
            collector,
            pipeline,
            publisher,
            runtime,
            registry,
            http,
            state: Mutex::new(RunState::default()),
            cancel: Mutex::new(None),
            last_collections: Mutex::new(Vec::new()),
        }
    }

    // ------------------------------------------------------------------
    // Control operations
    // ------------------------------------------------------------------

    /// Starts a background run. Accepted iff the single-flight lock was
    /// acquired.
    pub async fn trigger_async(
        self: &Arc<Self>,
        fast_mode: bool,
        region_limit: Option<usize>,
    ) -> EngineResult<TriggerOutcome> {
        let mode = if fast_mode { RunMode::Fast } else { RunMode::Full };
        let limit = fast_mode.then(|| {
            region_limit
                .unwrap_or(self.config.workflow_manual_region_limit)
                .clamp(1, 500)
        });

        let (accepted, request_id, started_at) = self.begin(mode).await?;
        if !accepted {
            return Ok(TriggerOutcome {
                accepted: false,
                running: true,
                message: "已有预警刷新任务在运行，请稍后查看状态。".to_string(),
                started_at: None,
                request_id,
            });
        }

        let controller = Arc::clone(self);
        let rid = request_id.clone().unwrap_or_default();
        tokio::spawn(async move {
            if let Err(err) = controller.run_to_completion(&rid, mode, limit, true).await {
                tracing::error!(request_id = %rid, error = %err, "warning workflow run failed");
            }
        });

        let message = match limit {
            Some(limit) => format!("已启动预警刷新（快速模式，最多 {limit} 个地区）。"),
            None => "已启动预警刷新（全量模式）。".to_string(),
        };
        Ok(TriggerOutcome {
            accepted: true,
            running: true,
            message,
            started_at,
            request_id,
        })
    }

    /// Blocking variant: runs the full region set inline and returns the
    /// complete result set.
    pub async fn trigger_sync(self: &Arc<Self>) -> EngineResult<DeltaMessage> {
        let (accepted, request_id, _) = self.begin(RunMode::Manual).await?;
        if !accepted {
            return Err(EngineError::AlreadyRunning);
        }
        let rid = request_id.unwrap_or_default();
        self.run_to_completion(&rid, RunMode::Manual, None, true)
            .await
    }

    /// Current run-state projection. A fresh durable lock held by another
    /// process shows as running; a stale one is evicted.
    pub async fn status(&self) -> RunState {
        let mut snapshot = self.state.lock().await.clone();
        if !snapshot.running {
            if let Ok(Some(raw)) = self.cache.kv_get(LOCK_KEY).await {
                match serde_json::from_str::<RunLock>(&raw) {
                    Ok(lock) => {
                        let age = (Utc::now() - lock.heartbeat_at).num_seconds();
                        if age <= self.config.heartbeat_timeout_seconds {
                            snapshot.running = true;
                            snapshot.request_id = Some(lock.request_id);
                            snapshot.started_at = Some(lock.started_at);
                            snapshot.heartbeat_at = Some(lock.heartbeat_at);
                        } else {
                            let _ = self.cache.kv_delete_if(LOCK_KEY, &raw).await;
                        }
                    }
                    Err(_) => {
                        let _ = self.cache.kv_delete_if(LOCK_KEY, &raw).await;
                    }
                }
            }
        }
        snapshot
    }

    /// Requests a cooperative abort: the run stops at the next batch
    /// boundary and keeps every committed batch.
    pub async fn abort(&self) -> AbortOutcome {
        let request_id = {
            let mut state = self.state.lock().await;
            if !state.running {
                return AbortOutcome {
                    ok: true,
                    running: false,
                    message: "当前没有正在运行的预警刷新任务。".to_string(),
                    request_id: None,
                };
            }
            state.abort_requested = true;
            state.request_id.clone()
        };

        if let Some(rid) = &request_id {
            let _ = self
                .cache
                .kv_set(&abort_key(rid), "1", Some(ABORT_FLAG_TTL))
                .await;
        }
        if let Some(tx) = self.cancel.lock().await.as_ref() {
            let _ = tx.send(true);
        }

        AbortOutcome {
            ok: true,
            running: true,
            message: "已请求中止：当前批次结束后停止，并保留已处理结果。".to_string(),
            request_id,
        }
    }

    /// Idempotent forced release of the lock and runtime state.
    pub async fn reset(&self) -> EngineResult<RunState> {
        let request_id = self.state.lock().await.request_id.clone();
        if let Some(rid) = &request_id {
            let _ = self.cache.kv_delete(&abort_key(rid)).await;
        }
        self.cache.kv_delete(LOCK_KEY).await?;

        let mut state = self.state.lock().await;
        state.running = false;
        state.request_id = None;
        state.abort_requested = false;
        state.started_at = None;
        state.heartbeat_at = None;
        state.last_finished_at = Some(Utc::now());
        state.last_error = Some("manual_reset".to_string());
        Ok(state.clone())
    }

    /// Most recent collection results, held in memory for introspection.
    pub async fn debug_last_collection(&self) -> Vec<CollectionResult> {
        self.last_collections.lock().await.clone()
    }

    /// Synthesizes plausible decisions for every region and pushes them via
    /// the delta channel without touching sources, the LLM, or persistence.
    pub async fn debug_randomize(&self) -> EngineResult<DeltaMessage> {
        if self.state.lock().await.running {
            return Err(EngineError::AlreadyRunning);
        }

        let regions = self.store.load_regions().await?;
        let now = Utc::now();
        let mut updates = Vec::with_capacity(regions.len());

        for region in &regions {
            // Unique per click, deterministic within it.
            let mut rng = SimRng::new(&format!("{}::{}", now.timestamp_millis(), region.code));
            let history = rng.uniform(0.0, 6.0) as i64;
            let merged = Observation {
                rain_24h: Some(round1(rng.uniform(0.0, 160.0))),
                rain_1h: Some(round1(rng.uniform(0.0, 40.0))),
                humidity: Some(round1(rng.uniform(35.0, 98.0))),
                wind_speed: Some(round1(rng.uniform(0.2, 16.0))),
                soil_moisture: Some(round1(rng.uniform(0.05, 0.85))),
                slope: Some(round1(rng.uniform(1.0, 42.0))),
                fault_distance: Some(round1(rng.uniform(0.6, 50.0))),
                data_mode: DataMode::Simulated,
                ..Observation::default()
            };

            let risk = pipeline::local_risk(&self.config.risk_weights, &merged, history);
            let level = RiskLevel::from_score(risk.score);
            let confidence =
                (0.55 + 0.35 * pipeline::threshold_distance(risk.score)).clamp(0.30, 0.96);
            let hazards: Vec<String> = pipeline::hazard_candidates(&merged)
                .into_iter()
                .map(|(id, _)| id)
                .collect();

            let mut source_status = SourceStatus::default();
            for channel in ["meteorology", "geology"] {
                source_status
                    .success
                    .insert(channel.to_string(), vec!["debug_random".to_string()]);
            }

            let reason = format!(
                "随机模拟：24h降雨{:.1}mm, 1h降雨{:.1}mm, 坡度{:.1}°, 断层距离{:.1}km",
                merged.rain_24h.unwrap_or(0.0),
                merged.rain_1h.unwrap_or(0.0),
                merged.slope.unwrap_or(0.0),
                merged.fault_distance.unwrap_or(0.0),
            );

            let detail = DecisionDetail {
                merged_observation: merged,
                source_status,
                hazard_candidates: hazards,
                confidence_breakdown: ConfidenceBreakdown {
                    formula: "随机模拟：按风险分与阈值的距离生成置信度".to_string(),
                    final_confidence: confidence,
                    components: Default::default(),
                },
                risk_score: risk.score,
                neighbor_influence: None,
                changed_fields: Vec::new(),
                data_quality_note: "随机模拟数据，仅用于演示，不写入历史库".to_string(),
                confidence,
            };

            updates.push(WarningUpdate {
                region_code: region.code.clone(),
                region_name: region.name.clone(),
                level,
                reason,
                confidence,
                meteorology: serde_json::to_value(&detail)?,
            });
        }

        let total = updates.len();
        let delta = DeltaMessage {
            timestamp: now,
            results: updates,
            total_regions: total,
            selected_regions: total,
            processed_regions: total,
            partial: false,
        };
        self.publisher.publish_snapshot(delta.clone()).await;
        Ok(delta)
    }

    /// Clears per-domain cooldowns, the rate-limit window, the collision
    /// map, and parser cooldowns; optionally flushes the scraper cache.
    pub async fn reset_scraper_runtime(
        &self,
        clear_cache: bool,
    ) -> EngineResult<ScraperRuntimeSnapshot> {
        let mut snapshot = self.runtime.reset();
        self.http.clear_cooldowns();
        self.registry.reset_scrapers();
        if clear_cache {
            self.cache.clear_prefix(CacheService::SCRAPER_PREFIX).await?;
            self.cache.delete(CacheService::WU_KEY_POOL).await?;
            self.cache.delete(CacheService::WU_ACTIVE_KEY).await?;
            self.cache.clear_memory();
            snapshot.cache_cleared = true;
        }
        Ok(snapshot)
    }

    // ------------------------------------------------------------------
    // Run lifecycle
    // ------------------------------------------------------------------

    async fn begin(
        &self,
        mode: RunMode,
    ) -> EngineResult<(bool, Option<String>, Option<DateTime<Utc>>)> {
        {
            let state = self.state.lock().await;
            if state.running {
                return Ok((false, state.request_id.clone(), state.started_at));
            }
        }

        let request_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let (acquired, evicted_stale) = self.acquire_lock(&request_id, started_at).await?;
        if !acquired {
            let owner = match self.cache.kv_get(LOCK_KEY).await? {
                Some(raw) => serde_json::from_str::<RunLock>(&raw)
                    .ok()
                    .map(|l| l.request_id),
                None => None,
            };
            return Ok((false, owner, None));
        }

        let (tx, _rx) = watch::channel(false);
        *self.cancel.lock().await = Some(tx);

        let mut state = self.state.lock().await;
        let last_processed = state.last_processed_regions;
        *state = RunState {
            running: true,
            request_id: Some(request_id.clone()),
            mode: Some(mode),
            started_at: Some(started_at),
            heartbeat_at: Some(started_at),
            total_regions: 0,
            selected_regions: 0,
            processed_regions: 0,
            abort_requested: false,
            last_started_at: Some(started_at),
            last_finished_at: None,
            // An eviction stays visible until this run finishes.
            last_error: evicted_stale.then(|| "heartbeat_lost".to_string()),
            last_processed_regions: last_processed,
        };
        Ok((true, Some(request_id), Some(started_at)))
    }

    /// Returns (acquired, evicted_stale_holder).
    async fn acquire_lock(
        &self,
        request_id: &str,
        started_at: DateTime<Utc>,
    ) -> EngineResult<(bool, bool)> {
        let lock = RunLock {
            request_id: request_id.to_string(),
            started_at,
            heartbeat_at: started_at,
        };
        let raw = serde_json::to_string(&lock)?;

        if self.cache.kv_try_insert(LOCK_KEY, &raw, None).await? {
            return Ok((true, false));
        }

        let Some(existing_raw) = self.cache.kv_get(LOCK_KEY).await? else {
            let acquired = self.cache.kv_try_insert(LOCK_KEY, &raw, None).await?;
            return Ok((acquired, false));
        };
        match serde_json::from_str::<RunLock>(&existing_raw) {
            Ok(existing) => {
                let age = (Utc::now() - existing.heartbeat_at).num_seconds();
                if age > self.config.heartbeat_timeout_seconds {
                    // Forcible eviction of an apparently dead holder.
                    if self.cache.kv_delete_if(LOCK_KEY, &existing_raw).await? {
                        tracing::warn!(
                            evicted = %existing.request_id,
                            age_seconds = age,
                            "evicted run lock with stale heartbeat"
                        );
                        let acquired = self.cache.kv_try_insert(LOCK_KEY, &raw, None).await?;
                        return Ok((acquired, true));
                    }
                }
                Ok((false, false))
            }
            Err(_) => {
                // Unparsable lock payloads cannot be trusted; clear and retry.
                let _ = self.cache.kv_delete_if(LOCK_KEY, &existing_raw).await;
                let acquired = self.cache.kv_try_insert(LOCK_KEY, &raw, None).await?;
                Ok((acquired, false))
            }
        }
    }

    async fn release_lock(&self, request_id: &str) {
        if let Ok(Some(raw)) = self.cache.kv_get(LOCK_KEY).await {
            if let Ok(lock) = serde_json::from_str::<RunLock>(&raw) {
                if lock.request_id == request_id {
                    let _ = self.cache.kv_delete_if(LOCK_KEY, &raw).await;
                }
            }
        }
    }

    async fn heartbeat(&self, request_id: &str) {
        let now = Utc::now();
        self.state.lock().await.heartbeat_at = Some(now);

        if let Ok(Some(raw)) = self.cache.kv_get(LOCK_KEY).await {
            if let Ok(mut lock) = serde_json::from_str::<RunLock>(&raw) {
                if lock.request_id == request_id {
                    lock.heartbeat_at = now;
                    if let Ok(updated) = serde_json::to_string(&lock) {
                        let _ = self.cache.kv_set(LOCK_KEY, &updated, None).await;
                    }
                }
            }
        }
    }

    async fn abort_requested(&self, request_id: &str) -> bool {
        if self.state.lock().await.abort_requested {
            return true;
        }
        matches!(self.cache.kv_get(&abort_key(request_id)).await, Ok(Some(_)))
    }

    async fn run_to_completion(
        self: &Arc<Self>,
        request_id: &str,
        mode: RunMode,
        region_limit: Option<usize>,
        force_llm: bool,
    ) -> EngineResult<DeltaMessage> {
        // Background refresher so slow batches do not lose the lock.
        let heartbeat_task = {
            let controller = Arc::clone(self);
            let rid = request_id.to_string();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(HEARTBEAT_REFRESH_SECONDS)).await;
                    controller.heartbeat(&rid).await;
                }
            })
        };

        let outcome = self
            .run_batches(request_id, mode, region_limit, force_llm)
            .await;
        heartbeat_task.abort();

        let (result, last_error, processed) = match outcome {
            Ok((message, last_error, processed)) => (Ok(message), last_error, processed),
            Err(err) => {
                tracing::error!(request_id, error = %err, "run failed");
                let tag = match &err {
                    EngineError::Database(_) => "internal:database",
                    _ => "internal:run_failed",
                };
                (Err(err), Some(tag.to_string()), 0)
            }
        };

        {
            let mut state = self.state.lock().await;
            if state.request_id.as_deref() == Some(request_id) {
                state.running = false;
                state.request_id = None;
                state.abort_requested = false;
            }
            state.last_finished_at = Some(Utc::now());
            state.last_error = last_error;
            if processed > 0 {
                state.last_processed_regions = processed;
            }
        }

        self.release_lock(request_id).await;
        let _ = self.cache.kv_delete(&abort_key(request_id)).await;
        *self.cancel.lock().await = None;

        result
    }

    async fn run_batches(
        &self,
        request_id: &str,
        mode: RunMode,
        region_limit: Option<usize>,
        force_llm: bool,
    ) -> EngineResult<(DeltaMessage, Option<String>, usize)> {
        let run_ts = self
            .state
            .lock()
            .await
            .started_at
            .unwrap_or_else(Utc::now);
        self.runtime.begin_run();

        let regions = self.store.load_regions().await?;
        let selection = selector::select_regions(
            &regions,
            mode,
            region_limit,
            request_id,
            self.config.high_risk_head_size,
        );
        {
            let mut state = self.state.lock().await;
            state.total_regions = selection.total;
            state.selected_regions = selection.selected;
        }
        self.publisher
            .begin_run(request_id, run_ts, selection.total, selection.selected)
            .await;

        let batches = selector::group_into_batches(&selection.regions, self.config.batch_size());
        let deadline =
            run_ts + chrono::Duration::seconds(self.config.workflow_max_runtime_seconds as i64);
        let cancel_rx = match self.cancel.lock().await.as_ref() {
            Some(tx) => tx.subscribe(),
            None => watch::channel(false).1,
        };

        let mut processed = 0usize;
        let mut last_error: Option<String> = None;
        let mut aborted = false;

        for batch in batches {
            if self.abort_requested(request_id).await {
                aborted = true;
                last_error = Some("manual_abort".to_string());
                break;
            }
            // Deadline is only checked between batches; a batch that starts
            // in time commits even when it finishes past the deadline.
            if Utc::now() >= deadline {
                last_error = Some(format!(
                    "workflow_partial_timeout_after_{}s",
                    self.config.workflow_max_runtime_seconds
                ));
                break;
            }

            self.heartbeat(request_id).await;

            let mut collected = self.collector.collect_batch(&batch, &cancel_rx).await;
            let decisions = self.pipeline.process(&mut collected, force_llm).await;

            {
                let mut debug = self.last_collections.lock().await;
                collected.truncate(DEBUG_COLLECTION_CAP);
                *debug = collected;
            }

            if let Err(err) = self.store.commit_batch(&decisions, run_ts).await {
                tracing::error!(request_id, error = %err, "batch commit failed");
                last_error = Some("internal:commit_failed".to_string());
                break;
            }

            processed += batch.len();
            {
                let mut state = self.state.lock().await;
                state.processed_regions = processed;
                state.heartbeat_at = Some(Utc::now());
            }

            let delta = DeltaMessage {
                timestamp: run_ts,
                results: decisions.iter().map(WarningUpdate::from_decision).collect(),
                total_regions: selection.total,
                selected_regions: selection.selected,
                processed_regions: processed,
                partial: true,
            };
            self.publisher.publish_batch(request_id, delta, false).await;
        }

        let partial = last_error.is_some() || processed < selection.selected;
        self.publisher.finish_run(request_id, partial, aborted).await;
        let results = self
            .publisher
            .last_state()
            .await
            .map(|s| s.results)
            .unwrap_or_default();
        let final_message = DeltaMessage {
            timestamp: run_ts,
            results,
            total_regions: selection.total,
            selected_regions: selection.selected,
            processed_regions: processed,
            partial,
        };
        Ok((final_message, last_error, processed))
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
