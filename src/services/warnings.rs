//! Warning persistence: snapshots, historical pressure, batch commits
//!
//! The pipeline reads persisted history through this service and never
//! writes outside the commit step. A batch commit is one transaction so
//! partial batches are all-or-nothing.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::EngineResult;
use crate::models::{Decision, Region, WarningRecord, WarningSnapshot};

/// Source tag written with every persisted decision.
pub const WARNING_SOURCE: &str = "fusion-pipeline/v1";

const TEST_SOURCE_KEYWORDS: [&str; 5] = ["test", "mock", "demo", "manual", "sample"];
const TEST_REASON_KEYWORDS: [&str; 5] = ["测试", "演示", "mock", "demo", "sample"];

/// Rows seeded by operators or demos must not act as real history.
pub fn is_test_warning(source: Option<&str>, reason: Option<&str>) -> bool {
    let source_hit = source
        .map(|s| {
            let lowered = s.trim().to_lowercase();
            TEST_SOURCE_KEYWORDS.iter().any(|k| lowered.contains(k))
        })
        .unwrap_or(false);
    let reason_hit = reason
        .map(|r| {
            let lowered = r.trim().to_lowercase();
            TEST_REASON_KEYWORDS.iter().any(|k| lowered.contains(k))
        })
        .unwrap_or(false);
    source_hit || reason_hit
}

pub struct WarningStore {
    db: PgPool,
}

impl WarningStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn load_regions(&self) -> EngineResult<Vec<Region>> {
        let regions = sqlx::query_as::<_, Region>(
            r#"
            SELECT code, name, longitude, latitude, risk_level, last_updated_at
            FROM regions
            ORDER BY code
            "#,
        )
        .fetch_all(&self.db)
        .await?;
        Ok(regions)
    }

    pub async fn count_regions(&self) -> EngineResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM regions")
            .fetch_one(&self.db)
            .await?;
        Ok(count)
    }

    /// Latest non-test warning for the region, parsed into a snapshot.
    pub async fn latest_snapshot(&self, region_code: &str) -> EngineResult<Option<WarningSnapshot>> {
        let records = sqlx::query_as::<_, WarningRecord>(
            r#"
            SELECT id, region_code, level, reason, meteorology, confidence, created_at, source
            FROM warnings
            WHERE region_code = $1
            ORDER BY created_at DESC
            LIMIT 30
            "#,
        )
        .bind(region_code)
        .fetch_all(&self.db)
        .await?;

        Ok(records
            .iter()
            .find(|r| !is_test_warning(Some(&r.source), r.reason.as_deref()))
            .map(WarningSnapshot::from_record))
    }

    /// Historical pressure: non-test warnings of level >= yellow within the
    /// rolling window (default ten years).
    pub async fn count_active_warnings(&self, region_code: &str, years: i64) -> EngineResult<i64> {
        let since = Utc::now() - chrono::Duration::days(years.max(1) * 365);
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM warnings
            WHERE region_code = $1
              AND created_at >= $2
              AND level IN ('yellow', 'orange', 'red')
              AND lower(coalesce(source, '')) NOT LIKE '%test%'
              AND lower(coalesce(source, '')) NOT LIKE '%mock%'
              AND lower(coalesce(source, '')) NOT LIKE '%demo%'
              AND lower(coalesce(source, '')) NOT LIKE '%manual%'
              AND lower(coalesce(source, '')) NOT LIKE '%sample%'
              AND lower(coalesce(reason, '')) NOT LIKE '%测试%'
              AND lower(coalesce(reason, '')) NOT LIKE '%演示%'
              AND lower(coalesce(reason, '')) NOT LIKE '%mock%'
              AND lower(coalesce(reason, '')) NOT LIKE '%demo%'
              AND lower(coalesce(reason, '')) NOT LIKE '%sample%'
            "#,
        )
        .bind(region_code)
        .bind(since)
        .fetch_one(&self.db)
        .await?;
        Ok(count.max(0))
    }

    /// Commits one batch atomically: region level updates plus one new
    /// warning row per non-retained decision.
    pub async fn commit_batch(
        &self,
        decisions: &[Decision],
        timestamp: DateTime<Utc>,
    ) -> EngineResult<usize> {
        let mut tx = self.db.begin().await?;
        let mut committed = 0usize;

        for decision in decisions.iter().filter(|d| !d.retained) {
            let updated = sqlx::query(
                "UPDATE regions SET risk_level = $1, last_updated_at = $2 WHERE code = $3",
            )
            .bind(decision.level.as_str())
            .bind(timestamp)
            .bind(&decision.region_code)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                sqlx::query(
                    r#"
                    INSERT INTO regions (code, name, risk_level, last_updated_at)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (code) DO UPDATE SET risk_level = $3, last_updated_at = $4
                    "#,
                )
                .bind(&decision.region_code)
                .bind(&decision.region_name)
                .bind(decision.level.as_str())
                .bind(timestamp)
                .execute(&mut *tx)
                .await?;
            }

            let meteorology = serde_json::to_string(&decision.meteorology)?;
            sqlx::query(
                r#"
                INSERT INTO warnings (region_code, level, reason, meteorology, confidence, created_at, source)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(&decision.region_code)
            .bind(decision.level.as_str())
            .bind(&decision.reason)
            .bind(&meteorology)
            .bind(decision.confidence)
            .bind(timestamp)
            .bind(WARNING_SOURCE)
            .execute(&mut *tx)
            .await?;

            committed += 1;
        }

        tx.commit().await?;
        Ok(committed)
    }

    /// Offline-built `region_code -> station_id` mapping for the CMA source.
    pub async fn station_map(&self) -> EngineResult<HashMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT region_code, station_id FROM cma_station_map")
                .fetch_all(&self.db)
                .await?;
        Ok(rows.into_iter().collect())
    }
}
