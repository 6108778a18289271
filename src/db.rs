use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::info;

use crate::model::{
    CacheEntry, GenerationRequest, InputKind, Limit, PresetImage, RequestStatus, UsageLedgerRow,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS generation_requests (
  id TEXT PRIMARY KEY,
  store_id TEXT NOT NULL,
  product_id TEXT NOT NULL,
  product_title TEXT NOT NULL,
  product_image_url TEXT NOT NULL,
  input_kind TEXT NOT NULL,
  preset_image_id TEXT,
  status TEXT NOT NULL,
  result_url TEXT,
  cache_hit INTEGER NOT NULL DEFAULT 0,
  attempts INTEGER NOT NULL DEFAULT 0,
  duration_ms INTEGER,
  error_reason TEXT,
  diagnostic TEXT,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS generation_requests_store_idx
  ON generation_requests(store_id, created_at);
CREATE TABLE IF NOT EXISTS result_cache (
  store_id TEXT NOT NULL,
  preset_image_id TEXT NOT NULL,
  product_id TEXT NOT NULL,
  result_url TEXT NOT NULL,
  product_title TEXT NOT NULL,
  product_image_url TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  UNIQUE(store_id, preset_image_id, product_id)
);
CREATE TABLE IF NOT EXISTS usage_ledgers (
  store_id TEXT PRIMARY KEY,
  credits_used INTEGER NOT NULL DEFAULT 0,
  credits_limit INTEGER NOT NULL,
  product_limit INTEGER NOT NULL,
  is_active INTEGER NOT NULL DEFAULT 1,
  last_reset_at INTEGER NOT NULL,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS enabled_products (
  store_id TEXT NOT NULL,
  product_id TEXT NOT NULL,
  enabled INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  PRIMARY KEY (store_id, product_id)
);
CREATE TABLE IF NOT EXISTS preset_images (
  id TEXT PRIMARY KEY,
  store_id TEXT,
  image_url TEXT NOT NULL,
  label TEXT NOT NULL,
  active INTEGER NOT NULL DEFAULT 1,
  created_at INTEGER NOT NULL
);
"#;

/// Rows removed by [`Database::purge_store`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub generation_requests: u64,
    pub cache_entries: u64,
    pub usage_ledgers: u64,
    pub enabled_products: u64,
    pub preset_images: u64,
}

/// Handle to the relational store. Cheap to clone; construct once at startup.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connect to sqlite")?;
        let db = Self { pool };
        db.init_schema().await?;
        info!("database ready");
        Ok(db)
    }

    /// Private in-memory database; a single connection keeps every query on it.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("open in-memory sqlite")?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("create schema")?;
        Ok(())
    }

    // ---- generation requests ----

    pub async fn insert_request(&self, request: &GenerationRequest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO generation_requests (
              id, store_id, product_id, product_title, product_image_url, input_kind,
              preset_image_id, status, result_url, cache_hit, attempts, duration_ms,
              error_reason, diagnostic, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
        )
        .bind(&request.id)
        .bind(&request.store_id)
        .bind(&request.product_id)
        .bind(&request.product_title)
        .bind(&request.product_image_url)
        .bind(request.input_kind.as_str())
        .bind(&request.preset_image_id)
        .bind(request.status.as_str())
        .bind(&request.result_url)
        .bind(request.cache_hit)
        .bind(request.attempts)
        .bind(request.duration_ms)
        .bind(&request.error_reason)
        .bind(&request.diagnostic)
        .bind(to_millis(request.created_at))
        .bind(to_millis(request.updated_at))
        .execute(&self.pool)
        .await
        .context("insert generation request")?;
        Ok(())
    }

    pub async fn mark_processing(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE generation_requests
            SET status = 'PROCESSING', updated_at = ?2
            WHERE id = ?1 AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        ensure_transitioned(result.rows_affected(), id, RequestStatus::Processing)
    }

    pub async fn complete_request(
        &self,
        id: &str,
        result_url: &str,
        attempts: i64,
        duration_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE generation_requests
            SET status = 'COMPLETED', result_url = ?2, attempts = ?3, duration_ms = ?4,
                updated_at = ?5
            WHERE id = ?1 AND status IN ('PENDING', 'PROCESSING')
            "#,
        )
        .bind(id)
        .bind(result_url)
        .bind(attempts)
        .bind(duration_ms)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        ensure_transitioned(result.rows_affected(), id, RequestStatus::Completed)
    }

    pub async fn fail_request(
        &self,
        id: &str,
        reason: &str,
        diagnostic: &str,
        attempts: i64,
        duration_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE generation_requests
            SET status = 'FAILED', error_reason = ?2, diagnostic = ?3, attempts = ?4,
                duration_ms = ?5, updated_at = ?6
            WHERE id = ?1 AND status IN ('PENDING', 'PROCESSING')
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(diagnostic)
        .bind(attempts)
        .bind(duration_ms)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        ensure_transitioned(result.rows_affected(), id, RequestStatus::Failed)
    }

    pub async fn get_request(&self, id: &str) -> Result<Option<GenerationRequest>> {
        let row = sqlx::query("SELECT * FROM generation_requests WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    /// Newest first.
    pub async fn list_requests(&self, store_id: &str, limit: i64) -> Result<Vec<GenerationRequest>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM generation_requests
            WHERE store_id = ?1
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?2
            "#,
        )
        .bind(store_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(request_from_row).collect()
    }

    pub async fn count_requests(&self, store_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM generation_requests WHERE store_id = ?1")
            .bind(store_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }

    // ---- result cache ----

    pub async fn get_cache_entry(
        &self,
        store_id: &str,
        preset_image_id: &str,
        product_id: &str,
    ) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM result_cache
            WHERE store_id = ?1 AND preset_image_id = ?2 AND product_id = ?3
            "#,
        )
        .bind(store_id)
        .bind(preset_image_id)
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(cache_entry_from_row).transpose()
    }

    pub async fn upsert_cache_entry(&self, entry: &CacheEntry) -> Result<CacheEntry> {
        sqlx::query(
            r#"
            INSERT INTO result_cache (
              store_id, preset_image_id, product_id, result_url, product_title,
              product_image_url, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(store_id, preset_image_id, product_id) DO UPDATE SET
              result_url = excluded.result_url,
              product_title = excluded.product_title,
              product_image_url = excluded.product_image_url,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(&entry.store_id)
        .bind(&entry.preset_image_id)
        .bind(&entry.product_id)
        .bind(&entry.result_url)
        .bind(&entry.product_title)
        .bind(&entry.product_image_url)
        .bind(to_millis(entry.created_at))
        .bind(to_millis(entry.updated_at))
        .execute(&self.pool)
        .await
        .context("upsert cache entry")?;
        self.get_cache_entry(&entry.store_id, &entry.preset_image_id, &entry.product_id)
            .await?
            .ok_or_else(|| anyhow!("cache entry missing after upsert"))
    }

    pub async fn delete_cache_for_product(&self, store_id: &str, product_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM result_cache WHERE store_id = ?1 AND product_id = ?2")
            .bind(store_id)
            .bind(product_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_cache_entries(&self, store_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM result_cache WHERE store_id = ?1")
            .bind(store_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }

    // ---- usage ledgers ----

    /// Creates the ledger if absent. Returns whether a row was inserted.
    pub async fn insert_ledger_if_absent(
        &self,
        store_id: &str,
        credits_limit: Limit,
        product_limit: Limit,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now = to_millis(now);
        let result = sqlx::query(
            r#"
            INSERT INTO usage_ledgers (
              store_id, credits_used, credits_limit, product_limit, is_active,
              last_reset_at, created_at, updated_at
            )
            VALUES (?1, 0, ?2, ?3, 1, ?4, ?4, ?4)
            ON CONFLICT(store_id) DO NOTHING
            "#,
        )
        .bind(store_id)
        .bind(credits_limit.to_sentinel())
        .bind(product_limit.to_sentinel())
        .bind(now)
        .execute(&self.pool)
        .await
        .context("insert usage ledger")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_ledger(&self, store_id: &str) -> Result<Option<UsageLedgerRow>> {
        let row = sqlx::query("SELECT * FROM usage_ledgers WHERE store_id = ?1")
            .bind(store_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(ledger_from_row).transpose()
    }

    /// Compare-and-set reset: only applies while `last_reset_at` still equals
    /// `observed_reset_at`, so a reset is never applied twice for one period.
    pub async fn reset_ledger(
        &self,
        store_id: &str,
        observed_reset_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE usage_ledgers
            SET credits_used = 0, last_reset_at = ?3, updated_at = ?3
            WHERE store_id = ?1 AND last_reset_at = ?2
            "#,
        )
        .bind(store_id)
        .bind(to_millis(observed_reset_at))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn increment_credits(&self, store_id: &str, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE usage_ledgers
            SET credits_used = credits_used + 1, updated_at = ?2
            WHERE store_id = ?1
            "#,
        )
        .bind(store_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("no usage ledger for store {store_id}"));
        }
        Ok(())
    }

    pub async fn set_ledger_limits(
        &self,
        store_id: &str,
        credits_limit: Limit,
        product_limit: Limit,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE usage_ledgers
            SET credits_limit = ?2, product_limit = ?3, updated_at = ?4
            WHERE store_id = ?1
            "#,
        )
        .bind(store_id)
        .bind(credits_limit.to_sentinel())
        .bind(product_limit.to_sentinel())
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("no usage ledger for store {store_id}"));
        }
        Ok(())
    }

    pub async fn set_ledger_active(&self, store_id: &str, active: bool, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE usage_ledgers SET is_active = ?2, updated_at = ?3 WHERE store_id = ?1",
        )
        .bind(store_id)
        .bind(active)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("no usage ledger for store {store_id}"));
        }
        Ok(())
    }

    // ---- enabled products ----

    pub async fn set_product_enabled(
        &self,
        store_id: &str,
        product_id: &str,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO enabled_products (store_id, product_id, enabled, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(store_id, product_id) DO UPDATE SET
              enabled = excluded.enabled,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(store_id)
        .bind(product_id)
        .bind(enabled)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .context("set product enabled")?;
        Ok(())
    }

    pub async fn is_product_enabled(&self, store_id: &str, product_id: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT enabled FROM enabled_products WHERE store_id = ?1 AND product_id = ?2",
        )
        .bind(store_id)
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(row.try_get("enabled")?),
            None => Ok(false),
        }
    }

    pub async fn count_enabled_products(&self, store_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM enabled_products WHERE store_id = ?1 AND enabled = 1",
        )
        .bind(store_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("total")?)
    }

    // ---- preset images ----

    pub async fn upsert_preset(&self, preset: &PresetImage, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO preset_images (id, store_id, image_url, label, active, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
              store_id = excluded.store_id,
              image_url = excluded.image_url,
              label = excluded.label,
              active = excluded.active
            "#,
        )
        .bind(&preset.id)
        .bind(&preset.store_id)
        .bind(&preset.image_url)
        .bind(&preset.label)
        .bind(preset.active)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .context("upsert preset image")?;
        Ok(())
    }

    /// An active preset that is app-wide or owned by `store_id`.
    pub async fn resolve_preset(&self, store_id: &str, preset_id: &str) -> Result<Option<PresetImage>> {
        let row = sqlx::query(
            r#"
            SELECT id, store_id, image_url, label, active FROM preset_images
            WHERE id = ?1 AND active = 1 AND (store_id IS NULL OR store_id = ?2)
            "#,
        )
        .bind(preset_id)
        .bind(store_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| -> Result<PresetImage> {
            Ok(PresetImage {
                id: row.try_get("id")?,
                store_id: row.try_get("store_id")?,
                image_url: row.try_get("image_url")?,
                label: row.try_get("label")?,
                active: row.try_get("active")?,
            })
        })
        .transpose()
    }

    // ---- compliance ----

    /// Deletes every row scoped to `store_id` in one transaction.
    pub async fn purge_store(&self, store_id: &str) -> Result<PurgeReport> {
        let mut tx = self.pool.begin().await?;
        let mut report = PurgeReport::default();
        report.generation_requests = sqlx::query("DELETE FROM generation_requests WHERE store_id = ?1")
            .bind(store_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        report.cache_entries = sqlx::query("DELETE FROM result_cache WHERE store_id = ?1")
            .bind(store_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        report.usage_ledgers = sqlx::query("DELETE FROM usage_ledgers WHERE store_id = ?1")
            .bind(store_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        report.enabled_products = sqlx::query("DELETE FROM enabled_products WHERE store_id = ?1")
            .bind(store_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        report.preset_images = sqlx::query("DELETE FROM preset_images WHERE store_id = ?1")
            .bind(store_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        info!(store = store_id, ?report, "store data purged");
        Ok(report)
    }
}

fn ensure_transitioned(rows: u64, id: &str, target: RequestStatus) -> Result<()> {
    if rows == 0 {
        return Err(anyhow!(
            "generation request {id} cannot move to {}",
            target.as_str()
        ));
    }
    Ok(())
}

pub fn to_millis(value: DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

pub fn from_millis(value: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(value).unwrap_or_default()
}

fn request_from_row(row: &SqliteRow) -> Result<GenerationRequest> {
    Ok(GenerationRequest {
        id: row.try_get("id")?,
        store_id: row.try_get("store_id")?,
        product_id: row.try_get("product_id")?,
        product_title: row.try_get("product_title")?,
        product_image_url: row.try_get("product_image_url")?,
        input_kind: InputKind::parse(&row.try_get::<String, _>("input_kind")?)?,
        preset_image_id: row.try_get("preset_image_id")?,
        status: RequestStatus::parse(&row.try_get::<String, _>("status")?)?,
        result_url: row.try_get("result_url")?,
        cache_hit: row.try_get("cache_hit")?,
        attempts: row.try_get("attempts")?,
        duration_ms: row.try_get("duration_ms")?,
        error_reason: row.try_get("error_reason")?,
        diagnostic: row.try_get("diagnostic")?,
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

fn cache_entry_from_row(row: &SqliteRow) -> Result<CacheEntry> {
    Ok(CacheEntry {
        store_id: row.try_get("store_id")?,
        preset_image_id: row.try_get("preset_image_id")?,
        product_id: row.try_get("product_id")?,
        result_url: row.try_get("result_url")?,
        product_title: row.try_get("product_title")?,
        product_image_url: row.try_get("product_image_url")?,
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

fn ledger_from_row(row: &SqliteRow) -> Result<UsageLedgerRow> {
    Ok(UsageLedgerRow {
        store_id: row.try_get("store_id")?,
        credits_used: row.try_get("credits_used")?,
        credits_limit: Limit::from_sentinel(row.try_get("credits_limit")?),
        product_limit: Limit::from_sentinel(row.try_get("product_limit")?),
        is_active: row.try_get("is_active")?,
        last_reset_at: from_millis(row.try_get("last_reset_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

#[cfg(test)]
impl Database {
    /// Removes the cache table so every cache read and write errors.
    pub(crate) async fn break_result_cache(&self) -> Result<()> {
        sqlx::raw_sql("DROP TABLE result_cache")
            .execute(&self.pool)
            .await
            .context("drop result_cache")?;
        Ok(())
    }
}
