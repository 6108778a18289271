use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::db::Database;
use crate::model::{Limit, UsageLedgerRow};

/// Credits roll over once this much time has passed since the last reset.
pub const RESET_PERIOD_DAYS: i64 = 30;

/// Limits applied to a store the first time its ledger is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanDefaults {
    pub credits_limit: Limit,
    pub product_limit: Limit,
}

impl Default for PlanDefaults {
    fn default() -> Self {
        Self {
            credits_limit: Limit::Capped(10),
            product_limit: Limit::Capped(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProductCapacity {
    pub exceeded: bool,
    pub limit: Limit,
    pub current: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSummary {
    pub store_id: String,
    pub credits_used: i64,
    pub credits_limit: Limit,
    pub credits_remaining: Option<i64>,
    pub products_enabled: i64,
    pub product_limit: Limit,
    pub is_active: bool,
    pub last_reset_at: DateTime<Utc>,
    pub next_reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnableOutcome {
    Enabled,
    AlreadyEnabled,
    LimitReached(ProductCapacity),
}

/// Whether the rollover is due at `now`.
pub fn reset_due(last_reset_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(last_reset_at) >= Duration::days(RESET_PERIOD_DAYS)
}

/// Per-store credit and product counters.
///
/// `increment` is deliberately not request-idempotent; the orchestrator calls
/// it once per completed request.
#[derive(Clone, Debug)]
pub struct UsageLedger {
    db: Database,
    defaults: PlanDefaults,
}

impl UsageLedger {
    pub fn new(db: Database, defaults: PlanDefaults) -> Self {
        Self { db, defaults }
    }

    /// Creates the store's ledger with plan defaults if it does not exist yet.
    pub async fn ensure(&self, store_id: &str, now: DateTime<Utc>) -> Result<UsageLedgerRow> {
        if self
            .db
            .insert_ledger_if_absent(
                store_id,
                self.defaults.credits_limit,
                self.defaults.product_limit,
                now,
            )
            .await?
        {
            info!(store = store_id, "usage ledger created");
        }
        self.db
            .get_ledger(store_id)
            .await?
            .ok_or_else(|| anyhow!("usage ledger missing for store {store_id}"))
    }

    /// Applies the lazy monthly rollover and returns the current ledger.
    /// Calling it again in the same period changes nothing.
    pub async fn check_and_reset(&self, store_id: &str, now: DateTime<Utc>) -> Result<UsageLedgerRow> {
        let ledger = self.ensure(store_id, now).await?;
        if !reset_due(ledger.last_reset_at, now) {
            return Ok(ledger);
        }
        if self.db.reset_ledger(store_id, ledger.last_reset_at, now).await? {
            info!(
                store = store_id,
                previous_credits_used = ledger.credits_used,
                "monthly usage reset"
            );
        } else {
            debug!(store = store_id, "usage reset already applied concurrently");
        }
        self.db
            .get_ledger(store_id)
            .await?
            .ok_or_else(|| anyhow!("usage ledger missing for store {store_id}"))
    }

    pub async fn has_capacity(&self, store_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let ledger = self.check_and_reset(store_id, now).await?;
        Ok(ledger_has_capacity(&ledger))
    }

    pub async fn increment(&self, store_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.db.increment_credits(store_id, now).await
    }

    /// Compares the live count of enabled products to the product limit.
    pub async fn has_product_capacity(&self, store_id: &str, now: DateTime<Utc>) -> Result<ProductCapacity> {
        let ledger = self.ensure(store_id, now).await?;
        let current = self.db.count_enabled_products(store_id).await?;
        Ok(ProductCapacity {
            exceeded: !ledger.product_limit.allows(current),
            limit: ledger.product_limit,
            current,
        })
    }

    pub async fn enable_product(
        &self,
        store_id: &str,
        product_id: &str,
        now: DateTime<Utc>,
    ) -> Result<EnableOutcome> {
        if self.db.is_product_enabled(store_id, product_id).await? {
            return Ok(EnableOutcome::AlreadyEnabled);
        }
        let capacity = self.has_product_capacity(store_id, now).await?;
        if capacity.exceeded {
            return Ok(EnableOutcome::LimitReached(capacity));
        }
        self.db
            .set_product_enabled(store_id, product_id, true, now)
            .await?;
        Ok(EnableOutcome::Enabled)
    }

    pub async fn disable_product(&self, store_id: &str, product_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.db
            .set_product_enabled(store_id, product_id, false, now)
            .await
    }

    pub async fn set_limits(
        &self,
        store_id: &str,
        credits_limit: Limit,
        product_limit: Limit,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure(store_id, now).await?;
        self.db
            .set_ledger_limits(store_id, credits_limit, product_limit, now)
            .await
    }

    pub async fn set_active(&self, store_id: &str, active: bool, now: DateTime<Utc>) -> Result<()> {
        self.ensure(store_id, now).await?;
        self.db.set_ledger_active(store_id, active, now).await
    }

    pub async fn summary(&self, store_id: &str, now: DateTime<Utc>) -> Result<UsageSummary> {
        let ledger = self.check_and_reset(store_id, now).await?;
        let products_enabled = self.db.count_enabled_products(store_id).await?;
        Ok(UsageSummary {
            credits_remaining: ledger.credits_limit.remaining(ledger.credits_used),
            next_reset_at: ledger.last_reset_at + Duration::days(RESET_PERIOD_DAYS),
            store_id: ledger.store_id,
            credits_used: ledger.credits_used,
            credits_limit: ledger.credits_limit,
            products_enabled,
            product_limit: ledger.product_limit,
            is_active: ledger.is_active,
            last_reset_at: ledger.last_reset_at,
        })
    }
}

/// Inactive stores have no capacity; otherwise the credit limit decides.
pub fn ledger_has_capacity(ledger: &UsageLedgerRow) -> bool {
    ledger.is_active && ledger.credits_limit.allows(ledger.credits_used)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ledger() -> UsageLedger {
        UsageLedger::new(Database::in_memory().await.unwrap(), PlanDefaults::default())
    }

    #[test]
    fn reset_due_at_thirty_days() {
        let start = Utc::now();
        assert!(!reset_due(start, start + Duration::days(29)));
        assert!(reset_due(start, start + Duration::days(30)));
        assert!(reset_due(start, start + Duration::days(45)));
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let ledger = ledger().await;
        let now = Utc::now();
        let first = ledger.ensure("s1", now).await.unwrap();
        ledger.increment("s1", now).await.unwrap();
        let second = ledger.ensure("s1", now + Duration::seconds(5)).await.unwrap();
        assert_eq!(first.credits_limit, Limit::Capped(10));
        assert_eq!(second.credits_used, 1);
        assert_eq!(second.last_reset_at, first.last_reset_at);
    }

    #[tokio::test]
    async fn check_and_reset_resets_once_per_period() {
        let ledger = ledger().await;
        let start = Utc::now();
        ledger.ensure("s1", start).await.unwrap();
        for _ in 0..4 {
            ledger.increment("s1", start).await.unwrap();
        }

        let same_tick = start + Duration::days(3);
        assert_eq!(ledger.check_and_reset("s1", same_tick).await.unwrap().credits_used, 4);
        assert_eq!(ledger.check_and_reset("s1", same_tick).await.unwrap().credits_used, 4);

        let later = start + Duration::days(31);
        let reset = ledger.check_and_reset("s1", later).await.unwrap();
        assert_eq!(reset.credits_used, 0);
        assert_eq!(reset.last_reset_at, crate::db::from_millis(crate::db::to_millis(later)));

        ledger.increment("s1", later).await.unwrap();
        let again = ledger.check_and_reset("s1", later).await.unwrap();
        assert_eq!(again.credits_used, 1);
        assert_eq!(again.last_reset_at, reset.last_reset_at);
    }

    #[tokio::test]
    async fn capacity_respects_limits_and_activity() {
        let ledger = ledger().await;
        let now = Utc::now();
        ledger
            .set_limits("s1", Limit::Capped(2), Limit::Capped(1), now)
            .await
            .unwrap();
        assert!(ledger.has_capacity("s1", now).await.unwrap());
        ledger.increment("s1", now).await.unwrap();
        ledger.increment("s1", now).await.unwrap();
        assert!(!ledger.has_capacity("s1", now).await.unwrap());

        ledger
            .set_limits("s1", Limit::Unlimited, Limit::Capped(1), now)
            .await
            .unwrap();
        assert!(ledger.has_capacity("s1", now).await.unwrap());

        ledger.set_active("s1", false, now).await.unwrap();
        assert!(!ledger.has_capacity("s1", now).await.unwrap());
    }

    #[tokio::test]
    async fn product_capacity_uses_live_count() {
        let ledger = ledger().await;
        let now = Utc::now();
        assert_eq!(
            ledger.enable_product("s1", "g1", now).await.unwrap(),
            EnableOutcome::Enabled
        );
        assert_eq!(
            ledger.enable_product("s1", "g1", now).await.unwrap(),
            EnableOutcome::AlreadyEnabled
        );
        match ledger.enable_product("s1", "g2", now).await.unwrap() {
            EnableOutcome::LimitReached(capacity) => {
                assert!(capacity.exceeded);
                assert_eq!(capacity.current, 1);
                assert_eq!(capacity.limit, Limit::Capped(1));
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        ledger.disable_product("s1", "g1", now).await.unwrap();
        let capacity = ledger.has_product_capacity("s1", now).await.unwrap();
        assert_eq!(capacity.current, 0);
        assert!(!capacity.exceeded);
    }

    #[tokio::test]
    async fn summary_reports_remaining_and_next_reset() {
        let ledger = ledger().await;
        let now = Utc::now();
        ledger.ensure("s1", now).await.unwrap();
        ledger.increment("s1", now).await.unwrap();
        let summary = ledger.summary("s1", now).await.unwrap();
        assert_eq!(summary.credits_remaining, Some(9));
        assert_eq!(
            summary.next_reset_at - summary.last_reset_at,
            Duration::days(RESET_PERIOD_DAYS)
        );
    }
}
