use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::db::Database;
use crate::model::{CacheEntry, ProductRef};

/// Previously generated results, keyed strictly by (store, preset, product).
///
/// Only preset images participate in the key. Nothing derived from a shopper
/// photo may be passed here.
#[derive(Clone, Debug)]
pub struct ResultCache {
    db: Database,
}

impl ResultCache {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn lookup(
        &self,
        store_id: &str,
        preset_image_id: &str,
        product_id: &str,
    ) -> Result<Option<CacheEntry>> {
        self.db
            .get_cache_entry(store_id, preset_image_id, product_id)
            .await
    }

    pub async fn upsert(
        &self,
        store_id: &str,
        preset_image_id: &str,
        product: &ProductRef,
        result_url: &str,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry> {
        let entry = CacheEntry {
            store_id: store_id.to_string(),
            preset_image_id: preset_image_id.to_string(),
            product_id: product.id.clone(),
            result_url: result_url.to_string(),
            product_title: product.title.clone(),
            product_image_url: product.image_url.clone(),
            created_at: now,
            updated_at: now,
        };
        self.db.upsert_cache_entry(&entry).await
    }

    /// Drops every cached result for a product, e.g. after its image changed.
    pub async fn invalidate_product(&self, store_id: &str, product_id: &str) -> Result<u64> {
        let removed = self.db.delete_cache_for_product(store_id, product_id).await?;
        info!(store = store_id, product = product_id, removed, "cache invalidated for product");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(id: &str) -> ProductRef {
        ProductRef {
            id: id.to_string(),
            title: "Denim Jacket".to_string(),
            image_url: "https://cdn.example.com/jacket.png".to_string(),
        }
    }

    #[tokio::test]
    async fn lookup_is_scoped_by_every_key_part() {
        let cache = ResultCache::new(Database::in_memory().await.unwrap());
        let now = Utc::now();
        cache
            .upsert("s1", "p1", &product("g1"), "http://x/r1.png", now)
            .await
            .unwrap();

        assert!(cache.lookup("s1", "p1", "g1").await.unwrap().is_some());
        assert!(cache.lookup("s2", "p1", "g1").await.unwrap().is_none());
        assert!(cache.lookup("s1", "p2", "g1").await.unwrap().is_none());
        assert!(cache.lookup("s1", "p1", "g2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_overwrites_and_keeps_created_at() {
        let cache = ResultCache::new(Database::in_memory().await.unwrap());
        let first_at = Utc::now() - chrono::Duration::hours(1);
        let first = cache
            .upsert("s1", "p1", &product("g1"), "http://x/r1.png", first_at)
            .await
            .unwrap();
        let second = cache
            .upsert("s1", "p1", &product("g1"), "http://x/r2.png", Utc::now())
            .await
            .unwrap();
        assert_eq!(second.result_url, "http://x/r2.png");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
    }

    #[tokio::test]
    async fn invalidate_product_removes_all_presets_for_it() {
        let cache = ResultCache::new(Database::in_memory().await.unwrap());
        let now = Utc::now();
        for preset in ["p1", "p2"] {
            cache
                .upsert("s1", preset, &product("g1"), "http://x/r.png", now)
                .await
                .unwrap();
        }
        cache
            .upsert("s1", "p1", &product("g2"), "http://x/other.png", now)
            .await
            .unwrap();
        assert_eq!(cache.invalidate_product("s1", "g1").await.unwrap(), 2);
        assert!(cache.lookup("s1", "p1", "g2").await.unwrap().is_some());
    }
}
