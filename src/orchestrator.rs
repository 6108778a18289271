//! Request orchestration: quota, cache, normalization, generation, metering.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{Database, PurgeReport};
use crate::error::TryOnError;
use crate::generation::GenerationClient;
use crate::image_processing::{NormalizeOptions, normalize};
use crate::ledger::{UsageLedger, ledger_has_capacity};
use crate::model::{
    CacheEntry, GenerationRequest, ImageInput, ImageRef, InputKind, ProductRef, RequestStatus,
    TryOnInput,
};
use crate::result_cache::ResultCache;
use crate::storage::{LocalFileStorage, result_key, store_results_prefix};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationOutcome {
    pub request_id: String,
    pub result_url: String,
    pub cache_hit: bool,
    pub attempts: u32,
}

/// Entry point of the pipeline. Construct once at startup and share.
#[derive(Clone)]
pub struct TryOnService {
    db: Database,
    ledger: UsageLedger,
    cache: ResultCache,
    storage: Arc<LocalFileStorage>,
    generator: GenerationClient,
    http: Client,
    normalize_options: NormalizeOptions,
}

/// The validated pieces of one submission.
struct Job<'a> {
    request_id: String,
    store_id: &'a str,
    product: &'a ProductRef,
    garment: ImageRef,
    subject: ImageRef,
    kind: InputKind,
    preset_image_id: Option<String>,
    started: Instant,
}

impl TryOnService {
    pub fn new(
        db: Database,
        ledger: UsageLedger,
        storage: Arc<LocalFileStorage>,
        generator: GenerationClient,
        http: Client,
        normalize_options: NormalizeOptions,
    ) -> Self {
        Self {
            cache: ResultCache::new(db.clone()),
            db,
            ledger,
            storage,
            generator,
            http,
            normalize_options,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn storage(&self) -> &LocalFileStorage {
        &self.storage
    }

    pub async fn submit(
        &self,
        store_id: &str,
        product: &ProductRef,
        input: TryOnInput,
    ) -> Result<GenerationOutcome, TryOnError> {
        let started = Instant::now();
        let store_id = store_id.trim();
        if store_id.is_empty() {
            return Err(TryOnError::invalid("store is required"));
        }
        if product.id.trim().is_empty() {
            return Err(TryOnError::invalid("product id is required"));
        }
        let garment = ImageRef::parse(&product.image_url)
            .map_err(|err| TryOnError::invalid(format!("product image: {err}")))?;
        let input = validate_input(input)?;

        let ledger = self.ledger.check_and_reset(store_id, Utc::now()).await?;
        if !ledger_has_capacity(&ledger) {
            info!(store = store_id, credits_used = ledger.credits_used, "try-on refused: limit reached");
            return Err(TryOnError::LimitExceeded {
                used: ledger.credits_used,
                limit: ledger.credits_limit.to_sentinel(),
            });
        }

        let request_id = Uuid::new_v4().to_string();
        let kind = input.kind();
        match input {
            ImageInput::Preset(preset_id) => {
                let preset = self
                    .db
                    .resolve_preset(store_id, &preset_id)
                    .await?
                    .ok_or_else(|| TryOnError::invalid("unknown preset image"))?;
                if let Some(entry) = self.lookup_cached(store_id, &preset.id, &product.id).await {
                    return self
                        .serve_cached(request_id, store_id, product, entry)
                        .await;
                }
                let subject = ImageRef::parse(&preset.image_url)
                    .with_context(|| format!("preset {} has an unusable image", preset.id))?;
                self.generate_fresh(Job {
                    request_id,
                    store_id,
                    product,
                    garment,
                    subject,
                    kind,
                    preset_image_id: Some(preset.id),
                    started,
                })
                .await
            }
            ImageInput::ShopperPhoto(photo) => {
                self.generate_fresh(Job {
                    request_id,
                    store_id,
                    product,
                    garment,
                    subject: photo,
                    kind,
                    preset_image_id: None,
                    started,
                })
                .await
            }
        }
    }

    async fn lookup_cached(
        &self,
        store_id: &str,
        preset_image_id: &str,
        product_id: &str,
    ) -> Option<CacheEntry> {
        match self.cache.lookup(store_id, preset_image_id, product_id).await {
            Ok(entry) => entry,
            Err(err) => {
                warn!(store = store_id, error = %format!("{err:#}"), "cache lookup failed, treating as miss");
                None
            }
        }
    }

    async fn serve_cached(
        &self,
        request_id: String,
        store_id: &str,
        product: &ProductRef,
        entry: CacheEntry,
    ) -> Result<GenerationOutcome, TryOnError> {
        let now = Utc::now();
        let request = GenerationRequest {
            id: request_id.clone(),
            store_id: store_id.to_string(),
            product_id: product.id.clone(),
            product_title: product.title.clone(),
            product_image_url: product.image_url.clone(),
            input_kind: InputKind::Preset,
            preset_image_id: Some(entry.preset_image_id.clone()),
            status: RequestStatus::Completed,
            result_url: Some(entry.result_url.clone()),
            cache_hit: true,
            attempts: 0,
            duration_ms: Some(0),
            error_reason: None,
            diagnostic: None,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_request(&request).await?;
        self.meter(store_id, &request_id).await;
        info!(store = store_id, request_id = %request_id, "try-on served from cache");
        Ok(GenerationOutcome {
            request_id,
            result_url: entry.result_url,
            cache_hit: true,
            attempts: 0,
        })
    }

    async fn generate_fresh(&self, job: Job<'_>) -> Result<GenerationOutcome, TryOnError> {
        let now = Utc::now();
        let request = GenerationRequest {
            id: job.request_id.clone(),
            store_id: job.store_id.to_string(),
            product_id: job.product.id.clone(),
            product_title: job.product.title.clone(),
            product_image_url: job.product.image_url.clone(),
            input_kind: job.kind,
            preset_image_id: job.preset_image_id.clone(),
            status: RequestStatus::Pending,
            result_url: None,
            cache_hit: false,
            attempts: 0,
            duration_ms: None,
            error_reason: None,
            diagnostic: None,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_request(&request).await?;

        let request_id = job.request_id.clone();
        let store_id = job.store_id;
        let started = job.started;
        let result = self.run_generation(job).await;
        if let Err(TryOnError::Internal(err)) = &result {
            error!(store = store_id, request_id = %request_id, error = %format!("{err:#}"), "try-on pipeline error");
            let elapsed = started.elapsed().as_millis() as i64;
            if let Err(mark_err) = self
                .db
                .fail_request(&request_id, "INTERNAL_ERROR", &format!("{err:#}"), 0, elapsed, Utc::now())
                .await
            {
                warn!(request_id = %request_id, error = %format!("{mark_err:#}"), "could not mark request failed");
            }
        }
        result
    }

    async fn run_generation(&self, job: Job<'_>) -> Result<GenerationOutcome, TryOnError> {
        let (subject, garment) = tokio::join!(
            normalize(&self.http, job.subject, self.normalize_options),
            normalize(&self.http, job.garment, self.normalize_options),
        );
        if subject.is_original() || garment.is_original() {
            info!(
                request_id = %job.request_id,
                subject_normalized = !subject.is_original(),
                garment_normalized = !garment.is_original(),
                "continuing with unnormalized input"
            );
        }

        self.db.mark_processing(&job.request_id, Utc::now()).await?;
        let generated = self
            .generator
            .generate(
                subject.into_image_ref(),
                garment.into_image_ref(),
                garment_label(job.product),
            )
            .await;

        let image = match generated {
            Ok(image) => image,
            Err(err) => {
                let elapsed = job.started.elapsed().as_millis() as i64;
                self.db
                    .fail_request(
                        &job.request_id,
                        err.kind.as_str(),
                        &err.diagnostic,
                        i64::from(err.attempts),
                        elapsed,
                        Utc::now(),
                    )
                    .await?;
                warn!(
                    store = job.store_id,
                    request_id = %job.request_id,
                    kind = err.kind.as_str(),
                    attempts = err.attempts,
                    "try-on generation failed"
                );
                return Err(TryOnError::GenerationFailed {
                    request_id: job.request_id,
                    kind: err.kind,
                    attempts: err.attempts,
                });
            }
        };

        let key = result_key(job.store_id, &job.request_id, &image.mime_type);
        let result_url = self
            .storage
            .put(&key, &image.data)
            .await
            .context("store generated image")?;
        let elapsed = job.started.elapsed().as_millis() as i64;
        self.db
            .complete_request(
                &job.request_id,
                &result_url,
                i64::from(image.attempts),
                elapsed,
                Utc::now(),
            )
            .await?;

        if let Some(preset_image_id) = job.preset_image_id.as_deref() {
            if let Err(err) = self
                .cache
                .upsert(job.store_id, preset_image_id, job.product, &result_url, Utc::now())
                .await
            {
                warn!(
                    store = job.store_id,
                    request_id = %job.request_id,
                    error = %format!("{err:#}"),
                    "cache write failed"
                );
            }
        }

        self.meter(job.store_id, &job.request_id).await;
        info!(
            store = job.store_id,
            request_id = %job.request_id,
            attempts = image.attempts,
            duration_ms = elapsed,
            "try-on completed"
        );
        Ok(GenerationOutcome {
            request_id: job.request_id,
            result_url,
            cache_hit: false,
            attempts: image.attempts,
        })
    }

    /// Charges one credit for a completed request. The result is already
    /// recorded, so a failure here is logged rather than surfaced.
    async fn meter(&self, store_id: &str, request_id: &str) {
        if let Err(err) = self.ledger.increment(store_id, Utc::now()).await {
            error!(
                store = store_id,
                request_id = %request_id,
                error = %format!("{err:#}"),
                "failed to record usage for completed request"
            );
        }
    }

    /// Drops a product's cached results after its display data changed.
    pub async fn invalidate_product(&self, store_id: &str, product_id: &str) -> anyhow::Result<u64> {
        self.cache.invalidate_product(store_id, product_id).await
    }

    /// Erases every row and stored result belonging to a store.
    pub async fn purge_store(&self, store_id: &str) -> anyhow::Result<PurgeReport> {
        let report = self.db.purge_store(store_id).await?;
        self.storage
            .delete_prefix(&store_results_prefix(store_id))
            .await
            .context("delete stored results")?;
        Ok(report)
    }
}

/// Exactly one of shopper photo or preset id must be present.
pub fn validate_input(input: TryOnInput) -> Result<ImageInput, TryOnError> {
    let preset = input
        .preset_image_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());
    match (input.shopper_photo, preset) {
        (Some(_), Some(_)) => Err(TryOnError::invalid(
            "provide either a shopper photo or a preset image, not both",
        )),
        (None, None) => Err(TryOnError::invalid(
            "a shopper photo or a preset image is required",
        )),
        (Some(photo), None) => Ok(ImageInput::ShopperPhoto(photo)),
        (None, Some(preset)) => Ok(ImageInput::Preset(preset)),
    }
}

fn garment_label(product: &ProductRef) -> &str {
    let title = product.title.trim();
    if title.is_empty() { "garment" } else { title }
}
