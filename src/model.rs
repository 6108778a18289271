use std::fmt;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::image_processing;

/// Sentinel stored in the ledger for "no limit".
pub const UNLIMITED_SENTINEL: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Processing => "PROCESSING",
            RequestStatus::Completed => "COMPLETED",
            RequestStatus::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "PENDING" => Ok(RequestStatus::Pending),
            "PROCESSING" => Ok(RequestStatus::Processing),
            "COMPLETED" => Ok(RequestStatus::Completed),
            "FAILED" => Ok(RequestStatus::Failed),
            other => Err(anyhow!("unknown request status: {other}")),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    ShopperPhoto,
    Preset,
}

impl InputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InputKind::ShopperPhoto => "shopper_photo",
            InputKind::Preset => "preset",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "shopper_photo" => Ok(InputKind::ShopperPhoto),
            "preset" => Ok(InputKind::Preset),
            other => Err(anyhow!("unknown input kind: {other}")),
        }
    }
}

/// An image either carried inline (decoded data URI, upload) or fetched on demand.
#[derive(Clone, PartialEq, Eq)]
pub enum ImageRef {
    Inline { mime_type: String, data: Vec<u8> },
    Remote(Url),
}

impl ImageRef {
    /// Accepts `data:<mime>;base64,...` or an http(s) URL.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("image reference is empty"));
        }
        if trimmed.starts_with("data:") {
            let (mime_type, data) = image_processing::parse_data_uri(trimmed)?;
            return Ok(ImageRef::Inline { mime_type, data });
        }
        let parsed = Url::parse(trimmed).map_err(|err| anyhow!("invalid image url: {err}"))?;
        match parsed.scheme() {
            "http" | "https" => Ok(ImageRef::Remote(parsed)),
            scheme => Err(anyhow!("unsupported image url scheme: {scheme}")),
        }
    }

    pub fn inline(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        ImageRef::Inline {
            mime_type: mime_type.into(),
            data,
        }
    }
}

impl fmt::Debug for ImageRef {
    // Inline payloads may be a shopper's photo; never print the bytes.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRef::Inline { mime_type, data } => f
                .debug_struct("Inline")
                .field("mime_type", mime_type)
                .field("len", &data.len())
                .finish(),
            ImageRef::Remote(url) => f.debug_tuple("Remote").field(&url.as_str()).finish(),
        }
    }
}

/// The product being tried on, as supplied by the storefront platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRef {
    pub id: String,
    pub title: String,
    pub image_url: String,
}

/// Raw subject input as received from the caller; validated by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct TryOnInput {
    pub shopper_photo: Option<ImageRef>,
    pub preset_image_id: Option<String>,
}

impl TryOnInput {
    pub fn shopper_photo(photo: ImageRef) -> Self {
        Self {
            shopper_photo: Some(photo),
            preset_image_id: None,
        }
    }

    pub fn preset(preset_image_id: impl Into<String>) -> Self {
        Self {
            shopper_photo: None,
            preset_image_id: Some(preset_image_id.into()),
        }
    }
}

/// Validated subject input: exactly one variant.
#[derive(Debug, Clone)]
pub enum ImageInput {
    ShopperPhoto(ImageRef),
    Preset(String),
}

impl ImageInput {
    pub fn kind(&self) -> InputKind {
        match self {
            ImageInput::ShopperPhoto(_) => InputKind::ShopperPhoto,
            ImageInput::Preset(_) => InputKind::Preset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Unlimited,
    Capped(i64),
}

impl Limit {
    pub fn from_sentinel(raw: i64) -> Self {
        if raw == UNLIMITED_SENTINEL {
            Limit::Unlimited
        } else {
            Limit::Capped(raw.max(0))
        }
    }

    pub fn to_sentinel(self) -> i64 {
        match self {
            Limit::Unlimited => UNLIMITED_SENTINEL,
            Limit::Capped(value) => value,
        }
    }

    /// True when `current` is still below the limit.
    pub fn allows(self, current: i64) -> bool {
        match self {
            Limit::Unlimited => true,
            Limit::Capped(limit) => current < limit,
        }
    }

    pub fn remaining(self, current: i64) -> Option<i64> {
        match self {
            Limit::Unlimited => None,
            Limit::Capped(limit) => Some((limit - current).max(0)),
        }
    }
}

impl Serialize for Limit {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.to_sentinel())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub id: String,
    pub store_id: String,
    pub product_id: String,
    pub product_title: String,
    pub product_image_url: String,
    pub input_kind: InputKind,
    pub preset_image_id: Option<String>,
    pub status: RequestStatus,
    pub result_url: Option<String>,
    pub cache_hit: bool,
    pub attempts: i64,
    pub duration_ms: Option<i64>,
    pub error_reason: Option<String>,
    pub diagnostic: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub store_id: String,
    pub preset_image_id: String,
    pub product_id: String,
    pub result_url: String,
    pub product_title: String,
    pub product_image_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageLedgerRow {
    pub store_id: String,
    pub credits_used: i64,
    pub credits_limit: Limit,
    pub product_limit: Limit,
    pub is_active: bool,
    pub last_reset_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresetImage {
    pub id: String,
    pub store_id: Option<String>,
    pub image_url: String,
    pub label: String,
    pub active: bool,
}
