use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::generation::RetryPolicy;
use crate::image_processing::NormalizeOptions;
use crate::ledger::PlanDefaults;
use crate::model::Limit;
use crate::provider;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub secret_key: Option<String>,
    pub database_url: String,
    pub storage_dir: PathBuf,
    pub public_base_url: String,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub provider_timeout: Duration,
    pub retry: RetryPolicy,
    pub normalize: NormalizeOptions,
    pub plan_defaults: PlanDefaults,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = parse_var("PORT", 3000u16)?;
        let bind_address = format!("0.0.0.0:{port}");
        let data_dir = resolve_data_dir();
        let database_url = non_empty_var("DATABASE_URL").unwrap_or_else(|| {
            format!("sqlite://{}?mode=rwc", data_dir.join("tryon.db").display())
        });
        let storage_dir = non_empty_var("STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("storage"));
        let secret_key = non_empty_var("SECRET_KEY");
        let public_base_url = resolve_public_base_url(&bind_address, secret_key.as_deref());

        let quality = parse_var("NORMALIZE_QUALITY", 85u8)?;
        if !(1..=100).contains(&quality) {
            return Err(anyhow!("NORMALIZE_QUALITY must be between 1 and 100"));
        }
        let max_width = parse_dimension("NORMALIZE_MAX_WIDTH", 1024)?;
        let max_height = parse_dimension("NORMALIZE_MAX_HEIGHT", 1024)?;

        Ok(Self {
            port,
            secret_key,
            database_url,
            storage_dir,
            public_base_url,
            gemini_api_key: non_empty_var("GEMINI_API_KEY"),
            gemini_model: non_empty_var("GEMINI_MODEL")
                .unwrap_or_else(|| provider::DEFAULT_MODEL.to_string()),
            gemini_base_url: non_empty_var("GEMINI_BASE_URL")
                .unwrap_or_else(|| provider::DEFAULT_BASE_URL.to_string()),
            provider_timeout: Duration::from_secs(parse_var("PROVIDER_TIMEOUT_SECS", 120u64)?),
            retry: RetryPolicy {
                max_attempts: parse_var("GENERATION_MAX_ATTEMPTS", 3u32)?.max(1),
                backoff_base: Duration::from_millis(parse_var("GENERATION_BACKOFF_MS", 1_000u64)?),
            },
            normalize: NormalizeOptions {
                max_width,
                max_height,
                quality,
            },
            plan_defaults: PlanDefaults {
                credits_limit: Limit::from_sentinel(parse_var("DEFAULT_CREDITS_LIMIT", 10i64)?),
                product_limit: Limit::from_sentinel(parse_var("DEFAULT_PRODUCT_LIMIT", 1i64)?),
            },
        })
    }

    pub fn bind_address(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    /// Route prefix derived from `SECRET_KEY`, empty when unset.
    pub fn route_prefix(&self) -> String {
        match self.secret_key.as_deref() {
            Some(secret) => format!("/{secret}"),
            None => String::new(),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match non_empty_var(name) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid value for {name}: {raw}")),
        None => Ok(default),
    }
}

fn parse_dimension(name: &str, default: u32) -> Result<u32> {
    let value = parse_var(name, default)?;
    if value == 0 {
        return Err(anyhow!("{name} must be greater than 0"));
    }
    Ok(value)
}

fn resolve_data_dir() -> PathBuf {
    let mut base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push("tryon-pipeline");
    base
}

fn resolve_public_base_url(bind_address: &str, secret_key: Option<&str>) -> String {
    let raw = non_empty_var("PUBLIC_BASE_URL").unwrap_or_else(|| bind_address.to_string());
    let base = normalize_base_url(&raw);
    match secret_key {
        Some(secret) => format!("{base}/{secret}/files"),
        None => format!("{base}/files"),
    }
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_normalize_bound_is_rejected() {
        // SAFETY: only this test touches these variables.
        unsafe {
            env::set_var("TRYON_TEST_ZERO_BOUND", "0");
            env::set_var("TRYON_TEST_BOUND", "640");
        }
        let err = parse_dimension("TRYON_TEST_ZERO_BOUND", 1024).unwrap_err();
        assert!(err.to_string().contains("greater than 0"));
        assert_eq!(parse_dimension("TRYON_TEST_BOUND", 1024).unwrap(), 640);
        assert_eq!(parse_dimension("TRYON_TEST_UNSET_BOUND", 1024).unwrap(), 1024);
    }

    #[test]
    fn base_url_gets_scheme_and_loses_trailing_slash() {
        assert_eq!(normalize_base_url("shop.example.com/"), "http://shop.example.com");
        assert_eq!(
            normalize_base_url("https://shop.example.com"),
            "https://shop.example.com"
        );
    }
}
