//! Metered virtual try-on generation: quota checks, preset-only result
//! caching, image normalization and a retried call to the image provider.

pub mod config;
pub mod db;
pub mod error;
pub mod generation;
pub mod http;
pub mod image_processing;
pub mod ledger;
pub mod model;
pub mod orchestrator;
pub mod provider;
pub mod result_cache;
pub mod storage;

pub use error::TryOnError;
pub use orchestrator::{GenerationOutcome, TryOnService};
