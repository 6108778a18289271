use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::image_processing::fetch_image_bytes;
use crate::model::ImageRef;
use crate::provider::{
    GenerationParams, ImageProvider, InlineImage, ProviderCallError, ProviderRequest,
    ProviderResponse,
};

pub const COMPOSITION_INSTRUCTION: &str = concat!(
    "You are a virtual try-on compositor. Using the person photo and the garment image, ",
    "produce one photorealistic image of the same person wearing the garment.\n",
    "Rules:\n",
    "1. Preserve the person's identity exactly: face, hair, skin tone, body shape.\n",
    "2. Keep the original background and lighting.\n",
    "3. Fully replace the clothing in the garment's category with the garment shown; ",
    "match its color, pattern, fabric and fit.\n",
    "4. Lay out a 2x2 grid in a single image showing the person in four natural poses ",
    "(front, three-quarter left, three-quarter right, relaxed).\n",
    "5. Return image data only. Do not reply with text."
);

/// Why a generation produced no image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    NoImage,
    TextOnly,
    Blocked,
    ProviderError,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::NoImage => "NO_IMAGE",
            FailureKind::TextOnly => "TEXT_ONLY",
            FailureKind::Blocked => "BLOCKED",
            FailureKind::ProviderError => "PROVIDER_ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationError {
    pub kind: FailureKind,
    /// Provider-side detail, for logs only.
    pub diagnostic: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub mime_type: String,
    pub data: Vec<u8>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1_000),
        }
    }
}

impl RetryPolicy {
    /// Linear backoff: the wait after attempt `n` is `n * base`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(attempt)
    }
}

/// Classifies a provider response. Safety blocks win over everything, then
/// any image wins over accompanying text.
pub fn classify(response: ProviderResponse) -> Result<InlineImage, (FailureKind, String)> {
    if let Some(reason) = response.block_reason {
        return Err((FailureKind::Blocked, format!("blocked: {reason}")));
    }
    if let Some(image) = response.images.into_iter().next() {
        return Ok(image);
    }
    match response.text {
        Some(text) => Err((FailureKind::TextOnly, format!("text only: {}", truncate(&text, 300)))),
        None => Err((FailureKind::NoImage, "response had neither image nor text".to_string())),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => format!("{}…", &text[..index]),
        None => text.to_string(),
    }
}

/// Wraps the provider with classification and bounded retries.
#[derive(Clone)]
pub struct GenerationClient {
    provider: Arc<dyn ImageProvider>,
    http: Client,
    policy: RetryPolicy,
    params: GenerationParams,
}

impl GenerationClient {
    pub fn new(provider: Arc<dyn ImageProvider>, http: Client, policy: RetryPolicy) -> Self {
        Self {
            provider,
            http,
            policy,
            params: GenerationParams::default(),
        }
    }

    pub async fn generate(
        &self,
        subject: ImageRef,
        garment: ImageRef,
        garment_label: &str,
    ) -> Result<GeneratedImage, GenerationError> {
        let subject = self.resolve(subject, "subject").await?;
        let garment = self.resolve(garment, "garment").await?;
        let request = ProviderRequest {
            instruction: COMPOSITION_INSTRUCTION.to_string(),
            subject,
            garment,
            garment_label: garment_label.to_string(),
            params: self.params,
        };

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let (kind, diagnostic, retryable) =
                match self.provider.generate_content(&request).await {
                    Ok(response) => match classify(response) {
                        Ok(image) => {
                            info!(attempt, mime_type = %image.mime_type, "provider returned image");
                            return Ok(GeneratedImage {
                                mime_type: image.mime_type,
                                data: image.data,
                                attempts: attempt,
                            });
                        }
                        Err((kind, diagnostic)) => {
                            (kind, diagnostic, kind == FailureKind::TextOnly)
                        }
                    },
                    Err(ProviderCallError::Transport(message)) => {
                        (FailureKind::ProviderError, message, true)
                    }
                    Err(ProviderCallError::Rejected(message)) => {
                        (FailureKind::ProviderError, message, false)
                    }
                };

            if !retryable || attempt >= max_attempts {
                warn!(
                    attempt,
                    kind = kind.as_str(),
                    diagnostic = %diagnostic,
                    "generation failed"
                );
                return Err(GenerationError {
                    kind,
                    diagnostic,
                    attempts: attempt,
                });
            }

            let delay = self.policy.delay_after(attempt);
            warn!(
                attempt,
                kind = kind.as_str(),
                delay_ms = delay.as_millis() as u64,
                "generation attempt missed, retrying"
            );
            sleep(delay).await;
        }
    }

    /// Inlines a remote input. The diagnostic names only the role, since the
    /// URL of a shopper photo must not reach the request record.
    async fn resolve(&self, image: ImageRef, role: &str) -> Result<InlineImage, GenerationError> {
        match image {
            ImageRef::Inline { mime_type, data } => Ok(InlineImage { mime_type, data }),
            ImageRef::Remote(url) => fetch_image_bytes(&self.http, url.as_str())
                .await
                .map(|(mime_type, data)| InlineImage { mime_type, data })
                .map_err(|err| {
                    warn!(role, error = %format!("{err:#}"), "input image fetch failed");
                    GenerationError {
                        kind: FailureKind::ProviderError,
                        diagnostic: format!("{role} image could not be fetched"),
                        attempts: 0,
                    }
                }),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    /// Plays back scripted responses and counts calls.
    pub struct ScriptedProvider {
        script: Mutex<VecDeque<Result<ProviderResponse, ProviderCallError>>>,
        fallback: Result<ProviderResponse, ProviderCallError>,
        calls: AtomicUsize,
        last_subject: Mutex<Option<InlineImage>>,
    }

    impl ScriptedProvider {
        pub fn new(
            script: Vec<Result<ProviderResponse, ProviderCallError>>,
            fallback: Result<ProviderResponse, ProviderCallError>,
        ) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: AtomicUsize::new(0),
                last_subject: Mutex::new(None),
            }
        }

        pub fn always(response: Result<ProviderResponse, ProviderCallError>) -> Self {
            Self::new(Vec::new(), response)
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Subject image sent with the most recent call.
        pub fn last_subject(&self) -> Option<InlineImage> {
            self.last_subject.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ImageProvider for ScriptedProvider {
        async fn generate_content(
            &self,
            request: &ProviderRequest,
        ) -> Result<ProviderResponse, ProviderCallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_subject.lock().unwrap() = Some(request.subject.clone());
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    pub fn image_response(data: &[u8]) -> Result<ProviderResponse, ProviderCallError> {
        Ok(ProviderResponse {
            images: vec![InlineImage {
                mime_type: "image/png".to_string(),
                data: data.to_vec(),
            }],
            ..ProviderResponse::default()
        })
    }

    pub fn text_response(text: &str) -> Result<ProviderResponse, ProviderCallError> {
        Ok(ProviderResponse {
            text: Some(text.to_string()),
            ..ProviderResponse::default()
        })
    }

    pub fn blocked_response() -> Result<ProviderResponse, ProviderCallError> {
        Ok(ProviderResponse {
            block_reason: Some("SAFETY".to_string()),
            ..ProviderResponse::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn client(provider: Arc<ScriptedProvider>) -> GenerationClient {
        GenerationClient::new(
            provider,
            Client::new(),
            RetryPolicy {
                max_attempts: 3,
                backoff_base: Duration::from_millis(1),
            },
        )
    }

    fn inputs() -> (ImageRef, ImageRef) {
        (
            ImageRef::inline("image/jpeg", vec![1, 2, 3]),
            ImageRef::inline("image/png", vec![4, 5, 6]),
        )
    }

    #[test]
    fn block_wins_over_image() {
        let response = ProviderResponse {
            block_reason: Some("SAFETY".to_string()),
            images: vec![InlineImage {
                mime_type: "image/png".to_string(),
                data: vec![1],
            }],
            text: None,
        };
        assert_eq!(classify(response).unwrap_err().0, FailureKind::Blocked);
    }

    #[test]
    fn image_wins_over_text() {
        let response = ProviderResponse {
            block_reason: None,
            images: vec![InlineImage {
                mime_type: "image/png".to_string(),
                data: vec![7],
            }],
            text: Some("Sure! Here you go.".to_string()),
        };
        assert_eq!(classify(response).unwrap().data, vec![7]);
    }

    #[test]
    fn empty_response_is_no_image() {
        assert_eq!(
            classify(ProviderResponse::default()).unwrap_err().0,
            FailureKind::NoImage
        );
    }

    #[test]
    fn backoff_is_linear() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn text_only_is_retried_up_to_the_cap() {
        let provider = Arc::new(ScriptedProvider::always(text_response("I cannot draw that")));
        let (subject, garment) = inputs();
        let err = client(provider.clone())
            .generate(subject, garment, "Shirt")
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::TextOnly);
        assert_eq!(err.attempts, 3);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn safety_block_is_not_retried() {
        let provider = Arc::new(ScriptedProvider::always(blocked_response()));
        let (subject, garment) = inputs();
        let err = client(provider.clone())
            .generate(subject, garment, "Shirt")
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Blocked);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn no_image_is_not_retried() {
        let provider = Arc::new(ScriptedProvider::always(Ok(ProviderResponse::default())));
        let (subject, garment) = inputs();
        let err = client(provider.clone())
            .generate(subject, garment, "Shirt")
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::NoImage);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn text_then_image_succeeds_on_third_attempt() {
        let provider = Arc::new(ScriptedProvider::new(
            vec![text_response("one"), text_response("two")],
            image_response(b"third"),
        ));
        let (subject, garment) = inputs();
        let image = client(provider.clone())
            .generate(subject, garment, "Shirt")
            .await
            .unwrap();
        assert_eq!(image.data, b"third");
        assert_eq!(image.attempts, 3);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn transport_errors_retry_then_surface_as_provider_error() {
        let provider = Arc::new(ScriptedProvider::always(Err(ProviderCallError::Transport(
            "connection reset".to_string(),
        ))));
        let (subject, garment) = inputs();
        let err = client(provider.clone())
            .generate(subject, garment, "Shirt")
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::ProviderError);
        assert_eq!(provider.calls(), 3);
        assert!(err.diagnostic.contains("connection reset"));
    }

    #[tokio::test]
    async fn rejected_call_fails_immediately() {
        let provider = Arc::new(ScriptedProvider::always(Err(ProviderCallError::Rejected(
            "HTTP 400".to_string(),
        ))));
        let (subject, garment) = inputs();
        let err = client(provider.clone())
            .generate(subject, garment, "Shirt")
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::ProviderError);
        assert_eq!(provider.calls(), 1);
    }
}
