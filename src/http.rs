use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::error::TryOnError;
use crate::image_processing::detect_mime_type;
use crate::ledger::EnableOutcome;
use crate::model::{ImageRef, ProductRef, TryOnInput};
use crate::orchestrator::TryOnService;
use crate::storage::local::validate_key;

const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;
const RESULT_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

pub type AppState = Arc<TryOnService>;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    retryable: bool,
}

fn json_error(status: StatusCode, code: &str, message: &str, retryable: bool) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: code.to_string(),
            message: message.to_string(),
            retryable,
        }),
    )
        .into_response()
}

fn internal_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request handler failed");
    TryOnError::Internal(err).into_response()
}

impl IntoResponse for TryOnError {
    fn into_response(self) -> Response {
        let status = match &self {
            TryOnError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            TryOnError::LimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            TryOnError::GenerationFailed { .. } => StatusCode::BAD_GATEWAY,
            TryOnError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        json_error(status, self.code(), &self.user_message(), self.retryable())
    }
}

/// Builds the application router. `prefix` is either empty or `/<secret>`.
pub fn router(state: AppState, prefix: &str) -> Router {
    let api = Router::new()
        .route(
            "/api/stores/{store}/try-on",
            post(submit_try_on).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/stores/{store}/usage", get(usage_summary))
        .route("/api/stores/{store}/requests", get(list_requests))
        .route(
            "/api/stores/{store}/products/{product}/enabled",
            put(enable_product).delete(disable_product),
        )
        .route(
            "/api/stores/{store}/products/{product}/invalidate",
            post(invalidate_product),
        )
        .route("/api/stores/{store}", axum::routing::delete(purge_store))
        .route("/files/{*path}", get(serve_file));
    let api = if prefix.is_empty() {
        api
    } else {
        Router::new().nest(prefix, api)
    };
    api.layer(TraceLayer::new_for_http()).with_state(state)
}

#[derive(Default)]
struct TryOnForm {
    product_id: Option<String>,
    product_title: Option<String>,
    product_image_url: Option<String>,
    preset_image_id: Option<String>,
    photo: Option<ImageRef>,
    photo_url: Option<String>,
}

async fn read_form(multipart: &mut Multipart) -> Result<TryOnForm, TryOnError> {
    let mut form = TryOnForm::default();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return Err(TryOnError::invalid(format!("malformed form: {err}"))),
        };
        let name = field.name().unwrap_or_default().to_string();
        if name == "photo" {
            let content_type = field.content_type().map(str::to_string);
            let bytes = field
                .bytes()
                .await
                .map_err(|err| TryOnError::invalid(format!("could not read photo: {err}")))?;
            if bytes.is_empty() {
                continue;
            }
            let mime_type = detect_mime_type(bytes.as_ref())
                .map(str::to_string)
                .or(content_type)
                .filter(|mime| mime.starts_with("image/"))
                .ok_or_else(|| TryOnError::invalid("photo must be an image"))?;
            form.photo = Some(ImageRef::inline(mime_type, bytes.to_vec()));
            continue;
        }
        let value = field
            .text()
            .await
            .map_err(|err| TryOnError::invalid(format!("could not read field {name}: {err}")))?;
        let value = Some(value.trim().to_string()).filter(|value| !value.is_empty());
        match name.as_str() {
            "product_id" => form.product_id = value,
            "product_title" => form.product_title = value,
            "product_image_url" => form.product_image_url = value,
            "preset_image_id" => form.preset_image_id = value,
            "photo_url" => form.photo_url = value,
            _ => {}
        }
    }
    Ok(form)
}

async fn submit_try_on(
    State(service): State<AppState>,
    Path(store): Path<String>,
    mut multipart: Multipart,
) -> Response {
    let form = match read_form(&mut multipart).await {
        Ok(form) => form,
        Err(err) => return err.into_response(),
    };
    let photo = match (form.photo, form.photo_url) {
        (Some(_), Some(_)) => {
            return TryOnError::invalid("send the photo as a file or a url, not both")
                .into_response();
        }
        (Some(photo), None) => Some(photo),
        (None, Some(url)) => match ImageRef::parse(&url) {
            Ok(photo) => Some(photo),
            Err(err) => return TryOnError::invalid(format!("photo url: {err}")).into_response(),
        },
        (None, None) => None,
    };
    let (Some(product_id), Some(product_image_url)) = (form.product_id, form.product_image_url)
    else {
        return TryOnError::invalid("product_id and product_image_url are required")
            .into_response();
    };
    let product = ProductRef {
        id: product_id,
        title: form.product_title.unwrap_or_default(),
        image_url: product_image_url,
    };
    let input = TryOnInput {
        shopper_photo: photo,
        preset_image_id: form.preset_image_id,
    };
    match service.submit(&store, &product, input).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err) => {
            if let TryOnError::Internal(inner) = &err {
                error!(store = %store, error = %format!("{inner:#}"), "try-on failed internally");
            }
            err.into_response()
        }
    }
}

async fn usage_summary(State(service): State<AppState>, Path(store): Path<String>) -> Response {
    match service.ledger().summary(&store, Utc::now()).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => internal_error(err),
    }
}

#[derive(Deserialize)]
struct ListQuery {
    limit: Option<i64>,
}

async fn list_requests(
    State(service): State<AppState>,
    Path(store): Path<String>,
    Query(query): Query<ListQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    match service.db().list_requests(&store, limit).await {
        Ok(requests) => Json(requests).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn enable_product(
    State(service): State<AppState>,
    Path((store, product)): Path<(String, String)>,
) -> Response {
    match service.ledger().enable_product(&store, &product, Utc::now()).await {
        Ok(EnableOutcome::Enabled | EnableOutcome::AlreadyEnabled) => {
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(EnableOutcome::LimitReached(capacity)) => {
            warn!(store = %store, current = capacity.current, "product limit reached");
            TryOnError::LimitExceeded {
                used: capacity.current,
                limit: capacity.limit.to_sentinel(),
            }
            .into_response()
        }
        Err(err) => internal_error(err),
    }
}

async fn disable_product(
    State(service): State<AppState>,
    Path((store, product)): Path<(String, String)>,
) -> Response {
    match service.ledger().disable_product(&store, &product, Utc::now()).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => internal_error(err),
    }
}

#[derive(Serialize)]
struct InvalidateResponse {
    removed: u64,
}

async fn invalidate_product(
    State(service): State<AppState>,
    Path((store, product)): Path<(String, String)>,
) -> Response {
    match service.invalidate_product(&store, &product).await {
        Ok(removed) => Json(InvalidateResponse { removed }).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn purge_store(State(service): State<AppState>, Path(store): Path<String>) -> Response {
    match service.purge_store(&store).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => internal_error(err),
    }
}

/// Public retrieval of stored results.
async fn serve_file(State(service): State<AppState>, Path(path): Path<String>) -> Response {
    if validate_key(&path).is_err() {
        return json_error(StatusCode::BAD_REQUEST, "INVALID_INPUT", "invalid path", false);
    }
    let bytes = match service.storage().get(&path).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "NOT_FOUND", "not found", false),
        Err(err) => return internal_error(err),
    };
    let content_type = detect_mime_type(&bytes).unwrap_or("application/octet-stream");
    let mut response = bytes.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(RESULT_CACHE_CONTROL),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::Client;
    use tempfile::tempdir;

    use super::*;
    use crate::db::Database;
    use crate::generation::testing::{ScriptedProvider, image_response};
    use crate::generation::{FailureKind, GenerationClient, RetryPolicy};
    use crate::image_processing::NormalizeOptions;
    use crate::ledger::{PlanDefaults, UsageLedger};
    use crate::storage::LocalFileStorage;

    async fn state(dir: &std::path::Path) -> AppState {
        let db = Database::in_memory().await.unwrap();
        let generator = GenerationClient::new(
            Arc::new(ScriptedProvider::always(image_response(b"x"))),
            Client::new(),
            RetryPolicy {
                max_attempts: 1,
                backoff_base: Duration::ZERO,
            },
        );
        Arc::new(TryOnService::new(
            db.clone(),
            UsageLedger::new(db, PlanDefaults::default()),
            Arc::new(LocalFileStorage::new(
                dir.to_path_buf(),
                "http://localhost/files".to_string(),
            )),
            generator,
            Client::new(),
            NormalizeOptions::default(),
        ))
    }

    #[tokio::test]
    async fn serve_file_sets_cache_headers() {
        let dir = tempdir().unwrap();
        let state = state(dir.path()).await;
        let png = crate::image_processing::sample_png(2, 2);
        state.storage().put("results/abc/r1.png", &png).await.unwrap();

        let response = serve_file(State(state), Path("results/abc/r1.png".to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(response.headers()[header::CACHE_CONTROL], RESULT_CACHE_CONTROL);
    }

    #[tokio::test]
    async fn serve_file_rejects_traversal_and_missing() {
        let dir = tempdir().unwrap();
        let state = state(dir.path()).await;
        let response = serve_file(State(state.clone()), Path("../secret.db".to_string())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = serve_file(State(state), Path("results/none.png".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn error_statuses_follow_taxonomy() {
        let cases = [
            (TryOnError::invalid("x"), StatusCode::BAD_REQUEST),
            (
                TryOnError::LimitExceeded { used: 1, limit: 1 },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                TryOnError::GenerationFailed {
                    request_id: "r".to_string(),
                    kind: FailureKind::NoImage,
                    attempts: 1,
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                TryOnError::Internal(anyhow::anyhow!("db down")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
