//! HTTP interface of the sidecar.
//!
//! - `GET /get-key` returns `200 {"key": ...}`, or `503 {"error": ...}` with
//!   `Retry-After` when the local cache is empty.
//! - `GET /healthz` reports the cache level and the current threshold.
//! - `POST /keys/{key}/persisted` drops a committed key from the issued
//!   ledger.

use crate::server::telemetry::{increment_acquire_exhausted, increment_keys_served};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use keypool::{Acquire, CandidateKey, Error, KeyBuffer, PoolStore};
use serde::Serialize;
use tower_http::trace::TraceLayer;

#[derive(Debug, Serialize)]
struct KeyResponse {
    key: CandidateKey,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    cached: usize,
    threshold: usize,
}

#[derive(Debug, Serialize)]
struct PersistedResponse {
    forgotten: bool,
}

pub fn router<S: PoolStore + 'static>(buffer: KeyBuffer<S>) -> Router {
    Router::new()
        .route("/get-key", get(get_key::<S>))
        .route("/healthz", get(healthz::<S>))
        .route("/keys/{key}/persisted", post(persisted::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(buffer)
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

async fn get_key<S: PoolStore + 'static>(State(buffer): State<KeyBuffer<S>>) -> Response {
    match buffer.acquire_one() {
        Acquire::Key(key) => {
            increment_keys_served();
            #[cfg(feature = "tracing")]
            tracing::debug!(%key, "Key served");
            Json(KeyResponse { key }).into_response()
        }
        Acquire::Exhausted => {
            increment_acquire_exhausted();
            #[cfg(feature = "tracing")]
            tracing::warn!("Local cache empty, answering 503");
            let mut response = error(StatusCode::SERVICE_UNAVAILABLE, "no keys available");
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from_static("1"));
            response
        }
    }
}

async fn healthz<S: PoolStore + 'static>(State(buffer): State<KeyBuffer<S>>) -> Response {
    Json(HealthResponse {
        cached: buffer.cached(),
        threshold: buffer.threshold(),
    })
    .into_response()
}

async fn persisted<S: PoolStore + 'static>(
    State(buffer): State<KeyBuffer<S>>,
    Path(key): Path<String>,
) -> Response {
    let key = CandidateKey::new(key);
    match buffer.confirm_persisted(&key).await {
        Ok(forgotten) => Json(PersistedResponse { forgotten }).into_response(),
        Err(e @ (Error::Shutdown | Error::StoreUnavailable { .. })) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(%key, error = %e, "Could not confirm persisted key");
            error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use core::time::Duration;
    use keypool::{BufferConfig, MemoryStore};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn buffer_with(keys: &[&str]) -> (Arc<MemoryStore>, KeyBuffer<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let keys: Vec<CandidateKey> = keys.iter().copied().map(CandidateKey::from).collect();
        store.add_available(&keys).await.unwrap();
        let buffer = KeyBuffer::spawn(Arc::clone(&store), BufferConfig::default()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        (store, buffer)
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, Response) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        (response.status(), response)
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn get_key_serves_then_reports_exhausted() {
        let (store, buffer) = buffer_with(&["aZ3kQ9x"]).await;
        let app = router(buffer.clone());

        let (status, response) = call(app.clone(), "GET", "/get-key").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "key": "aZ3kQ9x" }));
        assert!(store.issued_at(&CandidateKey::from("aZ3kQ9x")).is_some());

        let (status, response) = call(app, "GET", "/get-key").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[RETRY_AFTER], "1");
        assert_eq!(json_body(response).await, json!({ "error": "no keys available" }));

        buffer.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn healthz_reports_cache_level() {
        let (_store, buffer) = buffer_with(&["a", "b", "c"]).await;
        let app = router(buffer.clone());

        let (status, response) = call(app, "GET", "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "cached": 3, "threshold": 5 }));

        buffer.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_forgets_ledger_entry() {
        let (store, buffer) = buffer_with(&["k1"]).await;
        let app = router(buffer.clone());
        let _ = buffer.acquire_one();

        let (status, response) = call(app.clone(), "POST", "/keys/k1/persisted").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "forgotten": true }));
        assert_eq!(store.issued_at(&CandidateKey::from("k1")), None);

        let (_, response) = call(app.clone(), "POST", "/keys/k1/persisted").await;
        assert_eq!(json_body(response).await, json!({ "forgotten": false }));

        store.set_unavailable(true);
        let (status, _) = call(app, "POST", "/keys/k2/persisted").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        buffer.shutdown().await.unwrap();
    }
}
