//! HTTP front for the classifier.
//!
//! `POST /classify` takes the raw encoded image as the request body and answers with
//! `{"productName": ..., "confidence": ...}`. `GET /health` reports the model phase
//! and the corpus size.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{info, warn};
use serde_json::json;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::classifier::Classifier;
use crate::config::ServerConfig;
use crate::error::Error;
use crate::matcher::ClassificationResult;
use crate::state::ModelPhase;

/// A failure as reported over HTTP.
#[derive(Debug)]
pub enum ApiError
{
    Classifier(Error),
    /// The blocking task running the request panicked or was cancelled.
    Internal(String),
}

impl From<Error> for ApiError
{
    fn from(e: Error) -> Self
    {
        ApiError::Classifier(e)
    }
}

impl ApiError
{
    fn status_code(&self) -> StatusCode
    {
        match self {
            ApiError::Classifier(Error::Preprocess(_)) => StatusCode::BAD_REQUEST,
            ApiError::Classifier(Error::ModelNotReady(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Classifier(Error::StoreUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Classifier(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str
    {
        match self {
            ApiError::Classifier(e) => e.kind(),
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError
{
    fn into_response(self) -> Response
    {
        let status = self.status_code();
        let message = match &self {
            ApiError::Classifier(e) => e.to_string(),
            ApiError::Internal(message) => message.clone(),
        };
        if status.is_server_error() {
            warn!("Request failed with {}: {}", self.code(), message);
        }

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

pub fn router(classifier: Classifier, config: &ServerConfig) -> Router
{
    Router::new()
        .route("/classify", post(classify))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(config.max_body_size()))
        .layer(TimeoutLayer::new(config.timeout()))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(classifier))
}

/// Classifies the uploaded image. Decoding, inference and the corpus scan are
/// CPU/disk bound, so they run on the blocking pool.
async fn classify(
        State(classifier): State<Arc<Classifier>>,
        body: Bytes,
    ) -> Result<Json<ClassificationResult>, ApiError>
{
    let result = tokio::task::spawn_blocking(move || classifier.classify(&body))
        .await
        .map_err(|e| ApiError::Internal(format!("classification task failed: {e}")))??;

    Ok(Json(result))
}

async fn health(State(classifier): State<Arc<Classifier>>) -> Result<impl IntoResponse, ApiError>
{
    let phase = classifier.model_state().phase();
    let load_error = classifier.model_state().load_error();

    let counter = Arc::clone(&classifier);
    let references = tokio::task::spawn_blocking(move || counter.store().count())
        .await
        .map_err(|e| ApiError::Internal(format!("health task failed: {e}")))?;

    let (store_status, references) = match references {
        Ok(count) => ("ok", Some(count)),
        Err(e) => {
            warn!("Feature store check failed: {}", e);
            ("unavailable", None)
        }
    };

    let status = if phase == ModelPhase::Ready && references.is_some() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    Ok((status, Json(json!({
        "model": phase,
        "model_error": load_error,
        "store": store_status,
        "references": references,
    }))))
}

/// Serves until Ctrl-C.
pub async fn serve(classifier: Classifier, config: &ServerConfig) -> anyhow::Result<()>
{
    let addr = config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, router(classifier, config))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal()
{
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Unable to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests
{
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::classifier::tests::MeanColor;
    use crate::config::{StoreConfig, Thresholds};
    use crate::preprocessing::tests::solid_png;
    use crate::state::ModelState;
    use crate::store::SqliteFeatureStore;

    fn app(model: ModelState) -> (tempfile::TempDir, Classifier, Router)
    {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteFeatureStore::open(&StoreConfig {
            database_path: dir.path().join("server.db"),
            ..StoreConfig::default()
        }).unwrap();
        let classifier = Classifier::new(Arc::new(model), Arc::new(store), Thresholds::default());
        let router = router(classifier.clone(), &ServerConfig::default());
        (dir, classifier, router)
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value)
    {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn classify_request(body: Vec<u8>) -> Request<Body>
    {
        Request::builder()
            .method("POST")
            .uri("/classify")
            .header("content-type", "application/octet-stream")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn classify_returns_product_name_and_confidence()
    {
        let (_dir, classifier, router) = app(ModelState::ready(Arc::new(MeanColor)));
        classifier.ingest("cherry yogurt", &solid_png(4, 4, [220, 20, 60])).unwrap();

        let (status, body) = send(router, classify_request(solid_png(9, 9, [220, 20, 60]))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["productName"], "cherry yogurt");
        assert!(body["confidence"].as_f64().unwrap() > 99.9);
    }

    #[tokio::test]
    async fn empty_corpus_is_a_successful_not_determined()
    {
        let (_dir, _classifier, router) = app(ModelState::ready(Arc::new(MeanColor)));

        let (status, body) = send(router, classify_request(solid_png(4, 4, [1, 2, 3]))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "productName": "Not Determined", "confidence": 0.0 }));
    }

    #[tokio::test]
    async fn undecodable_upload_is_a_bad_request()
    {
        let (_dir, _classifier, router) = app(ModelState::ready(Arc::new(MeanColor)));

        let (status, body) = send(router, classify_request(b"GIF89a nope".to_vec())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "PREPROCESS_ERROR");
    }

    #[tokio::test]
    async fn requests_before_model_is_ready_are_rejected()
    {
        let (_dir, _classifier, router) = app(ModelState::new());

        let (status, body) = send(router, classify_request(solid_png(4, 4, [1, 2, 3]))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "MODEL_NOT_READY");
    }

    #[tokio::test]
    async fn health_reports_phase_and_corpus_size()
    {
        let (_dir, classifier, router) = app(ModelState::ready(Arc::new(MeanColor)));
        classifier.ingest("a", &solid_png(4, 4, [9, 9, 9])).unwrap();

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model"], "ready");
        assert_eq!(body["references"], 1);
    }

    #[tokio::test]
    async fn health_is_unavailable_while_unloaded()
    {
        let (_dir, _classifier, router) = app(ModelState::new());

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(router, request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["model"], "unloaded");
    }
}
