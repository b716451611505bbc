//! HTTP API for submission ingress, queries, and status.

use crate::artifacts::{ArtifactKind, ArtifactStore};
use crate::error::HarkError;
use crate::retrieval::{QueryRequest, RetrievalEngine, RetrievalVariant};
use crate::scheduler::PoolState;
use crate::store::{SourceKind, SqliteJobStore};
use crate::vector_store::VectorStore;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Shared application state.
pub struct AppState {
    pub store: Arc<SqliteJobStore>,
    pub artifacts: Arc<ArtifactStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub engine: Arc<RetrievalEngine>,
    pub pool: Option<Arc<PoolState>>,
}

/// Build the router.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/process", post(process))
        .route("/query", post(query))
        .route("/status", get(status))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

/// Serve the API on the given address until the process exits.
pub async fn serve(state: Arc<AppState>, host: &str, port: u16) -> crate::error::Result<()> {
    let app = router(state);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

// === Request/Response types ===

#[derive(Deserialize)]
struct ProcessRequest {
    urls: Vec<String>,
    #[serde(default)]
    use_fake_asr: bool,
    #[serde(default)]
    language: Option<String>,
    #[serde(default = "default_user")]
    user_id: String,
}

fn default_user() -> String {
    "api".to_string()
}

#[derive(Serialize)]
struct ProcessResponse {
    submission_ids: Vec<i64>,
}

#[derive(Deserialize)]
struct ApiQueryRequest {
    question: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default)]
    variant: Option<String>,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default = "default_user")]
    user_id: String,
}

fn default_top_k() -> usize {
    3
}

#[derive(Serialize)]
struct ApiQueryResponse {
    answer: String,
    sources: Vec<SourceInfo>,
    response_time_ms: u64,
}

#[derive(Serialize)]
struct SourceInfo {
    chunk_id: String,
    score: f32,
    text: String,
}

#[derive(Serialize)]
struct StatusResponse {
    submissions_by_stage: Vec<(String, u32)>,
    pending_total: u32,
    audio_bytes: u64,
    transcript_bytes: u64,
    chunk_bytes: u64,
    collection_size: usize,
    worker_pool: Vec<(String, usize)>,
    query_count: u32,
    avg_response_time_ms: Option<f64>,
    feedback_counts: Vec<(String, u32)>,
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    collection_size: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    tag: String,
}

fn error_response(e: &HarkError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match e {
        HarkError::Backpressure => StatusCode::TOO_MANY_REQUESTS,
        HarkError::InvalidInput(_) | HarkError::DuplicateSource(_) => StatusCode::BAD_REQUEST,
        HarkError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            tag: e.tag().to_string(),
        }),
    )
}

// === Handlers ===

async fn process(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProcessRequest>,
) -> impl IntoResponse {
    if req.urls.is_empty() {
        return error_response(&HarkError::InvalidInput("no urls given".into())).into_response();
    }

    let mut submission_ids = Vec::new();
    for url in &req.urls {
        match state.store.insert_submission(
            SourceKind::RemoteUrl,
            url,
            &req.user_id,
            req.language.as_deref(),
            req.use_fake_asr,
            5,
        ) {
            Ok(id) => submission_ids.push(id),
            Err(e) => return error_response(&e).into_response(),
        }
    }

    (StatusCode::ACCEPTED, Json(ProcessResponse { submission_ids })).into_response()
}

async fn query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ApiQueryRequest>,
) -> impl IntoResponse {
    let variant = match req.variant.as_deref() {
        Some(s) => match s.parse::<RetrievalVariant>() {
            Ok(v) => Some(v),
            Err(e) => return error_response(&HarkError::InvalidInput(e)).into_response(),
        },
        None => None,
    };

    let request = QueryRequest {
        user_id: req.user_id,
        question: req.question,
        top_k: Some(req.top_k),
        variant,
        system_prompt: req.system_prompt,
    };

    match state.engine.query(request).await {
        Ok(response) => Json(ApiQueryResponse {
            answer: response.answer,
            sources: response
                .sources
                .into_iter()
                .map(|c| SourceInfo {
                    chunk_id: c.chunk_id,
                    score: c.score,
                    text: c.text,
                })
                .collect(),
            response_time_ms: response.response_time_ms,
        })
        .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = match state.store.stats() {
        Ok(s) => s,
        Err(e) => return error_response(&e).into_response(),
    };

    let collection_size = state.vectors.count().await.unwrap_or(0);

    Json(StatusResponse {
        submissions_by_stage: stats.by_stage,
        pending_total: stats.pending_total,
        audio_bytes: state.artifacts.size(ArtifactKind::Audio).unwrap_or(0),
        transcript_bytes: state.artifacts.size(ArtifactKind::Transcript).unwrap_or(0),
        chunk_bytes: state.artifacts.size(ArtifactKind::Chunks).unwrap_or(0),
        collection_size,
        worker_pool: state.pool.as_ref().map(|p| p.snapshot()).unwrap_or_default(),
        query_count: stats.query_count,
        avg_response_time_ms: stats.avg_response_time_ms,
        feedback_counts: stats.feedback_counts,
    })
    .into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let collection_size = state.vectors.count().await.unwrap_or(0);
    Json(HealthResponse {
        ok: true,
        collection_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Prompts, RetrievalSettings};
    use crate::embedding::FakeEmbedder;
    use crate::llm::FakeChat;
    use crate::retrieval::LexicalOverlapScorer;
    use crate::store::StoreConfig;
    use crate::vector_store::MemoryVectorStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<SqliteJobStore>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteJobStore::in_memory(StoreConfig::default()).unwrap());
        let artifacts = Arc::new(ArtifactStore::new(tmp.path()).unwrap());
        let vectors: Arc<dyn VectorStore> = Arc::new(MemoryVectorStore::new());

        let engine = Arc::new(RetrievalEngine::new(
            store.clone(),
            vectors.clone(),
            Arc::new(FakeEmbedder::new(4)),
            Arc::new(FakeChat::new("an answer")),
            Arc::new(LexicalOverlapScorer),
            Prompts::default(),
            RetrievalSettings::default(),
        ));

        let state = Arc::new(AppState {
            store: store.clone(),
            artifacts,
            vectors,
            engine,
            pool: None,
        });
        (router(state), store, tmp)
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_process_accepts_submissions() {
        let (router, store, _tmp) = app();
        let (status, body) = send(
            &router,
            post_json(
                "/process",
                serde_json::json!({"urls": ["https://example/a", "https://example/b"]}),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["submission_ids"].as_array().unwrap().len(), 2);
        assert_eq!(store.non_terminal_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_process_backpressure_maps_to_429() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(
            SqliteJobStore::in_memory(StoreConfig {
                high_water_mark: 1,
                ..StoreConfig::default()
            })
            .unwrap(),
        );
        let artifacts = Arc::new(ArtifactStore::new(tmp.path()).unwrap());
        let vectors: Arc<dyn VectorStore> = Arc::new(MemoryVectorStore::new());
        let engine = Arc::new(RetrievalEngine::new(
            store.clone(),
            vectors.clone(),
            Arc::new(FakeEmbedder::new(4)),
            Arc::new(FakeChat::new("x")),
            Arc::new(LexicalOverlapScorer),
            Prompts::default(),
            RetrievalSettings::default(),
        ));
        let router = router(Arc::new(AppState {
            store,
            artifacts,
            vectors,
            engine,
            pool: None,
        }));

        let (first, _) = send(
            &router,
            post_json("/process", serde_json::json!({"urls": ["https://example/a"]})),
        )
        .await;
        assert_eq!(first, StatusCode::ACCEPTED);

        let (second, body) = send(
            &router,
            post_json("/process", serde_json::json!({"urls": ["https://example/b"]})),
        )
        .await;
        assert_eq!(second, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["tag"], "backpressure");
    }

    #[tokio::test]
    async fn test_health_reports_collection_size() {
        let (router, _store, _tmp) = app();
        let (status, body) = send(
            &router,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["collection_size"], 0);
    }

    #[tokio::test]
    async fn test_query_on_empty_corpus_is_not_found() {
        let (router, _store, _tmp) = app();
        let (status, body) = send(
            &router,
            post_json("/query", serde_json::json!({"question": "anything"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("no-corpus"));
    }

    #[tokio::test]
    async fn test_status_counts_by_stage() {
        let (router, store, _tmp) = app();
        store
            .insert_submission(SourceKind::RemoteUrl, "https://example/a", "u", None, false, 5)
            .unwrap();

        let (status, body) = send(
            &router,
            Request::builder().uri("/status").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pending_total"], 1);
    }
}
