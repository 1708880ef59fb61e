//! HTTP gateway built on axum.

use crate::context::{ConversationStore, DEFAULT_SESSION};
use crate::error::RagError;
use crate::rag::RagEngine;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};

pub const INFO: &str = "Esta API tem como objetivo oferecer uma aplicação que utiliza a técnica de Retrieval Augmented Generation (RAG) para responder a perguntas específicas sobre o código de ética e conduta para funcionários e servidores da Caixa Econômica Federal (CEF), com base no documento público disponível no Caixa Asset.";

pub const INDEX_CREATED: &str = "Banco de dados vetorial criado com sucesso.";

/// Shared state for the gateway
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RagEngine>,
    pub conversations: Arc<ConversationStore>,
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub question: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl IntoResponse for RagError {
    fn into_response(self) -> Response {
        error!("Request failed: {}", self);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

fn unprocessable(message: impl Into<String>) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({ "error": message.into() })),
    )
        .into_response()
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({ "info": INFO }))
}

async fn create_vector_db(State(state): State<AppState>) -> Result<Json<serde_json::Value>, RagError> {
    let report = state.engine.build_index().await?;
    info!("Vector index rebuilt with {} pages", report.pages);
    Ok(Json(json!({ "message": INDEX_CREATED })))
}

async fn ask_question(
    State(state): State<AppState>,
    payload: Result<Json<AskRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return unprocessable(rejection.body_text()),
    };
    if request.question.trim().is_empty() {
        return unprocessable("question must not be empty");
    }

    let session_id = request
        .session_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or(DEFAULT_SESSION);
    let conversation = state.conversations.session(session_id).await;

    match state.engine.ask(&conversation, &request.question).await {
        Ok(answer) => {
            state.conversations.commit(session_id, &conversation).await;
            Json(answer).into_response()
        }
        Err(e) => e.into_response(),
    }
}

fn cors_layer() -> CorsLayer {
    // Wildcards cannot be combined with credentials, so origins and headers are mirrored
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_methods([Method::GET, Method::POST])
        .allow_credentials(true)
}

/// Build the router with all routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/create_vector_db", get(create_vector_db))
        .route("/ask_question", post(ask_question))
        .layer(cors_layer())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::LocalIndex;
    use crate::test_support::{write_pdf, HashEmbedder, RecordingChat};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use serde_json::Value;
    use tower::ServiceExt;

    fn state(dir: &std::path::Path) -> AppState {
        let pdf = dir.join("codigo.pdf");
        write_pdf(
            &pdf,
            &[
                "Codigo de etica da Caixa integridade",
                "Conflito de interesses brindes",
                "Comite de etica contato",
            ],
        );
        let engine = RagEngine::new(
            pdf,
            Arc::new(LocalIndex::new(dir.join("db"))),
            Arc::new(HashEmbedder),
            Arc::new(RecordingChat::default()),
        );
        AppState {
            engine: Arc::new(engine),
            conversations: Arc::new(ConversationStore::new(10, 2)),
        }
    }

    fn router(dir: &std::path::Path) -> Router {
        build_router(state(dir))
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn ask(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/ask_question")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_root_describes_service() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = send(&router(dir.path()), get_request("/")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["info"], INFO);
    }

    #[tokio::test]
    async fn test_ask_before_build_is_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = send(
            &router(dir.path()),
            ask(json!({"question": "Qual o código de ética da Caixa?"})),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body["error"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_question_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(dir.path());

        let (status, body) = send(&app, ask(json!({"pergunta": "oi"}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].is_string());

        let (status, _) = send(&app, ask(json!({"question": 42}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = send(&app, ask(json!({"question": "  "}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_build_then_ask_accumulates_history() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(dir.path());

        let (status, body) = send(&app, get_request("/create_vector_db")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], INDEX_CREATED);

        let first = "Qual o código de ética da Caixa?";
        let (status, body) = send(&app, ask(json!({ "question": first }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["question"], first);
        assert!(!body["answer"].as_str().unwrap().is_empty());
        assert_eq!(body["history"][0]["human"], first);

        let second = "Posso aceitar brindes?";
        let (status, body) = send(&app, ask(json!({ "question": second }))).await;
        assert_eq!(status, StatusCode::OK);
        let history = body["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["human"], first);
        assert_eq!(history[1]["human"], second);
        assert!(history[1]["ia"].is_string());
    }

    #[tokio::test]
    async fn test_sessions_keep_separate_histories() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(dir.path());
        send(&app, get_request("/create_vector_db")).await;

        send(&app, ask(json!({"question": "pergunta a", "session_id": "a"}))).await;
        let (_, body) = send(&app, ask(json!({"question": "pergunta b", "session_id": "b"}))).await;

        let history = body["history"].as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["human"], "pergunta b");
    }

    #[tokio::test]
    async fn test_failed_questions_do_not_open_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let app = build_router(state.clone());

        for i in 0..20 {
            let (status, _) = send(
                &app,
                ask(json!({"question": "sem indice", "session_id": format!("s{}", i)})),
            )
            .await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        }

        assert_eq!(state.conversations.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_sessions_are_capped() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let app = build_router(state.clone());
        send(&app, get_request("/create_vector_db")).await;

        for id in ["a", "b", "c"] {
            let (status, _) = send(&app, ask(json!({"question": "pergunta", "session_id": id}))).await;
            assert_eq!(status, StatusCode::OK);
        }
        assert_eq!(state.conversations.session_count().await, 2);

        // "a" was evicted, so it starts over
        let (_, body) = send(&app, ask(json!({"question": "de novo", "session_id": "a"}))).await;
        assert_eq!(body["history"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_build_failure_is_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RagEngine::new(
            dir.path().join("absent.pdf"),
            Arc::new(LocalIndex::new(dir.path().join("db"))),
            Arc::new(HashEmbedder),
            Arc::new(RecordingChat::default()),
        );
        let app = build_router(AppState {
            engine: Arc::new(engine),
            conversations: Arc::new(ConversationStore::default()),
        });

        let (status, body) = send(&app, get_request("/create_vector_db")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("IO error"));
    }

    #[tokio::test]
    async fn test_cors_allows_credentialed_origin() {
        let dir = tempfile::tempdir().unwrap();
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/ask_question")
            .header(header::ORIGIN, "http://localhost:3000")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
            .body(Body::empty())
            .unwrap();

        let response = router(dir.path()).oneshot(request).await.unwrap();
        let headers = response.headers();

        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:3000"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }
}
