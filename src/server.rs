use std::net::SocketAddr;

use anyhow::Result;
use askama::Template;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json};
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::models::{
    ChapterSummaryRecord, ChatAnswer, ChatRequest, ConversationTurn, CorpusManifest, PageRecord,
    SessionRequest, SessionResponse,
};
use crate::pipeline::Pipeline;
use crate::session::{SessionRegistry, TurnError};

#[derive(Clone)]
struct AppState {
    book_title: String,
    pipeline: Pipeline,
    sessions: SessionRegistry,
}

pub async fn run_server(
    config: AppConfig,
    pipeline: Pipeline,
    sessions: SessionRegistry,
) -> Result<()> {
    let state = AppState {
        book_title: config.book_title.clone(),
        pipeline,
        sessions,
    };

    let app = router(state).nest_service("/static", ServeDir::new(config.static_dir()));

    let addr: SocketAddr = config.bind_addr.parse()?;
    tracing::info!("listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_page))
        .route("/api/session", post(create_session))
        .route("/api/session/:session_id", delete(end_session))
        .route("/api/session/:session_id/history", get(session_history))
        .route("/api/chat", post(chat_handler))
        .route("/api/pages/:page_number", get(get_page))
        .route("/api/chapters/:chapter_number", get(get_chapter))
        .route("/api/corpus", get(corpus_manifest))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index_page(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    // Registered on the first question, so page views alone hold no session.
    let template = IndexTemplate {
        session_id: Uuid::new_v4().to_string(),
        book_title: state.book_title.clone(),
    };
    let body = template.render().map_err(ApiError::from)?;

    Ok(Html(body))
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<SessionRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    if request.reset.unwrap_or(false) {
        if let Some(session_id) = request.session_id {
            state.sessions.end(&session_id).await?;
            let session = state.sessions.get_or_open(&session_id).await?;
            return Ok(Json(SessionResponse {
                session_id: session.id().to_string(),
            }));
        }
    }

    let session = state.sessions.create().await?;
    Ok(Json(SessionResponse {
        session_id: session.id().to_string(),
    }))
}

async fn end_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.sessions.end(&session_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!(
            "session not found: {}",
            session_id
        )))
    }
}

async fn session_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<ConversationTurn>>, ApiError> {
    match state.sessions.find(&session_id).await? {
        Some(session) => Ok(Json(session.history().await)),
        None => Err(ApiError::not_found(format!(
            "session not found: {}",
            session_id
        ))),
    }
}

async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatAnswer>, ApiError> {
    let question = request.question.trim();
    if question.is_empty() {
        return Err(ApiError::bad_request("question must not be empty".to_string()));
    }

    let run = state
        .sessions
        .ask(&request.session_id, &state.pipeline, question)
        .await?;

    Ok(Json(ChatAnswer {
        sources: run.context.sources(),
        answer_markdown: run.answer,
        selection: run.selection,
        latency_ms: run.latency_ms,
    }))
}

async fn get_page(
    State(state): State<AppState>,
    Path(page_number): Path<u32>,
) -> Result<Json<PageRecord>, ApiError> {
    match state.pipeline.corpus().page(page_number) {
        Some(page) => Ok(Json(page.clone())),
        None => Err(ApiError::not_found(format!(
            "page not found: {}",
            page_number
        ))),
    }
}

async fn get_chapter(
    State(state): State<AppState>,
    Path(chapter_number): Path<u32>,
) -> Result<Json<ChapterSummaryRecord>, ApiError> {
    match state.pipeline.corpus().chapter(chapter_number) {
        Some(chapter) => Ok(Json(chapter.clone())),
        None => Err(ApiError::not_found(format!(
            "chapter not found: {}",
            chapter_number
        ))),
    }
}

async fn corpus_manifest(State(state): State<AppState>) -> Json<CorpusManifest> {
    Json(state.pipeline.corpus().manifest().clone())
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    session_id: String,
    book_title: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found",
            message,
        }
    }

    fn conflict(message: String) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            kind: "session_closed",
            message,
        }
    }

    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "bad_request",
            message,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: value.to_string(),
        }
    }
}

impl From<askama::Error> for ApiError {
    fn from(value: askama::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: value.to_string(),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(value: PipelineError) -> Self {
        let status = match value {
            PipelineError::MalformedSelection(_) => StatusCode::BAD_GATEWAY,
            PipelineError::SynthesisUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            kind: value.kind(),
            message: value.user_message().to_string(),
        }
    }
}

impl From<TurnError> for ApiError {
    fn from(value: TurnError) -> Self {
        match value {
            TurnError::Pipeline(err) => err.into(),
            TurnError::Closed(session_id) => {
                ApiError::conflict(format!("session was closed: {}", session_id))
            }
            TurnError::Transcript(err) => err.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message, "kind": self.kind });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::completion::testing::ScriptedBackend;
    use crate::config::SessionConfig;
    use crate::error::{CompletionError, MalformedSelectionError, SynthesisUnavailableError};
    use crate::models::Role;
    use crate::pipeline::tests::pipeline_with;

    fn test_app(replies: &[&str]) -> (Router, SessionRegistry) {
        let sessions = SessionRegistry::new(None, SessionConfig::default());
        let state = AppState {
            book_title: "Ace of Spades".to_string(),
            pipeline: pipeline_with(Arc::new(ScriptedBackend::replying(replies)), 1),
            sessions: sessions.clone(),
        };
        (router(state), sessions)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[test]
    fn pipeline_errors_map_to_gateway_statuses() {
        let malformed: ApiError =
            PipelineError::from(MalformedSelectionError::MissingPages).into();
        assert_eq!(malformed.status, StatusCode::BAD_GATEWAY);
        assert_eq!(malformed.kind, "malformed_selection");

        let unavailable: ApiError =
            PipelineError::from(SynthesisUnavailableError(CompletionError::RateLimited)).into();
        assert_eq!(unavailable.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(unavailable.kind, "synthesis_unavailable");
    }

    #[test]
    fn index_template_renders_session_and_title() {
        let body = IndexTemplate {
            session_id: "abc-123".to_string(),
            book_title: "Ace of Spades".to_string(),
        }
        .render()
        .unwrap();
        assert!(body.contains("abc-123"));
        assert!(body.contains("Ace of Spades"));
    }

    #[tokio::test]
    async fn index_page_does_not_hold_a_session() {
        let (app, sessions) = test_app(&[]);
        let response = app.clone().oneshot(empty_request("GET", "/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(sessions.live_sessions().await, 0);
    }

    #[tokio::test]
    async fn empty_question_is_rejected() {
        let (app, sessions) = test_app(&[]);
        let (status, body) = send(
            &app,
            json_request("POST", "/api/chat", json!({"session_id": "s", "question": "   "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "bad_request");
        assert_eq!(sessions.live_sessions().await, 0);
    }

    #[tokio::test]
    async fn chat_answers_and_history_keeps_turn_order() {
        let (app, _) = test_app(&[
            r#"{"chapters":[39],"pages":[179]}"#,
            "Chiamaka pulls Devon into lab 201 (p. 179).",
            r#"{"pages":[12]}"#,
            "Devon walks in (p. 12).",
        ]);

        let (status, body) = send(
            &app,
            json_request("POST", "/api/chat", json!({"session_id": "s1", "question": "Who is Chiamaka?"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["answer_markdown"].as_str().unwrap().contains("lab 201"));
        assert_eq!(body["selection"]["pages"], json!([179]));

        let (status, _) = send(
            &app,
            json_request("POST", "/api/chat", json!({"session_id": "s1", "question": "Who is Devon?"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, empty_request("GET", "/api/session/s1/history")).await;
        assert_eq!(status, StatusCode::OK);
        let turns: Vec<ConversationTurn> = serde_json::from_value(body).unwrap();
        let texts: Vec<&str> = turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "Who is Chiamaka?",
                "Chiamaka pulls Devon into lab 201 (p. 179).",
                "Who is Devon?",
                "Devon walks in (p. 12).",
            ]
        );
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[3].role, Role::Assistant);
    }

    #[tokio::test]
    async fn malformed_selection_returns_bad_gateway() {
        let (app, _) = test_app(&[r#"{"chapters":[39]}"#]);
        let (status, body) = send(
            &app,
            json_request("POST", "/api/chat", json!({"session_id": "s2", "question": "Who?"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["kind"], "malformed_selection");
    }

    #[tokio::test]
    async fn reset_keeps_the_id_and_clears_history() {
        let (app, _) = test_app(&[r#"{"pages":[12]}"#, "Devon answer"]);
        send(
            &app,
            json_request("POST", "/api/chat", json!({"session_id": "s3", "question": "Who is Devon?"})),
        )
        .await;

        let (status, body) = send(
            &app,
            json_request("POST", "/api/session", json!({"session_id": "s3", "reset": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session_id"], "s3");

        let (status, body) = send(&app, empty_request("GET", "/api/session/s3/history")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn delete_ends_a_session_once() {
        let (app, _) = test_app(&[]);
        let (status, body) = send(&app, json_request("POST", "/api/session", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        let id = body["session_id"].as_str().unwrap().to_string();

        let uri = format!("/api/session/{id}");
        let (status, _) = send(&app, empty_request("DELETE", &uri)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = send(&app, empty_request("DELETE", &uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");

        let (status, _) = send(&app, empty_request("GET", &format!("{uri}/history"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn source_lookup_returns_records_or_not_found() {
        let (app, _) = test_app(&[]);

        let (status, body) = send(&app, empty_request("GET", "/api/pages/179")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["page_number"], 179);
        let (status, _) = send(&app, empty_request("GET", "/api/pages/9999")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, empty_request("GET", "/api/chapters/39")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["chapter_number"], 39);
        let (status, _) = send(&app, empty_request("GET", "/api/chapters/2")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
