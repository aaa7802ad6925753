//! HTTP API for the browser front-end.
//!
//! Exposes sign-in, the document library, and the chat session of a
//! [`DocAssistant`] as JSON endpoints.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `POST`   | `/auth/signup` | Create an account and sign in |
//! | `POST`   | `/auth/signin` | Sign in |
//! | `POST`   | `/auth/signout` | Reset the transcript and sign out |
//! | `GET`    | `/files` | List the user's documents |
//! | `PUT`    | `/files/{name}` | Upload a document (raw body) |
//! | `DELETE` | `/files/{name}` | Delete a document |
//! | `POST`   | `/session/document` | Select the active document |
//! | `POST`   | `/session/model` | Switch inference backend |
//! | `POST`   | `/chat` | Submit one turn |
//! | `GET`    | `/chat/messages` | Current view model |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "auth/wrong-password", "message": "Invalid email/password" } }
//! ```
//!
//! Auth failures carry the message meant for the sign-in form. A failed chat
//! turn answers `502` with the backend's error code (`inference_http`,
//! `inference_no_choices`, ...).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the front-end can be
//! served from anywhere.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::assistant::DocAssistant;
use crate::config::Config;
use crate::error::{AuthError, StorageError};
use crate::inference::ModelSelector;
use crate::models::{FileEntry, Message, User};
use crate::session::{ChatSession, TurnOutcome};

/// Starts the HTTP server on `[server].bind`.
///
/// Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let assistant = Arc::new(DocAssistant::from_config(config)?);
    let _watcher = assistant.watch_identity();

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "DocAI server listening on http://{}", config.server.bind);
    axum::serve(listener, router(assistant)).await?;

    Ok(())
}

/// The API routes over `assistant`, with CORS applied.
pub fn router(assistant: Arc<DocAssistant>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/auth/signup", post(handle_sign_up))
        .route("/auth/signin", post(handle_sign_in))
        .route("/auth/signout", post(handle_sign_out))
        .route("/files", get(handle_list_files))
        .route("/files/{name}", put(handle_upload).delete(handle_delete))
        .route("/session/document", post(handle_select_document))
        .route("/session/model", post(handle_set_model))
        .route("/chat", post(handle_chat))
        .route("/chat/messages", get(handle_messages))
        .layer(cors)
        .with_state(assistant)
}

type AppState = State<Arc<DocAssistant>>;

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        let status = match err {
            AuthError::InvalidEmail | AuthError::WeakPassword { .. } => StatusCode::BAD_REQUEST,
            AuthError::WrongPassword | AuthError::UserNotFound | AuthError::NotSignedIn => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::EmailInUse => StatusCode::CONFLICT,
            AuthError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.code(), err.user_message())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(path) => {
                AppError::new(StatusCode::NOT_FOUND, "not_found", format!("not found: {}", path))
            }
            StorageError::Transient(e) => AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                format!("{:#}", e),
            ),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ /auth ============

#[derive(Deserialize)]
struct Credentials {
    email: String,
    password: String,
}

#[derive(Serialize)]
struct UserResponse {
    user: User,
}

async fn handle_sign_up(
    State(assistant): AppState,
    Json(creds): Json<Credentials>,
) -> Result<(StatusCode, Json<UserResponse>), AppError> {
    let user = assistant.sign_up(&creds.email, &creds.password).await?;
    Ok((StatusCode::CREATED, Json(UserResponse { user })))
}

async fn handle_sign_in(
    State(assistant): AppState,
    Json(creds): Json<Credentials>,
) -> Result<Json<UserResponse>, AppError> {
    let user = assistant.sign_in(&creds.email, &creds.password).await?;
    Ok(Json(UserResponse { user }))
}

async fn handle_sign_out(State(assistant): AppState) -> Result<StatusCode, AppError> {
    assistant.sign_out().await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ /files ============

#[derive(Serialize)]
struct FileListResponse {
    files: Vec<FileEntry>,
}

async fn handle_list_files(State(assistant): AppState) -> Result<Json<FileListResponse>, AppError> {
    let user = assistant.require_user()?;
    let files = assistant.library().list(&user.uid).await;
    Ok(Json(FileListResponse { files }))
}

async fn handle_upload(
    State(assistant): AppState,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<FileEntry>), AppError> {
    let user = assistant.require_user()?;
    assistant
        .library()
        .check_name(&name)
        .map_err(|e| bad_request(e.to_string()))?;
    let entry = assistant
        .library()
        .upload(&user.uid, &name, &body)
        .await
        .map_err(|e| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                format!("{:#}", e),
            )
        })?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn handle_delete(
    State(assistant): AppState,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    let user = assistant.require_user()?;
    assistant.library().delete(&user.uid, &name).await?;

    // Deleting the active document leaves the session without one.
    if let Some(session) = assistant.session() {
        let deleted = crate::library::document_path(&user.uid, &name);
        if session.document_path().as_deref() == Some(deleted.as_str()) {
            session.clear_document();
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

// ============ /session ============

#[derive(Deserialize)]
struct SelectDocumentRequest {
    name: String,
}

#[derive(Serialize)]
struct SessionResponse {
    model: ModelSelector,
    document: Option<String>,
}

impl SessionResponse {
    fn from_session(session: &ChatSession) -> Self {
        Self {
            model: session.model(),
            document: session.document_path(),
        }
    }
}

/// A document that fails to load is not an error: the session simply has no
/// active document afterwards.
async fn handle_select_document(
    State(assistant): AppState,
    Json(req): Json<SelectDocumentRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = assistant.require_session()?;
    session.select_document(&req.name).await;
    Ok(Json(SessionResponse::from_session(&session)))
}

#[derive(Deserialize)]
struct SetModelRequest {
    model: String,
}

async fn handle_set_model(
    State(assistant): AppState,
    Json(req): Json<SetModelRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = assistant.require_session()?;
    let model: ModelSelector = req.model.parse().map_err(|e: anyhow::Error| bad_request(e.to_string()))?;
    session.set_model(model);
    Ok(Json(SessionResponse::from_session(&session)))
}

// ============ /chat ============

#[derive(Deserialize)]
struct ChatRequest {
    input: String,
}

#[derive(Serialize)]
struct ChatResponse {
    reply: Message,
    messages: Vec<Message>,
}

async fn handle_chat(
    State(assistant): AppState,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let session = assistant.require_session()?;
    match session.submit(&req.input).await {
        TurnOutcome::Answered(reply) => Ok(Json(ChatResponse {
            reply,
            messages: session.messages(),
        })),
        TurnOutcome::Rejected => Err(bad_request("input must not be empty")),
        TurnOutcome::Failed(e) => Err(AppError::new(StatusCode::BAD_GATEWAY, e.code(), e.to_string())),
        TurnOutcome::Stale => Err(AppError::new(
            StatusCode::CONFLICT,
            "stale",
            "session ended before the response arrived",
        )),
    }
}

#[derive(Serialize)]
struct MessagesResponse {
    messages: Vec<Message>,
    model: ModelSelector,
    document: Option<String>,
}

async fn handle_messages(State(assistant): AppState) -> Result<Json<MessagesResponse>, AppError> {
    let session = assistant.require_session()?;
    Ok(Json(MessagesResponse {
        messages: session.messages(),
        model: session.model(),
        document: session.document_path(),
    }))
}
