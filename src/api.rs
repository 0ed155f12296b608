//! HTTP surface of the incident-reporting backend.
//!
//! This module owns request parsing, authentication, and response formatting
//! while delegating transcription, generation, and synthesis to the provider
//! traits and persistence to the store. Handlers are straight-line: validate,
//! call providers, persist, respond.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::analysis::{
    analysis_prompt, chat_prompt, follow_up_prompt, parse_analysis, ChatHistoryTurn,
    FollowUpExchange,
};
use crate::auth::{TokenVerifier, UserDirectory};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::providers::{SpeechSynthesizer, TextGenerator, Transcriber};
use crate::store::{IncidentKind, Sender, Store};

/// Human-readable service name returned by the health endpoint.
pub const APP_NAME: &str = "shesafe-server";
/// Service version string returned by the health endpoint.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state injected into all route handlers.
pub struct AppState {
    /// Runtime configuration loaded at startup.
    pub cfg: AppConfig,
    /// Incident and conversation persistence.
    pub store: Store,
    /// Bearer-token verifier.
    pub verifier: Arc<dyn TokenVerifier>,
    /// Speech-to-text provider.
    pub transcriber: Arc<dyn Transcriber>,
    /// Generative-text provider.
    pub generator: Arc<dyn TextGenerator>,
    /// Text-to-speech provider.
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    /// Identity-provider user directory.
    pub directory: Arc<dyn UserDirectory>,
}

/// Builds the Axum router for all public endpoints.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/incident/text", post(create_text_incident))
        .route("/incident/audio", post(create_audio_incident))
        .route("/incident/text-to-speech", post(text_to_speech))
        .route("/incidents", get(list_incidents))
        .route("/incident/analyze", post(analyze_incident))
        .route("/incident/analyze-text", post(analyze_text))
        .route("/incident/follow-up", post(follow_up))
        .route("/chat", post(chat))
        .route("/incident/:id/chat", get(incident_chat))
        .route("/voices", get(list_voices))
        .route("/users", get(list_users))
        .layer(cors)
        .with_state(state)
}

/// Service status endpoint (`GET /health`).
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "name": APP_NAME,
        "version": APP_VERSION,
    }))
}

#[derive(Debug, Deserialize)]
struct TextIncidentRequest {
    text: String,
}

/// Files a text incident report (`POST /incident/text`).
async fn create_text_incident(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TextIncidentRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let user_id = authenticate(&state, &headers).await?;

    if body.text.trim().is_empty() {
        return Err(AppError::invalid_request("text must not be empty"));
    }

    let incident = state
        .store
        .create_incident(&user_id, &body.text, IncidentKind::Text)
        .await?;
    info!(user = %user_id, id = incident.id, "text incident reported");

    Ok(Json(json!({
        "status": "success",
        "message": "Incident reported",
    })))
}

/// Files an audio incident report (`POST /incident/audio`).
///
/// The upload is written under the configured upload directory, transcribed,
/// and persisted; the temporary file is removed whether or not transcription
/// succeeds.
async fn create_audio_incident(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, AppError> {
    let user_id = authenticate(&state, &headers).await?;

    let (file_name, bytes) = read_upload(&mut multipart).await?;
    let path = PathBuf::from(&state.cfg.upload_dir).join(&file_name);

    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|err| AppError::internal(format!("failed to store upload: {err}")))?;
    let _cleanup = UploadGuard { path: path.clone() };

    let text = state.transcriber.transcribe(&path).await?;

    let incident = state
        .store
        .create_incident(&user_id, &text, IncidentKind::Audio)
        .await?;
    info!(user = %user_id, id = incident.id, "audio incident reported");

    Ok(Json(json!({
        "status": "success",
        "transcribed_text": text,
    })))
}

#[derive(Debug, Deserialize)]
struct TtsRequest {
    text: String,
}

/// Synthesizes speech for a text and stores it as a file (`POST
/// /incident/text-to-speech`). The output file is named after the requesting
/// user and intentionally left in place.
async fn text_to_speech(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(body): Form<TtsRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let user_id = authenticate(&state, &headers).await?;

    if body.text.trim().is_empty() {
        return Err(AppError::invalid_request("text must not be empty"));
    }

    let audio = state.synthesizer.synthesize(&body.text).await?;

    let file_name = format!("{user_id}_incident.mp3");
    let path = PathBuf::from(&state.cfg.upload_dir).join(&file_name);
    tokio::fs::write(&path, &audio)
        .await
        .map_err(|err| AppError::internal(format!("failed to write audio file: {err}")))?;

    Ok(Json(json!({
        "status": "success",
        "file": file_name,
    })))
}

/// Lists the caller's incidents (`GET /incidents`). Always scoped to the
/// authenticated subject.
async fn list_incidents(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let user_id = authenticate(&state, &headers).await?;
    let incidents = state.store.list_incidents(&user_id).await?;
    Ok(Json(json!(incidents)))
}

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    incident_id: i64,
}

/// Analyzes a stored incident (`POST /incident/analyze`).
async fn analyze_incident(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(body): Form<AnalyzeRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    authenticate(&state, &headers).await?;

    let incident = state
        .store
        .get_incident(body.incident_id)
        .await?
        .ok_or_else(|| AppError::not_found("Incident not found"))?;

    let raw = state.generator.generate(&analysis_prompt(&incident.text)).await?;
    let analysis = parse_analysis(&raw);

    Ok(Json(json!({
        "status": "success",
        "incident_id": incident.id,
        "analysis": analysis,
    })))
}

#[derive(Debug, Deserialize)]
struct AnalyzeTextRequest {
    text: String,
}

/// Analyzes incident text directly, without persistence (`POST
/// /incident/analyze-text`).
async fn analyze_text(
    State(state): State<Arc<AppState>>,
    Form(body): Form<AnalyzeTextRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if body.text.trim().is_empty() {
        return Err(AppError::invalid_request("text must not be empty"));
    }

    let raw = state.generator.generate(&analysis_prompt(&body.text)).await?;
    let analysis = parse_analysis(&raw);

    Ok(Json(json!({
        "status": "success",
        "userSolution": analysis.user_solution,
        "summary": analysis.summary,
        "severity": analysis.severity,
        "recommendation": analysis.recommendation,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FollowUpRequest {
    incident_id: i64,
    follow_up: String,
    #[serde(default)]
    conversation: Vec<FollowUpExchange>,
}

/// Answers a follow-up question about a stored incident (`POST
/// /incident/follow-up`). The supplied conversation is context only; nothing
/// is persisted here.
async fn follow_up(
    State(state): State<Arc<AppState>>,
    Json(body): Json<FollowUpRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let incident = state
        .store
        .get_incident(body.incident_id)
        .await?
        .ok_or_else(|| AppError::not_found("Incident not found"))?;

    let prompt = follow_up_prompt(&incident.text, &body.conversation, &body.follow_up);
    let answer = state.generator.generate(&prompt).await?;

    Ok(Json(json!({
        "status": "success",
        "answer": answer,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    #[serde(default)]
    message: String,
    #[serde(default)]
    history: Vec<ChatHistoryTurn>,
    incident_id: Option<i64>,
}

/// Free-form safety chat (`POST /chat`). When an incident id is supplied,
/// both sides of the turn are appended to that incident's conversation.
async fn chat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if body.message.trim().is_empty() {
        return Err(AppError::invalid_request("Message is required"));
    }

    let prompt = chat_prompt(&body.history, &body.message);
    let reply = state.generator.generate(&prompt).await?;

    if let Some(incident_id) = body.incident_id {
        state
            .store
            .append_turn(incident_id, Sender::User, &body.message)
            .await?;
        state
            .store
            .append_turn(incident_id, Sender::Ai, &reply)
            .await?;
    }

    Ok(Json(json!({
        "status": "success",
        "reply": reply,
    })))
}

/// Returns an incident's stored conversation turns in insertion order
/// (`GET /incident/{id}/chat`).
async fn incident_chat(
    State(state): State<Arc<AppState>>,
    Path(incident_id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let turns = state.store.list_conversation(incident_id).await?;
    Ok(Json(json!(turns)))
}

/// Lists available synthesis voices (`GET /voices`).
async fn list_voices(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let voices = state.synthesizer.list_voices().await?;
    Ok(Json(json!(voices)))
}

/// Lists identity-provider users (`GET /users`).
async fn list_users(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let users = state.directory.list_users().await?;
    Ok(Json(json!(users)))
}

/// Extracts and verifies the bearer token, returning the subject identifier.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, AppError> {
    let token = parse_bearer(headers)?;
    state.verifier.verify(token).await
}

/// Parses the `Authorization: Bearer <token>` header.
fn parse_bearer(headers: &HeaderMap) -> Result<&str, AppError> {
    let Some(raw) = headers.get(header::AUTHORIZATION) else {
        return Err(AppError::unauthorized("missing bearer token"));
    };

    let value = raw
        .to_str()
        .map_err(|_| AppError::unauthorized("invalid authorization header"))?;

    let mut parts = value.split_whitespace();
    let scheme = parts
        .next()
        .ok_or_else(|| AppError::unauthorized("missing bearer token"))?;
    let token = parts
        .next()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::unauthorized("missing bearer token"))?;
    if parts.next().is_some() || !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized("missing bearer token"));
    }

    Ok(token)
}

/// Reads the `file` field of an audio upload, returning a sanitized file name
/// and the raw bytes.
async fn read_upload(multipart: &mut Multipart) -> Result<(String, Vec<u8>), AppError> {
    let mut file: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::invalid_request(format!("invalid multipart body: {err}")))?
    {
        let Some(name) = field.name().map(ToOwned::to_owned) else {
            continue;
        };
        if name != "file" {
            continue;
        }

        let file_name = field
            .file_name()
            .map(ToOwned::to_owned)
            .ok_or_else(|| AppError::invalid_request("file field is missing filename"))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|err| AppError::invalid_request(format!("failed to read file bytes: {err}")))?;
        file = Some((sanitize_file_name(&file_name), bytes.to_vec()));
    }

    let (file_name, bytes) =
        file.ok_or_else(|| AppError::invalid_request("missing required multipart field: file"))?;
    if bytes.is_empty() {
        return Err(AppError::invalid_request("uploaded file is empty"));
    }

    Ok((file_name, bytes))
}

/// Strips any directory components from a client-supplied filename.
fn sanitize_file_name(raw: &str) -> String {
    FsPath::new(raw)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string())
}

/// Removes a temporary upload on drop, covering both the success path and
/// every early return.
struct UploadGuard {
    path: PathBuf,
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "failed to remove upload");
        }
    }
}
