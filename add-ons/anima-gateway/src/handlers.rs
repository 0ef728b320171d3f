//! HTTP handlers for the gateway surface.

use crate::pipeline::{self, RequestContext};
use crate::AppState;
use anima_core::KvStore;
use anima_voice::SpeechError;
use axum::extract::{Multipart, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;

impl RequestContext {
    /// Resolve per-request identity from headers, falling back to
    /// configured defaults. The upstream API key doubles as the tenant.
    pub fn from_headers(headers: &HeaderMap, state: &AppState) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        Self {
            api_key: header("x-api-key").unwrap_or_else(|| state.settings.llm_api_key.clone()),
            user: header("x-user-id").unwrap_or_else(|| "anonymous".to_string()),
            voice: header("x-voice-id").unwrap_or_else(|| state.settings.default_voice.clone()),
            speed: header("x-speed")
                .and_then(|v| v.parse().ok())
                .unwrap_or(state.settings.default_speed)
                .clamp(0.5, 2.0),
        }
    }
}

fn speech_error_response(err: SpeechError) -> Response {
    let (status, message) = match &err {
        SpeechError::InvalidAudio(detail) => (StatusCode::BAD_REQUEST, detail.clone()),
        SpeechError::TooLarge { size, max } => (
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("audio too large: {size} bytes (limit {max})"),
        ),
        other => (StatusCode::BAD_GATEWAY, other.to_string()),
    };
    (status, Json(json!({ "error": message }))).into_response()
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// POST /api/v1/audio-to-text — multipart upload, `file` part required.
pub async fn audio_to_text(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Response {
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload.wav").to_string();
        let bytes = match field.bytes().await {
            Ok(b) => b.to_vec(),
            Err(err) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("unreadable upload: {err}") })),
                )
                    .into_response()
            }
        };
        return match state.stt.transcribe(&filename, bytes).await {
            Ok(t) => Json(json!({ "text": t.text, "recognized": t.recognized })).into_response(),
            Err(err) => speech_error_response(err),
        };
    }
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "missing file part" })),
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct ChatBody {
    #[serde(default)]
    pub query: String,
}

/// POST /api/v1/chat-stream — SSE answer with incremental audio.
pub async fn chat_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> impl IntoResponse {
    let ctx = RequestContext::from_headers(&headers, &state);
    tracing::info!(user = %ctx.user, "chat stream start");
    Sse::new(pipeline::answer_stream(state, ctx, body.query))
}

/// GET /api/v1/chat-stream — same stream for EventSource clients, which
/// can only send query parameters.
pub async fn chat_stream_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(body): Query<ChatBody>,
) -> impl IntoResponse {
    let ctx = RequestContext::from_headers(&headers, &state);
    tracing::info!(user = %ctx.user, "chat stream start");
    Sse::new(pipeline::answer_stream(state, ctx, body.query))
}

/// POST /api/v1/speech — audio upload straight through the full pipeline:
/// transcribe, then stream the spoken answer. Unrecognized audio yields a
/// single spoken fallback frame without an upstream call.
pub async fn speech(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let ctx = RequestContext::from_headers(&headers, &state);
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload.wav").to_string();
        let bytes = match field.bytes().await {
            Ok(b) => b.to_vec(),
            Err(err) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("unreadable upload: {err}") })),
                )
                    .into_response()
            }
        };
        return match state.stt.transcribe(&filename, bytes).await {
            Ok(t) if t.recognized => {
                tracing::info!(user = %ctx.user, "speech transcribed, streaming answer");
                let query = pipeline::correct_transcript(&state, &ctx, &t.text).await;
                Sse::new(pipeline::answer_stream(state, ctx, query).boxed()).into_response()
            }
            Ok(t) => {
                Sse::new(pipeline::single_phrase_stream(state, ctx, t.text).boxed())
                    .into_response()
            }
            Err(err) => speech_error_response(err),
        };
    }
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "missing file part" })),
    )
        .into_response()
}

/// POST /api/v1/chat-blocking — single JSON answer.
pub async fn chat_blocking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Response {
    let query = body.query.trim().to_string();
    if query.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "empty query" })),
        )
            .into_response();
    }
    let ctx = RequestContext::from_headers(&headers, &state);
    Json(pipeline::answer_blocking(&state, &ctx, &query).await).into_response()
}

#[derive(Deserialize)]
pub struct SpeakBody {
    pub text: String,
}

/// POST /api/v1/text-to-audio — synthesize one standalone phrase.
pub async fn text_to_audio(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SpeakBody>,
) -> Json<serde_json::Value> {
    let ctx = RequestContext::from_headers(&headers, &state);
    let url = state
        .synth
        .synthesize(&body.text, &ctx.voice, ctx.speed, &body.text)
        .await;
    Json(json!({ "url": url }))
}

/// GET /api/v1/cached-questions — questions this caller has already had
/// answered, oldest first.
pub async fn cached_questions(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let ctx = RequestContext::from_headers(&headers, &state);
    match state
        .sessions
        .asked_questions(&ctx.api_key, &ctx.user, &ctx.voice)
        .await
    {
        Ok(questions) => Json(json!({ "questions": questions })).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

/// POST /api/v1/clear-context — drop the caller's session keys.
pub async fn clear_context(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let ctx = RequestContext::from_headers(&headers, &state);
    match state.sessions.clear(&ctx.api_key, &ctx.user).await {
        Ok(()) => Json(json!({ "cleared": true })).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

/// GET /api/v1/parameters — upstream app parameters, passed through.
pub async fn parameters(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let ctx = RequestContext::from_headers(&headers, &state);
    match state.llm.parameters(&ctx.api_key).await {
        Ok(value) => Json(value).into_response(),
        Err(err) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize, Default)]
pub struct ReloadBody {
    #[serde(default)]
    pub questions: Option<Vec<String>>,
}

/// POST /api/v1/suggested/reload — swap the suggested-question set from
/// the request body, or re-read the configured file when none is given.
pub async fn reload_suggested(
    State(state): State<AppState>,
    body: Option<Json<ReloadBody>>,
) -> Response {
    let questions = match body.and_then(|Json(b)| b.questions) {
        Some(qs) => qs,
        None => match &state.settings.suggested_file {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(content) => content.lines().map(str::to_string).collect(),
                Err(err) => {
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({ "error": format!("cannot read {path}: {err}") })),
                    )
                        .into_response()
                }
            },
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "no questions given and no file configured" })),
                )
                    .into_response()
            }
        },
    };
    let count = state.suggested.reload(questions);
    // Shared replay entries were produced under the old set; drop them so
    // answers regenerate against the new one.
    if let Err(err) = state.kv.delete_prefix("sse:suggested:").await {
        tracing::warn!(%err, "could not invalidate shared replay entries");
    }
    tracing::info!(count, "suggested questions reloaded");
    Json(json!({ "count": count })).into_response()
}
