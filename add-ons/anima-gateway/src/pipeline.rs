//! Pipeline orchestrator: one request from question to sealed SSE stream.
//!
//! Per request: `RECEIVE → CACHE_LOOKUP → {REPLAY | GENERATE} → SEAL → DONE`.
//! Generation runs as one producer task feeding a channel; the consumer
//! relays every frame to both sinks — the client transport and the replay
//! cache writer — in production order. Synthesis tasks are spawned the
//! moment a chunk is produced but their results are awaited in order, so
//! adapter calls overlap without reordering frames.
//!
//! Client disconnects drop the response stream; a drop guard then clears
//! the user's session keys and the producer stops at its next send.

use crate::AppState;
use anima_core::config::{pick_phrase, FALLBACK_PHRASES, GREETING_PHRASES};
use anima_core::segment::SegmentOutput;
use anima_core::{cache_key, ChatRequest, Frame, KvStore, LinkKind, LlmEvent, Segmenter};
use axum::response::sse::Event;
use futures_util::{pin_mut, Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Per-request identity and voice parameters, resolved from headers with
/// configured defaults.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Upstream bearer key; doubles as the tenant namespace.
    pub api_key: String,
    pub user: String,
    pub voice: String,
    pub speed: f32,
}

enum Produced {
    /// A frame ready for delivery (links, suggested questions).
    Frame(Frame),
    /// A prose chunk whose synthesis is already in flight.
    Speak {
        display: String,
        audio: JoinHandle<Option<String>>,
    },
    /// Upstream stream finished normally.
    End {
        conversation_id: String,
        message_id: String,
    },
    /// Upstream failed. Becomes an error frame carrying the spoken
    /// fallback; the cache entry must not be sealed.
    Fallback {
        detail: String,
        answer: String,
        audio: JoinHandle<Option<String>>,
    },
}

/// Streaming answer for one question. Yields SSE events until done.
pub fn answer_stream(
    state: AppState,
    ctx: RequestContext,
    query: String,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    async_stream::stream! {
        let query = query.trim().to_string();
        if query.is_empty() {
            yield Ok(frame_event(&Frame::error("empty query")));
            return;
        }

        let key = cache_key(&ctx.api_key, &ctx.user, &ctx.voice, &query, &state.suggested);
        let is_suggested = state.suggested.contains(&query);
        if is_suggested {
            if let Err(err) = state.sessions.save_suggested_marker(&ctx.api_key, &ctx.user).await {
                tracing::warn!(%err, "could not save suggested marker");
            }
        }

        // REPLAY: a sealed entry is emitted verbatim, frame for frame.
        match state.replay.load(&key).await {
            Ok(Some(frames)) => {
                tracing::debug!(key, frames = frames.len(), "replaying cached answer");
                for frame in frames {
                    yield Ok(frame_event(&frame));
                }
                return;
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(%err, "replay lookup failed, generating live"),
        }

        // Lease: one producer per key; losers wait for the winner's seal.
        let holds_lease = state.replay.try_lease(&key).await.unwrap_or(true);
        if !holds_lease {
            let wait = Duration::from_secs(state.settings.lease_ttl_secs);
            match state.replay.wait_for_sealed(&key, wait).await {
                Ok(Some(frames)) => {
                    for frame in frames {
                        yield Ok(frame_event(&frame));
                    }
                    return;
                }
                // Winner never sealed: generate live without the lease.
                Ok(None) => {}
                Err(err) => tracing::warn!(%err, "lease wait failed"),
            }
        }

        let mut guard = DisconnectGuard::new(state.clone(), ctx.clone(), key.clone(), holds_lease);

        let conversation_id = resolve_conversation(&state, &ctx).await;
        // Only the lease holder writes the cache: a lapsed loser generating
        // live must not clobber or interleave with the slow winner's entry.
        let mut writer = if holds_lease {
            Some(state.replay.writer(&key).await)
        } else {
            None
        };

        if state.settings.greeting_enabled {
            let phrase = pick_phrase(GREETING_PHRASES);
            let url = state.synth.synthesize(&phrase, &ctx.voice, ctx.speed, &query).await;
            let frame = Frame::message(&phrase, url.as_deref());
            if let Some(w) = writer.as_mut() {
                w.push(&frame).await;
            }
            yield Ok(frame_event(&frame));
        }

        let (tx, mut rx) = mpsc::channel(32);
        let _producer = tokio::spawn(produce(state.clone(), ctx.clone(), query.clone(), conversation_id, tx));

        let mut completed = false;
        while let Some(item) = rx.recv().await {
            match item {
                Produced::Frame(frame) => {
                    if let Some(w) = writer.as_mut() {
                        w.push(&frame).await;
                    }
                    yield Ok(frame_event(&frame));
                }
                Produced::Speak { display, audio } => {
                    let url = audio.await.ok().flatten();
                    let frame = Frame::message(&display, url.as_deref());
                    if let Some(w) = writer.as_mut() {
                        w.push(&frame).await;
                    }
                    yield Ok(frame_event(&frame));
                }
                Produced::End { conversation_id, message_id } => {
                    if !conversation_id.is_empty() {
                        if let Err(err) = state
                            .sessions
                            .save_conversation_id(&ctx.api_key, &ctx.user, &conversation_id)
                            .await
                        {
                            tracing::warn!(%err, "could not save conversation id");
                        }
                    }
                    if !message_id.is_empty() {
                        match state.llm.next_suggested(&ctx.api_key, &message_id, &ctx.user).await {
                            Ok(questions) if !questions.is_empty() => {
                                let frame = Frame::suggested_questions(&questions);
                                if let Some(w) = writer.as_mut() {
                                    w.push(&frame).await;
                                }
                                yield Ok(frame_event(&frame));
                            }
                            Ok(_) => {}
                            Err(err) => tracing::debug!(%err, "suggested fetch failed"),
                        }
                    }
                    if let Err(err) = state
                        .sessions
                        .record_question(&ctx.api_key, &ctx.user, &ctx.voice, &query)
                        .await
                    {
                        tracing::warn!(%err, "could not record asked question");
                    }
                    completed = true;
                }
                Produced::Fallback { detail, answer, audio } => {
                    let url = audio.await.ok().flatten();
                    yield Ok(frame_event(&Frame::upstream_error(&detail, &answer, url.as_deref())));
                    completed = false;
                    break;
                }
            }
        }
        if completed {
            // Only a fully produced answer becomes replayable.
            if let Some(w) = writer.take() {
                w.seal().await;
            }
        }
        if holds_lease {
            if let Err(err) = state.replay.release_lease(&key).await {
                tracing::warn!(%err, "could not release lease");
            }
        }
        guard.disarm();
    }
}

/// A one-frame stream that speaks a fixed phrase. Used when transcription
/// could not understand the audio: the avatar still answers, the session
/// and replay cache stay untouched.
pub fn single_phrase_stream(
    state: AppState,
    ctx: RequestContext,
    phrase: String,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    async_stream::stream! {
        let url = state.synth.synthesize(&phrase, &ctx.voice, ctx.speed, &phrase).await;
        yield Ok(frame_event(&Frame::message(&phrase, url.as_deref())));
    }
}

/// Producer half: consume the upstream stream, run segmentation, spawn
/// synthesis per chunk, and feed the channel in production order. A closed
/// channel means the consumer is gone; stop immediately.
async fn produce(
    state: AppState,
    ctx: RequestContext,
    query: String,
    conversation_id: Option<String>,
    tx: mpsc::Sender<Produced>,
) {
    let mut segmenter = Segmenter::new(
        state.settings.min_chunk_chars,
        state.settings.terminators.clone(),
    );
    let stream = state.llm.chat_stream(ChatRequest {
        query: query.clone(),
        user: ctx.user.clone(),
        conversation_id,
        api_key: ctx.api_key.clone(),
    });
    pin_mut!(stream);

    let mut end_ids: Option<(String, String)> = None;
    while let Some(event) = stream.next().await {
        match event {
            Ok(LlmEvent::Delta(delta)) => {
                for output in segmenter.push_delta(&delta) {
                    if !relay_output(&state, &ctx, &query, output, &tx).await {
                        return;
                    }
                }
            }
            Ok(LlmEvent::End {
                conversation_id,
                message_id,
            }) => {
                end_ids = Some((conversation_id, message_id));
            }
            Err(err) => {
                tracing::warn!(%err, "upstream stream failed, speaking fallback");
                let answer = pick_phrase(FALLBACK_PHRASES);
                let synth = state.synth.clone();
                let (voice, speed, q, text) =
                    (ctx.voice.clone(), ctx.speed, query.clone(), answer.clone());
                let audio = tokio::spawn(async move {
                    synth.synthesize(&text, &voice, speed, &q).await
                });
                let _ = tx
                    .send(Produced::Fallback {
                        detail: err.to_string(),
                        answer,
                        audio,
                    })
                    .await;
                return;
            }
        }
    }

    for output in segmenter.finish() {
        if !relay_output(&state, &ctx, &query, output, &tx).await {
            return;
        }
    }

    let (conversation_id, message_id) = end_ids.unwrap_or_default();
    let _ = tx
        .send(Produced::End {
            conversation_id,
            message_id,
        })
        .await;
}

/// Turn one segmenter output into a channel item. Returns false when the
/// consumer has gone away.
async fn relay_output(
    state: &AppState,
    ctx: &RequestContext,
    query: &str,
    output: SegmentOutput,
    tx: &mpsc::Sender<Produced>,
) -> bool {
    match output {
        SegmentOutput::Speak { display, speakable } => {
            let state = state.clone();
            let ctx = ctx.clone();
            let q = query.to_string();
            let audio = tokio::spawn(async move {
                let spoken = translate_for_speech(&state, &ctx, &speakable).await;
                state.synth.synthesize(&spoken, &ctx.voice, ctx.speed, &q).await
            });
            tx.send(Produced::Speak { display, audio }).await.is_ok()
        }
        SegmentOutput::Link(link) => {
            if link.kind == LinkKind::Image && !state.prober.exists(&link.url).await {
                tracing::debug!(url = %link.url, "dropping unreachable image link");
                return true;
            }
            tx.send(Produced::Frame(Frame::link(&link))).await.is_ok()
        }
    }
}

/// Transcripts carry recognition noise; when enabled, one short model
/// rewrite cleans them up before they become queries. Timeout or failure
/// falls back to the raw transcript.
pub async fn correct_transcript(state: &AppState, ctx: &RequestContext, text: &str) -> String {
    if !state.settings.correct_transcript {
        return text.to_string();
    }
    let window = Duration::from_secs(state.settings.rewrite_timeout_secs);
    let instruction = "Fix any speech recognition errors in the following \
                       sentence and reply with the corrected sentence only:";
    match tokio::time::timeout(window, state.llm.rewrite(&ctx.api_key, instruction, text)).await {
        Ok(Ok(fixed)) if !fixed.trim().is_empty() => fixed.trim().to_string(),
        Ok(Err(err)) => {
            tracing::debug!(%err, "transcript correction failed, using raw text");
            text.to_string()
        }
        Ok(Ok(_)) => text.to_string(),
        Err(_) => {
            tracing::debug!("transcript correction timed out, using raw text");
            text.to_string()
        }
    }
}

/// When a target language is configured, spoken text is translated before
/// synthesis; displayed text stays in the answer's language. Bounded like
/// correction, falling back to the untranslated chunk.
async fn translate_for_speech(state: &AppState, ctx: &RequestContext, text: &str) -> String {
    let Some(lang) = &state.settings.translate_to else {
        return text.to_string();
    };
    let window = Duration::from_secs(state.settings.rewrite_timeout_secs);
    let instruction = format!(
        "Translate the following sentence into {lang} and reply with the translation only:"
    );
    match tokio::time::timeout(window, state.llm.rewrite(&ctx.api_key, &instruction, text)).await {
        Ok(Ok(translated)) if !translated.trim().is_empty() => translated.trim().to_string(),
        _ => text.to_string(),
    }
}

async fn resolve_conversation(state: &AppState, ctx: &RequestContext) -> Option<String> {
    let round = match state.sessions.bump_round(&ctx.api_key, &ctx.user).await {
        Ok(r) => r,
        Err(err) => {
            tracing::warn!(%err, "round bump failed");
            return None;
        }
    };
    if round.reset {
        tracing::info!(user = %ctx.user, "round cap reached, starting a fresh conversation");
        return None;
    }
    // A canned suggested answer never went through the upstream
    // conversation, so the stored id no longer reflects what the user
    // heard. Start over.
    if state
        .sessions
        .suggested_marker(&ctx.api_key, &ctx.user)
        .await
        .unwrap_or(false)
    {
        if let Err(err) = state
            .sessions
            .clear_suggested_marker(&ctx.api_key, &ctx.user)
            .await
        {
            tracing::warn!(%err, "could not clear suggested marker");
        }
        return None;
    }
    state
        .sessions
        .conversation_id(&ctx.api_key, &ctx.user)
        .await
        .unwrap_or_default()
}

/// Blocking mode: one upstream call, one synthesis over the whole answer,
/// one JSON response, cached whole.
pub async fn answer_blocking(
    state: &AppState,
    ctx: &RequestContext,
    query: &str,
) -> serde_json::Value {
    let key = blocking_key(&ctx.api_key, &ctx.user, &ctx.voice, query);
    if let Ok(Some(cached)) = state.kv.get(&key).await {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&cached) {
            return value;
        }
    }

    let conversation_id = resolve_conversation(state, ctx).await;
    let answer = match state
        .llm
        .chat_blocking(&ChatRequest {
            query: query.to_string(),
            user: ctx.user.clone(),
            conversation_id,
            api_key: ctx.api_key.clone(),
        })
        .await
    {
        Ok(reply) => {
            if !reply.conversation_id.is_empty() {
                if let Err(err) = state
                    .sessions
                    .save_conversation_id(&ctx.api_key, &ctx.user, &reply.conversation_id)
                    .await
                {
                    tracing::warn!(%err, "could not save conversation id");
                }
            }
            reply.answer
        }
        Err(err) => {
            tracing::warn!(%err, "blocking chat failed, returning fallback");
            let phrase = pick_phrase(FALLBACK_PHRASES);
            let url = state.synth.synthesize(&phrase, &ctx.voice, ctx.speed, query).await;
            return serde_json::json!({
                "question": query,
                "answer": phrase,
                "url": url,
                "fallback": true,
            });
        }
    };

    let spoken = translate_for_speech(state, ctx, &answer).await;
    let url = state.synth.synthesize(&spoken, &ctx.voice, ctx.speed, query).await;
    let value = serde_json::json!({ "question": query, "answer": answer, "url": url });
    let ttl = Duration::from_secs(state.settings.cache_ttl_secs);
    if let Err(err) = state.kv.set_ex(&key, &value.to_string(), ttl).await {
        tracing::warn!(%err, "could not cache blocking answer");
    }
    value
}

fn blocking_key(tenant: &str, user: &str, voice: &str, query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.trim().as_bytes());
    let hash: String = hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    format!("llm:{tenant}:{user}:{voice}:{hash}")
}

fn frame_event(frame: &Frame) -> Event {
    Event::default().data(frame.payload())
}

/// Clears session state if the response stream is dropped before the
/// pipeline reaches DONE.
struct DisconnectGuard {
    state: AppState,
    ctx: RequestContext,
    key: String,
    holds_lease: bool,
    armed: bool,
}

impl DisconnectGuard {
    fn new(state: AppState, ctx: RequestContext, key: String, holds_lease: bool) -> Self {
        Self {
            state,
            ctx,
            key,
            holds_lease,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anima_core::Settings;
    use std::path::Path;

    fn ctx() -> RequestContext {
        RequestContext {
            api_key: "tenant".into(),
            user: "u1".into(),
            voice: "v1".into(),
            speed: 1.0,
        }
    }

    fn test_state_with(dir: &Path, tweak: impl FnOnce(&mut Settings)) -> AppState {
        let mut settings = Settings::from_env();
        settings.audio_dir = dir.to_path_buf();
        tweak(&mut settings);
        crate::build_state(settings)
    }

    fn test_state(dir: &Path) -> AppState {
        test_state_with(dir, |_| {})
    }

    /// Minimal upstream double: a streaming chat answer plus a synthesis
    /// endpoint that returns zero audio bytes.
    async fn stub_upstream() -> String {
        use axum::routing::post;
        let app = axum::Router::new()
            .route(
                "/chat-messages",
                post(|| async {
                    concat!(
                        "data: {\"event\":\"message\",\"answer\":\"The sky is blue today and clear.\"}\n\n",
                        "data: {\"event\":\"message_end\",\"conversation_id\":\"c1\",\"message_id\":\"m1\"}\n\n",
                    )
                }),
            )
            .route("/text-to-audio", post(|| async { Vec::<u8>::new() }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn full_answer_is_sealed_and_silent_chunks_keep_null_urls() {
        let dir = tempfile::tempdir().unwrap();
        let base = stub_upstream().await;
        let state = test_state_with(dir.path(), |s| {
            s.llm_base_url = base.clone();
            s.tts_url = format!("{base}/text-to-audio");
        });
        let query = "what color is the sky";

        let stream = answer_stream(state.clone(), ctx(), query.to_string());
        pin_mut!(stream);
        while stream.next().await.is_some() {}

        let key = cache_key("tenant", "u1", "v1", query, &state.suggested);
        let frames = state.replay.load(&key).await.unwrap().expect("entry sealed");
        let payloads: Vec<serde_json::Value> = frames
            .iter()
            .map(|f| serde_json::from_str(f.payload()).unwrap())
            .collect();
        let message = payloads
            .iter()
            .find(|v| v["event"] == "message")
            .expect("prose frame");
        assert!(message["text"].as_str().unwrap().contains("sky is blue"));
        // Zero-byte provider output: the chunk is still delivered, silent.
        assert!(message["url"].is_null());

        assert_eq!(
            state.sessions.conversation_id("tenant", "u1").await.unwrap().as_deref(),
            Some("c1")
        );
        assert_eq!(
            state.sessions.asked_questions("tenant", "u1", "v1").await.unwrap(),
            vec![query.to_string()]
        );
    }

    #[tokio::test]
    async fn lapsed_lease_loser_generates_live_without_touching_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let base = stub_upstream().await;
        let state = test_state_with(dir.path(), |s| {
            s.llm_base_url = base.clone();
            s.tts_url = format!("{base}/text-to-audio");
            // No wait window: the loser moves on at once.
            s.lease_ttl_secs = 0;
        });
        let query = "what color is the sky";
        let key = cache_key("tenant", "u1", "v1", query, &state.suggested);
        // Another producer holds the lease and is still mid-generation.
        assert!(state
            .kv
            .set_nx_ex(&format!("lease:{key}"), "1", Duration::from_secs(60))
            .await
            .unwrap());

        let stream = answer_stream(state.clone(), ctx(), query.to_string());
        pin_mut!(stream);
        let mut events = 0;
        while stream.next().await.is_some() {
            events += 1;
        }
        assert!(events >= 1, "live generation still reaches the client");

        // The slow winner's entry is untouched: nothing written, no seal.
        assert!(state.kv.lrange(&key).await.unwrap().is_none());
        assert!(state.replay.load(&key).await.unwrap().is_none());
        assert_eq!(
            state.sessions.conversation_id("tenant", "u1").await.unwrap().as_deref(),
            Some("c1")
        );
    }

    #[tokio::test]
    async fn upstream_failure_becomes_error_frame_with_spoken_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state_with(dir.path(), |s| {
            s.llm_base_url = "http://127.0.0.1:9".into();
        });
        let (tx, mut rx) = mpsc::channel(8);
        produce(state, ctx(), "hello there".into(), None, tx).await;
        match rx.recv().await {
            Some(Produced::Fallback { detail, answer, .. }) => {
                assert!(!detail.is_empty());
                assert!(FALLBACK_PHRASES.contains(&answer.as_str()));
            }
            _ => panic!("expected a fallback item"),
        }
        assert!(rx.recv().await.is_none(), "producer stops after the fallback");
    }

    #[tokio::test]
    async fn correction_disabled_passes_transcript_through() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let out = correct_transcript(&state, &ctx(), "helo wrold").await;
        assert_eq!(out, "helo wrold");
    }

    #[tokio::test]
    async fn failed_correction_falls_back_to_raw_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state_with(dir.path(), |s| {
            s.correct_transcript = true;
            s.rewrite_timeout_secs = 1;
            s.llm_base_url = "http://127.0.0.1:9".into();
        });
        let out = correct_transcript(&state, &ctx(), "helo wrold").await;
        assert_eq!(out, "helo wrold");
    }

    #[tokio::test]
    async fn dropped_guard_clears_session_keys() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        state
            .sessions
            .save_conversation_id("tenant", "u1", "conv-1")
            .await
            .unwrap();
        drop(DisconnectGuard::new(state.clone(), ctx(), "k".into(), false));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            state.sessions.conversation_id("tenant", "u1").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn disarmed_guard_leaves_session_alone() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        state
            .sessions
            .save_conversation_id("tenant", "u1", "conv-1")
            .await
            .unwrap();
        let mut guard = DisconnectGuard::new(state.clone(), ctx(), "k".into(), false);
        guard.disarm();
        drop(guard);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            state
                .sessions
                .conversation_id("tenant", "u1")
                .await
                .unwrap()
                .as_deref(),
            Some("conv-1")
        );
    }

    #[test]
    fn blocking_key_is_user_and_voice_scoped() {
        let a = blocking_key("t", "alice", "v1", "hello");
        assert_ne!(a, blocking_key("t", "bob", "v1", "hello"));
        assert_ne!(a, blocking_key("t", "alice", "v2", "hello"));
        assert_eq!(a, blocking_key("t", "alice", "v1", "hello "));
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let state = self.state.clone();
        let ctx = self.ctx.clone();
        let key = self.key.clone();
        let holds_lease = self.holds_lease;
        tokio::spawn(async move {
            tracing::info!(user = %ctx.user, "client disconnected, clearing session");
            if let Err(err) = state.sessions.clear(&ctx.api_key, &ctx.user).await {
                tracing::warn!(%err, "session cleanup failed");
            }
            if holds_lease {
                let _ = state.replay.release_lease(&key).await;
            }
        });
    }
}
