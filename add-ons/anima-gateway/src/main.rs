//! Axum gateway for the digital-human conversation pipeline.
//!
//! Wires the speech-to-text gateway, the streaming LLM segmentation
//! pipeline with incremental synthesis, and the SSE replay cache behind an
//! HTTP surface. All configuration comes from the environment (`.env` is
//! loaded first); produced audio is served from the static file tree.

mod handlers;
mod pipeline;

use anima_core::segment::{HttpLinkProber, TrustingProber};
use anima_core::{
    LlmClient, MemoryStore, ReplayCache, SessionStore, Settings, SuggestedSet,
};
use anima_voice::{
    AudioStore, HttpSttBackend, NullSink, ProvenanceSink, SqliteProvenance, SttGateway,
    SynthesisAdapter, Transcoder, TtsProvider,
};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub sessions: SessionStore,
    pub replay: ReplayCache,
    pub suggested: Arc<SuggestedSet>,
    pub llm: LlmClient,
    pub stt: Arc<SttGateway>,
    pub synth: SynthesisAdapter,
    pub prober: Arc<dyn anima_core::LinkProber>,
    pub kv: Arc<MemoryStore>,
}

fn build_app(state: AppState) -> Router {
    let static_dir = state.settings.audio_dir.clone();
    Router::new()
        .route("/api/v1/health", get(handlers::health))
        .route("/api/v1/audio-to-text", post(handlers::audio_to_text))
        .route("/api/v1/speech", post(handlers::speech))
        .route(
            "/api/v1/chat-stream",
            get(handlers::chat_stream_get).post(handlers::chat_stream),
        )
        .route("/api/v1/chat-blocking", post(handlers::chat_blocking))
        .route("/api/v1/text-to-audio", post(handlers::text_to_audio))
        .route("/api/v1/cached-questions", get(handlers::cached_questions))
        .route("/api/v1/clear-context", post(handlers::clear_context))
        .route("/api/v1/parameters", get(handlers::parameters))
        .route("/api/v1/suggested/reload", post(handlers::reload_suggested))
        .nest_service("/static", ServeDir::new(static_dir))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn build_state(settings: Settings) -> AppState {
    let settings = Arc::new(settings);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(settings.http_timeout_secs))
        .connect_timeout(Duration::from_secs(settings.http_connect_timeout_secs))
        .build()
        .expect("http client");

    let kv = Arc::new(MemoryStore::new());
    let cache_ttl = Duration::from_secs(settings.cache_ttl_secs);
    let store = AudioStore::new(&settings.audio_dir, &settings.public_base_url);

    let provenance: Arc<dyn ProvenanceSink> =
        match SqliteProvenance::open(settings.audio_dir.join("audio_records.db")) {
            Ok(db) => Arc::new(db),
            Err(err) => {
                tracing::warn!(%err, "provenance db unavailable, records will be dropped");
                Arc::new(NullSink)
            }
        };

    let provider = TtsProvider::from_settings(client.clone(), &settings)
        .expect("invalid ANIMA_TTS_SERVICE");
    let synth = SynthesisAdapter::new(
        provider,
        Transcoder::new(settings.transcode_workers),
        store.clone(),
        kv.clone(),
        provenance,
        anima_core::normalize::NormalizeOptions {
            spell_out_numbers: settings.spell_out_numbers,
        },
        cache_ttl,
        Duration::from_secs(settings.synthesis_timeout_secs),
    );

    let stt = Arc::new(SttGateway::new(
        Arc::new(HttpSttBackend::new(client.clone(), &settings.stt_url)),
        kv.clone(),
        store,
        settings.max_audio_bytes,
        cache_ttl,
    ));

    AppState {
        sessions: SessionStore::new(kv.clone(), cache_ttl, settings.max_rounds),
        replay: ReplayCache::new(
            kv.clone(),
            cache_ttl,
            settings.flush_every,
            Duration::from_secs(settings.lease_ttl_secs),
        ),
        suggested: Arc::new(load_suggested(&settings)),
        llm: LlmClient::new(client.clone(), &settings.llm_base_url),
        stt,
        synth,
        prober: if settings.probe_images {
            Arc::new(HttpLinkProber::new(client))
        } else {
            Arc::new(TrustingProber)
        },
        kv,
        settings,
    }
}

/// Suggested questions come from a newline-delimited file named by
/// ANIMA_SUGGESTED_FILE; without one the set starts empty.
fn load_suggested(settings: &Settings) -> SuggestedSet {
    match &settings.suggested_file {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(body) => {
                let set = SuggestedSet::new(body.lines());
                tracing::info!(count = set.len(), %path, "loaded suggested questions");
                set
            }
            Err(err) => {
                tracing::warn!(%path, %err, "could not read suggested questions file");
                SuggestedSet::default()
            }
        },
        None => SuggestedSet::default(),
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = dotenvy::dotenv() {
        eprintln!("[anima-gateway] .env not loaded: {err} (using system environment)");
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env();
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], settings.port));
    let state = build_state(settings);

    if let Err(err) = tokio::fs::create_dir_all(&state.settings.audio_dir).await {
        tracing::warn!(%err, "could not create audio dir");
    }

    // Expiry is lazy on read; this keeps keys nobody reads again from
    // accumulating.
    let sweep_store = state.kv.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(300));
        loop {
            tick.tick().await;
            sweep_store.sweep();
        }
    });

    let app = build_app(state);
    tracing::info!("anima-gateway listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("bind gateway port");
    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!(%err, "server error");
    }
}
