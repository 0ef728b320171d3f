//! Gateway configuration loaded from `.env`.
//!
//! Every knob the pipeline needs — upstream endpoints, chunking thresholds,
//! cache TTLs, audio limits — comes from the environment so deployments can
//! change behavior without code edits. Unset or invalid values fall back to
//! the documented defaults.

use rand::seq::SliceRandom;
use std::path::PathBuf;

/// Pipeline settings loaded from environment.
///
/// | Env | Default | Description |
/// |-----|---------|-------------|
/// | ANIMA_LLM_URL | http://127.0.0.1:8080/v1 | Upstream chat service base URL. |
/// | ANIMA_LLM_API_KEY | (empty) | Default bearer key when the caller sends none. |
/// | ANIMA_STT_URL | http://127.0.0.1:8081/audio-to-text | Upstream transcription endpoint. |
/// | ANIMA_TTS_SERVICE | fish-http | Synthesis provider: "fish-http" \| "openai". |
/// | ANIMA_CUT_LENGTH | 35 | Minimum speakable chars before a synthesis trigger. |
/// | ANIMA_TERMINATORS | .!?。！？ | Characters that close a speakable chunk. |
/// | ANIMA_MAX_ROUNDS | 20 | Conversation rounds before the context is reset. |
/// | ANIMA_CACHE_TTL | 3600 | TTL (seconds) for session keys and replay entries. |
#[derive(Debug, Clone)]
pub struct Settings {
    /// ANIMA_LLM_URL: base URL of the upstream conversational LLM service.
    pub llm_base_url: String,
    /// ANIMA_LLM_API_KEY: fallback bearer key for upstream calls.
    pub llm_api_key: String,
    /// ANIMA_STT_URL: upstream speech-to-text endpoint (multipart upload).
    pub stt_url: String,
    /// ANIMA_TTS_SERVICE: provider name resolved once at startup.
    pub tts_service: String,
    /// ANIMA_TTS_URL: provider endpoint (fish-http JSON API or OpenAI-compatible base).
    pub tts_url: String,
    /// ANIMA_TTS_API_KEY: bearer key for remote synthesis providers.
    pub tts_api_key: Option<String>,
    /// ANIMA_DEFAULT_VOICE: voice id used when the caller sends none.
    pub default_voice: String,
    /// ANIMA_TTS_SPEED: playback-rate multiplier applied during transcoding.
    pub default_speed: f32,
    /// ANIMA_AUDIO_DIR: durable storage root for produced and uploaded audio.
    pub audio_dir: PathBuf,
    /// ANIMA_PUBLIC_URL: public base used to build audio file URLs.
    pub public_base_url: String,
    /// ANIMA_CACHE_TTL: seconds before idle session/replay keys expire.
    pub cache_ttl_secs: u64,
    /// ANIMA_MAX_ROUNDS: round cap before conversation context is cleared.
    pub max_rounds: i64,
    /// ANIMA_CUT_LENGTH: minimum speakable length for a mid-stream synthesis trigger.
    pub min_chunk_chars: usize,
    /// ANIMA_TERMINATORS: terminal punctuation that closes a speakable chunk.
    pub terminators: Vec<char>,
    /// ANIMA_MAX_AUDIO_BYTES: upload size cap for the STT gateway.
    pub max_audio_bytes: usize,
    /// ANIMA_GREETING: emit a short synthesized acknowledgement before the answer.
    pub greeting_enabled: bool,
    /// ANIMA_PROBE_IMAGES: verify extracted image links exist before
    /// emitting them.
    pub probe_images: bool,
    /// ANIMA_SPELL_NUMBERS: rewrite digits into words before synthesis.
    pub spell_out_numbers: bool,
    /// ANIMA_CORRECT_TRANSCRIPT: run transcripts through a bounded model
    /// rewrite before they become queries.
    pub correct_transcript: bool,
    /// ANIMA_REWRITE_TIMEOUT: deadline (seconds) for correction and
    /// translation rewrites; lapsing falls back to the unrewritten text.
    pub rewrite_timeout_secs: u64,
    /// ANIMA_TRANSLATE_TO: target language for spoken text. Unset means no
    /// translation pass.
    pub translate_to: Option<String>,
    /// ANIMA_FLUSH_EVERY: replay-cache frame batch size.
    pub flush_every: usize,
    /// ANIMA_LEASE_TTL: seconds a producer holds the per-key generation lease.
    pub lease_ttl_secs: u64,
    /// ANIMA_SYNTH_TIMEOUT: per-chunk synthesis deadline in seconds.
    pub synthesis_timeout_secs: u64,
    /// ANIMA_HTTP_TIMEOUT: total deadline for one upstream HTTP exchange.
    pub http_timeout_secs: u64,
    /// ANIMA_HTTP_CONNECT_TIMEOUT: upstream connect deadline.
    pub http_connect_timeout_secs: u64,
    /// ANIMA_TRANSCODE_WORKERS: bounded pool size for ffmpeg jobs.
    pub transcode_workers: usize,
    /// ANIMA_SUGGESTED_FILE: newline-delimited suggested questions, loaded
    /// at startup and on explicit reload.
    pub suggested_file: Option<String>,
    /// ANIMA_PORT: gateway listen port.
    pub port: u16,
}

impl Settings {
    /// Load settings from environment. Unset or invalid => defaults (see field docs).
    pub fn from_env() -> Self {
        Self {
            llm_base_url: env_string("ANIMA_LLM_URL", "http://127.0.0.1:8080/v1"),
            llm_api_key: env_string("ANIMA_LLM_API_KEY", ""),
            stt_url: env_string("ANIMA_STT_URL", "http://127.0.0.1:8081/audio-to-text"),
            tts_service: env_string("ANIMA_TTS_SERVICE", "fish-http"),
            tts_url: env_string("ANIMA_TTS_URL", "http://127.0.0.1:8082/text-to-audio"),
            tts_api_key: env_opt_string("ANIMA_TTS_API_KEY"),
            default_voice: env_string("ANIMA_DEFAULT_VOICE", "default"),
            default_speed: env_f32("ANIMA_TTS_SPEED", 1.0).clamp(0.5, 2.0),
            audio_dir: PathBuf::from(env_string("ANIMA_AUDIO_DIR", "./static")),
            public_base_url: env_string("ANIMA_PUBLIC_URL", "http://127.0.0.1:8000"),
            cache_ttl_secs: env_u64("ANIMA_CACHE_TTL", 3600),
            max_rounds: env_u64("ANIMA_MAX_ROUNDS", 20) as i64,
            min_chunk_chars: env_u64("ANIMA_CUT_LENGTH", 35) as usize,
            terminators: env_string("ANIMA_TERMINATORS", ".!?。！？").chars().collect(),
            max_audio_bytes: env_u64("ANIMA_MAX_AUDIO_BYTES", 15 * 1024 * 1024) as usize,
            greeting_enabled: env_bool("ANIMA_GREETING", false),
            probe_images: env_bool("ANIMA_PROBE_IMAGES", true),
            spell_out_numbers: env_bool("ANIMA_SPELL_NUMBERS", true),
            correct_transcript: env_bool("ANIMA_CORRECT_TRANSCRIPT", false),
            rewrite_timeout_secs: env_u64("ANIMA_REWRITE_TIMEOUT", 2),
            translate_to: env_opt_string("ANIMA_TRANSLATE_TO"),
            flush_every: env_u64("ANIMA_FLUSH_EVERY", 10) as usize,
            lease_ttl_secs: env_u64("ANIMA_LEASE_TTL", 120),
            synthesis_timeout_secs: env_u64("ANIMA_SYNTH_TIMEOUT", 60),
            http_timeout_secs: env_u64("ANIMA_HTTP_TIMEOUT", 60),
            http_connect_timeout_secs: env_u64("ANIMA_HTTP_CONNECT_TIMEOUT", 10),
            transcode_workers: env_u64("ANIMA_TRANSCODE_WORKERS", 8) as usize,
            suggested_file: env_opt_string("ANIMA_SUGGESTED_FILE"),
            port: env_u64("ANIMA_PORT", 8000) as u16,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Neutral phrases spoken when the transcript or the answer cannot be produced.
/// The avatar must always say something; one of these is chosen at random.
pub const FALLBACK_PHRASES: &[&str] = &[
    "I'm sorry, I may not have caught that clearly. Could you say it again?",
    "Apologies, I didn't quite understand. Please repeat your question and I'll listen carefully.",
    "Sorry about that — could you ask once more? I'm happy to help.",
    "I might have missed part of that. Would you mind repeating it?",
];

/// Short acknowledgements played while the first answer chunk is being produced.
pub const GREETING_PHRASES: &[&str] = &[
    "Thanks for waiting, I'm preparing your answer.",
    "One moment while I think that through.",
    "Let me look into that for you.",
];

/// Pick one canned phrase at random.
pub fn pick_phrase(phrases: &[&str]) -> String {
    phrases
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or_default()
        .to_string()
}

fn env_string(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => v.trim().eq_ignore_ascii_case("true") || (v.trim().is_empty() && default),
        Err(_) => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_f32(name: &str, default: f32) -> f32 {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::from_env();
        assert!(s.min_chunk_chars > 0);
        assert!(s.terminators.contains(&'.'));
        assert!(s.flush_every > 0);
    }

    #[test]
    fn pick_phrase_returns_member() {
        let p = pick_phrase(FALLBACK_PHRASES);
        assert!(FALLBACK_PHRASES.contains(&p.as_str()));
    }
}
