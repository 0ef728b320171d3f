//! The synthesis adapter: text chunk in, audio URL out.
//!
//! Pipeline per chunk: normalize → dedup by (text, voice, speed) content
//! hash → provider call → ffmpeg post-processing → durable store →
//! provenance. Every failure degrades to `None` so the text frame still
//! reaches the client with `url: null`; nothing in here aborts a stream.

use crate::error::SpeechResult;
use crate::provenance::{AudioRecord, ProvenanceSink};
use crate::store::AudioStore;
use crate::transcode::Transcoder;
use crate::tts::TtsProvider;
use anima_core::normalize::{normalize, NormalizeOptions};
use anima_core::KvStore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Dedup key over the exact synthesis inputs.
pub fn synthesis_key(normalized_text: &str, voice: &str, speed: f32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_text.as_bytes());
    hasher.update(b"|");
    hasher.update(voice.as_bytes());
    hasher.update(b"|");
    hasher.update(format!("{speed:.2}").as_bytes());
    let hash: String = hasher.finalize().iter().map(|b| format!("{b:02x}")).collect();
    format!("tts:{hash}")
}

#[derive(Clone)]
pub struct SynthesisAdapter {
    provider: Arc<TtsProvider>,
    transcoder: Transcoder,
    store: AudioStore,
    cache: Arc<dyn KvStore>,
    provenance: Arc<dyn ProvenanceSink>,
    normalize_opts: NormalizeOptions,
    cache_ttl: Duration,
    timeout: Duration,
}

impl SynthesisAdapter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: TtsProvider,
        transcoder: Transcoder,
        store: AudioStore,
        cache: Arc<dyn KvStore>,
        provenance: Arc<dyn ProvenanceSink>,
        normalize_opts: NormalizeOptions,
        cache_ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            provider: Arc::new(provider),
            transcoder,
            store,
            cache,
            provenance,
            normalize_opts,
            cache_ttl,
            timeout,
        }
    }

    /// Produce a playable URL for `text`, or `None` when there is nothing
    /// to say or synthesis failed. `question` is only used for provenance.
    pub async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        speed: f32,
        question: &str,
    ) -> Option<String> {
        let spoken = normalize(text, self.normalize_opts);
        if spoken.is_empty() {
            return None;
        }

        let key = synthesis_key(&spoken, voice, speed);
        match self.cache.get(&key).await {
            Ok(Some(url)) => return Some(url),
            Ok(None) => {}
            Err(err) => tracing::warn!(%err, "synthesis dedup lookup failed"),
        }

        let started = Instant::now();
        let produced =
            tokio::time::timeout(self.timeout, self.produce(&spoken, voice, speed)).await;
        let url = match produced {
            Ok(Ok(Some(url))) => url,
            Ok(Ok(None)) => {
                tracing::warn!(voice, "synthesis produced no audio");
                return None;
            }
            Ok(Err(err)) => {
                tracing::warn!(provider = self.provider.name(), voice, %err, "synthesis failed");
                return None;
            }
            Err(_) => {
                tracing::warn!(voice, timeout_secs = self.timeout.as_secs(), "synthesis timed out");
                return None;
            }
        };

        if let Err(err) = self.cache.set_ex(&key, &url, self.cache_ttl).await {
            tracing::warn!(%err, "could not cache synthesis result");
        }

        let record = AudioRecord::new(
            question,
            text,
            url.clone(),
            voice,
            started.elapsed().as_millis() as u64,
        );
        let sink = Arc::clone(&self.provenance);
        tokio::task::spawn_blocking(move || sink.record(record));

        Some(url)
    }

    async fn produce(
        &self,
        spoken: &str,
        voice: &str,
        speed: f32,
    ) -> SpeechResult<Option<String>> {
        let raw = self.provider.synthesize_raw(spoken, voice).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        let wav = self.transcoder.to_speech_wav(&raw, speed).await?;
        let stored = self.store.save("tts", "wav", &wav).await?;
        Ok(Some(stored.url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_covers_all_inputs() {
        let base = synthesis_key("hello there", "v1", 1.0);
        assert_eq!(base, synthesis_key("hello there", "v1", 1.0));
        assert_ne!(base, synthesis_key("hello there!", "v1", 1.0));
        assert_ne!(base, synthesis_key("hello there", "v2", 1.0));
        assert_ne!(base, synthesis_key("hello there", "v1", 1.25));
    }
}
