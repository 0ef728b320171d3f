//! Speech-to-text gateway.
//!
//! Validates the upload, hashes its bytes, and only calls the upstream
//! transcriber on a cache miss. The (possibly empty) upstream result is
//! always cached so identical failing audio does not hammer the service;
//! an empty transcript reaches the caller as a neutral fallback phrase,
//! never as an error. The raw upload is persisted regardless of outcome.

use crate::error::{SpeechError, SpeechResult};
use crate::store::AudioStore;
use anima_core::config::{pick_phrase, FALLBACK_PHRASES};
use anima_core::KvStore;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Upload extensions the upstream transcriber accepts.
const ALLOWED_EXTENSIONS: &[&str] = &["mp3", "mp4", "mpeg", "mpga", "m4a", "wav", "webm"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub audio_hash: String,
    /// What the pipeline should treat as the user's question. Never empty:
    /// unusable audio yields a fallback phrase.
    pub text: String,
    /// False when the text is a fallback phrase rather than real speech.
    pub recognized: bool,
}

/// The upstream transcription call, behind a seam so the gateway logic is
/// testable without a network.
#[async_trait]
pub trait SttBackend: Send + Sync {
    async fn transcribe(&self, filename: &str, bytes: Vec<u8>) -> SpeechResult<String>;
}

/// Multipart HTTP backend.
pub struct HttpSttBackend {
    client: reqwest::Client,
    url: String,
}

impl HttpSttBackend {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl SttBackend for HttpSttBackend {
    async fn transcribe(&self, filename: &str, bytes: Vec<u8>) -> SpeechResult<String> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = self.client.post(&self.url).multipart(form).send().await?;
        if !resp.status().is_success() {
            return Err(SpeechError::Backend {
                provider: "stt",
                detail: format!("status {}", resp.status()),
            });
        }
        #[derive(serde::Deserialize)]
        struct Body {
            #[serde(default)]
            text: String,
        }
        Ok(resp.json::<Body>().await.map(|b| b.text)?)
    }
}

pub struct SttGateway {
    backend: Arc<dyn SttBackend>,
    cache: Arc<dyn KvStore>,
    store: AudioStore,
    max_bytes: usize,
    cache_ttl: Duration,
}

impl SttGateway {
    pub fn new(
        backend: Arc<dyn SttBackend>,
        cache: Arc<dyn KvStore>,
        store: AudioStore,
        max_bytes: usize,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            backend,
            cache,
            store,
            max_bytes,
            cache_ttl,
        }
    }

    /// Validate, persist, and transcribe one upload.
    pub async fn transcribe(&self, filename: &str, bytes: Vec<u8>) -> SpeechResult<Transcript> {
        let ext = filename
            .rsplit_once('.')
            .map(|(_, e)| e.to_ascii_lowercase())
            .unwrap_or_default();
        if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
            return Err(SpeechError::InvalidAudio(format!(
                "extension {ext:?} not in {ALLOWED_EXTENSIONS:?}"
            )));
        }
        if bytes.len() > self.max_bytes {
            return Err(SpeechError::TooLarge {
                size: bytes.len(),
                max: self.max_bytes,
            });
        }

        // Uploads are kept for traceability whatever the transcription says.
        if let Err(err) = self.store.save("uploads", &ext, &bytes).await {
            tracing::warn!(%err, "could not persist uploaded audio");
        }

        let audio_hash = {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            hasher
                .finalize()
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<String>()
        };
        let cache_key = format!("stt:{audio_hash}");

        let raw = match self.cache.get(&cache_key).await {
            Ok(Some(cached)) => cached,
            other => {
                if let Err(err) = other {
                    tracing::warn!(%err, "transcript cache read failed");
                }
                let raw = match self.backend.transcribe(filename, bytes).await {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(%err, "upstream transcription failed");
                        String::new()
                    }
                };
                if let Err(err) = self.cache.set_ex(&cache_key, &raw, self.cache_ttl).await {
                    tracing::warn!(%err, "transcript cache write failed");
                }
                raw
            }
        };

        let cleaned = raw.trim().trim_end_matches(['？', '?', '。', '.', '>']).trim();
        if cleaned.is_empty() {
            Ok(Transcript {
                audio_hash,
                text: pick_phrase(FALLBACK_PHRASES),
                recognized: false,
            })
        } else {
            Ok(Transcript {
                audio_hash,
                text: cleaned.to_string(),
                recognized: true,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anima_core::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        calls: AtomicUsize,
        reply: SpeechResult<&'static str>,
    }

    impl CountingBackend {
        fn ok(reply: &'static str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply: Ok(reply),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply: Err(SpeechError::Backend {
                    provider: "stt",
                    detail: "down".into(),
                }),
            })
        }
    }

    #[async_trait]
    impl SttBackend for CountingBackend {
        async fn transcribe(&self, _filename: &str, _bytes: Vec<u8>) -> SpeechResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Ok(s) => Ok(s.to_string()),
                Err(_) => Err(SpeechError::Backend {
                    provider: "stt",
                    detail: "down".into(),
                }),
            }
        }
    }

    fn gateway(backend: Arc<dyn SttBackend>, dir: &std::path::Path) -> SttGateway {
        SttGateway::new(
            backend,
            Arc::new(MemoryStore::new()),
            AudioStore::new(dir, "http://h"),
            1024,
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn rejects_disallowed_extension() {
        let dir = tempfile::tempdir().unwrap();
        let g = gateway(CountingBackend::ok("hi"), dir.path());
        let err = g.transcribe("note.txt", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, SpeechError::InvalidAudio(_)));
    }

    #[tokio::test]
    async fn rejects_oversized_upload() {
        let dir = tempfile::tempdir().unwrap();
        let g = gateway(CountingBackend::ok("hi"), dir.path());
        let err = g
            .transcribe("a.wav", vec![0u8; 2048])
            .await
            .unwrap_err();
        assert!(matches!(err, SpeechError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn cache_hit_skips_upstream_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CountingBackend::ok("What time is it？");
        let g = gateway(backend.clone(), dir.path());
        let first = g.transcribe("a.wav", b"same bytes".to_vec()).await.unwrap();
        let second = g.transcribe("a.wav", b"same bytes".to_vec()).await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.text, "What time is it");
        assert_eq!(first, second);
        assert!(first.recognized);
    }

    #[tokio::test]
    async fn upstream_failure_yields_fallback_and_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CountingBackend::failing();
        let g = gateway(backend.clone(), dir.path());
        let t1 = g.transcribe("a.wav", b"noise".to_vec()).await.unwrap();
        assert!(!t1.recognized);
        assert!(FALLBACK_PHRASES.contains(&t1.text.as_str()));
        // Empty result was cached: the second identical upload makes no call.
        let _t2 = g.transcribe("a.wav", b"noise".to_vec()).await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn upload_is_persisted_even_when_transcription_fails() {
        let dir = tempfile::tempdir().unwrap();
        let g = gateway(CountingBackend::failing(), dir.path());
        g.transcribe("a.wav", b"noise".to_vec()).await.unwrap();
        let uploads = std::fs::read_dir(dir.path().join("uploads")).unwrap().count();
        assert_eq!(uploads, 1);
    }
}
