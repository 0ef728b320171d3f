//! Deterministic SSE replay cache.
//!
//! Outgoing frames for one answer are appended, in order, under a key
//! derived from the request. The entry only becomes replayable once the
//! producer appends the completion sentinel: a list without it is
//! indistinguishable from one still being produced, so readers treat it as
//! a miss. A short-TTL lease key keeps two identical concurrent misses from
//! both producing; the loser waits and replays what the winner sealed.

use crate::cache::KvStore;
use crate::chunk::Frame;
use crate::error::CoreResult;
use crate::suggest::{normalize_question, SuggestedSet};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Reserved completion marker. Cache-internal only, never sent to clients.
pub const END_OF_STREAM: &str = "__END_OF_STREAM__";

/// Derive the replay key. Questions in the suggested set share one entry
/// across users (keyed by tenant and voice only); everything else is also
/// scoped by user.
pub fn cache_key(
    tenant: &str,
    user: &str,
    voice: &str,
    question: &str,
    suggested: &SuggestedSet,
) -> String {
    let normalized = normalize_question(question);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let hash = hex_digest(hasher);
    if suggested.contains(question) {
        format!("sse:suggested:{tenant}:{voice}:{hash}")
    } else {
        format!("sse:{tenant}:{user}:{voice}:{hash}")
    }
}

pub(crate) fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[derive(Clone)]
pub struct ReplayCache {
    store: Arc<dyn KvStore>,
    ttl: Duration,
    flush_every: usize,
    lease_ttl: Duration,
}

impl ReplayCache {
    pub fn new(
        store: Arc<dyn KvStore>,
        ttl: Duration,
        flush_every: usize,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            store,
            ttl,
            flush_every: flush_every.max(1),
            lease_ttl,
        }
    }

    /// Sealed frames for a key, in production order. `None` when the entry
    /// is absent or lacks the sentinel.
    pub async fn load(&self, key: &str) -> CoreResult<Option<Vec<Frame>>> {
        let Some(items) = self.store.lrange(key).await? else {
            return Ok(None);
        };
        if items.last().map(Vec::as_slice) != Some(END_OF_STREAM.as_bytes()) {
            return Ok(None);
        }
        Ok(Some(
            items[..items.len() - 1]
                .iter()
                .map(|b| Frame::from_payload(String::from_utf8_lossy(b).into_owned()))
                .collect(),
        ))
    }

    /// Try to become the producer for this key. Exactly one concurrent
    /// caller wins; the rest should `wait_for_sealed`.
    pub async fn try_lease(&self, key: &str) -> CoreResult<bool> {
        self.store
            .set_nx_ex(&lease_key(key), "1", self.lease_ttl)
            .await
    }

    pub async fn release_lease(&self, key: &str) -> CoreResult<()> {
        self.store.delete(&lease_key(key)).await
    }

    /// Poll until the entry is sealed or the deadline passes. Returns the
    /// frames on success; `None` means the winner never finished and the
    /// caller should generate live.
    pub async fn wait_for_sealed(
        &self,
        key: &str,
        deadline: Duration,
    ) -> CoreResult<Option<Vec<Frame>>> {
        let step = Duration::from_millis(200);
        let mut waited = Duration::ZERO;
        while waited < deadline {
            if let Some(frames) = self.load(key).await? {
                return Ok(Some(frames));
            }
            tokio::time::sleep(step).await;
            waited += step;
        }
        Ok(None)
    }

    /// Start writing a fresh entry. Any stale partial list under the key is
    /// dropped first.
    pub async fn writer(&self, key: &str) -> ReplayWriter {
        if let Err(err) = self.store.delete(key).await {
            tracing::warn!(key, %err, "could not clear stale replay entry");
        }
        ReplayWriter {
            cache: self.clone(),
            key: key.to_string(),
            pending: Vec::new(),
        }
    }
}

fn lease_key(key: &str) -> String {
    format!("lease:{key}")
}

/// Batched appender for one replay entry. Flushes every `flush_every`
/// frames; `seal` writes the remainder plus the sentinel. Cache failures
/// are logged and swallowed: replay is an optimization, never a reason to
/// break the live stream. Dropping an unsealed writer leaves the entry
/// incomplete, which readers already treat as a miss.
pub struct ReplayWriter {
    cache: ReplayCache,
    key: String,
    pending: Vec<Vec<u8>>,
}

impl ReplayWriter {
    pub async fn push(&mut self, frame: &Frame) {
        self.pending.push(frame.payload().as_bytes().to_vec());
        if self.pending.len() >= self.cache.flush_every {
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        if let Err(err) = self.cache.store.rpush(&self.key, &batch, self.cache.ttl).await {
            tracing::warn!(key = %self.key, %err, "replay cache write failed");
        }
    }

    /// Final flush plus the sentinel. Only after this does the entry become
    /// replayable.
    pub async fn seal(mut self) {
        self.pending.push(END_OF_STREAM.as_bytes().to_vec());
        self.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;

    fn cache(store: Arc<MemoryStore>) -> ReplayCache {
        ReplayCache::new(store, Duration::from_secs(60), 3, Duration::from_secs(30))
    }

    fn suggested() -> SuggestedSet {
        SuggestedSet::new(["what can you do"])
    }

    #[test]
    fn suggested_keys_ignore_user_but_not_voice() {
        let s = suggested();
        let a = cache_key("t", "alice", "v1", "What can you do?", &s);
        let b = cache_key("t", "bob", "v1", "what can you do", &s);
        let c = cache_key("t", "alice", "v2", "What can you do?", &s);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn ordinary_questions_are_user_scoped() {
        let s = suggested();
        let a = cache_key("t", "alice", "v1", "tell me a story", &s);
        let b = cache_key("t", "bob", "v1", "tell me a story", &s);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn unsealed_entry_is_never_replayed() {
        let store = Arc::new(MemoryStore::new());
        let c = cache(Arc::clone(&store));
        let mut w = c.writer("k").await;
        for i in 0..5 {
            w.push(&Frame::message(&format!("part {i}"), None)).await;
        }
        // Dropped without seal: bytes exist, sentinel does not.
        drop(w);
        assert!(store.lrange("k").await.unwrap().is_some());
        assert!(c.load("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sealed_entry_replays_in_order_without_sentinel() {
        let store = Arc::new(MemoryStore::new());
        let c = cache(store);
        let mut w = c.writer("k").await;
        let frames: Vec<Frame> = (0..4).map(|i| Frame::message(&format!("p{i}"), None)).collect();
        for f in &frames {
            w.push(f).await;
        }
        w.seal().await;
        let replayed = c.load("k").await.unwrap().unwrap();
        assert_eq!(replayed, frames);
        assert!(!replayed
            .iter()
            .any(|f| f.payload().contains(END_OF_STREAM)));
    }

    #[tokio::test]
    async fn second_writer_replaces_stale_partial() {
        let store = Arc::new(MemoryStore::new());
        let c = cache(Arc::clone(&store));
        let mut w = c.writer("k").await;
        w.push(&Frame::message("stale", None)).await;
        w.flush().await;
        drop(w);
        let mut w2 = c.writer("k").await;
        w2.push(&Frame::message("fresh", None)).await;
        w2.seal().await;
        let frames = c.load("k").await.unwrap().unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload().contains("fresh"));
    }

    #[tokio::test]
    async fn lease_single_winner_then_wait_replays() {
        let store = Arc::new(MemoryStore::new());
        let c = cache(store);
        assert!(c.try_lease("k").await.unwrap());
        assert!(!c.try_lease("k").await.unwrap());
        let mut w = c.writer("k").await;
        w.push(&Frame::message("answer", None)).await;
        w.seal().await;
        let frames = c
            .wait_for_sealed("k", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frames.len(), 1);
        c.release_lease("k").await.unwrap();
        assert!(c.try_lease("k").await.unwrap());
    }
}
