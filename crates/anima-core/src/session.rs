//! Per-user conversation bookkeeping on top of the shared cache.
//!
//! Four key families, all scoped by tenant (API key) and user:
//!   conn:{tenant}:{user}             -> upstream conversation id
//!   count:{tenant}:{user}            -> rounds used in the current context
//!   suggested:{tenant}:{user}        -> marker that the last answer was a
//!                                       canned suggested-question reply
//!   question:{tenant}:{user}:{voice} -> ordered list of answered questions
//! All keys share one idle TTL; an untouched session simply evaporates.
//! The question list outlives context clears: it is history, not context.

use crate::cache::KvStore;
use crate::error::CoreResult;
use crate::replay::END_OF_STREAM;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of counting one conversational round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundState {
    /// Round number this exchange ran as (1-based, after any reset).
    pub round: i64,
    /// True when the cap was hit and the context was cleared before this
    /// exchange, so the upstream call must start a fresh conversation.
    pub reset: bool,
}

/// Session store keyed by `(tenant, user)`.
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KvStore>,
    ttl: Duration,
    max_rounds: i64,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration, max_rounds: i64) -> Self {
        Self {
            store,
            ttl,
            max_rounds,
        }
    }

    fn conn_key(tenant: &str, user: &str) -> String {
        format!("conn:{tenant}:{user}")
    }

    fn count_key(tenant: &str, user: &str) -> String {
        format!("count:{tenant}:{user}")
    }

    fn suggested_key(tenant: &str, user: &str) -> String {
        format!("suggested:{tenant}:{user}")
    }

    /// Upstream conversation id to continue, if one is live.
    pub async fn conversation_id(&self, tenant: &str, user: &str) -> CoreResult<Option<String>> {
        self.store.get(&Self::conn_key(tenant, user)).await
    }

    /// Record the conversation id reported by the upstream `message_end`.
    pub async fn save_conversation_id(
        &self,
        tenant: &str,
        user: &str,
        conversation_id: &str,
    ) -> CoreResult<()> {
        self.store
            .set_ex(&Self::conn_key(tenant, user), conversation_id, self.ttl)
            .await
    }

    /// Count one round. Past the cap the whole context is cleared first and
    /// the counter restarts at 1, so `reset` tells the caller to open a new
    /// upstream conversation.
    pub async fn bump_round(&self, tenant: &str, user: &str) -> CoreResult<RoundState> {
        let count = self
            .store
            .incr_ex(&Self::count_key(tenant, user), self.ttl)
            .await?;
        if count > self.max_rounds {
            self.clear(tenant, user).await?;
            let round = self
                .store
                .incr_ex(&Self::count_key(tenant, user), self.ttl)
                .await?;
            return Ok(RoundState { round, reset: true });
        }
        Ok(RoundState {
            round: count,
            reset: false,
        })
    }

    /// Whether the previous answer in this session came from the
    /// suggested-question path.
    pub async fn suggested_marker(&self, tenant: &str, user: &str) -> CoreResult<bool> {
        Ok(self
            .store
            .get(&Self::suggested_key(tenant, user))
            .await?
            .is_some())
    }

    pub async fn save_suggested_marker(&self, tenant: &str, user: &str) -> CoreResult<()> {
        self.store
            .set_ex(&Self::suggested_key(tenant, user), "1", self.ttl)
            .await
    }

    pub async fn clear_suggested_marker(&self, tenant: &str, user: &str) -> CoreResult<()> {
        self.store.delete(&Self::suggested_key(tenant, user)).await
    }

    fn question_key(tenant: &str, user: &str, voice: &str) -> String {
        format!("question:{tenant}:{user}:{voice}")
    }

    /// Append one fully answered question to the user's history list.
    pub async fn record_question(
        &self,
        tenant: &str,
        user: &str,
        voice: &str,
        question: &str,
    ) -> CoreResult<()> {
        self.store
            .rpush(
                &Self::question_key(tenant, user, voice),
                &[question.as_bytes().to_vec()],
                self.ttl,
            )
            .await
    }

    /// Every question this user has had answered, oldest first. Completion
    /// sentinels that shared the list's storage format are filtered out.
    pub async fn asked_questions(
        &self,
        tenant: &str,
        user: &str,
        voice: &str,
    ) -> CoreResult<Vec<String>> {
        let items = self
            .store
            .lrange(&Self::question_key(tenant, user, voice))
            .await?
            .unwrap_or_default();
        Ok(items
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .filter(|q| q != END_OF_STREAM)
            .collect())
    }

    /// Drop every session key for this user: conversation id, round counter,
    /// suggested marker. Used on round-cap resets, explicit context clears,
    /// and client disconnects. Question history is kept.
    pub async fn clear(&self, tenant: &str, user: &str) -> CoreResult<()> {
        self.store.delete(&Self::conn_key(tenant, user)).await?;
        self.store.delete(&Self::count_key(tenant, user)).await?;
        self.store.delete(&Self::suggested_key(tenant, user)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;

    fn store(max_rounds: i64) -> SessionStore {
        SessionStore::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(60),
            max_rounds,
        )
    }

    #[tokio::test]
    async fn conversation_id_roundtrip() {
        let s = store(20);
        assert_eq!(s.conversation_id("t", "u").await.unwrap(), None);
        s.save_conversation_id("t", "u", "conv-1").await.unwrap();
        assert_eq!(
            s.conversation_id("t", "u").await.unwrap().as_deref(),
            Some("conv-1")
        );
    }

    #[tokio::test]
    async fn rounds_count_up_then_reset_past_cap() {
        let s = store(3);
        s.save_conversation_id("t", "u", "conv-1").await.unwrap();
        for expected in 1..=3 {
            let rs = s.bump_round("t", "u").await.unwrap();
            assert_eq!(rs, RoundState { round: expected, reset: false });
        }
        // Fourth exchange trips the cap: context cleared, counter restarts.
        let rs = s.bump_round("t", "u").await.unwrap();
        assert_eq!(rs, RoundState { round: 1, reset: true });
        assert_eq!(s.conversation_id("t", "u").await.unwrap(), None);
    }

    #[tokio::test]
    async fn users_do_not_share_counters() {
        let s = store(20);
        s.bump_round("t", "alice").await.unwrap();
        s.bump_round("t", "alice").await.unwrap();
        let rs = s.bump_round("t", "bob").await.unwrap();
        assert_eq!(rs.round, 1);
    }

    #[tokio::test]
    async fn question_history_accumulates_and_survives_clear() {
        let s = store(20);
        s.record_question("t", "u", "v1", "first question").await.unwrap();
        s.record_question("t", "u", "v1", "second question").await.unwrap();
        s.clear("t", "u").await.unwrap();
        assert_eq!(
            s.asked_questions("t", "u", "v1").await.unwrap(),
            vec!["first question", "second question"]
        );
        // Other voices and users see their own lists.
        assert!(s.asked_questions("t", "u", "v2").await.unwrap().is_empty());
        assert!(s.asked_questions("t", "other", "v1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn question_history_filters_storage_sentinels() {
        let s = store(20);
        s.record_question("t", "u", "v1", "real question").await.unwrap();
        s.record_question("t", "u", "v1", END_OF_STREAM).await.unwrap();
        assert_eq!(
            s.asked_questions("t", "u", "v1").await.unwrap(),
            vec!["real question"]
        );
    }

    #[tokio::test]
    async fn clear_removes_all_three_keys() {
        let s = store(20);
        s.save_conversation_id("t", "u", "c").await.unwrap();
        s.bump_round("t", "u").await.unwrap();
        s.save_suggested_marker("t", "u").await.unwrap();
        s.clear("t", "u").await.unwrap();
        assert_eq!(s.conversation_id("t", "u").await.unwrap(), None);
        assert!(!s.suggested_marker("t", "u").await.unwrap());
        // Counter restarted from scratch.
        assert_eq!(s.bump_round("t", "u").await.unwrap().round, 1);
    }
}
