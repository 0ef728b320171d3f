//! Client for the upstream conversational LLM service.
//!
//! Streaming answers arrive as newline-delimited `data: <json>` frames with
//! `event` ∈ {message, message_end}. Network chunk boundaries do not respect
//! frame boundaries, so `LineBuffer` reassembles complete lines before
//! parsing. A malformed frame is logged and skipped; only transport and
//! HTTP-status failures become errors.

use crate::error::{CoreError, CoreResult};
use futures_util::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;

/// One parsed upstream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmEvent {
    /// An `answer` delta from a `message` frame.
    Delta(String),
    /// Stream end: ids the session store records for the next turn.
    End {
        conversation_id: String,
        message_id: String,
    },
}

/// Answer of a blocking (non-streaming) chat call.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockingAnswer {
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub message_id: String,
}

/// One chat turn. `conversation_id` continues an upstream conversation;
/// `None` opens a fresh one.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub query: String,
    pub user: String,
    pub conversation_id: Option<String>,
    /// Per-tenant upstream key.
    pub api_key: String,
}

#[derive(Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
}

impl LlmClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn chat_body(req: &ChatRequest, mode: &str) -> serde_json::Value {
        json!({
            "inputs": {},
            "query": req.query,
            "response_mode": mode,
            "conversation_id": req.conversation_id.clone().unwrap_or_default(),
            "user": req.user,
        })
    }

    /// Streaming chat call. Yields parsed events until the upstream closes
    /// the response.
    pub fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> impl Stream<Item = CoreResult<LlmEvent>> + Send + 'static {
        let client = self.client.clone();
        let url = format!("{}/chat-messages", self.base_url);
        async_stream::stream! {
            let resp = match client
                .post(&url)
                .bearer_auth(&req.api_key)
                .json(&Self::chat_body(&req, "streaming"))
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(err) => {
                    yield Err(err.into());
                    return;
                }
            };
            let status = resp.status();
            if !status.is_success() {
                let detail = resp.text().await.unwrap_or_default();
                yield Err(CoreError::Upstream {
                    service: "llm",
                    detail: format!("status {status}: {detail}"),
                });
                return;
            }
            let mut lines = LineBuffer::new();
            let mut body = resp.bytes_stream();
            while let Some(piece) = body.next().await {
                let piece = match piece {
                    Ok(piece) => piece,
                    Err(err) => {
                        yield Err(err.into());
                        return;
                    }
                };
                for line in lines.push(&piece) {
                    if let Some(event) = parse_frame(&line) {
                        yield Ok(event);
                    }
                }
            }
            if let Some(event) = lines.finish().and_then(|l| parse_frame(&l)) {
                yield Ok(event);
            }
        }
    }

    /// Blocking chat call: one request, one complete answer.
    pub async fn chat_blocking(&self, req: &ChatRequest) -> CoreResult<BlockingAnswer> {
        let resp = self
            .client
            .post(format!("{}/chat-messages", self.base_url))
            .bearer_auth(&req.api_key)
            .json(&Self::chat_body(req, "blocking"))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(CoreError::Upstream {
                service: "llm",
                detail: format!("status {status}: {detail}"),
            });
        }
        Ok(resp.json().await?)
    }

    /// One-shot rewrite of `text`: a blocking call on a fresh conversation.
    /// Backs transcript correction and spoken-text translation; callers own
    /// the deadline and the fallback to the original text.
    pub async fn rewrite(
        &self,
        api_key: &str,
        instruction: &str,
        text: &str,
    ) -> CoreResult<String> {
        let req = ChatRequest {
            query: format!("{instruction}\n\n{text}"),
            user: "rewrite".to_string(),
            conversation_id: None,
            api_key: api_key.to_string(),
        };
        Ok(self.chat_blocking(&req).await?.answer)
    }

    /// Follow-up questions the upstream suggests after a finished answer.
    pub async fn next_suggested(
        &self,
        api_key: &str,
        message_id: &str,
        user: &str,
    ) -> CoreResult<Vec<String>> {
        #[derive(Deserialize)]
        struct Suggested {
            #[serde(default)]
            data: Vec<String>,
        }
        let resp = self
            .client
            .get(format!(
                "{}/messages/{}/suggested",
                self.base_url, message_id
            ))
            .bearer_auth(api_key)
            .query(&[("user", user)])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(CoreError::Upstream {
                service: "llm",
                detail: format!("suggested fetch status {}", resp.status()),
            });
        }
        Ok(resp.json::<Suggested>().await?.data)
    }

    /// Upstream app parameters (opening statement, suggested questions),
    /// passed through to the client untouched.
    pub async fn parameters(&self, api_key: &str) -> CoreResult<serde_json::Value> {
        let resp = self
            .client
            .get(format!("{}/parameters", self.base_url))
            .bearer_auth(api_key)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(CoreError::Upstream {
                service: "llm",
                detail: format!("parameters status {}", resp.status()),
            });
        }
        Ok(resp.json().await?)
    }
}

/// Reassembles newline-delimited lines from arbitrarily split byte chunks.
/// Bytes after the last newline stay buffered for the next push.
pub struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            partial: Vec::new(),
        }
    }

    /// Append bytes, returning every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.partial.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Whatever remains when the stream closes without a final newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&std::mem::take(&mut self.partial)).into_owned())
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse one SSE line into an event. Blank lines, comments, unknown event
/// kinds, and malformed JSON all come back as `None`.
pub fn parse_frame(line: &str) -> Option<LlmEvent> {
    let line = line.trim();
    let data = line.strip_prefix("data:")?.trim_start();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(%err, "skipping malformed upstream frame");
            return None;
        }
    };
    match value.get("event").and_then(|e| e.as_str()) {
        Some("message") => Some(LlmEvent::Delta(
            value.get("answer")?.as_str().unwrap_or_default().to_string(),
        )),
        Some("message_end") => Some(LlmEvent::End {
            conversation_id: value
                .get("conversation_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            message_id: value
                .get("message_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        }),
        _ => None,
    }
}
