//! Output units of the segmentation engine and their SSE wire encoding.
//!
//! Every chunk becomes exactly one SSE frame of the form
//! `data: {"event": ..., ...}\n\n`. Frame order equals chunk production
//! order and is preserved verbatim by the replay cache.

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Media class of an extracted link, derived from its file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Image,
    Audio,
    Video,
    Generic,
}

impl LinkKind {
    /// Classify a URL by the extension of its path component.
    pub fn from_url(url: &str) -> Self {
        let path = url
            .split(['?', '#'])
            .next()
            .unwrap_or(url)
            .rsplit('/')
            .next()
            .unwrap_or("");
        let ext = match path.rsplit_once('.') {
            Some((_, e)) => e.to_ascii_lowercase(),
            None => return LinkKind::Generic,
        };
        match ext.as_str() {
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "svg" => LinkKind::Image,
            "mp3" | "wav" | "m4a" | "ogg" | "flac" | "aac" => LinkKind::Audio,
            "mp4" | "mov" | "avi" | "mkv" | "webm" | "flv" => LinkKind::Video,
            _ => LinkKind::Generic,
        }
    }

    /// SSE event name for this link class.
    pub fn event_name(self) -> &'static str {
        match self {
            LinkKind::Image => "image_link",
            LinkKind::Audio => "audio_link",
            LinkKind::Video => "video_link",
            LinkKind::Generic => "generic_link",
        }
    }
}

/// A link extracted from the model output, removed from the prose stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkChunk {
    pub kind: LinkKind,
    pub title: Option<String>,
    pub url: String,
}

/// A single outbound SSE frame, already JSON-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: String,
}

impl Frame {
    fn new(value: serde_json::Value) -> Self {
        Self {
            payload: value.to_string(),
        }
    }

    /// A prose frame. `audio_url` is None when synthesis was skipped or
    /// failed; the text is still delivered.
    pub fn message(display_text: &str, audio_url: Option<&str>) -> Self {
        Self::new(json!({
            "event": "message",
            "text": display_text,
            "url": audio_url,
        }))
    }

    pub fn link(link: &LinkChunk) -> Self {
        Self::new(json!({
            "event": link.kind.event_name(),
            "title": link.title,
            "url": link.url,
        }))
    }

    pub fn suggested_questions(questions: &[String]) -> Self {
        Self::new(json!({
            "event": "suggested_questions",
            "questions": questions,
        }))
    }

    pub fn error(message: &str) -> Self {
        Self::new(json!({
            "event": "error",
            "message": message,
        }))
    }

    /// Upstream failure frame. The spoken fallback travels on it so the
    /// client can still render and play an answer.
    pub fn upstream_error(detail: &str, answer: &str, audio_url: Option<&str>) -> Self {
        Self::new(json!({
            "event": "error",
            "detail": detail,
            "answer": answer,
            "url": audio_url,
        }))
    }

    /// The JSON body, without SSE framing. This is what the replay cache
    /// stores.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Rebuild a frame from a cached payload.
    pub fn from_payload(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Full wire form: `data: {json}\n\n`.
    pub fn encode(&self) -> String {
        format!("data: {}\n\n", self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_kind_by_extension() {
        assert_eq!(LinkKind::from_url("http://a/b/cat.PNG"), LinkKind::Image);
        assert_eq!(LinkKind::from_url("http://a/song.mp3?x=1"), LinkKind::Audio);
        assert_eq!(LinkKind::from_url("http://a/clip.webm"), LinkKind::Video);
        assert_eq!(LinkKind::from_url("http://a/page"), LinkKind::Generic);
        assert_eq!(LinkKind::from_url("http://a/doc.pdf"), LinkKind::Generic);
    }

    #[test]
    fn message_frame_wire_shape() {
        let f = Frame::message("hello", Some("http://h/a.wav"));
        let encoded = f.encode();
        assert!(encoded.starts_with("data: {"));
        assert!(encoded.ends_with("\n\n"));
        let v: serde_json::Value = serde_json::from_str(f.payload()).unwrap();
        assert_eq!(v["event"], "message");
        assert_eq!(v["text"], "hello");
        assert_eq!(v["url"], "http://h/a.wav");
    }

    #[test]
    fn message_frame_with_no_audio_has_null_url() {
        let f = Frame::message("hi", None);
        let v: serde_json::Value = serde_json::from_str(f.payload()).unwrap();
        assert!(v["url"].is_null());
    }

    #[test]
    fn upstream_error_frame_carries_the_fallback_answer() {
        let f = Frame::upstream_error("status 502", "Sorry, please repeat that.", None);
        let v: serde_json::Value = serde_json::from_str(f.payload()).unwrap();
        assert_eq!(v["event"], "error");
        assert_eq!(v["detail"], "status 502");
        assert_eq!(v["answer"], "Sorry, please repeat that.");
        assert!(v["url"].is_null());
    }

    #[test]
    fn payload_roundtrip_through_cache_form() {
        let f = Frame::link(&LinkChunk {
            kind: LinkKind::Image,
            title: Some("cat".into()),
            url: "http://a/cat.png".into(),
        });
        let restored = Frame::from_payload(f.payload().to_string());
        assert_eq!(restored.encode(), f.encode());
    }
}
