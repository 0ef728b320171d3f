//! Stream segmentation: turns raw LLM answer deltas into ordered chunks.
//!
//! Two states. In `Prose`, text feeds a display accumulator (formatting
//! preserved) and a speakable accumulator (markup stripped) in parallel;
//! a synthesis trigger fires when the speakable text ends in terminal
//! punctuation and has reached the configured minimum length. When a delta
//! contains a markdown link marker or a bare URL scheme the machine moves
//! to `LinkCollecting` and buffers until the link closes; link bytes never
//! reach either accumulator. Deltas may split anywhere, including inside a
//! marker, so a possible marker prefix at the end of a delta is held back
//! until the next delta disambiguates it.

use crate::chunk::{LinkChunk, LinkKind};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

/// What a pushed delta produced, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentOutput {
    /// Trigger fired: both accumulators, already reset in the engine.
    Speak { display: String, speakable: String },
    /// A completed link, classified by extension. Image links still need
    /// an existence probe before emission.
    Link(LinkChunk),
}

enum Mode {
    Prose,
    LinkCollecting { buf: String },
}

/// Characters stripped from the speakable accumulator. The display
/// accumulator keeps them so clients can render markdown.
const SPEAKABLE_STRIP: &[char] = &['*', '#', '`', '~', '_', '>'];

static MD_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^!?\[([^\]]*)\]\(([^)\s]+)\)").unwrap());
static LIST_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+\.|-)\s").unwrap());
static PREFIX_PARAM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[?&]prefix=([^&\s]+)").unwrap());

/// Stateful segmentation engine for one answer stream.
pub struct Segmenter {
    min_chars: usize,
    terminators: Vec<char>,
    display: String,
    speakable: String,
    mode: Mode,
    /// Trailing bytes of the last delta that may open a link marker.
    hold: String,
}

impl Segmenter {
    pub fn new(min_chars: usize, terminators: Vec<char>) -> Self {
        Self {
            min_chars,
            terminators,
            display: String::new(),
            speakable: String::new(),
            mode: Mode::Prose,
            hold: String::new(),
        }
    }

    /// Feed one answer delta; returns chunks completed by it, in order.
    pub fn push_delta(&mut self, delta: &str) -> Vec<SegmentOutput> {
        let mut out = Vec::new();
        let input = format!("{}{}", std::mem::take(&mut self.hold), delta);
        self.consume(&input, false, &mut out);
        out
    }

    /// End of stream: close any open link, then flush residual prose
    /// regardless of length or punctuation. Empty-after-cleanup residue is
    /// dropped.
    pub fn finish(&mut self) -> Vec<SegmentOutput> {
        let mut out = Vec::new();
        let input = std::mem::take(&mut self.hold);
        self.consume(&input, true, &mut out);
        if let Mode::LinkCollecting { buf } = std::mem::replace(&mut self.mode, Mode::Prose) {
            match parse_link(&buf) {
                Some(link) => out.push(SegmentOutput::Link(link)),
                // An unclosed marker was ordinary text after all.
                None => self.append_prose(&buf),
            }
        }
        if !self.display.trim().is_empty() {
            out.push(SegmentOutput::Speak {
                display: std::mem::take(&mut self.display).trim().to_string(),
                speakable: std::mem::take(&mut self.speakable).trim().to_string(),
            });
        } else {
            self.display.clear();
            self.speakable.clear();
        }
        out
    }

    fn consume(&mut self, input: &str, at_end: bool, out: &mut Vec<SegmentOutput>) {
        let mut current = input.to_string();
        loop {
            match &mut self.mode {
                Mode::Prose => match find_marker(&current) {
                    Some(pos) => {
                        let rest = current.split_off(pos);
                        self.append_prose_with_trigger(&current, out);
                        self.mode = Mode::LinkCollecting { buf: String::new() };
                        current = rest;
                    }
                    None => {
                        let cut = if at_end {
                            current.len()
                        } else {
                            current.len() - marker_prefix_len(&current)
                        };
                        let tail = current.split_off(cut);
                        self.append_prose_with_trigger(&current, out);
                        self.hold = tail;
                        return;
                    }
                },
                Mode::LinkCollecting { buf } => {
                    buf.push_str(&current);
                    match link_end(buf) {
                        LinkEnd::Complete(end) => {
                            let raw: String = buf.drain(..end).collect();
                            current = std::mem::take(buf);
                            self.mode = Mode::Prose;
                            match parse_link(&raw) {
                                Some(link) => out.push(SegmentOutput::Link(link)),
                                None => self.append_prose_with_trigger(&raw, out),
                            }
                            if current.is_empty() {
                                return;
                            }
                        }
                        LinkEnd::NotALink => {
                            // The opening bracket was ordinary text; emit it
                            // and rescan the rest for later markers.
                            let raw = std::mem::take(buf);
                            self.mode = Mode::Prose;
                            let mut chars = raw.chars();
                            if let Some(first) = chars.next() {
                                self.append_prose_with_trigger(
                                    first.encode_utf8(&mut [0u8; 4]),
                                    out,
                                );
                            }
                            current = chars.as_str().to_string();
                            if current.is_empty() {
                                return;
                            }
                        }
                        LinkEnd::Pending => return,
                    }
                }
            }
        }
    }

    fn append_prose_with_trigger(&mut self, text: &str, out: &mut Vec<SegmentOutput>) {
        if text.is_empty() {
            return;
        }
        self.append_prose(text);
        let speakable_len = self.speakable.chars().count();
        let ends_terminal = self
            .speakable
            .chars()
            .last()
            .is_some_and(|c| self.terminators.contains(&c));
        if ends_terminal && speakable_len >= self.min_chars {
            out.push(SegmentOutput::Speak {
                display: std::mem::take(&mut self.display).trim().to_string(),
                speakable: std::mem::take(&mut self.speakable).trim().to_string(),
            });
        }
    }

    fn append_prose(&mut self, text: &str) {
        // Forced break before a list marker keeps client-side numbering
        // from running into the previous sentence.
        if LIST_MARKER.is_match(text.trim_start())
            && !self.display.is_empty()
            && !self.display.ends_with('\n')
        {
            self.display.push('\n');
        }
        self.display.push_str(text);
        for c in text.chars() {
            if SPEAKABLE_STRIP.contains(&c) {
                continue;
            }
            self.speakable.push(if c == '\n' { ' ' } else { c });
        }
    }
}

/// Markers that open link collection.
const SCHEMES: [&str; 2] = ["http://", "https://"];

fn find_marker(s: &str) -> Option<usize> {
    let mut best: Option<usize> = None;
    for pat in ["![", "["].iter().chain(SCHEMES.iter()) {
        if let Some(i) = s.find(pat) {
            // "![" and "[" overlap at the same link; prefer the earlier
            // (and for equal starts, the longer "![").
            best = Some(match best {
                Some(b) if b <= i => b,
                _ => i,
            });
        }
    }
    best
}

/// Length of the longest suffix of `s` that could still grow into a marker.
fn marker_prefix_len(s: &str) -> usize {
    let max = s.len().min(8);
    for take in (1..=max).rev() {
        if !s.is_char_boundary(s.len() - take) {
            continue;
        }
        let suffix = &s[s.len() - take..];
        let opens = ["![", "[", "http://", "https://"]
            .iter()
            .any(|m| m.starts_with(suffix));
        if opens {
            return take;
        }
    }
    0
}

enum LinkEnd {
    /// Byte offset one past the end of the link text.
    Complete(usize),
    /// The buffer can no longer become a link.
    NotALink,
    /// Need more input.
    Pending,
}

fn link_end(buf: &str) -> LinkEnd {
    if buf.starts_with('[') || buf.starts_with("![") {
        // Markdown form: complete at the ')' closing "](...)".
        if let Some(close) = buf.find(']') {
            match buf[close..].chars().nth(1) {
                Some('(') => match buf[close..].find(')') {
                    Some(p) => LinkEnd::Complete(close + p + 1),
                    None => LinkEnd::Pending,
                },
                // "]x" with no paren: bracketed text, not a link.
                Some(_) => LinkEnd::NotALink,
                None => LinkEnd::Pending,
            }
        } else {
            LinkEnd::Pending
        }
    } else {
        // Bare URL: ends at the first whitespace or closing bracket.
        match buf.find(|c: char| c.is_whitespace() || c == ')' || c == ']' || c == '"') {
            Some(p) => LinkEnd::Complete(p),
            None => LinkEnd::Pending,
        }
    }
}

/// Parse a collected buffer into a link. Strips the upload artifact
/// `&version_id=null` and prefers a `prefix=` query parameter as title.
fn parse_link(raw: &str) -> Option<LinkChunk> {
    let (title, url) = if let Some(c) = MD_LINK.captures(raw) {
        let t = c[1].trim().to_string();
        (if t.is_empty() { None } else { Some(t) }, c[2].to_string())
    } else if SCHEMES.iter().any(|s| raw.starts_with(s)) {
        (None, raw.trim().to_string())
    } else {
        return None;
    };
    let url = url.replace("&version_id=null", "");
    let title = PREFIX_PARAM
        .captures(&url)
        .map(|c| c[1].to_string())
        .or(title);
    if url.is_empty() {
        return None;
    }
    Some(LinkChunk {
        kind: LinkKind::from_url(&url),
        title,
        url,
    })
}

/// Existence check for extracted image links. Suspected-dead links are
/// dropped silently instead of being sent to the client.
#[async_trait]
pub trait LinkProber: Send + Sync {
    async fn exists(&self, url: &str) -> bool;
}

/// Probes with a one-byte ranged GET so large images cost nothing.
pub struct HttpLinkProber {
    client: reqwest::Client,
}

impl HttpLinkProber {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LinkProber for HttpLinkProber {
    async fn exists(&self, url: &str) -> bool {
        match self
            .client
            .get(url)
            .header(reqwest::header::RANGE, "bytes=0-0")
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                tracing::debug!(url, %err, "image probe failed");
                false
            }
        }
    }
}

/// Probe that accepts everything. Used when probing is disabled and in
/// tests.
pub struct TrustingProber;

#[async_trait]
impl LinkProber for TrustingProber {
    async fn exists(&self, _url: &str) -> bool {
        true
    }
}
