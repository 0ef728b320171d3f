//! Core of the conversational pipeline: configuration, session state, the
//! stream segmentation engine, the upstream LLM client, and the SSE replay
//! cache. Voice concerns (STT, TTS, transcoding) live in `anima-voice`; the
//! HTTP surface lives in the gateway.

pub mod cache;
pub mod chunk;
pub mod config;
pub mod error;
pub mod llm;
pub mod normalize;
pub mod replay;
pub mod segment;
pub mod session;
pub mod suggest;

pub use cache::{KvStore, MemoryStore};
pub use chunk::{Frame, LinkChunk, LinkKind};
pub use config::Settings;
pub use error::{CoreError, CoreResult};
pub use llm::{ChatRequest, LlmClient, LlmEvent};
pub use replay::{cache_key, ReplayCache, ReplayWriter, END_OF_STREAM};
pub use segment::{HttpLinkProber, LinkProber, Segmenter, SegmentOutput, TrustingProber};
pub use session::{RoundState, SessionStore};
pub use suggest::SuggestedSet;
