//! Voice layer of the pipeline: the speech-to-text gateway, the closed set
//! of synthesis providers, ffmpeg post-processing, durable audio storage,
//! and provenance recording.

pub mod error;
pub mod provenance;
pub mod store;
pub mod stt;
pub mod synth;
pub mod transcode;
pub mod tts;

pub use error::{SpeechError, SpeechResult};
pub use provenance::{AudioRecord, NullSink, ProvenanceSink, SqliteProvenance};
pub use store::{AudioStore, StoredAudio};
pub use stt::{HttpSttBackend, SttBackend, SttGateway, Transcript};
pub use synth::SynthesisAdapter;
pub use transcode::Transcoder;
pub use tts::TtsProvider;
