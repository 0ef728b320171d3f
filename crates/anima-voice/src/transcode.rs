//! ffmpeg post-processing for synthesized audio.
//!
//! Every provider's raw output goes through one ffmpeg pass: resample to
//! 16 kHz mono PCM and apply the playback-rate multiplier. ffmpeg is
//! CPU-bound, so jobs run behind a bounded semaphore instead of saturating
//! the runtime. Temporary files are owned by `NamedTempFile` guards and are
//! removed on every exit path, including errors.

use crate::error::{SpeechError, SpeechResult};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct Transcoder {
    workers: Arc<Semaphore>,
}

impl Transcoder {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Convert raw provider audio into speakable WAV: 16 kHz, mono,
    /// pcm_s16le, with tempo scaled by `speed`.
    pub async fn to_speech_wav(&self, input: &[u8], speed: f32) -> SpeechResult<Vec<u8>> {
        let _slot = self
            .workers
            .acquire()
            .await
            .map_err(|_| SpeechError::Transcode("worker pool closed".into()))?;

        // atempo only accepts 0.5..=2.0 in a single filter pass.
        let speed = speed.clamp(0.5, 2.0);

        let in_file = tempfile::Builder::new().suffix(".audio").tempfile()?;
        let out_file = tempfile::Builder::new().suffix(".wav").tempfile()?;
        tokio::fs::write(in_file.path(), input).await?;

        let output = Command::new("ffmpeg")
            .arg("-y")
            .arg("-i")
            .arg(in_file.path())
            .arg("-filter:a")
            .arg(format!("atempo={speed}"))
            .arg("-ar")
            .arg("16000")
            .arg("-ac")
            .arg("1")
            .arg("-acodec")
            .arg("pcm_s16le")
            .arg(out_file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SpeechError::Transcode(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr.lines().last().unwrap_or_default()
            )));
        }

        let bytes = tokio::fs::read(out_file.path()).await?;
        if bytes.is_empty() {
            return Err(SpeechError::Transcode("ffmpeg produced no output".into()));
        }
        Ok(bytes)
    }
}
