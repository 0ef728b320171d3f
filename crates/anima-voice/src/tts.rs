//! Synthesis providers.
//!
//! A closed set of interchangeable backends, resolved once from
//! configuration at startup. Callers never select a provider per request;
//! they only supply text and a voice id.

use crate::error::{SpeechError, SpeechResult};
use anima_core::Settings;
use serde_json::json;

/// The configured synthesis backend.
pub enum TtsProvider {
    /// A fish-speech style HTTP service: JSON request, raw audio response.
    FishHttp(FishHttp),
    /// Any service exposing the OpenAI `/audio/speech` shape.
    OpenAiCompat(OpenAiCompat),
}

impl TtsProvider {
    /// Resolve the provider named in configuration. Unknown names fail at
    /// startup, not at request time.
    pub fn from_settings(client: reqwest::Client, settings: &Settings) -> SpeechResult<Self> {
        match settings.tts_service.as_str() {
            "fish-http" => Ok(Self::FishHttp(FishHttp {
                client,
                url: settings.tts_url.clone(),
                api_key: settings.tts_api_key.clone(),
            })),
            "openai" => Ok(Self::OpenAiCompat(OpenAiCompat {
                client,
                base_url: settings.tts_url.trim_end_matches('/').to_string(),
                api_key: settings.tts_api_key.clone().unwrap_or_default(),
            })),
            other => Err(SpeechError::UnknownProvider(other.to_string())),
        }
    }

    /// Raw audio bytes for `text` in `voice`. Format depends on provider;
    /// transcoding normalizes it afterwards.
    pub async fn synthesize_raw(&self, text: &str, voice: &str) -> SpeechResult<Vec<u8>> {
        match self {
            Self::FishHttp(p) => p.synthesize(text, voice).await,
            Self::OpenAiCompat(p) => p.synthesize(text, voice).await,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::FishHttp(_) => "fish-http",
            Self::OpenAiCompat(_) => "openai",
        }
    }
}

pub struct FishHttp {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl FishHttp {
    async fn synthesize(&self, text: &str, voice: &str) -> SpeechResult<Vec<u8>> {
        let mut req = self.client.post(&self.url).json(&json!({
            "text": text,
            "reference_id": voice,
            "format": "wav",
        }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(SpeechError::Backend {
                provider: "fish-http",
                detail: format!("status {}", resp.status()),
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

pub struct OpenAiCompat {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompat {
    async fn synthesize(&self, text: &str, voice: &str) -> SpeechResult<Vec<u8>> {
        let resp = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": "tts-1",
                "input": text,
                "voice": voice,
                "response_format": "wav",
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(SpeechError::Backend {
                provider: "openai",
                detail: format!("status {}", resp.status()),
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_service(name: &str) -> Settings {
        let mut s = Settings::from_env();
        s.tts_service = name.to_string();
        s
    }

    #[test]
    fn provider_resolution_is_closed() {
        let client = reqwest::Client::new();
        assert!(matches!(
            TtsProvider::from_settings(client.clone(), &settings_with_service("fish-http")),
            Ok(TtsProvider::FishHttp(_))
        ));
        assert!(matches!(
            TtsProvider::from_settings(client.clone(), &settings_with_service("openai")),
            Ok(TtsProvider::OpenAiCompat(_))
        ));
        assert!(matches!(
            TtsProvider::from_settings(client, &settings_with_service("espeak")),
            Err(SpeechError::UnknownProvider(_))
        ));
    }
}
