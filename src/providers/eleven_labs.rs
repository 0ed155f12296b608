//! ElevenLabs client covering speech-to-text, text-to-speech, and the voice
//! catalog.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::providers::{SpeechSynthesizer, Transcriber, Voice};

const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io";
/// Speech-to-text model used for incident audio.
const STT_MODEL_ID: &str = "scribe_v1";

/// Thin client for the ElevenLabs HTTP API.
pub struct ElevenLabsClient {
    client: reqwest::Client,
    api_key: String,
    voice_id: String,
    model_id: String,
}

#[derive(Debug, Deserialize)]
struct SpeechToTextResponse {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct VoicesResponse {
    #[serde(default)]
    voices: Vec<VoiceEntry>,
}

#[derive(Debug, Deserialize)]
struct VoiceEntry {
    voice_id: String,
    #[serde(default)]
    name: String,
}

impl ElevenLabsClient {
    pub fn new(client: reqwest::Client, cfg: &AppConfig) -> Self {
        Self {
            client,
            api_key: cfg.elevenlabs_api_key.clone(),
            voice_id: cfg.tts_voice_id.clone(),
            model_id: cfg.tts_model_id.clone(),
        }
    }
}

fn url(path: &str) -> String {
    format!("{DEFAULT_BASE_URL}{path}")
}

#[async_trait]
impl Transcriber for ElevenLabsClient {
    async fn transcribe(&self, path: &Path) -> Result<String, AppError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|err| AppError::internal(format!("failed to read upload {path:?}: {err}")))?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());

        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model_id", STT_MODEL_ID);

        let response = self
            .client
            .post(url("/v1/speech-to-text"))
            .header("xi-api-key", &self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|err| AppError::upstream(format!("transcription request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::upstream(format!(
                "transcription returned {status}: {detail}"
            )));
        }

        let parsed: SpeechToTextResponse = response
            .json()
            .await
            .map_err(|err| AppError::upstream(format!("invalid transcription response: {err}")))?;

        Ok(parsed.text)
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsClient {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, AppError> {
        let response = self
            .client
            .post(url(&format!("/v1/text-to-speech/{}", self.voice_id)))
            .header("xi-api-key", &self.api_key)
            .header("accept", "audio/mpeg")
            .json(&json!({ "text": text, "model_id": self.model_id }))
            .send()
            .await
            .map_err(|err| AppError::upstream(format!("synthesis request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::upstream(format!(
                "synthesis returned {status}: {detail}"
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| AppError::upstream(format!("failed to read audio bytes: {err}")))?;
        Ok(bytes.to_vec())
    }

    async fn list_voices(&self) -> Result<Vec<Voice>, AppError> {
        let response = self
            .client
            .get(url("/v1/voices"))
            .header("xi-api-key", &self.api_key)
            .send()
            .await
            .map_err(|err| AppError::upstream(format!("voice listing failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::upstream(format!(
                "voice listing returned {status}: {detail}"
            )));
        }

        let parsed: VoicesResponse = response
            .json()
            .await
            .map_err(|err| AppError::upstream(format!("invalid voices response: {err}")))?;

        Ok(parsed
            .voices
            .into_iter()
            .map(|entry| Voice {
                id: entry.voice_id,
                name: entry.name,
            })
            .collect())
    }
}
