//! Provider abstractions for the external AI services.
//!
//! The HTTP layer depends on these traits instead of concrete clients, which
//! keeps request handling decoupled from any single vendor and lets tests
//! substitute mocks.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::AppConfig;
use crate::error::AppError;

pub mod eleven_labs;
pub mod gemini;

/// Converts an already-persisted audio file to text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribes the file at `path`. Failures are opaque upstream errors;
    /// the caller owns deletion of the file on every outcome.
    async fn transcribe(&self, path: &Path) -> Result<String, AppError>;
}

/// Produces free-form text from a prompt. Single attempt, no streaming.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, AppError>;
}

/// An available synthesis voice, as listed by the speech provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Voice {
    pub id: String,
    pub name: String,
}

/// Converts text to synthesized audio. Voice and model are fixed at
/// construction, not configurable per call.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, AppError>;
    async fn list_voices(&self) -> Result<Vec<Voice>, AppError>;
}

/// Concrete provider clients wired from configuration.
pub struct Providers {
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn TextGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

/// Builds the provider clients, sharing a single HTTP client between them.
pub fn build_providers(cfg: &AppConfig) -> Result<Providers, AppError> {
    let http = reqwest::Client::builder()
        .build()
        .map_err(|err| AppError::internal(format!("failed to create HTTP client: {err}")))?;

    let eleven = Arc::new(eleven_labs::ElevenLabsClient::new(http.clone(), cfg));
    let gemini = Arc::new(gemini::GeminiClient::new(http, cfg));

    Ok(Providers {
        transcriber: eleven.clone(),
        generator: gemini,
        synthesizer: eleven,
    })
}
