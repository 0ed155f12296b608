//! Configuration loading from environment variables.
//!
//! Values are intentionally validated early so startup fails fast with
//! actionable errors; the process aborts when a provider credential is
//! missing.

use crate::error::AppError;
use std::env;

/// Default ElevenLabs voice ("Rachel").
pub const DEFAULT_TTS_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";
/// Default ElevenLabs synthesis model.
pub const DEFAULT_TTS_MODEL_ID: &str = "eleven_multilingual_v2";
/// Default Gemini model used for analysis and chat.
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
/// Default JWKS cache lifetime in seconds.
pub const DEFAULT_JWKS_CACHE_SECS: u64 = 300;

/// Runtime configuration for the HTTP server, store, and provider clients.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Host interface to bind, for example `127.0.0.1`.
    pub host: String,
    /// TCP port to bind.
    pub port: u16,
    /// Path to the SQLite database file.
    pub database_path: String,
    /// Directory for audio uploads and synthesized output.
    pub upload_dir: String,
    /// ElevenLabs API key (speech-to-text and text-to-speech).
    pub elevenlabs_api_key: String,
    /// Gemini API key (incident analysis and chat).
    pub gemini_api_key: String,
    /// Gemini model identifier.
    pub gemini_model: String,
    /// Auth0 tenant domain, for example `my-tenant.us.auth0.com`.
    pub auth0_domain: String,
    /// Expected `aud` claim of incoming access tokens.
    pub auth0_audience: String,
    /// Optional client id for the Auth0 Management API (`/users` listing).
    pub auth0_client_id: Option<String>,
    /// Optional client secret for the Auth0 Management API.
    pub auth0_client_secret: Option<String>,
    /// ElevenLabs voice id used by text-to-speech.
    pub tts_voice_id: String,
    /// ElevenLabs model id used by text-to-speech.
    pub tts_model_id: String,
    /// Lifetime of a fetched JWKS before it is refetched.
    pub jwks_cache_secs: u64,
}

impl AppConfig {
    /// Builds configuration from environment variables.
    ///
    /// Variables:
    /// - `HOST` (default `127.0.0.1`)
    /// - `PORT` (default `8000`)
    /// - `DATABASE_PATH` (default `shesafe.db`)
    /// - `UPLOAD_DIR` (default `uploads`)
    /// - `ELEVENLABS_API_KEY` (required)
    /// - `GEMINI_API_KEY` (required)
    /// - `GEMINI_MODEL` (default `gemini-2.5-flash`)
    /// - `AUTH0_DOMAIN` (required)
    /// - `AUTH0_AUDIENCE` (required)
    /// - `AUTH0_CLIENT_ID` / `AUTH0_CLIENT_SECRET` (optional)
    /// - `TTS_VOICE_ID` / `TTS_MODEL_ID` (optional overrides)
    /// - `JWKS_CACHE_SECS` (default `300`)
    pub fn from_env() -> Result<Self, AppError> {
        Ok(Self {
            host: env_str("HOST", "127.0.0.1"),
            port: env_u16("PORT", 8000)?,
            database_path: env_str("DATABASE_PATH", "shesafe.db"),
            upload_dir: env_str("UPLOAD_DIR", "uploads"),
            elevenlabs_api_key: env_required("ELEVENLABS_API_KEY")?,
            gemini_api_key: env_required("GEMINI_API_KEY")?,
            gemini_model: env_str("GEMINI_MODEL", DEFAULT_GEMINI_MODEL),
            auth0_domain: env_required("AUTH0_DOMAIN")?,
            auth0_audience: env_required("AUTH0_AUDIENCE")?,
            auth0_client_id: env_opt("AUTH0_CLIENT_ID"),
            auth0_client_secret: env_opt("AUTH0_CLIENT_SECRET"),
            tts_voice_id: env_str("TTS_VOICE_ID", DEFAULT_TTS_VOICE_ID),
            tts_model_id: env_str("TTS_MODEL_ID", DEFAULT_TTS_MODEL_ID),
            jwks_cache_secs: env_u64("JWKS_CACHE_SECS", DEFAULT_JWKS_CACHE_SECS)?,
        })
    }

    /// Token issuer derived from the Auth0 domain.
    pub fn auth0_issuer(&self) -> String {
        format!("https://{}/", self.auth0_domain)
    }

    /// JWKS document URL for the Auth0 tenant.
    pub fn jwks_url(&self) -> String {
        format!("https://{}/.well-known/jwks.json", self.auth0_domain)
    }
}

fn env_str(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                default.to_string()
            } else {
                trimmed.to_string()
            }
        }
        Err(_) => default.to_string(),
    }
}

fn env_opt(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Err(_) => None,
    }
}

fn env_required(name: &str) -> Result<String, AppError> {
    env_opt(name).ok_or_else(|| {
        AppError::internal(format!("{name} not set; refusing to start without it"))
    })
}

fn env_u16(name: &str, default: u16) -> Result<u16, AppError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    parse_u16(name, &raw)
}

fn parse_u16(name: &str, raw: &str) -> Result<u16, AppError> {
    let parsed = raw.trim().parse::<u16>().map_err(|_| {
        AppError::internal(format!("invalid {name}={raw:?}; expected integer 1-65535"))
    })?;
    if parsed == 0 {
        return Err(AppError::internal(format!(
            "invalid {name}={raw:?}; expected > 0"
        )));
    }
    Ok(parsed)
}

fn env_u64(name: &str, default: u64) -> Result<u64, AppError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    parse_u64(name, &raw)
}

fn parse_u64(name: &str, raw: &str) -> Result<u64, AppError> {
    raw.trim().parse::<u64>().map_err(|_| {
        AppError::internal(format!("invalid {name}={raw:?}; expected an integer"))
    })
}

#[cfg(test)]
mod tests {
    use super::{parse_u16, parse_u64};

    #[test]
    fn parse_u16_accepts_valid_port() {
        assert_eq!(parse_u16("PORT", "8000").unwrap(), 8000);
        assert_eq!(parse_u16("PORT", " 443 ").unwrap(), 443);
    }

    #[test]
    fn parse_u16_rejects_zero_and_garbage() {
        assert!(parse_u16("PORT", "0").is_err());
        assert!(parse_u16("PORT", "http").is_err());
        assert!(parse_u16("PORT", "70000").is_err());
    }

    #[test]
    fn parse_u64_rejects_non_numeric_value() {
        assert_eq!(parse_u64("JWKS_CACHE_SECS", "300").unwrap(), 300);
        assert!(parse_u64("JWKS_CACHE_SECS", "soon").is_err());
    }
}
