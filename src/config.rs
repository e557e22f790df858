use anyhow::{Context, Result};
use serde::Deserialize;

use crate::session::SessionConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub stt: SttConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub nats: NatsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// When false every connection is admitted as the `local` user
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// HS256 secret used to validate connection tokens
    #[serde(default)]
    pub jwt_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            jwt_secret: String::new(),
        }
    }
}

/// Which speech-to-text backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SttBackendKind {
    Http,
    Nats,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SttConfig {
    #[serde(default = "default_stt_backend")]
    pub backend: SttBackendKind,
    #[serde(default = "default_stt_url")]
    pub base_url: String,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            backend: default_stt_backend(),
            base_url: default_stt_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_num_ctx")]
    pub num_ctx: u32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_url(),
            model: default_llm_model(),
            temperature: default_temperature(),
            num_ctx: default_num_ctx(),
            system_prompt: default_system_prompt(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "default_tts_url")]
    pub url: String,
    /// MIME type reported in `tts_audio_chunk` messages
    #[serde(default = "default_tts_format")]
    pub format: String,
    /// Size of each outbound audio chunk
    #[serde(default = "default_tts_chunk_bytes")]
    pub chunk_bytes: usize,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: default_tts_url(),
            format: default_tts_format(),
            chunk_bytes: default_tts_chunk_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_nats_url")]
    pub url: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
        }
    }
}

impl Config {
    /// Load a TOML file, overlaid with `VOICE_GATEWAY__SECTION__KEY` env vars
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("VOICE_GATEWAY")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("Failed to read config from {}", path))?;

        settings
            .try_deserialize()
            .context("Failed to parse gateway config")
    }
}

fn default_true() -> bool {
    true
}

fn default_stt_backend() -> SttBackendKind {
    SttBackendKind::Http
}

fn default_stt_url() -> String {
    "http://localhost:8009".to_string()
}

fn default_llm_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "llama3.1".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_num_ctx() -> u32 {
    4096
}

fn default_system_prompt() -> String {
    "You are a concise personal voice assistant. Answer in the user's language.".to_string()
}

fn default_tts_url() -> String {
    "http://localhost:8010/api/tts/".to_string()
}

fn default_tts_format() -> String {
    "audio/wav".to_string()
}

fn default_tts_chunk_bytes() -> usize {
    32 * 1024
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_load_minimal_file_uses_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[service]
name = "voice-gateway"

[service.http]
bind = "127.0.0.1"
port = 8080

[auth]
jwt_secret = "secret"

[session]
silence_timeout_ms = 900
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let cfg = Config::load(&path).unwrap();

        assert_eq!(cfg.service.http.port, 8080);
        assert!(cfg.auth.enabled);
        assert_eq!(cfg.auth.jwt_secret, "secret");
        assert_eq!(cfg.session.silence_timeout(), Duration::from_millis(900));
        assert_eq!(cfg.stt.backend, SttBackendKind::Http);
        assert_eq!(cfg.tts.format, "audio/wav");
        assert_eq!(cfg.llm.num_ctx, 4096);
    }
}
