//! TOML configuration file loading
//!
//! Supports `~/.config/voicewire/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::transport::AudioEncoding;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoicewireConfigFile {
    /// Relay server configuration
    #[serde(default)]
    pub relay: RelayFileConfig,

    /// Client session configuration
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Context delivery configuration
    #[serde(default)]
    pub context: ContextFileConfig,

    /// Capture and silence detection
    #[serde(default)]
    pub audio: AudioFileConfig,
}

/// Relay server configuration
#[derive(Debug, Default, Deserialize)]
pub struct RelayFileConfig {
    /// Listen port
    pub port: Option<u16>,

    /// Upstream realtime endpoint (e.g. "wss://api.openai.com/v1/realtime")
    pub upstream_url: Option<String>,

    /// Upstream service key
    pub upstream_api_key: Option<String>,

    /// Identity required to mint session credentials
    pub client_api_key: Option<String>,

    pub ping_interval_secs: Option<u64>,
    pub credential_ttl_secs: Option<u64>,
    pub default_model: Option<String>,
    pub default_voice: Option<String>,
}

/// Client session configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Relay realtime endpoint (e.g. "ws://127.0.0.1:8788/realtime")
    pub relay_url: Option<String>,

    /// Bearer identity presented when minting credentials
    pub identity: Option<String>,

    pub model: Option<String>,
    pub voice: Option<String>,

    /// Reconnect attempts after a failure (0 disables retries)
    pub max_attempts: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_cap_ms: Option<u64>,
    pub negotiation_timeout_ms: Option<u64>,

    /// "base64_json" or "binary"
    pub audio_transport: Option<AudioEncoding>,
}

/// Context delivery configuration
#[derive(Debug, Default, Deserialize)]
pub struct ContextFileConfig {
    /// Enhanced context assembly budget (minimum 2500)
    pub enhance_timeout_ms: Option<u64>,

    /// Wait for `session.updated` before assuming implicit delivery
    pub ack_grace_ms: Option<u64>,
}

/// Capture and silence detection
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub sample_rate: Option<u32>,
    pub frame_samples: Option<usize>,
    pub silence_threshold: Option<f32>,
    pub silence_duration_ms: Option<u64>,
    pub settle_delay_ms: Option<u64>,
    pub commit_on_silence: Option<bool>,
    pub echo_cancellation: Option<bool>,
    pub noise_suppression: Option<bool>,
    pub auto_gain: Option<bool>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoicewireConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VoicewireConfigFile {
    let Some(path) = config_file_path() else {
        return VoicewireConfigFile::default();
    };

    if !path.exists() {
        return VoicewireConfigFile::default();
    }

    load_from(&path)
}

/// Load a config file from an explicit path, falling back to defaults
pub fn load_from(path: &Path) -> VoicewireConfigFile {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VoicewireConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VoicewireConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/voicewire/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voicewire").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let file: VoicewireConfigFile = toml::from_str(
            r#"
            [relay]
            port = 9000

            [session]
            max_attempts = 5
            audio_transport = "binary"

            [audio]
            commit_on_silence = false
            "#,
        )
        .unwrap();

        assert_eq!(file.relay.port, Some(9000));
        assert_eq!(file.relay.upstream_url, None);
        assert_eq!(file.session.max_attempts, Some(5));
        assert_eq!(file.session.audio_transport, Some(AudioEncoding::Binary));
        assert_eq!(file.audio.commit_on_silence, Some(false));
        assert_eq!(file.context.enhance_timeout_ms, None);
    }

    #[test]
    fn empty_file_is_default() {
        let file: VoicewireConfigFile = toml::from_str("").unwrap();
        assert_eq!(file.relay.port, None);
        assert_eq!(file.session.relay_url, None);
    }

    #[test]
    fn unreadable_file_falls_back() {
        let file = load_from(Path::new("/nonexistent/voicewire/config.toml"));
        assert_eq!(file.relay.port, None);
    }
}
