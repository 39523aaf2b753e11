//! Configuration management
//!
//! Values resolve as environment > TOML file > defaults.

pub mod file;

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use crate::context::{DEFAULT_ACK_GRACE, DEFAULT_ENHANCE_TIMEOUT, MIN_ENHANCE_TIMEOUT};
use crate::relay::{DEFAULT_UPSTREAM_URL, RelayConfig};
use crate::session::{ReconnectPolicy, SessionOptions};
use crate::transport::{AudioEncoding, DEFAULT_NEGOTIATION_TIMEOUT};
use crate::voice::{CaptureOptions, ProcessingOptions, SilenceConfig};
use crate::{Error, Result};

use self::file::VoicewireConfigFile;

/// Default relay endpoint for client sessions
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8788/realtime";

/// Voicewire configuration
#[derive(Debug)]
pub struct Config {
    /// Relay server configuration
    pub relay: RelayConfig,

    /// Client session configuration
    pub session: SessionConfig,

    /// Context delivery configuration
    pub context: ContextConfig,

    /// Capture and silence detection
    pub audio: AudioConfig,
}

/// Client session configuration
#[derive(Debug)]
pub struct SessionConfig {
    /// Relay realtime endpoint
    pub relay_url: Url,

    /// Bearer identity for credential minting (from `VOICEWIRE_IDENTITY`)
    pub identity: Option<SecretString>,

    pub model: String,
    pub voice: String,
    pub reconnect: ReconnectPolicy,

    /// Dial plus `connection.established` budget
    pub negotiation_timeout: Duration,

    pub audio_transport: AudioEncoding,
}

/// Context delivery configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextConfig {
    pub enhance_timeout: Duration,
    pub ack_grace: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            enhance_timeout: DEFAULT_ENHANCE_TIMEOUT,
            ack_grace: DEFAULT_ACK_GRACE,
        }
    }
}

/// Capture and silence detection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioConfig {
    pub capture: CaptureOptions,
    pub silence: SilenceConfig,

    /// Commit the input buffer when silence is detected
    pub commit_on_silence: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture: CaptureOptions::default(),
            silence: SilenceConfig::default(),
            commit_on_silence: true,
        }
    }
}

impl Config {
    /// Load configuration from the process environment and config file
    ///
    /// # Errors
    ///
    /// Returns error if a value is malformed or inconsistent
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::resolve(fc, |name| std::env::var(name).ok())
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is malformed or inconsistent
    pub fn resolve(fc: VoicewireConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let relay_defaults = RelayConfig::default();
        let session_defaults = SessionOptions::default();

        // Relay
        let upstream_url = parse_url(
            "upstream_url",
            &env("VOICEWIRE_UPSTREAM_URL")
                .or(fc.relay.upstream_url)
                .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string()),
        )?;
        let relay = RelayConfig {
            port: parse_env(&env, "VOICEWIRE_PORT")?
                .or(fc.relay.port)
                .unwrap_or(relay_defaults.port),
            upstream_url,
            upstream_api_key: env("OPENAI_API_KEY")
                .or(fc.relay.upstream_api_key)
                .map(SecretString::from),
            client_api_key: env("VOICEWIRE_API_KEY")
                .or(fc.relay.client_api_key)
                .map(SecretString::from),
            ping_interval: fc
                .relay
                .ping_interval_secs
                .map_or(relay_defaults.ping_interval, Duration::from_secs),
            credential_ttl: fc
                .relay
                .credential_ttl_secs
                .map_or(relay_defaults.credential_ttl, Duration::from_secs),
            default_model: fc
                .relay
                .default_model
                .unwrap_or(relay_defaults.default_model),
            default_voice: fc
                .relay
                .default_voice
                .unwrap_or(relay_defaults.default_voice),
        };
        if relay.ping_interval.is_zero() {
            return Err(Error::Config("ping_interval_secs must be positive".to_string()));
        }

        // Session
        let reconnect_defaults = ReconnectPolicy::default();
        let reconnect = ReconnectPolicy {
            max_attempts: parse_env(&env, "VOICEWIRE_MAX_ATTEMPTS")?
                .or(fc.session.max_attempts)
                .unwrap_or(reconnect_defaults.max_attempts),
            base_delay: fc
                .session
                .backoff_base_ms
                .map_or(reconnect_defaults.base_delay, Duration::from_millis),
            max_delay: fc
                .session
                .backoff_cap_ms
                .map_or(reconnect_defaults.max_delay, Duration::from_millis),
        };
        if reconnect.max_delay < reconnect.base_delay {
            return Err(Error::Config(format!(
                "backoff cap ({}ms) is below backoff base ({}ms)",
                reconnect.max_delay.as_millis(),
                reconnect.base_delay.as_millis()
            )));
        }

        let session = SessionConfig {
            relay_url: parse_url(
                "relay_url",
                &env("VOICEWIRE_RELAY_URL")
                    .or(fc.session.relay_url)
                    .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string()),
            )?,
            identity: env("VOICEWIRE_IDENTITY")
                .or(fc.session.identity)
                .map(SecretString::from),
            model: env("VOICEWIRE_MODEL")
                .or(fc.session.model)
                .unwrap_or(session_defaults.model),
            voice: env("VOICEWIRE_VOICE")
                .or(fc.session.voice)
                .unwrap_or(session_defaults.voice),
            reconnect,
            negotiation_timeout: fc
                .session
                .negotiation_timeout_ms
                .map_or(DEFAULT_NEGOTIATION_TIMEOUT, Duration::from_millis),
            audio_transport: fc.session.audio_transport.unwrap_or_default(),
        };

        // Context
        let mut enhance_timeout = parse_env::<u64>(&env, "VOICEWIRE_CONTEXT_TIMEOUT_MS")?
            .or(fc.context.enhance_timeout_ms)
            .map_or(DEFAULT_ENHANCE_TIMEOUT, Duration::from_millis);
        if enhance_timeout < MIN_ENHANCE_TIMEOUT {
            tracing::warn!(
                requested_ms = enhance_timeout.as_millis(),
                minimum_ms = MIN_ENHANCE_TIMEOUT.as_millis(),
                "context timeout below minimum, clamping"
            );
            enhance_timeout = MIN_ENHANCE_TIMEOUT;
        }
        let context = ContextConfig {
            enhance_timeout,
            ack_grace: fc
                .context
                .ack_grace_ms
                .map_or(DEFAULT_ACK_GRACE, Duration::from_millis),
        };

        // Audio
        let audio_defaults = AudioConfig::default();
        let audio = AudioConfig {
            capture: CaptureOptions {
                sample_rate: fc
                    .audio
                    .sample_rate
                    .unwrap_or(audio_defaults.capture.sample_rate),
                frame_samples: fc
                    .audio
                    .frame_samples
                    .unwrap_or(audio_defaults.capture.frame_samples),
                processing: ProcessingOptions {
                    echo_cancellation: fc
                        .audio
                        .echo_cancellation
                        .unwrap_or(audio_defaults.capture.processing.echo_cancellation),
                    noise_suppression: fc
                        .audio
                        .noise_suppression
                        .unwrap_or(audio_defaults.capture.processing.noise_suppression),
                    auto_gain: fc
                        .audio
                        .auto_gain
                        .unwrap_or(audio_defaults.capture.processing.auto_gain),
                },
            },
            silence: SilenceConfig {
                threshold: fc
                    .audio
                    .silence_threshold
                    .unwrap_or(audio_defaults.silence.threshold),
                silence_duration: fc
                    .audio
                    .silence_duration_ms
                    .map_or(audio_defaults.silence.silence_duration, Duration::from_millis),
                settle_delay: fc
                    .audio
                    .settle_delay_ms
                    .map_or(audio_defaults.silence.settle_delay, Duration::from_millis),
            },
            commit_on_silence: fc
                .audio
                .commit_on_silence
                .unwrap_or(audio_defaults.commit_on_silence),
        };
        if audio.capture.sample_rate == 0 || audio.capture.frame_samples == 0 {
            return Err(Error::Config(
                "sample_rate and frame_samples must be positive".to_string(),
            ));
        }

        Ok(Self {
            relay,
            session,
            context,
            audio,
        })
    }

    /// Session controller tuning derived from this configuration
    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            model: self.session.model.clone(),
            voice: self.session.voice.clone(),
            reconnect: self.session.reconnect,
            silence: self.audio.silence,
            commit_on_silence: self.audio.commit_on_silence,
        }
    }
}

fn parse_env<T: FromStr>(env: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>> {
    env(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| Error::Config(format!("{name} is not valid: {raw}")))
        })
        .transpose()
}

fn parse_url(field: &str, raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| Error::Config(format!("invalid {field} '{raw}': {e}")))
}
