//! Error types for voicewire

use thiserror::Error;

use crate::transport::FailureKind;

/// Result type alias for voicewire operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the realtime session subsystem
#[derive(Debug, Error)]
pub enum Error {
    /// Caller has no valid identity
    #[error("auth error: {0}")]
    Auth(String),

    /// Credential lifetime below the acceptance floor
    #[error("credential expires too soon ({remaining_ms} ms remaining)")]
    CredentialExpiry {
        /// Remaining lifetime at acquisition, negative when already expired
        remaining_ms: i64,
    },

    /// Credential service or model service unreachable or malformed
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Audio hardware failure
    #[error("audio device error: {0}")]
    Device(String),

    /// Microphone access denied
    #[error("audio permission denied: {0}")]
    Permission(String),

    /// Audio encode/decode error
    #[error("audio error: {0}")]
    Audio(String),

    /// Negotiation or context assembly timed out
    #[error("timed out: {0}")]
    Timeout(String),

    /// Remote side closed the transport
    #[error("remote closed: {0}")]
    RemoteClosed(String),

    /// Malformed upgrade or message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Reconnect budget spent
    #[error("connection attempts exhausted after {attempts} retries")]
    ConnectionExhausted {
        /// Number of reconnect attempts performed
        attempts: u32,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// URL parsing error
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

impl Error {
    /// Classify a connect/negotiate failure for the reconnection policy
    #[must_use]
    pub fn failure_kind(&self) -> FailureKind {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match self {
            Self::Timeout(_) => FailureKind::Timeout,
            Self::RemoteClosed(_) | Self::Io(_) => FailureKind::RemoteClosed,
            Self::WebSocket(WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Io(_)) => {
                FailureKind::RemoteClosed
            }
            Self::Http(e) if e.is_timeout() => FailureKind::Timeout,
            _ => FailureKind::ProtocolError,
        }
    }

    /// Whether the reconnection policy may retry after this error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Auth(_)
                | Self::Config(_)
                | Self::Device(_)
                | Self::Permission(_)
                | Self::ConnectionExhausted { .. }
        )
    }

    /// Whether this error comes from the audio hardware
    #[must_use]
    pub const fn is_audio_device(&self) -> bool {
        matches!(self, Self::Device(_) | Self::Permission(_))
    }
}
