//! Session lifecycle
//!
//! The [`SessionController`] owns the one live [`Session`], drives the
//! transport and context protocols, and supervises reconnection. Callers
//! observe it through a four-state [`SessionStatus`] and a stream of
//! [`SessionUpdate`] notifications.

mod controller;
mod reconnect;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use controller::{ConnectRequest, SessionController, SessionOptions, SessionParts};
pub use reconnect::{ReconnectPolicy, ReconnectState};

use crate::context::DeliveryOutcome;

/// Caller-supplied progress value, opaque to this subsystem
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    #[default]
    Exploration,
    Analysis,
    Reflection,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exploration => write!(f, "exploration"),
            Self::Analysis => write!(f, "analysis"),
            Self::Reflection => write!(f, "reflection"),
        }
    }
}

impl std::str::FromStr for SessionPhase {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_lowercase().as_str() {
            "exploration" => Ok(Self::Exploration),
            "analysis" => Ok(Self::Analysis),
            "reflection" => Ok(Self::Reflection),
            other => Err(crate::Error::Config(format!("unknown session phase: {other}"))),
        }
    }
}

/// One logical conversation; destroyed on disconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    pub phase: SessionPhase,
    pub started_at: DateTime<Utc>,
}

impl Session {
    #[must_use]
    pub fn new(phase: SessionPhase) -> Self {
        Self {
            id: Uuid::new_v4(),
            phase,
            started_at: Utc::now(),
        }
    }
}

/// Reconnect progress shown while connecting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconnectAttempt {
    /// One-based reconnect attempt number
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Public status contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SessionStatus {
    Disconnected,
    /// First attempt when `attempt` is `None`, otherwise a reconnect
    Connecting { attempt: Option<ReconnectAttempt> },
    Connected,
    /// Terminal until the caller connects again
    Failed { reason: String },
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting { attempt: None } => write!(f, "connecting"),
            Self::Connecting {
                attempt: Some(a),
            } => write!(f, "reconnecting ({}/{})", a.attempt, a.max_attempts),
            Self::Connected => write!(f, "connected"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Notifications for the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// A reconnect is scheduled after `delay`
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    /// Streaming assistant transcript text
    TranscriptDelta(String),
    /// Assistant transcript for the finished response
    TranscriptDone(String),
    /// Transcript of the caller's own speech
    InputTranscript(String),
    /// Silence detector fired and the input buffer was committed
    SilenceDetected,
    /// Enhanced context phase finished for the current channel
    ContextDelivered(DeliveryOutcome),
    /// Microphone failure; the connection stays up
    AudioDeviceError(String),
    /// `error` event from the remote side; not fatal
    RemoteError(String),
    /// Reconnect budget spent
    Exhausted { attempts: u32 },
}
