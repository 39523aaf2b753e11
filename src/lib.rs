//! Voicewire - Realtime voice sessions against speech-to-speech model services
//!
//! This library provides:
//! - A client session controller (credential, transport, context, audio)
//! - A relay server that mints short-lived session credentials and bridges
//!   clients to the upstream model service
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 SessionController                    │
//! │  Credential │ Transport │ Context │ Capture/Playback │
//! └────────────────────┬────────────────────────────────┘
//!                      │ WebSocket (per-session credential)
//! ┌────────────────────▼────────────────────────────────┐
//! │                      Relay                           │
//! │   /api/session  │  /realtime bridge  │  /health     │
//! └────────────────────┬────────────────────────────────┘
//!                      │ WebSocket (server-held key)
//! ┌────────────────────▼────────────────────────────────┐
//! │              Upstream model service                  │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod context;
pub mod credential;
pub mod error;
pub mod relay;
pub mod session;
pub mod transport;
pub mod voice;

pub use config::Config;
pub use error::{Error, Result};
pub use relay::{RelayConfig, RelayServer};
pub use session::{
    ConnectRequest, SessionController, SessionOptions, SessionParts, SessionPhase, SessionStatus,
    SessionUpdate,
};
