//! Duplex transport to the relay
//!
//! A transport is a [`Link`] (ordered text/binary message pipe) produced by a
//! [`Dialer`]. The [`TransportConnector`] drives the connection state machine
//! over it and hands out a [`TransportChannel`] once the relay reports the
//! connection as established.

mod channel;
mod connector;
pub mod events;
mod ws;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use channel::{ChannelHandle, Inbound, TransportChannel};
pub use connector::{ConnectOutcome, DEFAULT_NEGOTIATION_TIMEOUT, TransportConnector};
pub use events::{ClientEvent, ServerEvent};
pub use ws::WsDialer;

use crate::Result;
use crate::credential::Credential;

/// Why a connection attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Negotiation did not complete in time
    Timeout,
    /// The remote side went away
    RemoteClosed,
    /// Malformed upgrade, rejected credential or bad message
    ProtocolError,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::RemoteClosed => write!(f, "remote closed"),
            Self::ProtocolError => write!(f, "protocol error"),
        }
    }
}

/// Connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Negotiating,
    Open,
    Closing,
    /// Terminal for one attempt; feeds the reconnection policy
    Failed(FailureKind),
}

impl TransportState {
    /// Whether an attempt is outstanding or a channel is open
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Connecting | Self::Negotiating | Self::Open)
    }
}

/// How outgoing audio frames are carried
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// Base64 inside `input_audio_buffer.append` events
    #[default]
    Base64Json,
    /// Raw little-endian PCM in binary messages
    Binary,
}

/// One message on a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// One end of an ordered, reliable message pipe
#[derive(Debug)]
pub struct Link {
    /// Messages to the remote end
    pub tx: mpsc::Sender<WireMessage>,
    /// Messages from the remote end
    pub rx: mpsc::Receiver<WireMessage>,
}

impl Link {
    /// Two connected in-memory ends
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (Self { tx: a_tx, rx: a_rx }, Self { tx: b_tx, rx: b_rx })
    }
}

/// Opens a link to the relay with a session credential
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial the relay, presenting `credential`
    async fn dial(&self, credential: &Credential) -> Result<Link>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_states() {
        assert!(TransportState::Connecting.is_busy());
        assert!(TransportState::Negotiating.is_busy());
        assert!(TransportState::Open.is_busy());
        assert!(!TransportState::Disconnected.is_busy());
        assert!(!TransportState::Closing.is_busy());
        assert!(!TransportState::Failed(FailureKind::Timeout).is_busy());
    }

    #[tokio::test]
    async fn link_pair_is_crossed() {
        let (mut a, mut b) = Link::pair(4);
        a.tx.send(WireMessage::Text("hi".to_string())).await.unwrap();
        b.tx.send(WireMessage::Binary(vec![1, 2])).await.unwrap();

        assert_eq!(b.rx.recv().await, Some(WireMessage::Text("hi".to_string())));
        assert_eq!(a.rx.recv().await, Some(WireMessage::Binary(vec![1, 2])));
    }
}
