//! Open transport channel
//!
//! Splits one [`Link`] into an ordered event sub-channel and a best-effort
//! audio sub-channel. A writer task merges both outgoing queues onto the
//! link; a reader task parses inbound messages and forwards them to the
//! single consumer (the session controller).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::events::{ClientEvent, ServerEvent, timestamp_ms};
use super::{AudioEncoding, FailureKind, Link, WireMessage};
use crate::voice::AudioFrame;
use crate::{Error, Result};

const EVENT_QUEUE: usize = 64;
const AUDIO_QUEUE: usize = 64;
const INBOUND_QUEUE: usize = 256;

/// Something received on an open channel
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Parsed control/text event
    Event(ServerEvent),
    /// Raw PCM16 from a binary message
    Audio(Vec<u8>),
    /// Channel ended; always the last item
    Closed(FailureKind),
}

/// Cloneable sender side of a channel, shared with the context protocol
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: u64,
    events: mpsc::Sender<ClientEvent>,
    acks: watch::Receiver<Option<String>>,
    closed: CancellationToken,
    context_sent: Arc<AtomicBool>,
}

impl ChannelHandle {
    /// Channel identifier, unique per connector
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Queue an event on the ordered sub-channel
    ///
    /// # Errors
    ///
    /// Returns `RemoteClosed` if the channel has closed
    pub async fn send_event(&self, event: ClientEvent) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::RemoteClosed("channel closed".to_string()));
        }
        self.events
            .send(event)
            .await
            .map_err(|_| Error::RemoteClosed("channel closed".to_string()))
    }

    /// Claim the single enhanced-context send for this channel
    ///
    /// Returns true for exactly one caller over the channel's lifetime.
    #[must_use]
    pub fn claim_context_slot(&self) -> bool {
        self.context_sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether the context slot has been claimed
    #[must_use]
    pub fn context_sent(&self) -> bool {
        self.context_sent.load(Ordering::Acquire)
    }

    /// Instructions echoed by the most recent `session.updated`
    ///
    /// Every acknowledgement marks the receiver changed, even when it repeats
    /// the previous instructions. `None` until the first one arrives or when
    /// the acknowledgement carries no instructions.
    #[must_use]
    pub fn acks(&self) -> watch::Receiver<Option<String>> {
        self.acks.clone()
    }

    /// Resolves once the channel has closed
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Whether the channel is still open
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }
}

/// One open connection; lifetime is a single connection attempt
#[derive(Debug)]
pub struct TransportChannel {
    handle: ChannelHandle,
    audio: mpsc::Sender<AudioFrame>,
    inbound: mpsc::Receiver<Inbound>,
}

impl TransportChannel {
    /// Start the reader and writer tasks over an established link
    #[must_use]
    pub fn from_link(id: u64, link: Link, encoding: AudioEncoding) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (acks_tx, acks_rx) = watch::channel(None);
        let closed = CancellationToken::new();

        let Link { tx, rx } = link;
        tokio::spawn(run_writer(
            id,
            tx,
            events_rx,
            audio_rx,
            encoding,
            closed.clone(),
        ));
        tokio::spawn(run_reader(
            id,
            rx,
            inbound_tx,
            events_tx.clone(),
            acks_tx,
            closed.clone(),
        ));

        tracing::debug!(channel_id = id, ?encoding, "transport channel open");

        Self {
            handle: ChannelHandle {
                id,
                events: events_tx,
                acks: acks_rx,
                closed,
                context_sent: Arc::new(AtomicBool::new(false)),
            },
            audio: audio_tx,
            inbound: inbound_rx,
        }
    }

    /// Channel identifier
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.handle.id
    }

    /// Sender side for the context protocol and other producers
    #[must_use]
    pub fn handle(&self) -> ChannelHandle {
        self.handle.clone()
    }

    /// Queue an event on the ordered sub-channel
    ///
    /// # Errors
    ///
    /// Returns `RemoteClosed` if the channel has closed
    pub async fn send_event(&self, event: ClientEvent) -> Result<()> {
        self.handle.send_event(event).await
    }

    /// Queue an audio frame without waiting; returns false if dropped
    pub fn send_audio(&self, frame: AudioFrame) -> bool {
        !self.handle.closed.is_cancelled() && self.audio.try_send(frame).is_ok()
    }

    /// Next inbound item; `None` after the channel has fully drained
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    /// Whether the channel is still open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    /// Close both directions
    pub fn close(&self) {
        if !self.handle.closed.is_cancelled() {
            tracing::debug!(channel_id = self.handle.id, "closing transport channel");
            self.handle.closed.cancel();
        }
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_writer(
    id: u64,
    link: mpsc::Sender<WireMessage>,
    mut events: mpsc::Receiver<ClientEvent>,
    mut audio: mpsc::Receiver<AudioFrame>,
    encoding: AudioEncoding,
    closed: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = closed.cancelled() => break,
            Some(event) = events.recv() => match event.to_json() {
                Ok(json) => {
                    tracing::trace!(channel_id = id, event_type = event.kind(), "sending event");
                    WireMessage::Text(json)
                }
                Err(e) => {
                    tracing::warn!(channel_id = id, error = %e, "failed to encode event");
                    continue;
                }
            },
            Some(frame) = audio.recv() => match encoding {
                AudioEncoding::Binary => WireMessage::Binary(frame.to_pcm16_bytes()),
                AudioEncoding::Base64Json => {
                    let event = ClientEvent::InputAudioAppend {
                        audio: frame.to_base64(),
                    };
                    match event.to_json() {
                        Ok(json) => WireMessage::Text(json),
                        Err(e) => {
                            tracing::warn!(channel_id = id, error = %e, "failed to encode audio");
                            continue;
                        }
                    }
                }
            },
            else => break,
        };

        if link.send(message).await.is_err() {
            closed.cancel();
            break;
        }
    }

    let _ = link.send(WireMessage::Close).await;
    tracing::trace!(channel_id = id, "transport writer stopped");
}

async fn run_reader(
    id: u64,
    mut link: mpsc::Receiver<WireMessage>,
    inbound: mpsc::Sender<Inbound>,
    events: mpsc::Sender<ClientEvent>,
    acks: watch::Sender<Option<String>>,
    closed: CancellationToken,
) {
    let reason = loop {
        let message = tokio::select! {
            () = closed.cancelled() => return,
            message = link.recv() => message,
        };

        let item = match message {
            Some(WireMessage::Text(text)) => {
                let Some(event) = ServerEvent::parse(&text) else {
                    continue;
                };
                match &event {
                    ServerEvent::SessionUpdated { session } => {
                        let instructions = session
                            .get("instructions")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        acks.send_replace(instructions);
                    }
                    ServerEvent::Ping { .. } => {
                        let pong = ClientEvent::Pong {
                            timestamp: timestamp_ms(),
                        };
                        if events.try_send(pong).is_err() {
                            tracing::debug!(channel_id = id, "event queue full, pong dropped");
                        }
                    }
                    _ => {}
                }
                Inbound::Event(event)
            }
            Some(WireMessage::Binary(bytes)) => Inbound::Audio(bytes),
            Some(WireMessage::Close) | None => break FailureKind::RemoteClosed,
        };

        if inbound.send(item).await.is_err() {
            return;
        }
    };

    tracing::debug!(channel_id = id, reason = %reason, "transport channel closed by remote");
    closed.cancel();
    let _ = inbound.send(Inbound::Closed(reason)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(encoding: AudioEncoding) -> (TransportChannel, Link) {
        let (local, remote) = Link::pair(16);
        (TransportChannel::from_link(1, local, encoding), remote)
    }

    #[tokio::test]
    async fn events_keep_send_order() {
        let (channel, mut remote) = open(AudioEncoding::Base64Json);
        channel
            .send_event(ClientEvent::session_update("a"))
            .await
            .unwrap();
        channel.send_event(ClientEvent::InputAudioCommit).await.unwrap();

        let Some(WireMessage::Text(first)) = remote.rx.recv().await else {
            panic!("expected text");
        };
        assert!(first.contains("session.update"));
        let Some(WireMessage::Text(second)) = remote.rx.recv().await else {
            panic!("expected text");
        };
        assert!(second.contains("input_audio_buffer.commit"));
    }

    #[tokio::test]
    async fn audio_encodings() {
        let (channel, mut remote) = open(AudioEncoding::Binary);
        assert!(channel.send_audio(AudioFrame::new(0, 24_000, vec![1, -1])));
        assert_eq!(
            remote.rx.recv().await,
            Some(WireMessage::Binary(vec![1, 0, 0xff, 0xff]))
        );

        let (channel, mut remote) = open(AudioEncoding::Base64Json);
        assert!(channel.send_audio(AudioFrame::new(0, 24_000, vec![1, -1])));
        let Some(WireMessage::Text(text)) = remote.rx.recv().await else {
            panic!("expected text");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "input_audio_buffer.append");
        assert_eq!(value["audio"], "AQD//w==");
    }

    #[tokio::test]
    async fn answers_ping_and_publishes_acks() {
        let (mut channel, mut remote) = open(AudioEncoding::Base64Json);
        let mut acks = channel.handle().acks();

        remote
            .tx
            .send(WireMessage::Text(r#"{"type":"ping","timestamp":5}"#.to_string()))
            .await
            .unwrap();
        let Some(WireMessage::Text(pong)) = remote.rx.recv().await else {
            panic!("expected pong");
        };
        assert!(pong.contains(r#""type":"pong""#));
        assert!(matches!(
            channel.recv().await,
            Some(Inbound::Event(ServerEvent::Ping { .. }))
        ));

        remote
            .tx
            .send(WireMessage::Text(
                r#"{"type":"session.updated","session":{"instructions":"be brief"}}"#.to_string(),
            ))
            .await
            .unwrap();
        acks.changed().await.unwrap();
        assert_eq!(acks.borrow_and_update().as_deref(), Some("be brief"));

        // A repeat still registers, and a bare ack carries nothing
        remote
            .tx
            .send(WireMessage::Text(r#"{"type":"session.updated"}"#.to_string()))
            .await
            .unwrap();
        acks.changed().await.unwrap();
        assert_eq!(*acks.borrow(), None);
    }

    #[tokio::test]
    async fn remote_close_ends_channel() {
        let (mut channel, remote) = open(AudioEncoding::Base64Json);
        let handle = channel.handle();
        drop(remote);

        assert_eq!(
            channel.recv().await,
            Some(Inbound::Closed(FailureKind::RemoteClosed))
        );
        handle.closed().await;
        assert!(!channel.is_open());
        assert!(!channel.send_audio(AudioFrame::new(0, 24_000, vec![0])));
    }

    #[tokio::test]
    async fn local_close_sends_close_frame() {
        let (channel, mut remote) = open(AudioEncoding::Base64Json);
        channel.close();
        assert_eq!(remote.rx.recv().await, Some(WireMessage::Close));
    }

    #[tokio::test]
    async fn context_slot_claimed_once() {
        let (channel, _remote) = open(AudioEncoding::Base64Json);
        let a = channel.handle();
        let b = channel.handle();
        assert!(a.claim_context_slot());
        assert!(!b.claim_context_slot());
        assert!(!a.claim_context_slot());
        assert!(b.context_sent());
    }
}
