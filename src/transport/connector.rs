//! Connection state machine
//!
//! `disconnected → connecting → negotiating → open → closing → disconnected`,
//! with `failed` ending any attempt that errors before `open`. Only one
//! attempt may be outstanding at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use super::events::ServerEvent;
use super::{AudioEncoding, Dialer, TransportChannel, TransportState, WireMessage};
use crate::credential::{CredentialProvider, CredentialRequest};
use crate::{Error, Result};

/// Time allowed from dialing to `connection.established`
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a `connect` call
#[derive(Debug)]
pub enum ConnectOutcome {
    /// This call ran the attempt and the channel is open
    Opened(TransportChannel),
    /// Another attempt is outstanding or a channel is already open
    InProgress(TransportState),
}

/// Establishes transport channels to the relay
pub struct TransportConnector {
    dialer: Arc<dyn Dialer>,
    state: watch::Sender<TransportState>,
    negotiation_timeout: Duration,
    encoding: AudioEncoding,
    next_id: AtomicU64,
}

impl TransportConnector {
    /// Create a connector over the given dialer
    #[must_use]
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        let (state, _) = watch::channel(TransportState::Disconnected);
        Self {
            dialer,
            state,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            encoding: AudioEncoding::default(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Override the negotiation deadline
    #[must_use]
    pub const fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    /// Choose how outgoing audio is carried
    #[must_use]
    pub const fn with_encoding(mut self, encoding: AudioEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    /// Watch state transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    /// Acquire a credential, dial and negotiate a new channel
    ///
    /// A call while an attempt is outstanding or a channel is open does
    /// nothing and reports the current state.
    ///
    /// # Errors
    ///
    /// Returns the attempt's error; the state is then `Failed`
    pub async fn connect(
        &self,
        broker: &dyn CredentialProvider,
        request: &CredentialRequest,
    ) -> Result<ConnectOutcome> {
        let mut current = TransportState::Disconnected;
        let claimed = self.state.send_if_modified(|state| {
            current = *state;
            if state.is_busy() {
                false
            } else {
                *state = TransportState::Connecting;
                true
            }
        });
        if !claimed {
            tracing::debug!(state = ?current, "connect ignored, attempt outstanding");
            return Ok(ConnectOutcome::InProgress(current));
        }

        match self.establish(broker, request).await {
            Ok(channel) => {
                self.set(TransportState::Open);
                Ok(ConnectOutcome::Opened(channel))
            }
            Err(e) => {
                let kind = e.failure_kind();
                tracing::debug!(error = %e, kind = %kind, "connection attempt failed");
                self.set(TransportState::Failed(kind));
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        broker: &dyn CredentialProvider,
        request: &CredentialRequest,
    ) -> Result<TransportChannel> {
        let credential = broker.acquire(request).await?;

        self.set(TransportState::Negotiating);
        let link = tokio::time::timeout(self.negotiation_timeout, async {
            let mut link = self.dialer.dial(&credential).await?;
            await_established(&mut link.rx).await?;
            Ok::<_, Error>(link)
        })
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "negotiation exceeded {} ms",
                self.negotiation_timeout.as_millis()
            ))
        })??;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(TransportChannel::from_link(id, link, self.encoding))
    }

    /// Record that the open channel is being torn down
    pub fn mark_closing(&self) {
        self.state.send_if_modified(|state| {
            if *state == TransportState::Open {
                *state = TransportState::Closing;
                true
            } else {
                false
            }
        });
    }

    /// Return to `disconnected` after teardown or a cancelled attempt
    pub fn mark_disconnected(&self) {
        self.set(TransportState::Disconnected);
    }

    fn set(&self, next: TransportState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                tracing::trace!(from = ?*state, to = ?next, "transport state");
                *state = next;
                true
            }
        });
    }
}

/// Wait for the relay's `connection.established`, discarding anything else
async fn await_established(rx: &mut mpsc::Receiver<WireMessage>) -> Result<()> {
    loop {
        match rx.recv().await {
            Some(WireMessage::Text(text)) => {
                if let Some(ServerEvent::ConnectionEstablished { .. }) = ServerEvent::parse(&text) {
                    return Ok(());
                }
                tracing::trace!("discarding message received before establishment");
            }
            Some(WireMessage::Binary(_)) => {
                tracing::trace!("discarding audio received before establishment");
            }
            Some(WireMessage::Close) | None => {
                return Err(Error::RemoteClosed(
                    "closed during negotiation".to_string(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::credential::Credential;
    use crate::transport::{FailureKind, Link};

    struct TestBroker;

    #[async_trait]
    impl CredentialProvider for TestBroker {
        async fn acquire(&self, _request: &CredentialRequest) -> Result<Credential> {
            let now = Utc::now();
            Credential::new("secret", now + chrono::Duration::seconds(60), now)
        }
    }

    /// Remote sends the given first message, or nothing at all
    struct ScriptedDialer {
        greeting: Option<WireMessage>,
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for ScriptedDialer {
        async fn dial(&self, _credential: &Credential) -> Result<Link> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (local, remote) = Link::pair(8);
            let greeting = self.greeting.clone();
            tokio::spawn(async move {
                let Link { tx, mut rx } = remote;
                if let Some(message) = greeting {
                    let _ = tx.send(message).await;
                }
                while rx.recv().await.is_some() {}
                drop(tx);
            });
            Ok(local)
        }
    }

    fn request() -> CredentialRequest {
        CredentialRequest {
            model: "m".to_string(),
            voice: "v".to_string(),
            instructions: "i".to_string(),
        }
    }

    fn established() -> Option<WireMessage> {
        Some(WireMessage::Text(
            r#"{"type":"connection.established","time":0}"#.to_string(),
        ))
    }

    #[tokio::test]
    async fn opens_on_established() {
        let dialer = Arc::new(ScriptedDialer {
            greeting: established(),
            dials: AtomicUsize::new(0),
        });
        let connector = TransportConnector::new(dialer);

        let outcome = connector.connect(&TestBroker, &request()).await.unwrap();
        assert!(matches!(outcome, ConnectOutcome::Opened(_)));
        assert_eq!(connector.state(), TransportState::Open);
    }

    #[tokio::test]
    async fn second_connect_is_noop_while_open() {
        let dialer = Arc::new(ScriptedDialer {
            greeting: established(),
            dials: AtomicUsize::new(0),
        });
        let connector = TransportConnector::new(dialer.clone());

        let _first = connector.connect(&TestBroker, &request()).await.unwrap();
        let second = connector.connect(&TestBroker, &request()).await.unwrap();
        assert!(matches!(
            second,
            ConnectOutcome::InProgress(TransportState::Open)
        ));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_relay_times_out() {
        let dialer = Arc::new(ScriptedDialer {
            greeting: None,
            dials: AtomicUsize::new(0),
        });
        let connector = TransportConnector::new(dialer)
            .with_negotiation_timeout(Duration::from_millis(500));

        let err = connector.connect(&TestBroker, &request()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(
            connector.state(),
            TransportState::Failed(FailureKind::Timeout)
        );
    }

    #[tokio::test]
    async fn close_during_negotiation_is_remote_closed() {
        let dialer = Arc::new(ScriptedDialer {
            greeting: Some(WireMessage::Close),
            dials: AtomicUsize::new(0),
        });
        let connector = TransportConnector::new(dialer);

        let err = connector.connect(&TestBroker, &request()).await.unwrap_err();
        assert!(matches!(err, Error::RemoteClosed(_)));
        assert_eq!(
            connector.state(),
            TransportState::Failed(FailureKind::RemoteClosed)
        );
    }

    #[tokio::test]
    async fn failed_state_allows_retry() {
        let dialer = Arc::new(ScriptedDialer {
            greeting: Some(WireMessage::Close),
            dials: AtomicUsize::new(0),
        });
        let connector = TransportConnector::new(dialer.clone());

        assert!(connector.connect(&TestBroker, &request()).await.is_err());
        assert!(connector.connect(&TestBroker, &request()).await.is_err());
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }
}
