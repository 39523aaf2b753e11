//! WebSocket dialer
//!
//! Connects to the relay's `/realtime` endpoint and bridges the socket onto a
//! [`Link`] with two pump tasks.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use url::Url;

use super::{Dialer, Link, WireMessage};
use crate::credential::Credential;
use crate::{Error, Result};

const LINK_CAPACITY: usize = 256;

/// Dials the relay over WebSocket, presenting the credential as a bearer token
#[derive(Debug, Clone)]
pub struct WsDialer {
    url: Url,
}

impl WsDialer {
    /// Dialer for a relay endpoint such as `ws://localhost:8788/realtime`
    #[must_use]
    pub const fn new(url: Url) -> Self {
        Self { url }
    }

    /// Relay endpoint
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, credential: &Credential) -> Result<Link> {
        let mut request = self.url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.expose()))
            .map_err(|e| Error::Protocol(format!("credential is not a valid header: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (socket, _) = connect_async(request).await.map_err(|e| match e {
            WsError::Http(response) => {
                Error::Protocol(format!("relay rejected upgrade: {}", response.status()))
            }
            other => Error::from(other),
        })?;
        tracing::debug!(url = %self.url, "connected to relay");

        let (mut sink, mut stream) = socket.split();
        let (local, remote) = Link::pair(LINK_CAPACITY);
        let Link { tx, mut rx } = remote;

        // socket -> link
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let wire = match message {
                    Ok(Message::Text(text)) => WireMessage::Text(text.as_str().to_owned()),
                    Ok(Message::Binary(bytes)) => WireMessage::Binary(bytes.to_vec()),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!(error = %e, "relay socket error");
                        break;
                    }
                };
                if tx.send(wire).await.is_err() {
                    break;
                }
            }
            let _ = tx.send(WireMessage::Close).await;
        });

        // link -> socket
        tokio::spawn(async move {
            while let Some(wire) = rx.recv().await {
                let message = match wire {
                    WireMessage::Text(text) => Message::Text(text.into()),
                    WireMessage::Binary(bytes) => Message::Binary(bytes.into()),
                    WireMessage::Close => break,
                };
                if let Err(e) = sink.send(message).await {
                    tracing::debug!(error = %e, "relay socket write failed");
                    return;
                }
            }
            let _ = sink.close().await;
        });

        Ok(local)
    }
}
