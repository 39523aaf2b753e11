//! Upstream model-service leg

use futures::SinkExt;
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::Grant;
use crate::transport::ClientEvent;
use crate::transport::events::SessionSettings;
use crate::{Error, Result};

/// Socket to the upstream service
pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OPENAI_BETA: HeaderName = HeaderName::from_static("openai-beta");

/// Open the upstream leg for a grant and apply its session settings
///
/// # Errors
///
/// Returns `Upstream` if the service is unreachable or rejects the upgrade
pub async fn connect_upstream(
    base: &Url,
    api_key: Option<&SecretString>,
    grant: &Grant,
) -> Result<UpstreamSocket> {
    let mut url = base.clone();
    if !grant.model.is_empty() {
        url.query_pairs_mut().append_pair("model", &grant.model);
    }

    let mut request = url.as_str().into_client_request()?;
    let headers = request.headers_mut();
    if let Some(key) = api_key {
        let bearer = HeaderValue::from_str(&format!("Bearer {}", key.expose_secret()))
            .map_err(|e| Error::Config(format!("upstream api key is not a valid header: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);
    }
    headers.insert(OPENAI_BETA, HeaderValue::from_static("realtime=v1"));

    let (mut socket, _) = connect_async(request)
        .await
        .map_err(|e| Error::Upstream(format!("upstream connect failed: {e}")))?;

    let update = ClientEvent::SessionUpdate {
        session: SessionSettings {
            instructions: grant.instructions.clone(),
            voice: Some(grant.voice.clone()).filter(|v| !v.is_empty()),
        },
    };
    socket
        .send(Message::Text(update.to_json()?.into()))
        .await
        .map_err(|e| Error::Upstream(format!("upstream session update failed: {e}")))?;

    tracing::debug!(host = url.host_str(), model = %grant.model, "upstream leg open");
    Ok(socket)
}
