//! Ephemeral session credentials
//!
//! A [`Credential`] authorizes exactly one realtime session. The broker
//! obtains it from the relay's session endpoint and refuses anything with
//! less than [`MIN_CREDENTIAL_LIFETIME`] remaining. The broker never retries;
//! retry policy belongs to the session controller.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Minimum remaining lifetime accepted at acquisition
pub const MIN_CREDENTIAL_LIFETIME: Duration = Duration::from_secs(5);

/// Scope requested for a session credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRequest {
    /// Model identifier
    pub model: String,
    /// Output voice
    pub voice: String,
    /// Instructions in effect when the session opens
    pub instructions: String,
}

/// Short-lived secret plus absolute expiry; never persisted
#[derive(Debug)]
pub struct Credential {
    secret: SecretString,
    expires_at: DateTime<Utc>,
}

impl Credential {
    /// Build a credential, enforcing the minimum remaining lifetime
    ///
    /// # Errors
    ///
    /// Returns `CredentialExpiry` if less than five seconds remain at `now`
    pub fn new(
        secret: impl Into<String>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        validate_lifetime(expires_at, now)?;
        Ok(Self {
            secret: SecretString::from(secret.into()),
            expires_at,
        })
    }

    /// Secret value for presenting to the relay
    #[must_use]
    pub fn expose(&self) -> &str {
        self.secret.expose_secret()
    }

    /// Absolute expiry
    #[must_use]
    pub const fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Remaining lifetime at `now`, zero once expired
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the credential has expired at `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Reject credentials with less than five seconds of lifetime left
///
/// # Errors
///
/// Returns `CredentialExpiry` with the remaining milliseconds
pub fn validate_lifetime(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    let remaining = expires_at - now;
    let floor = chrono::Duration::from_std(MIN_CREDENTIAL_LIFETIME)
        .unwrap_or_else(|_| chrono::Duration::seconds(5));

    if remaining < floor {
        return Err(Error::CredentialExpiry {
            remaining_ms: remaining.num_milliseconds(),
        });
    }
    Ok(())
}

/// Anything that can hand out session credentials
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Obtain a credential scoped to one session
    async fn acquire(&self, request: &CredentialRequest) -> Result<Credential>;
}

/// Wire shape of the credential endpoint response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialResponse {
    /// Opaque secret
    pub secret_value: String,
    /// Absolute expiry, unix seconds
    pub expires_at: i64,
}

/// Fetches credentials from the relay's `POST /api/session` endpoint
pub struct CredentialBroker {
    client: reqwest::Client,
    endpoint: Url,
    identity: Option<SecretString>,
}

impl CredentialBroker {
    /// Create a broker for the given session endpoint
    ///
    /// `identity` is the caller's bearer identity; without one every
    /// acquisition fails with `Auth`.
    #[must_use]
    pub fn new(endpoint: Url, identity: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            endpoint,
            identity,
        }
    }

    /// Session endpoint for a relay base URL (`ws://` or `http://`)
    ///
    /// # Errors
    ///
    /// Returns error if the URL cannot be converted
    pub fn endpoint_for(relay_url: &Url) -> Result<Url> {
        let mut url = relay_url.clone();
        let scheme = match relay_url.scheme() {
            "ws" | "http" => "http",
            "wss" | "https" => "https",
            other => return Err(Error::Config(format!("unsupported relay scheme: {other}"))),
        };
        url.set_scheme(scheme)
            .map_err(|()| Error::Config("cannot rewrite relay scheme".to_string()))?;
        url.set_query(None);
        Ok(url.join("/api/session")?)
    }
}

#[async_trait]
impl CredentialProvider for CredentialBroker {
    async fn acquire(&self, request: &CredentialRequest) -> Result<Credential> {
        let Some(identity) = &self.identity else {
            return Err(Error::Auth("no caller identity configured".to_string()));
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(identity.expose_secret())
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("credential service unreachable: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::Auth(format!("credential service rejected identity ({status})")));
        }
        if !status.is_success() {
            return Err(Error::Upstream(format!("credential service returned {status}")));
        }

        let body: CredentialResponse = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("malformed credential payload: {e}")))?;

        if body.secret_value.is_empty() {
            return Err(Error::Upstream("credential payload has empty secret".to_string()));
        }

        let expires_at = Utc
            .timestamp_opt(body.expires_at, 0)
            .single()
            .ok_or_else(|| Error::Upstream(format!("invalid expiresAt: {}", body.expires_at)))?;

        let credential = Credential::new(body.secret_value, expires_at, Utc::now())?;
        tracing::debug!(
            model = %request.model,
            expires_at = %credential.expires_at(),
            "acquired session credential"
        );
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_lifetime() {
        let now = Utc::now();
        let result = Credential::new("s", now + chrono::Duration::milliseconds(4999), now);
        assert!(matches!(result, Err(Error::CredentialExpiry { remaining_ms: 4999 })));
    }

    #[test]
    fn rejects_already_expired() {
        let now = Utc::now();
        let result = validate_lifetime(now - chrono::Duration::seconds(1), now);
        assert!(matches!(result, Err(Error::CredentialExpiry { remaining_ms }) if remaining_ms < 0));
    }

    #[test]
    fn accepts_exact_floor() {
        let now = Utc::now();
        let credential = Credential::new("s", now + chrono::Duration::seconds(5), now).unwrap();
        assert_eq!(credential.remaining(now), Duration::from_secs(5));
        assert!(!credential.is_expired(now));
    }

    #[test]
    fn secret_is_redacted_in_debug() {
        let now = Utc::now();
        let credential =
            Credential::new("super-secret", now + chrono::Duration::seconds(60), now).unwrap();
        assert!(!format!("{credential:?}").contains("super-secret"));
        assert_eq!(credential.expose(), "super-secret");
    }

    #[test]
    fn endpoint_from_relay_url() {
        let relay = Url::parse("ws://localhost:8788/realtime?token=x").unwrap();
        let endpoint = CredentialBroker::endpoint_for(&relay).unwrap();
        assert_eq!(endpoint.as_str(), "http://localhost:8788/api/session");

        let relay = Url::parse("wss://relay.example.com/realtime").unwrap();
        let endpoint = CredentialBroker::endpoint_for(&relay).unwrap();
        assert_eq!(endpoint.as_str(), "https://relay.example.com/api/session");
    }

    #[test]
    fn response_uses_camel_case() {
        let body: CredentialResponse =
            serde_json::from_str(r#"{"secretValue":"abc","expiresAt":1700000000}"#).unwrap();
        assert_eq!(body.secret_value, "abc");
        assert_eq!(body.expires_at, 1_700_000_000);
    }

    #[tokio::test]
    async fn missing_identity_is_auth_error() {
        let broker = CredentialBroker::new(Url::parse("http://127.0.0.1:9/api/session").unwrap(), None);
        let request = CredentialRequest {
            model: "m".to_string(),
            voice: "v".to_string(),
            instructions: String::new(),
        };
        assert!(matches!(broker.acquire(&request).await, Err(Error::Auth(_))));
    }
}
