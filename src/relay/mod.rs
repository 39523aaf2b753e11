//! Realtime relay server
//!
//! Routes:
//! - `POST /api/session`: mint a single-use session credential
//! - `GET /realtime`: WebSocket upgrade, bridged to the upstream model service
//! - `GET /health`: liveness plus active bridge count

mod bridge;
mod grants;
mod upstream;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use url::Url;

pub use grants::{Grant, GrantStore, constant_time_eq};
pub use upstream::{UpstreamSocket, connect_upstream};

use crate::credential::CredentialResponse;
use crate::{Error, Result};

/// Default relay listen port
pub const DEFAULT_PORT: u16 = 8788;

/// Default upstream realtime endpoint
pub const DEFAULT_UPSTREAM_URL: &str = "wss://api.openai.com/v1/realtime";

/// Relay configuration
#[derive(Debug)]
pub struct RelayConfig {
    /// Listen port
    pub port: u16,
    /// Upstream realtime WebSocket endpoint
    pub upstream_url: Url,
    /// Server-held upstream credential
    pub upstream_api_key: Option<SecretString>,
    /// Identity callers must present to mint credentials; any bearer when unset
    pub client_api_key: Option<SecretString>,
    /// Keep-alive interval on both legs
    pub ping_interval: Duration,
    /// Lifetime of minted credentials
    pub credential_ttl: Duration,
    pub default_model: String,
    pub default_voice: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            upstream_url: Url::parse(DEFAULT_UPSTREAM_URL)
                .unwrap_or_else(|_| unreachable!("default upstream url is valid")),
            upstream_api_key: None,
            client_api_key: None,
            ping_interval: Duration::from_secs(30),
            credential_ttl: Duration::from_secs(60),
            default_model: "gpt-4o-realtime-preview".to_string(),
            default_voice: "alloy".to_string(),
        }
    }
}

/// Shared relay state
pub struct RelayState {
    pub config: RelayConfig,
    pub grants: GrantStore,
    active: AtomicUsize,
}

impl RelayState {
    /// Bridges currently holding both legs (or dialing upstream)
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Structured relay error
#[derive(Debug)]
pub enum RelayError {
    /// No bearer identity on a credential request
    AuthRequired,
    /// Bearer identity does not match the configured key
    InvalidIdentity,
    /// Missing, unknown, expired or already-used credential on upgrade
    InvalidCredential,
    /// Request is not a valid WebSocket upgrade
    BadUpgrade(StatusCode, String),
    /// Malformed request body
    BadRequest(String),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: &'static str,
            message: String,
        }

        let (status, error, message) = match self {
            Self::AuthRequired => (
                StatusCode::UNAUTHORIZED,
                "auth_required",
                "bearer identity required".to_string(),
            ),
            Self::InvalidIdentity => (
                StatusCode::UNAUTHORIZED,
                "invalid_identity",
                "identity not recognized".to_string(),
            ),
            Self::InvalidCredential => (
                StatusCode::UNAUTHORIZED,
                "invalid_credential",
                "session credential missing, expired or already used".to_string(),
            ),
            Self::BadUpgrade(status, message) => (status, "bad_upgrade", message),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message),
        };

        (status, Json(ErrorResponse { error, message })).into_response()
    }
}

/// Relay HTTP/WebSocket server
pub struct RelayServer {
    state: Arc<RelayState>,
}

impl RelayServer {
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        let grants = GrantStore::new(config.credential_ttl);
        Self {
            state: Arc::new(RelayState {
                config,
                grants,
                active: AtomicUsize::new(0),
            }),
        }
    }

    /// Shared state, for inspection
    #[must_use]
    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    /// Build the router
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/api/session", post(create_session))
            .route("/realtime", get(realtime))
            .route("/health", get(health))
            .with_state(Arc::clone(&self.state))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Run on the configured port until the process exits
    ///
    /// # Errors
    ///
    /// Returns error if the server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.state.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind relay: {e}")))?;
        self.serve(listener, std::future::pending()).await
    }

    /// Serve on an already-bound listener until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if the server fails
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(
            %addr,
            upstream = %self.state.config.upstream_url,
            "relay listening"
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Config(format!("relay server error: {e}")))?;
        Ok(())
    }
}

/// Extract the bearer token from the Authorization header
fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|v| !v.is_empty())
}

/// Credential request body; omitted fields use relay defaults
#[derive(Debug, Default, Deserialize)]
struct SessionRequest {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    voice: Option<String>,
    #[serde(default)]
    instructions: Option<String>,
}

async fn create_session(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    body: std::result::Result<Json<SessionRequest>, JsonRejection>,
) -> std::result::Result<Json<CredentialResponse>, RelayError> {
    let Some(identity) = bearer(&headers) else {
        return Err(RelayError::AuthRequired);
    };
    if let Some(expected) = &state.config.client_api_key {
        if !constant_time_eq(identity.as_bytes(), expected.expose_secret().as_bytes()) {
            tracing::warn!("credential request with unrecognized identity");
            return Err(RelayError::InvalidIdentity);
        }
    }

    let Json(request) = body.map_err(|e| RelayError::BadRequest(e.body_text()))?;
    let grant = Grant {
        model: request
            .model
            .unwrap_or_else(|| state.config.default_model.clone()),
        voice: request
            .voice
            .unwrap_or_else(|| state.config.default_voice.clone()),
        instructions: request.instructions.unwrap_or_default(),
    };

    let model = grant.model.clone();
    let (secret, expires_at) = state.grants.mint(grant);
    tracing::debug!(%model, %expires_at, "minted session credential");

    Ok(Json(CredentialResponse {
        secret_value: secret,
        expires_at: expires_at.timestamp(),
    }))
}

#[derive(Debug, Deserialize)]
struct RealtimeQuery {
    token: Option<String>,
}

async fn realtime(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Query(query): Query<RealtimeQuery>,
    upgrade: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            tracing::debug!(reason = %rejection.body_text(), "rejected upgrade");
            return RelayError::BadUpgrade(rejection.status(), rejection.body_text())
                .into_response();
        }
    };

    let token = bearer(&headers).or(query.token.as_deref());
    let Some(grant) = token.and_then(|t| state.grants.consume(t)) else {
        tracing::warn!("upgrade with invalid session credential");
        return RelayError::InvalidCredential.into_response();
    };

    upgrade.on_upgrade(move |socket| bridge::run(socket, grant, state))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    active_sessions: usize,
}

async fn health(State(state): State<Arc<RelayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        active_sessions: state.active_sessions(),
    })
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    fn server(client_api_key: Option<&str>) -> RelayServer {
        RelayServer::new(RelayConfig {
            client_api_key: client_api_key.map(|k| SecretString::from(k.to_string())),
            ..RelayConfig::default()
        })
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn session_request(auth: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/session")
            .header("content-type", "application/json");
        if let Some(auth) = auth {
            builder = builder.header("authorization", auth);
        }
        builder
            .body(Body::from(r#"{"model":"m","voice":"v","instructions":"i"}"#))
            .unwrap()
    }

    #[test]
    fn test_bearer() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer(&headers), Some("abc"));

        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer(&headers), None);
    }

    #[tokio::test]
    async fn mint_requires_identity() {
        let response = server(None)
            .router()
            .oneshot(session_request(None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "auth_required");
    }

    #[tokio::test]
    async fn mint_checks_configured_identity() {
        let response = server(Some("letmein"))
            .router()
            .oneshot(session_request(Some("Bearer nope")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "invalid_identity");
    }

    #[tokio::test]
    async fn mint_returns_credential() {
        let relay = server(Some("letmein"));
        let state = relay.state();
        let response = relay
            .router()
            .oneshot(session_request(Some("Bearer letmein")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        let secret = body["secretValue"].as_str().unwrap();
        let expires_at = body["expiresAt"].as_i64().unwrap();
        assert!(expires_at > chrono::Utc::now().timestamp() + 30);

        let grant = state.grants.consume(secret).unwrap();
        assert_eq!(grant.model, "m");
        assert_eq!(grant.instructions, "i");
    }

    #[tokio::test]
    async fn plain_get_is_bad_upgrade() {
        let response = server(None)
            .router()
            .oneshot(
                Request::builder()
                    .uri("/realtime")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());
        assert_eq!(json_body(response).await["error"], "bad_upgrade");
    }

    #[tokio::test]
    async fn health_reports_idle() {
        let response = server(None)
            .router()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_sessions"], 0);
    }
}
