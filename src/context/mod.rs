//! Two-phase instruction delivery
//!
//! Phase 1 builds a minimal payload synchronously so negotiation never waits
//! on context assembly. Phase 2 runs once the channel is open: assembly
//! from a [`ContextSource`] races a deadline, and the result (or the minimal
//! payload if the deadline wins) is sent as a single `session.update`.
//!
//! The enhanced send happens at most once per channel. Delivery is never
//! retried; a second send could leave conflicting instructions mid-session.

mod source;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use source::{FileContextSource, StaticContext};

use crate::Result;
use crate::session::SessionPhase;
use crate::transport::{ChannelHandle, ClientEvent};

/// Default deadline for enhanced-context assembly
pub const DEFAULT_ENHANCE_TIMEOUT: Duration = Duration::from_millis(3000);

/// Shortest acceptable assembly deadline
pub const MIN_ENHANCE_TIMEOUT: Duration = Duration::from_millis(2500);

/// Default wait for a `session.updated` acknowledgement
pub const DEFAULT_ACK_GRACE: Duration = Duration::from_millis(1000);

/// Static note carried by every payload
pub const BOILERPLATE_NOTE: &str = "You are a realtime voice assistant. \
Keep replies brief and conversational, and let the caller finish speaking before you answer.";

/// Which phase produced a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextPhase {
    Minimal,
    Enhanced,
}

/// Instructions pushed to the upstream service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextPayload {
    pub instructions: String,
    pub phase: ContextPhase,
}

impl ContextPayload {
    /// Boilerplate plus, at most, the caller identifier
    #[must_use]
    pub fn minimal(caller_id: Option<&str>) -> Self {
        let instructions = match caller_id {
            Some(id) if !id.is_empty() => format!("{BOILERPLATE_NOTE}\nCaller: {id}"),
            _ => BOILERPLATE_NOTE.to_string(),
        };
        Self {
            instructions,
            phase: ContextPhase::Minimal,
        }
    }

    /// Minimal payload extended with assembled context
    #[must_use]
    pub fn enhanced(request: &ContextRequest, assembled: &str) -> Self {
        let base = Self::minimal(request.caller_id.as_deref());
        Self {
            instructions: format!(
                "{}\nSession phase: {}\n\n{}",
                base.instructions,
                request.phase,
                assembled.trim()
            ),
            phase: ContextPhase::Enhanced,
        }
    }
}

/// Inputs for context assembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRequest {
    /// Opaque caller identifier
    pub caller_id: Option<String>,
    /// Caller-supplied progress value
    pub phase: SessionPhase,
}

/// External collaborator that assembles enhanced context
#[async_trait]
pub trait ContextSource: Send + Sync {
    /// Produce the context body; may be slow
    async fn assemble(&self, request: &ContextRequest) -> Result<String>;
}

/// How a delivery attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Remote echoed the sent instructions in `session.updated`
    Acknowledged,
    /// No acknowledgement, but the channel stayed open through the grace window
    Implicit,
    /// Send failed or the channel closed before the grace window ended
    Failed(String),
    /// Context was already sent on this channel; nothing was sent
    AlreadySent,
}

/// Result of phase 2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// Phase of the payload that was sent, `None` if nothing was sent
    pub phase: Option<ContextPhase>,
    pub status: DeliveryStatus,
}

impl DeliveryOutcome {
    /// Whether the payload is believed to be in effect
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(
            self.status,
            DeliveryStatus::Acknowledged | DeliveryStatus::Implicit
        )
    }
}

/// Drives both context phases
#[derive(Clone)]
pub struct ContextProtocol {
    source: Option<Arc<dyn ContextSource>>,
    enhance_timeout: Duration,
    ack_grace: Duration,
}

impl ContextProtocol {
    /// Protocol over an optional source; without one phase 2 sends the minimal payload
    #[must_use]
    pub fn new(source: Option<Arc<dyn ContextSource>>) -> Self {
        Self {
            source,
            enhance_timeout: DEFAULT_ENHANCE_TIMEOUT,
            ack_grace: DEFAULT_ACK_GRACE,
        }
    }

    /// Set the assembly deadline, raised to the 2500 ms minimum if shorter
    #[must_use]
    pub fn with_enhance_timeout(mut self, timeout: Duration) -> Self {
        if timeout < MIN_ENHANCE_TIMEOUT {
            tracing::warn!(
                requested_ms = timeout.as_millis(),
                minimum_ms = MIN_ENHANCE_TIMEOUT.as_millis(),
                "context timeout below minimum, clamping"
            );
            self.enhance_timeout = MIN_ENHANCE_TIMEOUT;
        } else {
            self.enhance_timeout = timeout;
        }
        self
    }

    /// Set the acknowledgement grace window
    #[must_use]
    pub const fn with_ack_grace(mut self, grace: Duration) -> Self {
        self.ack_grace = grace;
        self
    }

    /// Assembly deadline in effect
    #[must_use]
    pub const fn enhance_timeout(&self) -> Duration {
        self.enhance_timeout
    }

    /// Phase 1: synchronous, no I/O
    #[must_use]
    pub fn minimal(&self, request: &ContextRequest) -> ContextPayload {
        ContextPayload::minimal(request.caller_id.as_deref())
    }

    /// Race assembly against the deadline, falling back to the minimal payload
    ///
    /// A timed-out assembly is dropped, cancelling its in-flight work.
    pub async fn assemble(&self, request: &ContextRequest) -> ContextPayload {
        let Some(source) = &self.source else {
            return self.minimal(request);
        };

        match tokio::time::timeout(self.enhance_timeout, source.assemble(request)).await {
            Ok(Ok(body)) if !body.trim().is_empty() => ContextPayload::enhanced(request, &body),
            Ok(Ok(_)) => {
                tracing::debug!("context source returned nothing, using minimal context");
                self.minimal(request)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "context assembly failed, using minimal context");
                self.minimal(request)
            }
            Err(_) => {
                tracing::info!(
                    timeout_ms = self.enhance_timeout.as_millis(),
                    "context assembly timed out, using minimal context"
                );
                self.minimal(request)
            }
        }
    }

    /// Phase 2: assemble and send once, then wait for acknowledgement
    pub async fn deliver(&self, channel: &ChannelHandle, request: &ContextRequest) -> DeliveryOutcome {
        if !channel.claim_context_slot() {
            tracing::debug!(channel_id = channel.id(), "context already sent on channel");
            return DeliveryOutcome {
                phase: None,
                status: DeliveryStatus::AlreadySent,
            };
        }

        let payload = self.assemble(request).await;
        let phase = Some(payload.phase);

        let mut acks = channel.acks();
        acks.mark_unchanged();

        if let Err(e) = channel
            .send_event(ClientEvent::session_update(payload.instructions.clone()))
            .await
        {
            tracing::warn!(channel_id = channel.id(), error = %e, "context send failed");
            return DeliveryOutcome {
                phase,
                status: DeliveryStatus::Failed(e.to_string()),
            };
        }

        let grace = tokio::time::sleep(self.ack_grace);
        tokio::pin!(grace);

        let status = loop {
            tokio::select! {
                changed = acks.changed() => {
                    if changed.is_err() {
                        break DeliveryStatus::Failed("channel closed before acknowledgement".to_string());
                    }
                    // Acks for other updates (the relay's own, an earlier one) don't count
                    if acks.borrow_and_update().as_deref() == Some(payload.instructions.as_str()) {
                        break DeliveryStatus::Acknowledged;
                    }
                }
                () = channel.closed() => {
                    break DeliveryStatus::Failed("channel closed before acknowledgement".to_string());
                }
                () = &mut grace => {
                    break if channel.is_open() {
                        DeliveryStatus::Implicit
                    } else {
                        DeliveryStatus::Failed("channel closed during grace window".to_string())
                    };
                }
            }
        };

        tracing::debug!(
            channel_id = channel.id(),
            phase = ?payload.phase,
            status = ?status,
            "context delivered"
        );
        DeliveryOutcome { phase, status }
    }
}
