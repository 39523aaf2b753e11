//! Event-channel message shapes
//!
//! JSON objects tagged by `type`. Unknown server event types deserialize to
//! [`ServerEvent::Unknown`] and are ignored by consumers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current time in unix milliseconds, as carried in ping/pong events
#[must_use]
pub fn timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Instructions pushed with `session.update`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub instructions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

/// Content part of a conversation item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

/// Conversation item created from client text input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

impl ConversationItem {
    /// A user message carrying plain text
    #[must_use]
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            kind: "message".to_string(),
            role: "user".to_string(),
            content: vec![ContentPart {
                kind: "input_text".to_string(),
                text: text.into(),
            }],
        }
    }
}

/// Events sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioCommit,

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate,

    #[serde(rename = "ping")]
    Ping { timestamp: i64 },

    #[serde(rename = "pong")]
    Pong { timestamp: i64 },
}

impl ClientEvent {
    /// Context push carrying `instructions`
    #[must_use]
    pub fn session_update(instructions: impl Into<String>) -> Self {
        Self::SessionUpdate {
            session: SessionSettings {
                instructions: instructions.into(),
                voice: None,
            },
        }
    }

    /// Wire `type` tag
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "session.update",
            Self::InputAudioAppend { .. } => "input_audio_buffer.append",
            Self::InputAudioCommit => "input_audio_buffer.commit",
            Self::ConversationItemCreate { .. } => "conversation.item.create",
            Self::ResponseCreate => "response.create",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }

    /// Serialize to a JSON text message
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Events received from the relay or the upstream service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Relay accepted the connection (sent before upstream is ready)
    #[serde(rename = "connection.established")]
    ConnectionEstablished {
        #[serde(default)]
        time: Option<i64>,
    },

    #[serde(rename = "ping")]
    Ping {
        #[serde(default)]
        timestamp: Option<i64>,
    },

    #[serde(rename = "pong")]
    Pong {
        #[serde(default)]
        timestamp: Option<i64>,
    },

    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: Value,
    },

    /// Acknowledges a `session.update`
    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: Value,
    },

    /// Base64 PCM16 audio
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.audio.done")]
    AudioDone,

    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta { delta: String },

    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone {
        #[serde(default)]
        transcript: Option<String>,
    },

    /// Transcript of the caller's own speech
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscript { transcript: String },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Value,
    },

    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Parse a text message, logging and discarding anything unusable
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str::<Self>(text) {
            Ok(Self::Unknown) => {
                tracing::trace!(event_type = event_type(text).as_deref(), "ignoring unknown event");
                None
            }
            Ok(event) => Some(event),
            Err(e) => {
                tracing::debug!(
                    event_type = event_type(text).as_deref(),
                    error = %e,
                    "ignoring malformed event"
                );
                None
            }
        }
    }

    /// Human-readable message of an `error` event
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        let Self::Error { error } = self else {
            return None;
        };
        Some(
            error
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| error.to_string(), ToString::to_string),
        )
    }
}

/// Extract the `type` tag of a JSON message without interpreting the rest
#[must_use]
pub fn event_type(text: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Tag {
        #[serde(rename = "type")]
        kind: String,
    }

    serde_json::from_str::<Tag>(text).ok().map(|t| t.kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_update_shape() {
        let json = ClientEvent::session_update("be brief").to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "session.update");
        assert_eq!(value["session"]["instructions"], "be brief");
        assert!(value["session"].get("voice").is_none());
    }

    #[test]
    fn unit_events_carry_only_type() {
        let json = ClientEvent::InputAudioCommit.to_json().unwrap();
        assert_eq!(json, r#"{"type":"input_audio_buffer.commit"}"#);
    }

    #[test]
    fn text_input_item() {
        let event = ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text("hello"),
        };
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["item"]["role"], "user");
        assert_eq!(value["item"]["content"][0]["type"], "input_text");
        assert_eq!(value["item"]["content"][0]["text"], "hello");
    }

    #[test]
    fn parses_known_server_events() {
        assert_eq!(
            ServerEvent::parse(r#"{"type":"connection.established","time":1}"#),
            Some(ServerEvent::ConnectionEstablished { time: Some(1) })
        );
        assert_eq!(
            ServerEvent::parse(r#"{"type":"response.audio_transcript.delta","delta":"hi"}"#),
            Some(ServerEvent::TranscriptDelta {
                delta: "hi".to_string()
            })
        );
        assert_eq!(
            ServerEvent::parse(r#"{"type":"response.audio.done","response_id":"r1"}"#),
            Some(ServerEvent::AudioDone)
        );
    }

    #[test]
    fn unknown_and_malformed_are_ignored() {
        assert_eq!(ServerEvent::parse(r#"{"type":"rate_limits.updated"}"#), None);
        assert_eq!(ServerEvent::parse(r#"{"type":"response.audio.delta"}"#), None);
        assert_eq!(ServerEvent::parse("not json"), None);
    }

    #[test]
    fn error_event_message() {
        let event =
            ServerEvent::parse(r#"{"type":"error","error":{"message":"bad audio"}}"#).unwrap();
        assert_eq!(event.error_message().as_deref(), Some("bad audio"));
    }

    #[test]
    fn extracts_type_tag() {
        assert_eq!(
            event_type(r#"{"type":"input_audio_buffer.append","audio":"AAA="}"#).as_deref(),
            Some("input_audio_buffer.append")
        );
        assert_eq!(event_type("[]"), None);
    }
}
