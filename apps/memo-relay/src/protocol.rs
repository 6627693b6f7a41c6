//! Wire protocol spoken over the relay socket.
//!
//! Every frame is a JSON envelope:
//!
//! ```text
//! { "type": <tag>, "payload": <object>, "senderId"?: string, "groupId"?: string | number }
//! ```
//!
//! Decoding happens in two stages so that an unrecognised `type` can be told
//! apart from a payload that does not fit its declared type.

use std::fmt;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

/// Discriminant carried in the envelope `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    AuthSuccess,
    MemoCreate,
    MemoUpdate,
    MemoDelete,
    GroupJoin,
    GroupLeave,
    BroadcastMessage,
    Ping,
    Pong,
    Error,
}

impl MessageKind {
    pub const ALL: [MessageKind; 10] = [
        MessageKind::AuthSuccess,
        MessageKind::MemoCreate,
        MessageKind::MemoUpdate,
        MessageKind::MemoDelete,
        MessageKind::GroupJoin,
        MessageKind::GroupLeave,
        MessageKind::BroadcastMessage,
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::AuthSuccess => "AUTH_SUCCESS",
            MessageKind::MemoCreate => "MEMO_CREATE",
            MessageKind::MemoUpdate => "MEMO_UPDATE",
            MessageKind::MemoDelete => "MEMO_DELETE",
            MessageKind::GroupJoin => "GROUP_JOIN",
            MessageKind::GroupLeave => "GROUP_LEAVE",
            MessageKind::BroadcastMessage => "BROADCAST_MESSAGE",
            MessageKind::Ping => "PING",
            MessageKind::Pong => "PONG",
            MessageKind::Error => "ERROR",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }

    /// Types only the server emits; clients sending them get an error back.
    pub fn is_server_only(self) -> bool {
        matches!(
            self,
            MessageKind::AuthSuccess | MessageKind::Pong | MessageKind::Error
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier that clients may send either as a JSON string or an integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceId {
    Int(i64),
    Text(String),
}

impl ResourceId {
    pub fn is_blank(&self) -> bool {
        match self {
            ResourceId::Int(_) => false,
            ResourceId::Text(text) => text.trim().is_empty(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Int(value) => write!(f, "{value}"),
            ResourceId::Text(value) => f.write_str(value),
        }
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        ResourceId::Text(value.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        ResourceId::Text(value)
    }
}

impl From<i64> for ResourceId {
    fn from(value: i64) -> Self {
        ResourceId::Int(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSuccess {
    pub user_id: String,
}

/// Payload of `MEMO_CREATE` and `MEMO_UPDATE`. Fields the relay does not
/// interpret are kept in `extra` so relayed envelopes stay intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ResourceId>,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<ResourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<ResourceId>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoDelete {
    pub id: ResourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<ResourceId>,
}

/// Payload of `GROUP_JOIN` / `GROUP_LEAVE`. The id is optional at the codec
/// level; its absence is a validation failure reported by the handler.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<ResourceId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastText {
    pub text: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Typed payload, one variant per [`MessageKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    AuthSuccess(AuthSuccess),
    MemoCreate(MemoDraft),
    MemoUpdate(MemoDraft),
    MemoDelete(MemoDelete),
    GroupJoin(GroupTarget),
    GroupLeave(GroupTarget),
    Broadcast(BroadcastText),
    Ping,
    Pong,
    Error(ErrorPayload),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::AuthSuccess(_) => MessageKind::AuthSuccess,
            Message::MemoCreate(_) => MessageKind::MemoCreate,
            Message::MemoUpdate(_) => MessageKind::MemoUpdate,
            Message::MemoDelete(_) => MessageKind::MemoDelete,
            Message::GroupJoin(_) => MessageKind::GroupJoin,
            Message::GroupLeave(_) => MessageKind::GroupLeave,
            Message::Broadcast(_) => MessageKind::BroadcastMessage,
            Message::Ping => MessageKind::Ping,
            Message::Pong => MessageKind::Pong,
            Message::Error(_) => MessageKind::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message: Message,
    pub sender_id: Option<String>,
    pub group_id: Option<ResourceId>,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            sender_id: None,
            group_id: None,
        }
    }

    pub fn auth_success(user_id: impl Into<String>) -> Self {
        Self::new(Message::AuthSuccess(AuthSuccess {
            user_id: user_id.into(),
        }))
    }

    pub fn error(message: impl Into<String>, code: Option<&str>) -> Self {
        Self::new(Message::Error(ErrorPayload {
            message: message.into(),
            code: code.map(str::to_string),
        }))
    }

    pub fn pong() -> Self {
        Self::new(Message::Pong)
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    pub fn with_group(mut self, group_id: impl Into<ResourceId>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Replaces any client-supplied `senderId` with the authenticated identity.
    pub fn stamped(&self, sender: &str) -> Self {
        let mut stamped = self.clone();
        stamped.sender_id = Some(sender.to_string());
        stamped
    }
}

#[derive(Serialize)]
struct EmptyPayload {}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields =
            2 + usize::from(self.sender_id.is_some()) + usize::from(self.group_id.is_some());
        let mut state = serializer.serialize_struct("Envelope", fields)?;
        state.serialize_field("type", self.kind().as_str())?;
        match &self.message {
            Message::AuthSuccess(payload) => state.serialize_field("payload", payload)?,
            Message::MemoCreate(payload) | Message::MemoUpdate(payload) => {
                state.serialize_field("payload", payload)?
            }
            Message::MemoDelete(payload) => state.serialize_field("payload", payload)?,
            Message::GroupJoin(payload) | Message::GroupLeave(payload) => {
                state.serialize_field("payload", payload)?
            }
            Message::Broadcast(payload) => state.serialize_field("payload", payload)?,
            Message::Error(payload) => state.serialize_field("payload", payload)?,
            Message::Ping | Message::Pong => state.serialize_field("payload", &EmptyPayload {})?,
        }
        match &self.sender_id {
            Some(sender) => state.serialize_field("senderId", sender)?,
            None => state.skip_field("senderId")?,
        }
        match &self.group_id {
            Some(group) => state.serialize_field("groupId", group)?,
            None => state.skip_field("groupId")?,
        }
        state.end()
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid message format: {0}")]
    Malformed(String),
    #[error("binary frame is not valid UTF-8")]
    NotUtf8,
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: MessageKind, reason: String },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    sender_id: Option<String>,
    #[serde(default)]
    group_id: Option<ResourceId>,
}

pub fn decode(raw: &str) -> Result<Envelope, DecodeError> {
    let envelope: RawEnvelope =
        serde_json::from_str(raw).map_err(|err| DecodeError::Malformed(err.to_string()))?;
    let kind = MessageKind::from_tag(&envelope.kind)
        .ok_or_else(|| DecodeError::UnknownType(envelope.kind.clone()))?;

    // A missing or null payload is read as an empty object.
    let payload = match envelope.payload {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };

    let message = match kind {
        MessageKind::AuthSuccess => Message::AuthSuccess(payload_as(kind, payload)?),
        MessageKind::MemoCreate => Message::MemoCreate(payload_as(kind, payload)?),
        MessageKind::MemoUpdate => {
            let draft: MemoDraft = payload_as(kind, payload)?;
            if draft.id.is_none() {
                return Err(DecodeError::InvalidPayload {
                    kind,
                    reason: "missing field `id`".to_string(),
                });
            }
            Message::MemoUpdate(draft)
        }
        MessageKind::MemoDelete => Message::MemoDelete(payload_as(kind, payload)?),
        MessageKind::GroupJoin => Message::GroupJoin(payload_as(kind, payload)?),
        MessageKind::GroupLeave => Message::GroupLeave(payload_as(kind, payload)?),
        MessageKind::BroadcastMessage => Message::Broadcast(payload_as(kind, payload)?),
        MessageKind::Ping => Message::Ping,
        MessageKind::Pong => Message::Pong,
        MessageKind::Error => Message::Error(payload_as(kind, payload)?),
    };

    Ok(Envelope {
        message,
        sender_id: envelope.sender_id,
        group_id: envelope.group_id,
    })
}

/// Binary frames are accepted when they carry UTF-8 JSON.
pub fn decode_bytes(raw: &[u8]) -> Result<Envelope, DecodeError> {
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::NotUtf8)?;
    decode(text)
}

pub fn encode(envelope: &Envelope) -> String {
    match serde_json::to_string(envelope) {
        Ok(json) => json,
        Err(err) => {
            warn!(error = %err, kind = %envelope.kind(), "failed to encode envelope");
            r#"{"type":"ERROR","payload":{"message":"internal encoding error"}}"#.to_string()
        }
    }
}

fn payload_as<T: serde::de::DeserializeOwned>(
    kind: MessageKind,
    payload: Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(payload).map_err(|err| DecodeError::InvalidPayload {
        kind,
        reason: err.to_string(),
    })
}
