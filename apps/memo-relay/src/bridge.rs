//! Commits memo mutations to the REST API of record before they are relayed.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::protocol::{MemoDraft, Message, ResourceId};

/// Trust-boundary header carrying the authenticated identity.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Shared secret identifying this relay to the backend.
pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoOperation {
    Create,
    Update,
    Delete,
}

impl MemoOperation {
    pub fn method(self) -> Method {
        match self {
            MemoOperation::Create => Method::POST,
            MemoOperation::Update => Method::PATCH,
            MemoOperation::Delete => Method::DELETE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemoOperation::Create => "create",
            MemoOperation::Update => "update",
            MemoOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for MemoOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A memo change ready to be sent to the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoMutation {
    Create { draft: MemoDraft },
    Update { id: ResourceId, draft: MemoDraft },
    Delete { id: ResourceId },
}

impl MemoMutation {
    /// Builds the mutation for a memo message, filling the payload's group
    /// from the envelope when the client left it out. Returns `None` for
    /// non-memo messages and for updates without an id.
    pub fn from_message(message: &Message, group_id: &ResourceId) -> Option<Self> {
        let with_group = |draft: &MemoDraft| {
            let mut draft = draft.clone();
            if draft.group_id.is_none() {
                draft.group_id = Some(group_id.clone());
            }
            draft
        };
        match message {
            Message::MemoCreate(draft) => Some(MemoMutation::Create {
                draft: with_group(draft),
            }),
            Message::MemoUpdate(draft) => draft.id.clone().map(|id| MemoMutation::Update {
                id,
                draft: with_group(draft),
            }),
            Message::MemoDelete(target) => Some(MemoMutation::Delete {
                id: target.id.clone(),
            }),
            _ => None,
        }
    }

    pub fn operation(&self) -> MemoOperation {
        match self {
            MemoMutation::Create { .. } => MemoOperation::Create,
            MemoMutation::Update { .. } => MemoOperation::Update,
            MemoMutation::Delete { .. } => MemoOperation::Delete,
        }
    }

    pub fn memo_id(&self) -> Option<&ResourceId> {
        match self {
            MemoMutation::Create { draft } => draft.id.as_ref(),
            MemoMutation::Update { id, .. } | MemoMutation::Delete { id } => Some(id),
        }
    }

    fn body(&self) -> Option<&MemoDraft> {
        match self {
            MemoMutation::Create { draft } | MemoMutation::Update { draft, .. } => Some(draft),
            MemoMutation::Delete { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("backend rejected {operation} with status {status}")]
    Rejected {
        operation: MemoOperation,
        status: StatusCode,
        message: Option<String>,
    },
    #[error("backend request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),
}

impl BridgeError {
    /// Text relayed to the client that issued the mutation.
    pub fn client_message(&self) -> String {
        match self {
            BridgeError::Rejected {
                message: Some(message),
                ..
            } => message.clone(),
            BridgeError::Rejected {
                operation, status, ..
            } => format!("Backend rejected memo {operation} ({status})"),
            BridgeError::Transport(_) => "Backend unavailable".to_string(),
            BridgeError::Timeout(_) => "Backend timed out".to_string(),
            BridgeError::InvalidUrl(_) => "Backend misconfigured".to_string(),
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            BridgeError::Rejected { .. } => "rejected",
            BridgeError::Transport(_) => "transport",
            BridgeError::Timeout(_) => "timeout",
            BridgeError::InvalidUrl(_) => "invalid_url",
        }
    }
}

#[async_trait]
pub trait MemoBackend: Send + Sync {
    /// Applies the mutation on behalf of `identity`. `Ok` means the backend
    /// accepted it and the event may be relayed.
    async fn apply(&self, identity: &str, mutation: &MemoMutation) -> Result<(), BridgeError>;
}

/// [`MemoBackend`] that talks to the REST API over HTTP. Failures are not
/// retried.
#[derive(Clone)]
pub struct HttpMemoBackend {
    client: Client,
    base_url: Url,
    internal_token: Option<String>,
}

impl HttpMemoBackend {
    pub fn new(client: Client, base_url: Url, internal_token: Option<String>) -> Self {
        Self {
            client,
            base_url: with_trailing_slash(base_url),
            internal_token: internal_token.filter(|token| !token.trim().is_empty()),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn memo_url(&self, id: Option<&ResourceId>) -> Result<Url, BridgeError> {
        let mut url = self
            .base_url
            .join("api/memos")
            .map_err(|err| BridgeError::InvalidUrl(err.to_string()))?;
        if let Some(id) = id {
            url.path_segments_mut()
                .map_err(|_| BridgeError::InvalidUrl(self.base_url.to_string()))?
                .push(&id.to_string());
        }
        Ok(url)
    }
}

#[async_trait]
impl MemoBackend for HttpMemoBackend {
    async fn apply(&self, identity: &str, mutation: &MemoMutation) -> Result<(), BridgeError> {
        let operation = mutation.operation();
        let url = match mutation {
            MemoMutation::Create { .. } => self.memo_url(None)?,
            MemoMutation::Update { id, .. } | MemoMutation::Delete { id } => {
                self.memo_url(Some(id))?
            }
        };

        let mut request = self
            .client
            .request(operation.method(), url.clone())
            .header(USER_ID_HEADER, identity);
        if let Some(token) = &self.internal_token {
            request = request.header(INTERNAL_TOKEN_HEADER, token);
        }
        if let Some(body) = mutation.body() {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            debug!(%operation, %url, %status, "backend accepted memo mutation");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let message = backend_message(&body);
        warn!(
            %operation,
            %url,
            %status,
            message = message.as_deref().unwrap_or(""),
            "backend rejected memo mutation"
        );
        Err(BridgeError::Rejected {
            operation,
            status,
            message,
        })
    }
}

/// Pulls the `message` field out of an error body. Validation failures may
/// carry a list of messages, which are joined.
fn backend_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.get("message")? {
        Value::String(message) if !message.trim().is_empty() => Some(message.clone()),
        Value::Array(items) => {
            let parts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        _ => None,
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
