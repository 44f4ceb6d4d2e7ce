//! Remote API contract and response classification.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use stockman_core::{EntityType, Operation};

use crate::action::{QueuedAction, target_from_payload};

/// Failure of a remote call, as seen by the processor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Retry later (network failure, timeout, 5xx, 408/429, expired session).
    #[error("{0}")]
    Transient(String),
    /// The server rejected the payload; retrying cannot succeed.
    #[error("{0}")]
    Permanent(String),
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            RemoteError::Transient(m) | RemoteError::Permanent(m) => m,
        }
    }
}

/// Body returned by a successful remote call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteRecord {
    pub body: Value,
}

impl RemoteRecord {
    pub fn new(body: Value) -> Self {
        Self { body }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Id the server assigned to the record, if the body carries one.
    pub fn server_id(&self, entity_type: EntityType) -> Option<String> {
        target_from_payload(entity_type, &self.body)
    }
}

/// Remote mutation endpoints.
///
/// `update` takes an optional id because singletons (settings) are addressed
/// without one.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn create(&self, entity_type: EntityType, payload: &Value) -> Result<RemoteRecord, RemoteError>;

    async fn update(
        &self,
        entity_type: EntityType,
        id: Option<&str>,
        payload: &Value,
    ) -> Result<RemoteRecord, RemoteError>;

    async fn delete(&self, entity_type: EntityType, id: &str) -> Result<RemoteRecord, RemoteError>;
}

#[async_trait]
impl<R> RemoteApi for Arc<R>
where
    R: RemoteApi + ?Sized,
{
    async fn create(&self, entity_type: EntityType, payload: &Value) -> Result<RemoteRecord, RemoteError> {
        (**self).create(entity_type, payload).await
    }

    async fn update(
        &self,
        entity_type: EntityType,
        id: Option<&str>,
        payload: &Value,
    ) -> Result<RemoteRecord, RemoteError> {
        (**self).update(entity_type, id, payload).await
    }

    async fn delete(&self, entity_type: EntityType, id: &str) -> Result<RemoteRecord, RemoteError> {
        (**self).delete(entity_type, id).await
    }
}

/// Replay one queued action against the remote API.
pub async fn dispatch(remote: &dyn RemoteApi, action: &QueuedAction) -> Result<RemoteRecord, RemoteError> {
    match action.operation {
        Operation::Create => remote.create(action.entity_type, &action.payload).await,
        Operation::Update => {
            remote
                .update(action.entity_type, action.target_id.as_deref(), &action.payload)
                .await
        }
        Operation::Delete => match action.target_id.as_deref() {
            Some(id) => remote.delete(action.entity_type, id).await,
            None => Err(RemoteError::permanent(format!(
                "unsupported operation: delete {} without id",
                action.entity_type
            ))),
        },
    }
}

/// Map an HTTP status and body to success or a classified error.
///
/// 401 is transient: an expired session is refreshed by the app and the
/// action must survive until then.
pub fn classify_status(status: u16, body: &str) -> Result<(), RemoteError> {
    match status {
        200..=299 => Ok(()),
        401 | 408 | 429 | 500..=599 => Err(RemoteError::transient(format!(
            "HTTP {status}: {}",
            error_detail(body)
        ))),
        _ => Err(RemoteError::permanent(error_detail(body))),
    }
}

/// Human-readable message out of a FastAPI-style error body.
pub fn error_detail(body: &str) -> String {
    const FALLBACK: &str = "server error";

    let Ok(json) = serde_json::from_str::<Value>(body) else {
        let trimmed = body.trim();
        return if trimmed.is_empty() || trimmed.len() > 200 {
            FALLBACK.to_string()
        } else {
            trimmed.to_string()
        };
    };

    match json.get("detail") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => {
            let lines: Vec<String> = items.iter().map(validation_line).collect();
            if lines.is_empty() {
                FALLBACK.to_string()
            } else {
                lines.join("\n")
            }
        }
        Some(other @ Value::Object(_)) => other.to_string(),
        _ => json
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| FALLBACK.to_string()),
    }
}

fn validation_line(item: &Value) -> String {
    let msg = item.get("msg").and_then(Value::as_str).unwrap_or("invalid value");
    let loc = item.get("loc").and_then(Value::as_array).map(|parts| {
        parts
            .iter()
            .filter(|p| p.as_str() != Some("body"))
            .map(|p| match p {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(".")
    });

    match loc {
        Some(loc) if !loc.is_empty() => format!("{loc}: {msg}"),
        _ => msg.to_string(),
    }
}
