//! `reqwest` transport for the back-office REST API.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, Url};
use serde_json::Value;
use stockman_core::{EntityType, Operation};

use crate::config::SyncConfig;
use crate::network::{ConnectivityProbe, LinkState};
use crate::remote::{RemoteApi, RemoteError, RemoteRecord, classify_status};

/// HTTP client for the remote API.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(api_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.auth_token.clone(),
        })
    }

    /// Replace the bearer token (e.g. after the app refreshed its session).
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    async fn send(
        &self,
        entity_type: EntityType,
        operation: Operation,
        id: Option<&str>,
        payload: Option<&Value>,
    ) -> Result<RemoteRecord, RemoteError> {
        let endpoint = route(entity_type, operation, id)?;
        let method = endpoint.method.clone();
        let url = endpoint.url(&self.api_url)?;

        let mut req = self.client.request(method.clone(), url.clone());
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(payload) = payload {
            req = req.json(payload);
        }

        tracing::debug!(%method, %url, "sending remote request");
        let resp = req
            .send()
            .await
            .map_err(|e| RemoteError::transient(format!("network error: {e}")))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| RemoteError::transient(format!("failed to read response: {e}")))?;

        classify_status(status, &body)?;

        let body = if body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body).unwrap_or(Value::String(body))
        };
        Ok(RemoteRecord::new(body))
    }
}

/// REST endpoint of one remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Endpoint<'a> {
    pub method: Method,
    /// Collection path relative to `/api`.
    pub resource: &'static str,
    /// Entity id, appended as a single percent-encoded path segment.
    pub id: Option<&'a str>,
}

impl Endpoint<'_> {
    pub fn url(&self, api_url: &str) -> Result<Url, RemoteError> {
        let invalid = |detail: String| RemoteError::permanent(format!("invalid API url {api_url:?}: {detail}"));

        let mut url = Url::parse(&format!("{api_url}/api{}", self.resource)).map_err(|e| invalid(e.to_string()))?;
        if let Some(id) = self.id {
            url.path_segments_mut()
                .map_err(|()| invalid("cannot be a base".to_string()))?
                .push(id);
        }
        Ok(url)
    }
}

/// Endpoint for an `(entity, operation)` pair.
pub(crate) fn route(entity_type: EntityType, operation: Operation, id: Option<&str>) -> Result<Endpoint<'_>, RemoteError> {
    let collection = |method: Method, resource: &'static str| Endpoint {
        method,
        resource,
        id: None,
    };
    let member = |method: Method, resource: &'static str| match id {
        Some(id) => Ok(Endpoint {
            method,
            resource,
            id: Some(id),
        }),
        None => Err(RemoteError::permanent(format!(
            "unsupported operation: {operation} {entity_type} without id"
        ))),
    };

    let resource = match entity_type {
        EntityType::Product => "/products",
        EntityType::Supplier => "/suppliers",
        EntityType::Customer => "/customers",
        EntityType::AlertRule => "/alert-rules",
        EntityType::Expense => "/expenses",
        _ => "",
    };

    match (entity_type, operation) {
        (EntityType::Sale | EntityType::Order, Operation::Create) => Ok(collection(Method::POST, "/sales")),
        (EntityType::Settings, Operation::Update) => Ok(collection(Method::PUT, "/settings")),
        (EntityType::Stock, Operation::Create) => Ok(collection(Method::POST, "/stock/movement")),
        (EntityType::Notification, Operation::Create) => {
            Ok(collection(Method::POST, "/notifications/register-token"))
        }
        (
            EntityType::Product
            | EntityType::Supplier
            | EntityType::Customer
            | EntityType::AlertRule
            | EntityType::Expense,
            Operation::Create,
        ) => Ok(collection(Method::POST, resource)),
        (
            EntityType::Product | EntityType::Supplier | EntityType::Customer | EntityType::AlertRule,
            Operation::Update,
        ) => member(Method::PUT, resource),
        (
            EntityType::Product
            | EntityType::Supplier
            | EntityType::Customer
            | EntityType::AlertRule
            | EntityType::Expense,
            Operation::Delete,
        ) => member(Method::DELETE, resource),
        _ => Err(RemoteError::permanent(format!(
            "unsupported operation: {operation} {entity_type}"
        ))),
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn create(&self, entity_type: EntityType, payload: &Value) -> Result<RemoteRecord, RemoteError> {
        self.send(entity_type, Operation::Create, None, Some(payload)).await
    }

    async fn update(
        &self,
        entity_type: EntityType,
        id: Option<&str>,
        payload: &Value,
    ) -> Result<RemoteRecord, RemoteError> {
        self.send(entity_type, Operation::Update, id, Some(payload)).await
    }

    async fn delete(&self, entity_type: EntityType, id: &str) -> Result<RemoteRecord, RemoteError> {
        self.send(entity_type, Operation::Delete, Some(id), None).await
    }
}

#[async_trait]
impl ConnectivityProbe for HttpRemote {
    /// Any HTTP response from `GET <api>/health` means the API is reachable.
    async fn check(&self) -> LinkState {
        let url = format!("{}/health", self.api_url);
        match self.client.get(&url).send().await {
            Ok(_) => LinkState::online(),
            Err(e) => {
                tracing::debug!(%url, error = %e, "health check failed");
                LinkState::offline()
            }
        }
    }
}
