//! HTTP adapter for the remote write API.
//!
//! The HTTP client itself is abstracted by [`HttpClient`] so hosts can plug
//! in the library they already use (reqwest, hyper, a platform bridge).
//! Bodies are JSON; the server answers a successful write with `{"id": ...}`.

use crate::remote::{RemoteApi, RemoteFailure, RemoteReceipt, RemoteRequest};
use async_trait::async_trait;
use fieldsync_store::QueueItemType;
use serde::Deserialize;

/// HTTP method used for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// Create.
    Post,
    /// Replace.
    Put,
}

/// A raw HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

/// HTTP client abstraction.
///
/// `Err` means no response was received at all (connection refused, DNS,
/// reset). Any response, whatever its status, is `Ok`.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a JSON request.
    async fn send(
        &self,
        method: HttpMethod,
        url: &str,
        tenant_id: &str,
        body: Vec<u8>,
    ) -> Result<HttpResponse, String>;
}

#[derive(Deserialize)]
struct Created {
    id: serde_json::Value,
}

/// [`RemoteApi`] over HTTP.
pub struct HttpRemote<C: HttpClient> {
    base_url: String,
    client: C,
}

impl<C: HttpClient> HttpRemote<C> {
    /// Creates an adapter for the server at `base_url`.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Method and path for a request.
    pub fn route(request: &RemoteRequest) -> Result<(HttpMethod, String), RemoteFailure> {
        let route = match request.item_type {
            QueueItemType::FormSubmission => (HttpMethod::Post, "/forms".to_string()),
            QueueItemType::FormUpdate => {
                let id = request.server_id.as_deref().ok_or_else(|| {
                    RemoteFailure::InvalidRequest("form update without a server id".into())
                })?;
                (HttpMethod::Put, format!("/forms/{id}"))
            }
            QueueItemType::PhotoUpload => (HttpMethod::Post, "/evidence/photos".to_string()),
            QueueItemType::Evidence => (HttpMethod::Post, "/evidence".to_string()),
        };
        Ok(route)
    }
}

#[async_trait]
impl<C: HttpClient> RemoteApi for HttpRemote<C> {
    async fn submit(&self, request: &RemoteRequest) -> Result<RemoteReceipt, RemoteFailure> {
        let (method, path) = Self::route(request)?;
        let body = serde_json::to_vec(&request.body)
            .map_err(|e| RemoteFailure::InvalidRequest(e.to_string()))?;

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .send(method, &url, &request.tenant_id, body)
            .await
            .map_err(RemoteFailure::Network)?;

        if !(200..300).contains(&response.status) {
            let message = String::from_utf8_lossy(&response.body).trim().to_string();
            return Err(RemoteFailure::http(response.status, message));
        }

        let created: Created = serde_json::from_slice(&response.body)
            .map_err(|e| RemoteFailure::MalformedResponse(e.to_string()))?;
        match created.id {
            serde_json::Value::String(id) if !id.is_empty() => Ok(RemoteReceipt::new(id)),
            serde_json::Value::Number(id) => Ok(RemoteReceipt::new(id.to_string())),
            other => Err(RemoteFailure::MalformedResponse(format!(
                "unexpected id {other}"
            ))),
        }
    }
}
