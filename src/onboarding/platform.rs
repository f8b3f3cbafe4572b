//! Identity platform client
//!
//! Thin wrapper around a shared `reqwest::Client` that knows the platform's
//! URL layout and credentials, sends one request and hands back the status
//! and decoded body. Classifying the response is left to the stages.

use crate::config::PlatformConfig;
use crate::onboarding::types::{AccessTokenContext, Fault, TokenScope};
use serde_json::Value;
use std::time::Duration;

/// Build the HTTP client used for all platform calls
///
/// The client is shared across runs for connection pooling only; it carries
/// no per-run state.
pub fn build_http_client(config: &PlatformConfig) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .user_agent(concat!("tenant-onboarding/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Status and decoded body of a platform response
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformResponse {
    /// HTTP status code
    pub status: u16,
    /// JSON body, `Value::Null` when empty, a JSON string when not JSON
    pub body: Value,
}

impl PlatformResponse {
    /// 2xx status
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Best human-readable error text in the body
    pub fn error_message(&self, fallback: &str) -> String {
        for key in ["error_description", "detail", "description", "message", "error"] {
            if let Some(text) = self.body.get(key).and_then(Value::as_str) {
                if !text.is_empty() {
                    return text.to_string();
                }
            }
        }
        if let Some(text) = self.body.as_str() {
            if !text.is_empty() {
                return text.to_string();
            }
        }
        format!("{} (HTTP {})", fallback, self.status)
    }

    /// Turn a non-success response into a fault with the body passed through
    pub fn into_fault(self, fallback: &str) -> Fault {
        let message = self.error_message(fallback);
        let details = match self.body {
            Value::Null => None,
            body => Some(body),
        };
        Fault::rejected(self.status, message, details)
    }
}

/// Client for the identity platform's organization and SCIM APIs
#[derive(Clone)]
pub struct PlatformClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    scopes: String,
}

impl PlatformClient {
    /// Create a client for the configured platform
    pub fn new(http: reqwest::Client, config: &PlatformConfig) -> Self {
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            scopes: config.scopes.join(" "),
        }
    }

    /// Underlying HTTP client
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Service client id
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Service client secret
    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    /// Space-separated scope list
    pub fn scopes(&self) -> &str {
        &self.scopes
    }

    /// URL under the root organization
    pub fn root_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// URL under the organization a token is scoped to
    ///
    /// Fails when handed a service-scoped token, so organization endpoints
    /// can only be reached after the context switch.
    pub fn org_url(&self, token: &AccessTokenContext, path: &str) -> Result<String, Fault> {
        token
            .org_id()
            .map(|org_id| format!("{}/o/{}{}", self.base_url, org_id, path))
            .ok_or_else(|| {
                Fault::internal("Organization endpoint called with a service-scoped token")
            })
    }

    /// Reject anything but a service-scoped token
    pub fn require_service(&self, token: &AccessTokenContext) -> Result<(), Fault> {
        match token.scope() {
            TokenScope::Service => Ok(()),
            TokenScope::Organization(_) => Err(Fault::internal(
                "Root organization endpoint called with an organization-scoped token",
            )),
        }
    }

    /// Send a request and decode the response
    ///
    /// Transport errors (connect, timeout, body read) become
    /// `FailureKind::Unavailable` faults; HTTP error statuses are returned as
    /// ordinary responses.
    pub async fn send(
        &self,
        request: reqwest::RequestBuilder,
        operation: &str,
    ) -> Result<PlatformResponse, Fault> {
        let response = request.send().await.map_err(|e| {
            tracing::warn!(operation = operation, error = %e, "Platform request failed");
            Fault::unavailable(format!("Failed to reach identity platform during {}: {}", operation, e))
        })?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| {
            Fault::unavailable(format!(
                "Failed to read identity platform response during {}: {}",
                operation, e
            ))
        })?;

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        tracing::debug!(
            operation = operation,
            status_code = status,
            "Platform responded"
        );

        Ok(PlatformResponse { status, body })
    }
}
