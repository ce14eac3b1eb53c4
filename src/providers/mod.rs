//! # Provider Clients
//!
//! Thin typed HTTP clients for the external systems the workers call: the
//! CRM API (lead sync) and the bot API (outbound messages). Each exposes
//! exactly one operation per external call site; retries happen at the job
//! level, the clients only bound each request with a timeout.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Per-request timeout for all provider calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure from a provider call, classified for job-level retry.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("provider response malformed: {0}")]
    MalformedResponse(String),

    #[error("provider credentials incomplete: {0}")]
    Credentials(String),
}

impl ProviderError {
    /// Network faults and server-side errors are worth retrying; auth,
    /// client errors and malformed bodies are not.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Transport(_) => true,
            ProviderError::Api { status, .. } => *status >= 500 || *status == 429,
            ProviderError::MalformedResponse(_) => false,
            ProviderError::Credentials(_) => false,
        }
    }
}

/// Decrypted CRM credential payload stored in an integration's blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CrmCredentials {
    pub api_base: String,
    pub access_token: String,
}

/// Decrypted bot credential payload stored in an integration's blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BotCredentials {
    pub bot_token: String,
}

/// CRM boundary: one fetch operation for the sync workload.
#[async_trait]
pub trait CrmApi: Send + Sync {
    /// Fetches the tenant's leads as raw provider objects. The caller reuses
    /// the webhook upsert path, so the shape stays the provider's own.
    async fn fetch_leads(&self, credentials: &CrmCredentials)
    -> Result<Vec<JsonValue>, ProviderError>;
}

/// Bot boundary: one send operation for notification dispatch.
#[async_trait]
pub trait BotApi: Send + Sync {
    async fn send_message(
        &self,
        token: &str,
        chat_id: &str,
        text: &str,
    ) -> Result<(), ProviderError>;
}

/// HTTP implementation of [`CrmApi`].
pub struct HttpCrmClient {
    client: Client,
}

impl HttpCrmClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }
}

impl Default for HttpCrmClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct LeadsEnvelope {
    leads: Vec<JsonValue>,
}

#[async_trait]
impl CrmApi for HttpCrmClient {
    async fn fetch_leads(
        &self,
        credentials: &CrmCredentials,
    ) -> Result<Vec<JsonValue>, ProviderError> {
        let url = format!("{}/leads", credentials.api_base.trim_end_matches('/'));

        let response = self
            .client
            .get(&url)
            .bearer_auth(&credentials.access_token)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, message });
        }

        let envelope: LeadsEnvelope = response
            .json()
            .await
            .map_err(|err| ProviderError::MalformedResponse(err.to_string()))?;

        debug!(count = envelope.leads.len(), "Fetched CRM leads");
        Ok(envelope.leads)
    }
}

/// HTTP implementation of [`BotApi`] speaking the Telegram-style
/// `sendMessage` shape.
pub struct HttpBotClient {
    client: Client,
    api_base: String,
}

impl HttpBotClient {
    pub fn new(api_base: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            api_base: api_base.into(),
        }
    }
}

#[async_trait]
impl BotApi for HttpBotClient {
    async fn send_message(
        &self,
        token: &str,
        chat_id: &str,
        text: &str,
    ) -> Result<(), ProviderError> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            token
        );

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, message });
        }

        debug!(chat_id = %chat_id, "Bot message sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetch_leads_parses_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/leads"))
            .and(header("authorization", "Bearer secret-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "leads": [
                    {"id": 101, "name": "Acme deal", "status_id": 3},
                    {"id": 102, "name": "Globex deal"}
                ]
            })))
            .mount(&server)
            .await;

        let client = HttpCrmClient::new();
        let credentials = CrmCredentials {
            api_base: server.uri(),
            access_token: "secret-token".to_string(),
        };

        let leads = client.fetch_leads(&credentials).await.expect("fetch");
        assert_eq!(leads.len(), 2);
        assert_eq!(leads[0]["id"], 101);
        assert_eq!(leads[1]["name"], "Globex deal");
    }

    #[tokio::test]
    async fn fetch_leads_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/leads"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let client = HttpCrmClient::new();
        let credentials = CrmCredentials {
            api_base: server.uri(),
            access_token: "token".to_string(),
        };

        let err = client.fetch_leads(&credentials).await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, ProviderError::Api { status: 502, .. }));
    }

    #[tokio::test]
    async fn fetch_leads_auth_error_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/leads"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&server)
            .await;

        let client = HttpCrmClient::new();
        let credentials = CrmCredentials {
            api_base: server.uri(),
            access_token: "expired".to_string(),
        };

        let err = client.fetch_leads(&credentials).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn fetch_leads_malformed_body_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/leads"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = HttpCrmClient::new();
        let credentials = CrmCredentials {
            api_base: server.uri(),
            access_token: "token".to_string(),
        };

        let err = client.fetch_leads(&credentials).await.unwrap_err();
        assert!(matches!(err, ProviderError::MalformedResponse(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn send_message_posts_telegram_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot12345:token/sendMessage"))
            .and(body_json(json!({ "chat_id": "-100", "text": "New lead" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpBotClient::new(server.uri());
        client
            .send_message("12345:token", "-100", "New lead")
            .await
            .expect("send");
    }

    #[tokio::test]
    async fn send_message_rate_limited_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bottoken/sendMessage"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let client = HttpBotClient::new(server.uri());
        let err = client
            .send_message("token", "-1", "hello")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
