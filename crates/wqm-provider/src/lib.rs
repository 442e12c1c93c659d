//! Client for the external phone-number status provider (Meta Graph API).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "wqm-provider";

/// Fields requested for every phone number lookup.
pub const DETAIL_FIELDS: &str = "id,quality_rating,messaging_limit_tier,verified_name,\
display_phone_number,name_status,code_verification_status,status,platform_type,throughput";

/// Opaque bearer credential. Never printed; identify it by fingerprint.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    access_token: String,
}

impl Credential {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.access_token
    }

    /// First 12 hex chars of the token's SHA-256.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.access_token.as_bytes());
        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(12);
        digest
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.fingerprint())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Throughput {
    pub level: Option<String>,
}

/// Raw provider vocabulary; translation happens in the mapper.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NumberDetail {
    pub id: Option<String>,
    pub quality_rating: Option<String>,
    pub messaging_limit_tier: Option<String>,
    pub verified_name: Option<String>,
    pub display_phone_number: Option<String>,
    pub name_status: Option<String>,
    pub code_verification_status: Option<String>,
    pub status: Option<String>,
    pub platform_type: Option<String>,
    pub throughput: Option<Throughput>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network failure: {0}")]
    Network(String),
    #[error("provider returned {status}: {message}")]
    Api {
        status: u16,
        code: Option<i64>,
        message: String,
    },
    #[error("undecodable provider response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait StatusProvider: Send + Sync {
    /// One lookup, no retries. Retry policy belongs to the caller.
    async fn fetch_number_detail(
        &self,
        phone_number_id: &str,
        credential: &Credential,
    ) -> Result<NumberDetail, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GraphApiConfig {
    pub base_url: String,
    pub api_version: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
}

impl Default for GraphApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.facebook.com".to_string(),
            api_version: "v21.0".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 8,
        }
    }
}

#[derive(Debug)]
pub struct GraphApiClient {
    client: reqwest::Client,
    base_url: String,
    api_version: String,
    timeout: Duration,
    limit: Arc<Semaphore>,
}

#[derive(Debug, Deserialize)]
struct GraphErrorEnvelope {
    error: GraphErrorBody,
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    message: Option<String>,
    code: Option<i64>,
}

impl GraphApiClient {
    pub fn new(config: GraphApiConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_version: config.api_version.trim_matches('/').to_string(),
            timeout: config.timeout,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
        })
    }

    pub fn detail_url(&self, phone_number_id: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.api_version, phone_number_id)
    }

    fn classify(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(self.timeout)
        } else if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }

    async fn fetch_inner(
        &self,
        phone_number_id: &str,
        credential: &Credential,
    ) -> Result<NumberDetail, ProviderError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let resp = self
            .client
            .get(self.detail_url(phone_number_id))
            .bearer_auth(credential.token())
            .query(&[("fields", DETAIL_FIELDS)])
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| self.classify(e))?;
        if !status.is_success() {
            return Err(api_error(status, &body));
        }

        let detail: NumberDetail =
            serde_json::from_slice(&body).map_err(|e| ProviderError::Decode(e.to_string()))?;
        debug!(
            quality = detail.quality_rating.as_deref().unwrap_or("-"),
            tier = detail.messaging_limit_tier.as_deref().unwrap_or("-"),
            "graph detail fetched"
        );
        Ok(detail)
    }
}

const MAX_ERROR_TEXT_CHARS: usize = 300;

/// Extracts the human-readable message from a Graph error envelope.
fn api_error(status: StatusCode, body: &[u8]) -> ProviderError {
    match serde_json::from_slice::<GraphErrorEnvelope>(body) {
        Ok(envelope) => ProviderError::Api {
            status: status.as_u16(),
            code: envelope.error.code,
            message: envelope
                .error
                .message
                .unwrap_or_else(|| status.to_string()),
        },
        Err(_) => {
            let text = String::from_utf8_lossy(body);
            let text = text.trim();
            let text = if text.is_empty() {
                status.to_string()
            } else {
                text.chars().take(MAX_ERROR_TEXT_CHARS).collect()
            };
            ProviderError::Api {
                status: status.as_u16(),
                code: None,
                message: text,
            }
        }
    }
}

#[async_trait]
impl StatusProvider for GraphApiClient {
    async fn fetch_number_detail(
        &self,
        phone_number_id: &str,
        credential: &Credential,
    ) -> Result<NumberDetail, ProviderError> {
        let span = info_span!(
            "graph_fetch",
            phone_number_id,
            credential = %credential.fingerprint()
        );
        self.fetch_inner(phone_number_id, credential)
            .instrument(span)
            .await
    }
}
