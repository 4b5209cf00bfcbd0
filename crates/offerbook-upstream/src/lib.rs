//! Client for the upstream pricing service: credential, per-product offer feed and
//! product registration.

use std::time::Duration;

use async_trait::async_trait;
use offerbook_core::{ObservedOffer, Product, ValidationError};
use reqwest::{RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "offerbook-upstream";

/// Header carrying the credential on every upstream call.
pub const CREDENTIAL_HEADER: &str = "Bearer";

/// One vendor quotation as returned by `GET {base}/products/{id}/offers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamOffer {
    /// Vendor id.
    pub id: i64,
    pub price: i64,
    pub items_in_stock: i64,
}

impl UpstreamOffer {
    pub fn observe(&self, prod_id: i64) -> Result<ObservedOffer, ValidationError> {
        ObservedOffer::new(prod_id, self.id, self.price, self.items_in_stock)
    }
}

#[derive(Debug, Deserialize)]
struct IssuedCredential {
    access_token: String,
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("could not decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("upstream issued an empty credential")]
    MissingCredential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let shift = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Pre-shared credential; fetched from `{base_url}/auth` when absent.
    pub credential: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl UpstreamConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            credential: None,
            timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Source of vendor offers and sink for product registrations.
#[async_trait]
pub trait OfferFeed: Send + Sync {
    async fn fetch_offers(&self, prod_id: i64) -> Result<Vec<UpstreamOffer>, UpstreamError>;

    async fn register_product(&self, product: &Product) -> Result<(), UpstreamError>;
}

#[derive(Debug)]
pub struct HttpOfferFeed {
    client: reqwest::Client,
    base_url: String,
    credential: String,
    backoff: BackoffPolicy,
}

impl HttpOfferFeed {
    /// Builds the client and resolves the credential once.
    ///
    /// Failing to obtain a credential is an error; callers treat it as fatal.
    pub async fn connect(config: UpstreamConfig) -> Result<Self, UpstreamError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build()?;
        let base_url = config.base_url.trim_end_matches('/').to_string();

        let mut feed = Self {
            client,
            base_url,
            credential: String::new(),
            backoff: config.backoff,
        };
        feed.credential = match config.credential.filter(|token| !token.trim().is_empty()) {
            Some(token) => token,
            None => feed.request_credential().await?,
        };
        Ok(feed)
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request_credential(&self) -> Result<String, UpstreamError> {
        let url = format!("{}/auth", self.base_url);
        let issued: IssuedCredential = self.get_json(&url, |req| req).await?;
        if issued.access_token.trim().is_empty() {
            return Err(UpstreamError::MissingCredential);
        }
        debug!(url, "upstream credential issued");
        Ok(issued.access_token)
    }

    /// GET with retry on transient failures, then JSON decoding.
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        decorate: impl Fn(RequestBuilder) -> RequestBuilder,
    ) -> Result<T, UpstreamError> {
        let mut attempt = 0;
        loop {
            match decorate(self.client.get(url)).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return serde_json::from_slice(&body).map_err(|source| {
                            UpstreamError::Decode {
                                url: url.to_string(),
                                source,
                            }
                        });
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(UpstreamError::HttpStatus {
                            status: status.as_u16(),
                            url: url.to_string(),
                        });
                    }
                    warn!(url, status = status.as_u16(), attempt, "retrying upstream request");
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(UpstreamError::Request(err));
                    }
                    warn!(url, %err, attempt, "retrying upstream request");
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl OfferFeed for HttpOfferFeed {
    async fn fetch_offers(&self, prod_id: i64) -> Result<Vec<UpstreamOffer>, UpstreamError> {
        let url = format!("{}/products/{prod_id}/offers", self.base_url);
        let span = info_span!("upstream_fetch", prod_id, url = %url);
        self.get_json(&url, |req| req.header(CREDENTIAL_HEADER, &self.credential))
            .instrument(span)
            .await
    }

    async fn register_product(&self, product: &Product) -> Result<(), UpstreamError> {
        let url = format!("{}/products/register", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header(CREDENTIAL_HEADER, &self.credential)
            .json(product)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(UpstreamError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        debug!(prod_id = product.prod_id, "product registered upstream");
        Ok(())
    }
}
