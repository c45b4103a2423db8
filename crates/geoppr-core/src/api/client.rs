//! HTTP client for the GeoPPR REST API.
//!
//! Collections are read from `GET {base}/<key>/` and records are written
//! back with `PUT {base}/update/<key>/<fid>/`.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{header, Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::source::UpdateEnvelope;
use super::{ApiError, InfrastructureSource, UpdateOutcome};
use crate::models::{Record, ResourceType};

/// Used when no base URL is configured.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api";

/// HTTP request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// API client for the infrastructure tables.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Same connection pool, with a bearer token on every request.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn collection_url(&self, resource: ResourceType) -> String {
        format!("{}{}", self.base_url, resource.endpoint())
    }

    pub fn update_url(&self, resource: ResourceType, fid: &str) -> String {
        format!("{}/update/{}/{}/", self.base_url, resource.as_str(), fid)
    }

    fn auth_headers(&self) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        if let Some(ref token) = self.token {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }
        Ok(headers)
    }

    /// Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        url: &str,
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(url, status, &body).into())
        }
    }

    /// Send a request built by `build`, retrying with exponential backoff
    /// while the server answers 429.
    async fn send_with_retry<F>(&self, method: &Method, url: &str, build: F) -> Result<reqwest::Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let request = self
                .client
                .request(method.clone(), url)
                .headers(self.auth_headers()?);
            let response = build(request)
                .send()
                .await
                .map_err(|source| ApiError::Network {
                    url: url.to_string(),
                    source,
                })?;

            match Self::check_response_for_retry(url, response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited {
                            url: url.to_string(),
                            retries: MAX_RATE_LIMIT_RETRIES,
                        }
                        .into());
                    }
                    warn!(url, retry = retries, backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.send_with_retry(&Method::GET, url, |r| r).await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse JSON response from {}", url))
    }

    /// Fetch and unwrap one collection.
    pub async fn fetch_collection(&self, resource: ResourceType) -> Result<Vec<Record>> {
        let url = self.collection_url(resource);
        let body: Value = self
            .get(&url)
            .await
            .with_context(|| format!("Failed to fetch {}", resource))?;
        let records = extract_records(resource, body);
        debug!(resource = %resource, count = records.len(), "Collection fetched");
        Ok(records)
    }

    /// Write `fields` back to one record.
    pub async fn update_record(
        &self,
        resource: ResourceType,
        fid: &str,
        fields: &Map<String, Value>,
    ) -> Result<UpdateOutcome> {
        let url = self.update_url(resource, fid);
        let result = self
            .send_with_retry(&Method::PUT, &url, |r| r.json(fields))
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => return rejection_from_error(e),
        };

        let envelope: UpdateEnvelope = response
            .json()
            .await
            .with_context(|| format!("Failed to parse update response from {}", url))?;
        let outcome = UpdateOutcome::from(envelope);
        debug!(resource = %resource, fid, applied = outcome.is_applied(), "Update answered");
        Ok(outcome)
    }
}

/// A 4xx/5xx whose body is an update envelope is a rejection, not a
/// transport failure.
fn rejection_from_error(error: anyhow::Error) -> Result<UpdateOutcome> {
    let body = error.downcast_ref::<ApiError>().and_then(ApiError::body);

    match body.and_then(|b| serde_json::from_str::<UpdateEnvelope>(b).ok()) {
        Some(envelope) => Ok(UpdateOutcome::from(envelope)),
        None => Err(error),
    }
}

/// Unwrap the record list from any of the envelopes the API produces:
/// a bare array, a FeatureCollection, or either of those under `results`.
pub fn extract_records(resource: ResourceType, body: Value) -> Vec<Record> {
    match body {
        Value::Array(records) => records,
        Value::Object(mut obj) => {
            if let Some(Value::Array(features)) = obj.remove("features") {
                return features;
            }
            match obj.remove("results") {
                Some(Value::Array(records)) => records,
                Some(Value::Object(mut inner)) => match inner.remove("features") {
                    Some(Value::Array(features)) => features,
                    _ => {
                        warn!(resource = %resource, "Unrecognized results envelope, treating as empty");
                        Vec::new()
                    }
                },
                _ => {
                    warn!(resource = %resource, "Unrecognized response envelope, treating as empty");
                    Vec::new()
                }
            }
        }
        _ => {
            warn!(resource = %resource, "Response is not a collection, treating as empty");
            Vec::new()
        }
    }
}

impl InfrastructureSource for ApiClient {
    async fn fetch_collection(&self, resource: ResourceType) -> Result<Vec<Record>> {
        ApiClient::fetch_collection(self, resource).await
    }

    async fn update_record(
        &self,
        resource: ResourceType,
        fid: &str,
        fields: &Map<String, Value>,
    ) -> Result<UpdateOutcome> {
        ApiClient::update_record(self, resource, fid, fields).await
    }
}
