//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client wrapper around `reqwest` for the point-in-time
//! endpoint API. Requests go through `reqwest-middleware` with an exponential
//! backoff retry policy for transient failures.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;

use crate::errors::SyncError;

/// Header carrying the endpoint credential.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// A standardized container for API responses.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The deserialized body, present on success.
    pub data: Option<T>,
    /// The raw body returned with a non-success status.
    pub error_body: Option<String>,
    pub status: u16,
    pub success: bool,
    pub headers: HeaderMap,
}

/// Appends the trailing slash `Url::join` needs to keep the last path segment.
pub fn normalize_base(base_url: &str) -> Result<Url, SyncError> {
    let mut base = base_url.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Ok(Url::parse(&base)?)
}

/// A middleware-enabled client bound to one endpoint base URL and credential.
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
    api_key: Option<String>,
}

impl ApiClient {
    /// Creates a client with three retries on transient failures.
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, SyncError> {
        let url = normalize_base(base_url)?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Configuration(format!("failed to build HTTP client: {}", e)))?;
        let client = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            base_url: url,
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Performs a request relative to the base URL and decodes a JSON body.
    pub async fn request<T>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
    ) -> Result<ApiResponse<T>, SyncError>
    where
        T: DeserializeOwned,
    {
        let full_url = self.base_url.join(path.trim_start_matches('/'))?;
        let mut req = self.inner.request(method, full_url);

        if let Some(h) = headers {
            req = req.headers(h);
        }
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(key)
                .map_err(|e| SyncError::Configuration(format!("invalid API key header: {}", e)))?;
            req = req.header(API_KEY_HEADER, value);
        }

        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();

        if status.is_success() {
            let text = response.text().await?;
            let data = serde_json::from_str::<T>(&text)
                .map_err(|e| SyncError::MalformedPayload(format!("{}: {}", path, e)))?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }

    /// GET returning the decoded body, or an error for any non-success status.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SyncError> {
        let resp = self.request::<T>(Method::GET, path, None).await?;
        match resp.data {
            Some(data) if resp.success => Ok(data),
            _ => Err(SyncError::TransientNetwork(format!(
                "GET {} returned HTTP {}: {}",
                path,
                resp.status,
                resp.error_body.unwrap_or_default()
            ))),
        }
    }
}
