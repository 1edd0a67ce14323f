use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

const REQUEST_TIMEOUT_SEC: u64 = 10;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("failed to build HTTP client: {0}")]
    BuildClient(#[source] reqwest::Error),

    #[error("invalid API URL {url}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("HTTP request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Status and body of one management API response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

/// The management API as seen by the harness: JSON `PUT`s, `GET`s and a
/// verdict on response status codes.
#[async_trait]
pub trait ApiSession: Send + Sync {
    async fn put(&self, path: &str, body: &Value) -> Result<ApiResponse, ApiError>;

    async fn get(&self, path: &str) -> Result<ApiResponse, ApiError>;

    fn is_good_response(&self, status: u16) -> bool {
        (200..300).contains(&status)
    }
}

/// [`ApiSession`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpApiSession {
    client: Client,
    base_url: Url,
}

impl HttpApiSession {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        // `Url::join` drops the last segment of a base without a trailing slash.
        let normalized = if base_url.ends_with('/') {
            base_url.to_owned()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized).map_err(|source| ApiError::Url {
            url: base_url.to_owned(),
            source,
        })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SEC))
            .build()
            .map_err(ApiError::BuildClient)?;

        Ok(Self { client, base_url })
    }

    pub fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|source| ApiError::Url {
                url: path.to_owned(),
                source,
            })
    }

    async fn send(&self, url: Url, request: reqwest::RequestBuilder) -> Result<ApiResponse, ApiError> {
        let request_error = |source| ApiError::Request {
            url: url.to_string(),
            source,
        };
        let response = request.send().await.map_err(request_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(request_error)?;
        debug!(%url, status, "API response");
        Ok(ApiResponse { status, body })
    }
}

#[async_trait]
impl ApiSession for HttpApiSession {
    #[instrument(skip(self, body))]
    async fn put(&self, path: &str, body: &Value) -> Result<ApiResponse, ApiError> {
        let url = self.url(path)?;
        debug!(%url, %body, "PUT");
        let request = self.client.put(url.clone()).json(body);
        self.send(url, request).await
    }

    #[instrument(skip(self))]
    async fn get(&self, path: &str) -> Result<ApiResponse, ApiError> {
        let url = self.url(path)?;
        debug!(%url, "GET");
        let request = self.client.get(url.clone());
        self.send(url, request).await
    }
}
