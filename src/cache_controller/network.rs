//! Network access for the cache controller.

use super::types::{CacheError, CacheMode, FetchRequest, FetchResponse};
use async_trait::async_trait;
use axum::http::{HeaderValue, header};

#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &FetchRequest, mode: CacheMode) -> Result<FetchResponse, CacheError>;
}

/// `reqwest`-backed network. No request timeout: a hung origin only blocks
/// the request waiting on it.
#[derive(Clone, Default)]
pub struct HttpNetwork {
    client: reqwest::Client,
}

impl HttpNetwork {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &FetchRequest, mode: CacheMode) -> Result<FetchResponse, CacheError> {
        let mut headers = request.headers.clone();
        if mode == CacheMode::Reload {
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        }

        let network_err = |err: reqwest::Error| CacheError::Network {
            url: request.url.to_string(),
            reason: err.to_string(),
        };

        let response = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(headers)
            .send()
            .await
            .map_err(network_err)?;

        let status = response.status();
        let url = response.url().clone();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(network_err)?;

        Ok(FetchResponse {
            status,
            url,
            headers,
            body,
        })
    }
}
