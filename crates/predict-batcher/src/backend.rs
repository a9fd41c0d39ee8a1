// Numan Thabit 2025
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use bytes::Bytes;
use reqwest::{Client, Url};

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::CONTENT_LENGTH,
];

/// Status and raw body of one downstream call.
#[derive(Debug, Clone)]
pub struct BackendReply {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Full upstream response replayed for non-batched traffic.
#[derive(Debug)]
pub struct PassThroughReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("upstream request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid upstream path {path}: {reason}")]
    Path { path: String, reason: String },
}

/// Performs one synchronous call against the inference service.
#[async_trait]
pub trait Backend: Send + Sync {
    /// POST `body` (already JSON encoded) to `path` and return the raw reply.
    async fn call(&self, path: &str, body: Bytes) -> Result<BackendReply, BackendError>;
}

/// reqwest-backed transport pointed at a single upstream host.
pub struct HttpBackend {
    client: Client,
    base: Url,
    timeout: Option<Duration>,
}

impl HttpBackend {
    pub fn new(base: Url, timeout: Option<Duration>) -> Result<Self> {
        if !matches!(base.scheme(), "http" | "https") {
            bail!("upstream must be an http(s) url, got {base}");
        }
        let client = Client::builder()
            .tcp_nodelay(true)
            .tcp_keepalive(Some(Duration::from_secs(15)))
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(1_000)
            .build()
            .context("failed to construct upstream client")?;
        Ok(Self {
            client,
            base,
            timeout,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Replay an arbitrary request against the upstream unchanged.
    pub async fn pass_through(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<PassThroughReply, BackendError> {
        let url = self.url_for(path_and_query)?;
        let mut outbound = headers.clone();
        strip_hop_by_hop(&mut outbound);
        outbound.remove(header::HOST);

        let mut request = self
            .client
            .request(method, url)
            .headers(outbound)
            .body(body);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|err| self.classify(err))?;
        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        let body = response.bytes().await.map_err(|err| self.classify(err))?;
        Ok(PassThroughReply {
            status,
            headers,
            body,
        })
    }

    /// Append `path_and_query` to the base path. Scheme, host and port always
    /// come from the base, whatever the request path looks like.
    fn url_for(&self, path_and_query: &str) -> Result<Url, BackendError> {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_and_query, None),
        };
        if !path.starts_with('/') {
            return Err(BackendError::Path {
                path: path_and_query.to_string(),
                reason: "path must start with '/'".to_string(),
            });
        }

        let mut url = self.base.clone();
        let prefix = self.base.path().trim_end_matches('/');
        url.set_path(&format!("{prefix}{path}"));
        url.set_query(query);
        url.set_fragment(None);
        Ok(url)
    }

    fn classify(&self, err: reqwest::Error) -> BackendError {
        match self.timeout {
            Some(timeout) if err.is_timeout() => BackendError::Timeout(timeout),
            _ => BackendError::Request(err),
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn call(&self, path: &str, body: Bytes) -> Result<BackendReply, BackendError> {
        let url = self.url_for(path)?;
        let mut request = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|err| self.classify(err))?;
        let status = response.status();
        let body = response.bytes().await.map_err(|err| self.classify(err))?;
        Ok(BackendReply { status, body })
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}
