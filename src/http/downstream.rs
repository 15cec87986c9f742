//! Outbound call to the optional downstream service.
//!
//! The request carries the current span's context so the downstream joins
//! the same trace. The response body is read and discarded.

use std::time::Duration;

use axum::body::Body;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::time::timeout;

use crate::observability::{RequestSpan, TracePropagator};

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BODY: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum DownstreamError {
    #[error("invalid downstream url {0}: must be http://host[:port][/path]")]
    InvalidUrl(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("request timed out")]
    Timeout,
}

#[derive(Clone)]
pub struct Downstream {
    client: Client<HttpConnector, Body>,
    uri: Uri,
    request_timeout: Duration,
}

impl Downstream {
    pub fn new(
        url: &str,
        max_idle_per_host: usize,
        request_timeout: Duration,
    ) -> Result<Self, DownstreamError> {
        let uri: Uri = url
            .parse()
            .map_err(|_| DownstreamError::InvalidUrl(url.to_string()))?;
        if uri.scheme_str() != Some("http") || uri.authority().is_none() {
            return Err(DownstreamError::InvalidUrl(url.to_string()));
        }

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(max_idle_per_host)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .build(HttpConnector::new());

        Ok(Self {
            client,
            uri,
            request_timeout,
        })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// GET the downstream with `span`'s context injected.
    pub async fn call(
        &self,
        propagator: &TracePropagator,
        span: &RequestSpan,
    ) -> Result<StatusCode, DownstreamError> {
        let mut request = Request::builder()
            .method(Method::GET)
            .uri(self.uri.clone())
            .body(Body::empty())
            .map_err(|e| DownstreamError::Request(e.to_string()))?;
        propagator.inject(span, request.headers_mut());

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| DownstreamError::Request(e.to_string()))?;
            let status = response.status();
            axum::body::to_bytes(Body::new(response.into_body()), MAX_BODY)
                .await
                .map_err(|e| DownstreamError::Request(e.to_string()))?;
            Ok(status)
        };

        timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| DownstreamError::Timeout)?
    }
}
