//! Elasticsearch-compatible backend over its REST API.
//!
//! # Responsibilities
//! - Index existence checks and creation with settings + mappings
//! - NDJSON bulk writes with per-document results
//! - Paged, sorted search for the operator CLI
//!
//! Endpoints are tried in order; a transport error or timeout on one moves on
//! to the next. Any HTTP response ends the attempt.

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::time::timeout;

use crate::config::SearchConfig;
use crate::index::backend::{
    BulkFailure, BulkOutcome, IndexDocument, SearchBackend, SearchError, SearchHit, SearchHits,
    SearchRequest,
};
use crate::index::schema::IndexSchema;

const ALREADY_EXISTS: &str = "resource_already_exists_exception";

#[derive(Debug, Clone)]
pub struct ElasticsearchBackend {
    client: Client,
    endpoints: Vec<String>,
    timeout_duration: Duration,
}

impl ElasticsearchBackend {
    pub fn new(config: &SearchConfig) -> Result<Self, SearchError> {
        let mut endpoints = Vec::new();
        for endpoint in &config.endpoints {
            match url::Url::parse(endpoint) {
                Ok(_) => endpoints.push(endpoint.trim_end_matches('/').to_string()),
                Err(e) => tracing::warn!(url = %endpoint, error = %e, "Ignoring invalid search endpoint"),
            }
        }
        if endpoints.is_empty() {
            return Err(SearchError::Config("no usable search endpoints".to_string()));
        }

        let client = Client::builder()
            .build()
            .map_err(|e| SearchError::Config(e.to_string()))?;

        Ok(Self {
            client,
            endpoints,
            timeout_duration: Duration::from_secs(config.request_timeout_secs),
        })
    }

    /// Send a request built for each endpoint in turn until one answers.
    async fn send(
        &self,
        method: Method,
        path: &str,
        build: impl Fn(RequestBuilder) -> RequestBuilder,
    ) -> Result<Response, SearchError> {
        let mut last_error = SearchError::Transport("no endpoints".to_string());

        for (i, endpoint) in self.endpoints.iter().enumerate() {
            let url = format!("{endpoint}/{path}");
            let request = build(self.client.request(method.clone(), &url));
            match timeout(self.timeout_duration, request.send()).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => {
                    tracing::warn!(endpoint_idx = i, url = %url, error = %e, "Search request failed, trying next endpoint");
                    last_error = SearchError::Transport(e.to_string());
                }
                Err(_) => {
                    tracing::warn!(endpoint_idx = i, url = %url, "Search request timed out, trying next endpoint");
                    last_error = SearchError::Timeout;
                }
            }
        }

        Err(last_error)
    }
}

/// Turn a non-success response into an error, keeping the backend's reason.
async fn rejection(response: Response) -> SearchError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let reason = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| format!("{}: {}", b.error.kind, b.error.reason.unwrap_or_default()))
        .unwrap_or(body);
    SearchError::Rejected { status, reason }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorCause,
}

#[derive(Debug, Deserialize)]
struct ErrorCause {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<BulkItem>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    index: BulkItemResult,
}

#[derive(Debug, Deserialize)]
struct BulkItemResult {
    #[serde(rename = "_id", default)]
    id: String,
    status: u16,
    #[serde(default)]
    error: Option<ErrorCause>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: SearchResponseHits,
}

#[derive(Debug, Deserialize)]
struct SearchResponseHits {
    total: Value,
    #[serde(default)]
    hits: Vec<SearchResponseHit>,
}

#[derive(Debug, Deserialize)]
struct SearchResponseHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: Value,
}

/// NDJSON body: one `index` action line and one source line per document.
pub fn bulk_body(index: &str, documents: &[IndexDocument]) -> Vec<u8> {
    let mut body = Vec::with_capacity(documents.iter().map(|d| d.size() + 64).sum());
    for document in documents {
        let action = json!({ "index": { "_index": index, "_id": document.id } });
        body.extend_from_slice(action.to_string().as_bytes());
        body.push(b'\n');
        body.extend_from_slice(&document.body);
        body.push(b'\n');
    }
    body
}

impl SearchBackend for ElasticsearchBackend {
    async fn index_exists(&self, index: &str) -> Result<bool, SearchError> {
        let response = self.send(Method::HEAD, index, |r| r).await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(rejection(response).await),
        }
    }

    async fn create_index(&self, index: &str, schema: &IndexSchema) -> Result<(), SearchError> {
        let body = schema.to_json();
        let response = self.send(Method::PUT, index, |r| r.json(&body)).await?;
        if response.status().is_success() {
            return Ok(());
        }
        match rejection(response).await {
            SearchError::Rejected { reason, .. } if reason.starts_with(ALREADY_EXISTS) => {
                Err(SearchError::IndexAlreadyExists(index.to_string()))
            }
            other => Err(other),
        }
    }

    async fn bulk(
        &self,
        index: &str,
        documents: &[IndexDocument],
    ) -> Result<BulkOutcome, SearchError> {
        let body = bulk_body(index, documents);
        let response = self
            .send(Method::POST, "_bulk", |r| {
                r.header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
                    .body(body.clone())
            })
            .await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }

        let parsed: BulkResponse = response
            .json()
            .await
            .map_err(|e| SearchError::Response(e.to_string()))?;

        let mut outcome = BulkOutcome::default();
        for item in parsed.items {
            let result = item.index;
            match result.error {
                None if (200..300).contains(&result.status) => outcome.indexed += 1,
                error => outcome.failures.push(BulkFailure {
                    id: result.id,
                    status: result.status,
                    reason: error
                        .map(|e| format!("{}: {}", e.kind, e.reason.unwrap_or_default()))
                        .unwrap_or_default(),
                }),
            }
        }
        Ok(outcome)
    }

    async fn search(&self, index: &str, request: &SearchRequest) -> Result<SearchHits, SearchError> {
        let sort: Vec<Value> = request
            .sort
            .iter()
            .map(|s| {
                let mut clause = Map::new();
                clause.insert(s.field.clone(), json!({ "order": s.order }));
                Value::Object(clause)
            })
            .collect();
        let body = json!({ "from": request.from, "size": request.size, "sort": sort });

        let path = format!("{index}/_search");
        let response = self.send(Method::GET, &path, |r| r.json(&body)).await?;
        match response.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => return Err(SearchError::IndexNotFound(index.to_string())),
            _ => return Err(rejection(response).await),
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| SearchError::Response(e.to_string()))?;

        // 7.x reports `{"value": n}`, older clusters a bare number.
        let total = parsed
            .hits
            .total
            .get("value")
            .and_then(Value::as_u64)
            .or_else(|| parsed.hits.total.as_u64())
            .unwrap_or(0);

        Ok(SearchHits {
            total,
            hits: parsed
                .hits
                .hits
                .into_iter()
                .map(|h| SearchHit {
                    id: h.id,
                    source: h.source,
                })
                .collect(),
        })
    }
}
