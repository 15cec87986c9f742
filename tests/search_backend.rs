//! Elasticsearch backend against a mock cluster.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use accesslog_pipeline::config::SearchConfig;
use accesslog_pipeline::index::{
    ensure_index, ElasticsearchBackend, IndexDocument, IndexSchema, SearchBackend, SearchError,
    SearchRequest, SortField,
};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::{json, Value};

#[derive(Default)]
struct Cluster {
    /// HEAD always answers 404, so every caller tries to create.
    pretend_missing: AtomicBool,
    created: AtomicBool,
    create_calls: AtomicUsize,
    last_search: Mutex<Option<Value>>,
    bulk_content_type: Mutex<Option<String>>,
}

async fn index_exists(State(cluster): State<Arc<Cluster>>) -> StatusCode {
    if cluster.created.load(Ordering::SeqCst) && !cluster.pretend_missing.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn create_index(
    State(cluster): State<Arc<Cluster>>,
    Path(index): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    cluster.create_calls.fetch_add(1, Ordering::SeqCst);
    assert!(body["mappings"]["properties"]["traceno"].is_object());
    if cluster.created.swap(true, Ordering::SeqCst) {
        let error = json!({
            "error": {
                "type": "resource_already_exists_exception",
                "reason": format!("index [{index}] already exists"),
            },
            "status": 400,
        });
        (StatusCode::BAD_REQUEST, Json(error))
    } else {
        (StatusCode::OK, Json(json!({ "acknowledged": true })))
    }
}

async fn bulk(
    State(cluster): State<Arc<Cluster>>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    *cluster.bulk_content_type.lock().unwrap() = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let text = String::from_utf8_lossy(&body);
    let items: Vec<Value> = text
        .lines()
        .step_by(2)
        .map(|line| {
            let action: Value = serde_json::from_str(line).unwrap();
            let id = action["index"]["_id"].as_str().unwrap_or_default().to_string();
            if id == "bad" {
                json!({ "index": { "_id": id, "status": 400, "error": {
                    "type": "mapper_parsing_exception", "reason": "failed to parse" } } })
            } else {
                json!({ "index": { "_id": id, "status": 201 } })
            }
        })
        .collect();
    Json(json!({ "errors": items.iter().any(|i| i["index"]["status"] != 201), "items": items }))
}

async fn search(State(cluster): State<Arc<Cluster>>, Json(body): Json<Value>) -> Json<Value> {
    *cluster.last_search.lock().unwrap() = Some(body);
    Json(json!({
        "hits": {
            "total": { "value": 2, "relation": "eq" },
            "hits": [
                { "_id": "a", "_source": { "method": "GET" } },
                { "_id": "b", "_source": { "method": "POST" } }
            ]
        }
    }))
}

async fn start_cluster(addr: SocketAddr) -> Arc<Cluster> {
    let cluster = Arc::new(Cluster::default());
    let app = Router::new()
        .route("/_bulk", post(bulk))
        .route("/{index}", put(create_index).head(index_exists))
        .route("/{index}/_search", get(search))
        .with_state(cluster.clone());

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    cluster
}

fn backend(endpoints: Vec<String>) -> ElasticsearchBackend {
    ElasticsearchBackend::new(&SearchConfig {
        endpoints,
        request_timeout_secs: 2,
        ..SearchConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_ensure_index_creates_then_finds_it() {
    let addr: SocketAddr = "127.0.0.1:28401".parse().unwrap();
    let cluster = start_cluster(addr).await;
    let backend = backend(vec![format!("http://{addr}")]);

    assert!(!backend.index_exists("accesslog").await.unwrap());
    ensure_index(&backend, "accesslog", &IndexSchema::default()).await.unwrap();
    assert!(backend.index_exists("accesslog").await.unwrap());

    ensure_index(&backend, "accesslog", &IndexSchema::default()).await.unwrap();
    assert_eq!(cluster.create_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_lost_creation_race_is_success() {
    let addr: SocketAddr = "127.0.0.1:28402".parse().unwrap();
    let cluster = start_cluster(addr).await;
    cluster.pretend_missing.store(true, Ordering::SeqCst);
    let backend = backend(vec![format!("http://{addr}")]);

    backend.create_index("accesslog", &IndexSchema::default()).await.unwrap();
    let again = backend.create_index("accesslog", &IndexSchema::default()).await;
    assert!(matches!(again, Err(SearchError::IndexAlreadyExists(_))));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let backend = backend.clone();
            tokio::spawn(async move {
                ensure_index(&backend, "accesslog", &IndexSchema::default()).await
            })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }
}

#[tokio::test]
async fn test_bulk_reports_per_document_failures() {
    let addr: SocketAddr = "127.0.0.1:28403".parse().unwrap();
    let cluster = start_cluster(addr).await;
    let backend = backend(vec![format!("http://{addr}")]);

    let documents = vec![
        IndexDocument { id: "good".into(), body: Bytes::from_static(br#"{"n":1}"#) },
        IndexDocument { id: "bad".into(), body: Bytes::from_static(br#"{"n":"x"}"#) },
        IndexDocument { id: "also-good".into(), body: Bytes::from_static(br#"{"n":3}"#) },
    ];
    let outcome = backend.bulk("accesslog", &documents).await.unwrap();

    assert_eq!(outcome.indexed, 2);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].id, "bad");
    assert_eq!(outcome.failures[0].status, 400);
    assert!(outcome.failures[0].reason.starts_with("mapper_parsing_exception"));
    assert_eq!(
        cluster.bulk_content_type.lock().unwrap().as_deref(),
        Some("application/x-ndjson")
    );
}

#[tokio::test]
async fn test_search_sends_paging_and_sort() {
    let addr: SocketAddr = "127.0.0.1:28404".parse().unwrap();
    let cluster = start_cluster(addr).await;
    let backend = backend(vec![format!("http://{addr}")]);

    let request = SearchRequest {
        from: 20,
        size: 5,
        sort: vec![SortField::parse("-timestamp"), SortField::parse("ip.keyword")],
    };
    let hits = backend.search("accesslog", &request).await.unwrap();

    assert_eq!(hits.total, 2);
    assert_eq!(hits.hits[1].id, "b");
    assert_eq!(hits.hits[1].source["method"], "POST");

    let sent = cluster.last_search.lock().unwrap().clone().unwrap();
    assert_eq!(sent["from"], 20);
    assert_eq!(sent["size"], 5);
    assert_eq!(sent["sort"][0]["timestamp"]["order"], "desc");
    assert_eq!(sent["sort"][1]["ip.keyword"]["order"], "asc");
}

#[tokio::test]
async fn test_unreachable_endpoint_fails_over_to_next() {
    let addr: SocketAddr = "127.0.0.1:28405".parse().unwrap();
    let dead: SocketAddr = "127.0.0.1:28406".parse().unwrap();
    start_cluster(addr).await;
    let failover = backend(vec![format!("http://{dead}"), format!("http://{addr}")]);
    assert!(!failover.index_exists("accesslog").await.unwrap());

    let only_dead = backend(vec![format!("http://{dead}")]);
    let err = only_dead.index_exists("accesslog").await.unwrap_err();
    assert!(err.is_transient());
}
