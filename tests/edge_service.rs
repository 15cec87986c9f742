//! End-to-end tests for the instrumented edge service.

use std::net::SocketAddr;
use std::time::Duration;

use accesslog_pipeline::broker::MemoryBroker;

mod common;

const PARENT_TRACE: &str = "4bf92f3577b34da6a3ce929d0e0e4736";
const PARENT_SPAN: &str = "00f067aa0ba902b7";

fn broker() -> MemoryBroker {
    MemoryBroker::new(4, Duration::from_secs(10))
}

#[tokio::test]
async fn test_request_produces_root_event() {
    let edge_addr: SocketAddr = "127.0.0.1:28301".parse().unwrap();
    let broker = broker();
    let edge = common::start_edge(common::edge_config(edge_addr, None), &broker).await;

    let res = common::client()
        .get(format!("http://{}/orders/42?verbose=1", edge_addr))
        .send()
        .await
        .expect("Edge unreachable");
    assert_eq!(res.status(), 200);
    assert!(res.headers().contains_key("x-request-id"));
    assert_eq!(res.text().await.unwrap(), "hello, world!");

    let events = common::read_events(&broker, 1).await;
    let event = &events[0];
    assert_eq!(event.method(), "GET");
    assert_eq!(event.path(), "/orders/42?verbose=1");
    assert_eq!(event.ip(), "127.0.0.1");
    assert_eq!(event.message().len(), 16);
    assert!(event.response_time() >= 0.0);

    let trace_id = event.trace_id().expect("trace id recorded");
    assert_eq!(trace_id.len(), 32);
    assert_ne!(trace_id, PARENT_TRACE);
    assert!(event.span_id().is_some());

    let stats = edge.stop().await;
    assert_eq!(stats.published, 1);
}

#[tokio::test]
async fn test_inbound_traceparent_yields_child_span() {
    let edge_addr: SocketAddr = "127.0.0.1:28302".parse().unwrap();
    let broker = broker();
    let edge = common::start_edge(common::edge_config(edge_addr, None), &broker).await;

    let res = common::client()
        .get(format!("http://{}/", edge_addr))
        .header("traceparent", format!("00-{PARENT_TRACE}-{PARENT_SPAN}-01"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    let events = common::read_events(&broker, 1).await;
    assert_eq!(events[0].trace_id(), Some(PARENT_TRACE));
    assert_ne!(events[0].span_id(), Some(PARENT_SPAN));

    edge.stop().await;
}

#[tokio::test]
async fn test_malformed_traceparent_starts_new_trace() {
    let edge_addr: SocketAddr = "127.0.0.1:28303".parse().unwrap();
    let broker = broker();
    let edge = common::start_edge(common::edge_config(edge_addr, None), &broker).await;

    let res = common::client()
        .get(format!("http://{}/", edge_addr))
        .header("traceparent", "00-not-a-trace-01")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    let events = common::read_events(&broker, 1).await;
    let trace_id = events[0].trace_id().unwrap();
    assert_eq!(trace_id.len(), 32);
    assert_ne!(trace_id, "00000000000000000000000000000000");

    edge.stop().await;
}

#[tokio::test]
async fn test_downstream_joins_the_trace() {
    let downstream_addr: SocketAddr = "127.0.0.1:28304".parse().unwrap();
    let edge_addr: SocketAddr = "127.0.0.1:28305".parse().unwrap();
    let captured = common::start_capturing_downstream(downstream_addr).await;

    let broker = broker();
    let config = common::edge_config(edge_addr, Some(format!("http://{}/ping", downstream_addr)));
    let edge = common::start_edge(config, &broker).await;

    let res = common::client()
        .get(format!("http://{}/", edge_addr))
        .header("traceparent", format!("00-{PARENT_TRACE}-{PARENT_SPAN}-01"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    let events = common::read_events(&broker, 1).await;
    let traceparent = captured.lock().unwrap()[0]
        .clone()
        .expect("downstream received traceparent");
    let parts: Vec<&str> = traceparent.split('-').collect();

    assert_eq!(parts.len(), 4);
    assert_eq!(parts[1], PARENT_TRACE);
    assert_eq!(Some(parts[2]), events[0].span_id());

    edge.stop().await;
}

#[tokio::test]
async fn test_downstream_failure_does_not_fail_request() {
    // Nothing listens on the downstream port.
    let downstream_addr: SocketAddr = "127.0.0.1:28306".parse().unwrap();
    let edge_addr: SocketAddr = "127.0.0.1:28307".parse().unwrap();

    let broker = broker();
    let config = common::edge_config(edge_addr, Some(format!("http://{}/", downstream_addr)));
    let edge = common::start_edge(config, &broker).await;

    let res = common::client()
        .post(format!("http://{}/submit", edge_addr))
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "hello, world!");

    let events = common::read_events(&broker, 1).await;
    assert_eq!(events[0].method(), "POST");

    edge.stop().await;
}

#[tokio::test]
async fn test_shutdown_publishes_every_accepted_request() {
    let edge_addr: SocketAddr = "127.0.0.1:28308".parse().unwrap();
    let broker = broker();
    let edge = common::start_edge(common::edge_config(edge_addr, None), &broker).await;

    let client = common::client();
    for i in 0..25 {
        let res = client
            .get(format!("http://{}/item/{}", edge_addr, i))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 200);
    }

    let stats = edge.stop().await;
    assert_eq!(stats.published, 25);
    assert_eq!(broker.topic_len(common::TOPIC), 25);
}

#[tokio::test]
async fn test_hanging_downstream_still_produces_event() {
    let downstream_addr: SocketAddr = "127.0.0.1:28309".parse().unwrap();
    let edge_addr: SocketAddr = "127.0.0.1:28310".parse().unwrap();
    common::start_silent_downstream(downstream_addr).await;

    let broker = broker();
    let mut config = common::edge_config(edge_addr, Some(format!("http://{}/", downstream_addr)));
    config.service.request_timeout_secs = 2;
    config.service.downstream_timeout_ms = 300;
    let edge = common::start_edge(config, &broker).await;

    let res = common::client()
        .get(format!("http://{}/slow", edge_addr))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "hello, world!");

    let events = common::read_events(&broker, 1).await;
    assert_eq!(events[0].path(), "/slow");

    let stats = edge.stop().await;
    assert_eq!(stats.published, 1);
}
