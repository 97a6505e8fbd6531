mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use common::{Script, Step, Upstreams, body_text, request};
use futures_util::{StreamExt, stream};
use hyper::StatusCode;
use portway::{
    InMemoryMetrics,
    config::models::{EndpointConfig, GatewayConfig, RetryConditionConfig, RetryConfig},
    metrics::MetricFamily,
    ports::metrics_sink::MetricLabels,
};

fn retrying(path: &str, upstream: &str, attempts: i64, per_try: &str) -> EndpointConfig {
    EndpointConfig::new(path)
        .method("POST")
        .backend(upstream)
        .timeout("5s")
        .metadata("service", "orders")
        .metadata("basePath", "/api")
        .retry(RetryConfig {
            attempts: Some(attempts),
            per_try_timeout: Some(per_try.to_string()),
            conditions: vec![RetryConditionConfig::ByStatusCode("500-599".to_string())],
        })
}

fn labels(path: &str) -> MetricLabels {
    MetricLabels::new("HTTP", "POST", path, "orders", "/api")
}

#[tokio::test]
async fn test_retry_until_success_on_third_attempt() {
    let upstreams = Upstreams::default();
    let script = upstreams.add(Script::new(
        "orders",
        vec![Step::Status(503), Step::Status(503), Step::Status(200)],
    ));
    let metrics = Arc::new(InMemoryMetrics::new());
    let proxy = upstreams.proxy(metrics.clone());
    proxy
        .update(
            &GatewayConfig::builder()
                .endpoint(retrying("/orders", "orders", 3, "100ms"))
                .build(),
        )
        .unwrap();

    let response = proxy.serve(request("POST", "/orders", "{}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "orders");

    assert_eq!(script.calls(), 3);
    let attempts: Vec<_> = script.seen().iter().map(|s| s.attempt).collect();
    assert_eq!(attempts, vec![Some(1), Some(2), Some(3)]);

    let labels = labels("/orders");
    assert_eq!(metrics.get(MetricFamily::Retry, &labels, None), 2);
    assert_eq!(metrics.get(MetricFamily::RetrySuccess, &labels, None), 1);
    assert_eq!(metrics.get(MetricFamily::Requests, &labels, Some(200)), 1);
    assert_eq!(metrics.get(MetricFamily::UpstreamCode, &labels, Some(200)), 1);
    assert_eq!(metrics.get(MetricFamily::SentBytes, &labels, None), 6);
    assert_eq!(metrics.get(MetricFamily::ReceivedBytes, &labels, None), 2);
}

#[tokio::test]
async fn test_first_attempt_success_records_no_retry() {
    let upstreams = Upstreams::default();
    let script = upstreams.add(Script::new("orders", vec![Step::Status(201)]));
    let metrics = Arc::new(InMemoryMetrics::new());
    let proxy = upstreams.proxy(metrics.clone());
    proxy
        .update(
            &GatewayConfig::builder()
                .endpoint(retrying("/orders", "orders", 5, "100ms"))
                .build(),
        )
        .unwrap();

    let response = proxy.serve(request("POST", "/orders", "")).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    drop(response);

    assert_eq!(script.calls(), 1);
    let labels = labels("/orders");
    assert_eq!(metrics.get(MetricFamily::Retry, &labels, None), 0);
    assert_eq!(metrics.get(MetricFamily::RetrySuccess, &labels, None), 0);
    // The request total is always labelled 200 on success; the real status is kept aside
    assert_eq!(metrics.get(MetricFamily::Requests, &labels, Some(200)), 1);
    assert_eq!(metrics.get(MetricFamily::UpstreamCode, &labels, Some(201)), 1);
}

#[tokio::test]
async fn test_exhausted_attempts_yield_bad_gateway() {
    let upstreams = Upstreams::default();
    let script = upstreams.add(Script::new("orders", vec![Step::Status(503)]));
    let metrics = Arc::new(InMemoryMetrics::new());
    let proxy = upstreams.proxy(metrics.clone());
    proxy
        .update(
            &GatewayConfig::builder()
                .endpoint(retrying("/orders", "orders", 4, "100ms"))
                .build(),
        )
        .unwrap();

    let response = proxy.serve(request("POST", "/orders", "x")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    assert_eq!(script.calls(), 4);
    let labels = labels("/orders");
    assert_eq!(metrics.get(MetricFamily::Retry, &labels, None), 3);
    assert_eq!(metrics.get(MetricFamily::RetrySuccess, &labels, None), 0);
    assert_eq!(metrics.get(MetricFamily::Requests, &labels, Some(502)), 1);
    assert_eq!(metrics.total(MetricFamily::Duration), 1);
}

#[tokio::test]
async fn test_transport_errors_are_retried() {
    let upstreams = Upstreams::default();
    let script = upstreams.add(Script::new(
        "orders",
        vec![Step::Refused, Step::Refused, Step::Status(200)],
    ));
    let proxy = upstreams.proxy(Arc::new(InMemoryMetrics::new()));
    proxy
        .update(
            &GatewayConfig::builder()
                .endpoint(retrying("/orders", "orders", 3, "100ms"))
                .build(),
        )
        .unwrap();

    let response = proxy.serve(request("POST", "/orders", "")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(script.calls(), 3);
}

#[tokio::test]
async fn test_no_conditions_means_no_retry() {
    let upstreams = Upstreams::default();
    let script = upstreams.add(Script::new("orders", vec![Step::Status(503)]));
    let proxy = upstreams.proxy(Arc::new(InMemoryMetrics::new()));
    let endpoint = EndpointConfig::new("/orders")
        .backend("orders")
        .retry(RetryConfig {
            attempts: Some(3),
            ..Default::default()
        });
    proxy
        .update(&GatewayConfig::builder().endpoint(endpoint).build())
        .unwrap();

    let response = proxy.serve(request("GET", "/orders", "")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(script.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_attempt_starts_after_overall_deadline() {
    let upstreams = Upstreams::default();
    let script = upstreams.add(Script::new(
        "slow",
        vec![Step::Delay(Duration::from_secs(1), 200)],
    ));
    let metrics = Arc::new(InMemoryMetrics::new());
    let proxy = upstreams.proxy(metrics.clone());
    let endpoint = EndpointConfig::new("/slow")
        .backend("slow")
        .timeout("250ms")
        .retry(RetryConfig {
            attempts: Some(10),
            per_try_timeout: Some("100ms".to_string()),
            conditions: vec![],
        });
    proxy
        .update(&GatewayConfig::builder().endpoint(endpoint).build())
        .unwrap();

    let started = tokio::time::Instant::now();
    let response = proxy.serve(request("GET", "/slow", "")).await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

    // Attempts at 0ms, 100ms and 200ms; the third is cut short by the overall deadline
    assert_eq!(script.calls(), 3);
    assert!(started.elapsed() <= Duration::from_millis(260));
    assert_eq!(metrics.total_with_code(MetricFamily::Requests, 504), 1);
}

#[tokio::test(start_paused = true)]
async fn test_per_try_timeout_larger_than_overall_is_capped() {
    let upstreams = Upstreams::default();
    let script = upstreams.add(Script::new(
        "slow",
        vec![Step::Delay(Duration::from_secs(10), 200)],
    ));
    let proxy = upstreams.proxy(Arc::new(InMemoryMetrics::new()));
    let endpoint = EndpointConfig::new("/slow")
        .backend("slow")
        .timeout("300ms")
        .retry(RetryConfig {
            attempts: Some(2),
            per_try_timeout: Some("5s".to_string()),
            conditions: vec![],
        });
    proxy
        .update(&GatewayConfig::builder().endpoint(endpoint).build())
        .unwrap();

    let started = tokio::time::Instant::now();
    let response = proxy.serve(request("GET", "/slow", "")).await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(script.calls(), 1);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(310));
}

#[tokio::test]
async fn test_request_body_read_once_and_replayed() {
    let upstreams = Upstreams::default();
    let script = upstreams.add(Script::new(
        "orders",
        vec![Step::Status(500), Step::Refused, Step::Status(200)],
    ));
    let proxy = upstreams.proxy(Arc::new(InMemoryMetrics::new()));
    proxy
        .update(
            &GatewayConfig::builder()
                .endpoint(retrying("/orders", "orders", 3, "100ms"))
                .build(),
        )
        .unwrap();

    let pulls = Arc::new(AtomicUsize::new(0));
    let counter = pulls.clone();
    let chunks = stream::iter(vec!["{\"id\":", "42", "}"]).map(move |chunk| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<_, std::io::Error>(Bytes::from_static(chunk.as_bytes()))
    });

    let response = proxy
        .serve(request("POST", "/orders", AxumBody::from_stream(chunks)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(pulls.load(Ordering::SeqCst), 3);
    let bodies: Vec<_> = script.seen().into_iter().map(|s| s.body).collect();
    assert_eq!(bodies.len(), 3);
    assert!(bodies.iter().all(|b| &b[..] == b"{\"id\":42}"));
}

#[tokio::test]
async fn test_failed_body_read_makes_no_attempt() {
    let upstreams = Upstreams::default();
    let script = upstreams.add(Script::new("orders", vec![Step::Status(200)]));
    let metrics = Arc::new(InMemoryMetrics::new());
    let proxy = upstreams.proxy(metrics.clone());
    proxy
        .update(
            &GatewayConfig::builder()
                .endpoint(retrying("/orders", "orders", 3, "100ms"))
                .build(),
        )
        .unwrap();

    let broken = stream::iter(vec![
        Ok(Bytes::from_static(b"partial")),
        Err(std::io::Error::other("connection reset by peer")),
    ]);
    let response = proxy
        .serve(request("POST", "/orders", AxumBody::from_stream(broken)))
        .await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(script.calls(), 0);
    assert_eq!(
        metrics.get(MetricFamily::Requests, &labels("/orders"), Some(502)),
        1
    );
}
