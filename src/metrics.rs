//! Request instrumentation for Portway.
//!
//! This module provides the [`MetricsSink`] implementations and the per-request
//! [`RequestRecorder`]:
//! * [`GatewayMetrics`] forwards to the `metrics` crate macros; the application installs
//!   whatever recorder it wants (the binary uses the Prometheus exporter via
//!   [`install_prometheus_recorder`]).
//! * [`InMemoryMetrics`] keeps plain counters, handy for embedding and tests.
//!
//! Provided metrics (labels: protocol, method, path, service, basePath):
//! * `gateway_requests_code_total` (counter, plus `code`)
//! * `gateway_requests_upstream_code_total` (counter, plus `code`)
//! * `gateway_requests_duration_seconds` (histogram)
//! * `gateway_requests_tx_bytes` / `gateway_requests_rx_bytes` (counters)
//! * `gateway_requests_retry_total` / `gateway_requests_retry_success` (counters)
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use hyper::StatusCode;
use metrics::{Unit, counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use tokio::time::Instant;

use crate::{
    core::error::STATUS_CLIENT_CLOSED_REQUEST,
    ports::metrics_sink::{MetricLabels, MetricsSink},
};

pub const GATEWAY_REQUESTS_TOTAL: &str = "gateway_requests_code_total";
pub const GATEWAY_UPSTREAM_CODE_TOTAL: &str = "gateway_requests_upstream_code_total";
pub const GATEWAY_REQUEST_DURATION_SECONDS: &str = "gateway_requests_duration_seconds";
pub const GATEWAY_SENT_BYTES: &str = "gateway_requests_tx_bytes";
pub const GATEWAY_RECEIVED_BYTES: &str = "gateway_requests_rx_bytes";
pub const GATEWAY_RETRY_TOTAL: &str = "gateway_requests_retry_total";
pub const GATEWAY_RETRY_SUCCESS: &str = "gateway_requests_retry_success";

/// Histogram buckets (seconds) for request durations: 5ms .. 1s.
pub const REQUEST_DURATION_BUCKETS: [f64; 8] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

static DESCRIBED: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        GATEWAY_REQUESTS_TOTAL,
        Unit::Count,
        "The total number of processed requests"
    );
    describe_counter!(
        GATEWAY_UPSTREAM_CODE_TOTAL,
        Unit::Count,
        "Status codes returned by upstreams on forwarded requests"
    );
    describe_histogram!(
        GATEWAY_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Requests duration(sec)."
    );
    describe_counter!(GATEWAY_SENT_BYTES, Unit::Bytes, "Total sent connection bytes");
    describe_counter!(
        GATEWAY_RECEIVED_BYTES,
        Unit::Bytes,
        "Total received connection bytes"
    );
    describe_counter!(GATEWAY_RETRY_TOTAL, Unit::Count, "Total request retries");
    describe_counter!(
        GATEWAY_RETRY_SUCCESS,
        Unit::Count,
        "Total request retry successes"
    );
});

/// Install the Prometheus recorder with the gateway's duration buckets.
pub fn install_prometheus_recorder() -> eyre::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(GATEWAY_REQUEST_DURATION_SECONDS.to_string()),
            &REQUEST_DURATION_BUCKETS,
        )?
        .install_recorder()?;
    Lazy::force(&DESCRIBED);
    tracing::info!("Prometheus metrics recorder installed");
    Ok(handle)
}

macro_rules! labelled {
    ($labels:expr) => {
        [
            ("protocol", $labels.protocol.clone()),
            ("method", $labels.method.clone()),
            ("path", $labels.path.clone()),
            ("service", $labels.service.clone()),
            ("basePath", $labels.base_path.clone()),
        ]
    };
}

/// [`MetricsSink`] backed by the global `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct GatewayMetrics;

impl GatewayMetrics {
    pub fn new() -> Self {
        Lazy::force(&DESCRIBED);
        Self
    }
}

fn with_code(labels: &MetricLabels, code: u16) -> Vec<(&'static str, String)> {
    let mut pairs = labelled!(labels).to_vec();
    pairs.push(("code", code.to_string()));
    pairs
}

impl MetricsSink for GatewayMetrics {
    fn increment_requests(&self, labels: &MetricLabels, code: u16) {
        counter!(GATEWAY_REQUESTS_TOTAL, &with_code(labels, code)).increment(1);
    }

    fn increment_upstream_code(&self, labels: &MetricLabels, code: u16) {
        counter!(GATEWAY_UPSTREAM_CODE_TOTAL, &with_code(labels, code)).increment(1);
    }

    fn observe_duration(&self, labels: &MetricLabels, duration: Duration) {
        histogram!(GATEWAY_REQUEST_DURATION_SECONDS, &labelled!(labels))
            .record(duration.as_secs_f64());
    }

    fn add_sent_bytes(&self, labels: &MetricLabels, bytes: u64) {
        counter!(GATEWAY_SENT_BYTES, &labelled!(labels)).increment(bytes);
    }

    fn add_received_bytes(&self, labels: &MetricLabels, bytes: u64) {
        counter!(GATEWAY_RECEIVED_BYTES, &labelled!(labels)).increment(bytes);
    }

    fn increment_retry(&self, labels: &MetricLabels) {
        counter!(GATEWAY_RETRY_TOTAL, &labelled!(labels)).increment(1);
    }

    fn increment_retry_success(&self, labels: &MetricLabels) {
        counter!(GATEWAY_RETRY_SUCCESS, &labelled!(labels)).increment(1);
    }
}

/// Metric families tracked by [`InMemoryMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricFamily {
    Requests,
    UpstreamCode,
    SentBytes,
    ReceivedBytes,
    Retry,
    RetrySuccess,
    Duration,
}

type SeriesKey = (MetricFamily, MetricLabels, Option<u16>);

/// In-process [`MetricsSink`] keeping every series in a map.
///
/// Durations are counted as observations, not summed.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    series: Mutex<HashMap<SeriesKey, u64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, family: MetricFamily, labels: &MetricLabels, code: Option<u16>, value: u64) {
        if let Ok(mut series) = self.series.lock() {
            *series.entry((family, labels.clone(), code)).or_default() += value;
        } else {
            tracing::error!("Failed to acquire lock for in-memory metrics");
        }
    }

    /// Value of one exact series.
    pub fn get(&self, family: MetricFamily, labels: &MetricLabels, code: Option<u16>) -> u64 {
        self.series
            .lock()
            .ok()
            .and_then(|series| series.get(&(family, labels.clone(), code)).copied())
            .unwrap_or(0)
    }

    /// Sum of a family across all label sets.
    pub fn total(&self, family: MetricFamily) -> u64 {
        self.sum(|(f, _, _)| *f == family)
    }

    /// Sum of a coded family (`Requests`, `UpstreamCode`) for one code across all label sets.
    pub fn total_with_code(&self, family: MetricFamily, code: u16) -> u64 {
        self.sum(|(f, _, c)| *f == family && *c == Some(code))
    }

    fn sum(&self, filter: impl Fn(&SeriesKey) -> bool) -> u64 {
        self.series
            .lock()
            .map(|series| {
                series
                    .iter()
                    .filter(|(key, _)| filter(key))
                    .map(|(_, value)| *value)
                    .sum()
            })
            .unwrap_or(0)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_requests(&self, labels: &MetricLabels, code: u16) {
        self.add(MetricFamily::Requests, labels, Some(code), 1);
    }

    fn increment_upstream_code(&self, labels: &MetricLabels, code: u16) {
        self.add(MetricFamily::UpstreamCode, labels, Some(code), 1);
    }

    fn observe_duration(&self, labels: &MetricLabels, _duration: Duration) {
        self.add(MetricFamily::Duration, labels, None, 1);
    }

    fn add_sent_bytes(&self, labels: &MetricLabels, bytes: u64) {
        self.add(MetricFamily::SentBytes, labels, None, bytes);
    }

    fn add_received_bytes(&self, labels: &MetricLabels, bytes: u64) {
        self.add(MetricFamily::ReceivedBytes, labels, None, bytes);
    }

    fn increment_retry(&self, labels: &MetricLabels) {
        self.add(MetricFamily::Retry, labels, None, 1);
    }

    fn increment_retry_success(&self, labels: &MetricLabels) {
        self.add(MetricFamily::RetrySuccess, labels, None, 1);
    }
}

/// Per-request instrumentation handle.
///
/// Created when a request enters an endpoint handler and consumed by exactly one of the
/// `finish_*` methods, which record the request total and its duration. A recorder dropped
/// without finishing belongs to a request whose caller went away and is counted as `499`,
/// or `502` when the drop happens while unwinding from a panic.
pub struct RequestRecorder {
    sink: Arc<dyn MetricsSink>,
    labels: MetricLabels,
    start: Instant,
    finished: bool,
}

impl RequestRecorder {
    pub fn new(sink: Arc<dyn MetricsSink>, labels: MetricLabels, start: Instant) -> Self {
        Self {
            sink,
            labels,
            start,
            finished: false,
        }
    }

    pub fn labels(&self) -> &MetricLabels {
        &self.labels
    }

    pub fn received(&self, bytes: usize) {
        self.sink.add_received_bytes(&self.labels, bytes as u64);
    }

    pub fn retry(&self) {
        self.sink.increment_retry(&self.labels);
    }

    pub fn retry_success(&self) {
        self.sink.increment_retry_success(&self.labels);
    }

    /// Error path: the request total is labelled with the classified code.
    pub fn finish_error(mut self, code: u16) {
        self.finished = true;
        self.sink.increment_requests(&self.labels, code);
        self.observe_elapsed();
    }

    /// Success path: the request total is always labelled "200"; the upstream's real
    /// status goes to a separate family.
    pub fn finish_success(mut self, upstream_status: u16, sent_bytes: u64) {
        self.finished = true;
        self.sink.add_sent_bytes(&self.labels, sent_bytes);
        self.sink.increment_requests(&self.labels, 200);
        self.sink
            .increment_upstream_code(&self.labels, upstream_status);
        self.observe_elapsed();
    }

    fn observe_elapsed(&self) {
        self.sink
            .observe_duration(&self.labels, self.start.elapsed());
    }
}

impl Drop for RequestRecorder {
    fn drop(&mut self) {
        if !self.finished {
            let code = if std::thread::panicking() {
                StatusCode::BAD_GATEWAY.as_u16()
            } else {
                STATUS_CLIENT_CLOSED_REQUEST
            };
            self.sink.increment_requests(&self.labels, code);
            self.observe_elapsed();
        }
    }
}
