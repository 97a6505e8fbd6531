use std::time::Duration;

/// Label set shared by every per-request metric family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MetricLabels {
    pub protocol: String,
    pub method: String,
    pub path: String,
    pub service: String,
    pub base_path: String,
}

impl MetricLabels {
    pub fn new(
        protocol: &str,
        method: &str,
        path: &str,
        service: &str,
        base_path: &str,
    ) -> Self {
        Self {
            protocol: protocol.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            service: service.to_string(),
            base_path: base_path.to_string(),
        }
    }
}

/// MetricsSink defines the port for request instrumentation.
///
/// Implementations must be safe for concurrent use from many request tasks.
pub trait MetricsSink: Send + Sync + 'static {
    /// Count a finished request under a status code label.
    fn increment_requests(&self, labels: &MetricLabels, code: u16);

    /// Count the status code actually returned by the upstream on the success path.
    fn increment_upstream_code(&self, labels: &MetricLabels, code: u16);

    fn observe_duration(&self, labels: &MetricLabels, duration: Duration);

    fn add_sent_bytes(&self, labels: &MetricLabels, bytes: u64);

    fn add_received_bytes(&self, labels: &MetricLabels, bytes: u64);

    /// Count an attempt beyond the first.
    fn increment_retry(&self, labels: &MetricLabels);

    /// Count a request that succeeded on an attempt beyond the first.
    fn increment_retry_success(&self, labels: &MetricLabels);
}
