//! Ports: the traits the forwarding core depends on.
pub mod config_provider;
pub mod metrics_sink;
pub mod middleware;
pub mod transport;

pub use metrics_sink::{MetricLabels, MetricsSink};
pub use middleware::{Middleware, MiddlewareError, MiddlewareFactory};
pub use transport::{
    SharedTransport, Transport, TransportError, TransportFactory, TransportResult, transport_fn,
};
