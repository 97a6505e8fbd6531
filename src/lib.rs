//! Portway - the request-forwarding core of an HTTP/gRPC API gateway.
//!
//! Portway turns a declarative list of endpoints into a routing table and serves requests
//! through it:
//!
//! - every endpoint gets a transport (backend client) wrapped in its middleware chain
//! - requests run through a retry loop bounded by an overall and a per-attempt deadline
//! - the request body is read once and replayed for every attempt
//! - failures are classified into `499` / `504` / `502`, with gRPC endpoints answering
//!   `200` plus `grpc-status`
//! - routing tables are swapped atomically on configuration change while in-flight
//!   requests finish on the table they started with
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use portway::{
//!     GatewayMetrics, HttpTransportFactory, MiddlewareRegistry, Proxy,
//!     config::loader::load_config,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config("gateway.yaml").await?;
//! let proxy = Arc::new(Proxy::new(
//!     Arc::new(HttpTransportFactory::new()?),
//!     Arc::new(MiddlewareRegistry::with_builtins()),
//!     Arc::new(GatewayMetrics::new()),
//! ));
//! proxy.update(&config.gateway)?;
//! // Wire `proxy.serve(req)` into an axum fallback handler (see the binary crate)
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! **Ports** (traits for transports, middlewares, metrics and configuration sources) are
//! kept apart from **adapters** (hyper client, middleware registry, file watcher), while the
//! forwarding logic lives in `core`.
//!
//! # Error Handling
//! Library building blocks return typed `thiserror` errors; the binary and configuration
//! loading use `eyre::Result<T>` with context attached through `WrapErr`.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{FileConfigProvider, HttpTransportFactory, MiddlewareRegistry},
    core::{EndpointHandler, Proxy, RouterHolder},
    metrics::{GatewayMetrics, InMemoryMetrics},
};
