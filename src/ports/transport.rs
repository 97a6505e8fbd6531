use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

use crate::config::models::EndpointConfig;

/// Error type for a single forwarding attempt
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    /// The backend could not be reached or the exchange broke mid-way
    #[error("Connection error: {0}")]
    Connection(String),

    /// The attempt was cancelled before a response arrived
    #[error("Request canceled: {0}")]
    Canceled(String),

    /// The attempt ran out of time
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The outgoing request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No backend could be selected for the endpoint
    #[error("No backend available for {0}")]
    NoBackend(String),

    /// The endpoint configuration cannot produce a transport
    #[error("Invalid transport configuration: {0}")]
    InvalidConfig(String),
}

impl TransportError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, TransportError::Canceled(_))
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, TransportError::DeadlineExceeded(_))
    }
}

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Transport defines the port for performing one forwarding attempt to a backend.
///
/// Implementations must not retry on their own; retries, deadlines and body replay are
/// owned by the endpoint handler.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Execute a single request and return the backend's response.
    async fn execute(&self, req: Request<AxumBody>) -> TransportResult<Response<AxumBody>>;
}

/// Shared, type-erased transport. Middlewares wrap one of these into another.
pub type SharedTransport = Arc<dyn Transport>;

/// TransportFactory builds the base transport of an endpoint.
///
/// It is called once per endpoint per configuration update, never per request.
pub trait TransportFactory: Send + Sync + 'static {
    fn build(&self, endpoint: &EndpointConfig) -> TransportResult<SharedTransport>;
}

impl<F> TransportFactory for F
where
    F: Fn(&EndpointConfig) -> TransportResult<SharedTransport> + Send + Sync + 'static,
{
    fn build(&self, endpoint: &EndpointConfig) -> TransportResult<SharedTransport> {
        self(endpoint)
    }
}

/// Adapter turning an async closure into a [`Transport`].
pub struct TransportFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Transport for TransportFn<F>
where
    F: Fn(Request<AxumBody>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TransportResult<Response<AxumBody>>> + Send + 'static,
{
    async fn execute(&self, req: Request<AxumBody>) -> TransportResult<Response<AxumBody>> {
        (self.f)(req).await
    }
}

/// Build a [`SharedTransport`] from an async closure.
pub fn transport_fn<F, Fut>(f: F) -> SharedTransport
where
    F: Fn(Request<AxumBody>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TransportResult<Response<AxumBody>>> + Send + 'static,
{
    Arc::new(TransportFn { f })
}
