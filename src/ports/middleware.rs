use std::sync::Arc;

use thiserror::Error;

use crate::{config::models::MiddlewareConfig, ports::transport::SharedTransport};

/// Error type for middleware resolution
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MiddlewareError {
    /// No middleware is registered under this name. Chain building skips it.
    #[error("Middleware not found: {0}")]
    NotFound(String),

    /// The middleware exists but its options are unusable. Aborts endpoint construction.
    #[error("Invalid middleware '{name}': {reason}")]
    Invalid { name: String, reason: String },
}

/// A transport decorator: takes the next transport and returns the wrapped one.
pub type Middleware = Arc<dyn Fn(SharedTransport) -> SharedTransport + Send + Sync>;

/// MiddlewareFactory resolves a configured middleware entry into a decorator.
pub trait MiddlewareFactory: Send + Sync + 'static {
    fn build(&self, config: &MiddlewareConfig) -> Result<Middleware, MiddlewareError>;
}
