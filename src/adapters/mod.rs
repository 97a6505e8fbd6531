pub mod config_providers;
pub mod http_client;
pub mod load_balancer;
pub mod middleware;

/// Re-export commonly used types from adapters
pub use config_providers::FileConfigProvider;
pub use http_client::{HttpTransport, HttpTransportFactory};
pub use middleware::MiddlewareRegistry;
