pub mod body;
pub mod chain;
pub mod endpoint;
pub mod error;
pub mod proxy;
pub mod retry;
pub mod router;

pub use body::BodySnapshot;
pub use chain::build_middleware_chain;
pub use endpoint::{EndpointHandler, Factories, RequestOptions};
pub use error::{BuildError, ConfigError, ProxyError, RouteError};
pub use proxy::{Proxy, RouterHolder};
pub use retry::RetryStrategy;
pub use router::Router;
