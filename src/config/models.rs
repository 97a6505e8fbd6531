//! Configuration data structures for Portway.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files. They are
//! serde‑friendly and include defaults so that minimal configs remain concise. Builders
//! here are part of the public API for embedding and for tests.
use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};

/// Metadata key carrying the logical service name of an endpoint.
pub const METADATA_SERVICE: &str = "service";
/// Metadata key carrying the base path of an endpoint.
pub const METADATA_BASE_PATH: &str = "basePath";

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

/// Wire protocol spoken by an endpoint towards its callers.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    #[serde(rename = "HTTP", alias = "http")]
    Http,
    #[serde(rename = "GRPC", alias = "grpc")]
    Grpc,
}

impl Protocol {
    /// Label value used in metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "HTTP",
            Protocol::Grpc => "GRPC",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named middleware with free-form options.
///
/// The options are interpreted by whichever constructor the middleware factory
/// resolves `name` to.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MiddlewareConfig {
    pub name: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

impl MiddlewareConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: serde_json::Value::Null,
        }
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }
}

/// An upstream target for an endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BackendConfig {
    /// Base URL of the backend, e.g. `http://127.0.0.1:9000`
    pub target: String,
    #[serde(default)]
    pub weight: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalanceStrategy {
    #[default]
    #[serde(rename = "round_robin")]
    RoundRobin,
    #[serde(rename = "random")]
    Random,
}

/// A condition that marks a response as "try again".
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetryConditionConfig {
    /// A single status code (`"503"`) or an inclusive range (`"500-504"`).
    ByStatusCode(String),
    /// Exact match on a response header value.
    ByHeader { name: String, value: String },
}

/// Retry policy of an endpoint. Durations are humantime strings ("250ms", "2s").
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one. 0 means "use the default".
    #[serde(default)]
    pub attempts: Option<i64>,
    #[serde(default)]
    pub per_try_timeout: Option<String>,
    #[serde(default)]
    pub conditions: Vec<RetryConditionConfig>,
}

/// One routed endpoint of the gateway.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EndpointConfig {
    /// Path template understood by the router, e.g. `/api/users/{id}`
    pub path: String,
    /// HTTP method; empty matches any method.
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub protocol: Protocol,
    /// Overall request timeout (humantime string).
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub middlewares: Vec<MiddlewareConfig>,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub load_balance: LoadBalanceStrategy,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl EndpointConfig {
    /// Create an HTTP endpoint matching any method on `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: String::new(),
            protocol: Protocol::Http,
            timeout: None,
            middlewares: Vec::new(),
            backends: Vec::new(),
            load_balance: LoadBalanceStrategy::RoundRobin,
            retry: None,
            metadata: HashMap::new(),
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn timeout(mut self, timeout: impl Into<String>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    pub fn middleware(mut self, middleware: MiddlewareConfig) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn backend(mut self, target: impl Into<String>) -> Self {
        self.backends.push(BackendConfig {
            target: target.into(),
            weight: None,
        });
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Logical service name from metadata, empty when unset.
    pub fn service(&self) -> &str {
        self.metadata
            .get(METADATA_SERVICE)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Base path from metadata, empty when unset.
    pub fn base_path(&self) -> &str {
        self.metadata
            .get(METADATA_BASE_PATH)
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// The routing section: everything needed to build one routing table.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    /// Gateway-wide middlewares, applied outside every endpoint's own list.
    #[serde(default)]
    pub middlewares: Vec<MiddlewareConfig>,
}

impl GatewayConfig {
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }
}

/// Builder for [`GatewayConfig`].
#[derive(Default)]
pub struct GatewayConfigBuilder {
    name: String,
    endpoints: Vec<EndpointConfig>,
    middlewares: Vec<MiddlewareConfig>,
}

impl GatewayConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add an endpoint
    pub fn endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Add a gateway-wide middleware
    pub fn middleware(mut self, middleware: MiddlewareConfig) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn build(self) -> GatewayConfig {
        GatewayConfig {
            name: self.name,
            endpoints: self.endpoints,
            middlewares: self.middlewares,
        }
    }
}

/// Process-level configuration: listeners plus the routing section.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Address of the debug listener (router inspection, metrics). Disabled when unset.
    #[serde(default)]
    pub debug_addr: Option<String>,
    #[serde(flatten)]
    pub gateway: GatewayConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            debug_addr: None,
            gateway: GatewayConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_metadata_labels() {
        let endpoint = EndpointConfig::new("/api/users")
            .metadata(METADATA_SERVICE, "users")
            .metadata(METADATA_BASE_PATH, "/api");
        assert_eq!(endpoint.service(), "users");
        assert_eq!(endpoint.base_path(), "/api");

        let bare = EndpointConfig::new("/");
        assert_eq!(bare.service(), "");
        assert_eq!(bare.base_path(), "");
    }

    #[test]
    fn test_protocol_serde_names() {
        let http: Protocol = serde_json::from_str("\"HTTP\"").unwrap();
        let grpc: Protocol = serde_json::from_str("\"grpc\"").unwrap();
        assert_eq!(http, Protocol::Http);
        assert_eq!(grpc, Protocol::Grpc);
        assert_eq!(grpc.to_string(), "GRPC");
    }

    #[test]
    fn test_retry_condition_shapes() {
        let json = r#"[{"by_status_code": "500-504"}, {"by_header": {"name": "x-retry", "value": "1"}}]"#;
        let conditions: Vec<RetryConditionConfig> = serde_json::from_str(json).unwrap();
        assert_eq!(
            conditions[0],
            RetryConditionConfig::ByStatusCode("500-504".to_string())
        );
        assert!(matches!(conditions[1], RetryConditionConfig::ByHeader { .. }));
    }
}
