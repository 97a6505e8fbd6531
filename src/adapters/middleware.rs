//! Built-in transport middlewares and the name-based registry resolving them.
//!
//! A middleware wraps a [`SharedTransport`] and returns a new one, so it sees every attempt
//! the endpoint makes. Middlewares are resolved by name from endpoint and gateway config; a
//! name the registry does not know yields [`MiddlewareError::NotFound`] and is skipped by the
//! chain builder.
use std::{collections::HashMap, sync::Arc};

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::time::Instant;

use crate::{
    config::models::MiddlewareConfig,
    core::endpoint::RequestOptions,
    ports::{
        middleware::{Middleware, MiddlewareError, MiddlewareFactory},
        transport::{SharedTransport, transport_fn},
    },
};

/// Builds a middleware from its free-form options.
pub type MiddlewareConstructor =
    Arc<dyn Fn(&serde_json::Value) -> Result<Middleware, String> + Send + Sync>;

/// Registry of named middleware constructors.
#[derive(Clone, Default)]
pub struct MiddlewareRegistry {
    constructors: HashMap<String, MiddlewareConstructor>,
}

impl MiddlewareRegistry {
    /// An empty registry; every lookup is `NotFound`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `request_timing`, `security_headers`, `cors` and
    /// `custom_headers`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("request_timing", |_| Ok(request_timing()));
        registry.register("security_headers", |_| Ok(security_headers()));
        registry.register("cors", |_| Ok(cors()));
        registry.register("custom_headers", custom_headers);
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&serde_json::Value) -> Result<Middleware, String> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(constructor));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }
}

impl MiddlewareFactory for MiddlewareRegistry {
    fn build(&self, config: &MiddlewareConfig) -> Result<Middleware, MiddlewareError> {
        let constructor = self
            .constructors
            .get(&config.name)
            .ok_or_else(|| MiddlewareError::NotFound(config.name.clone()))?;
        constructor(&config.options).map_err(|reason| MiddlewareError::Invalid {
            name: config.name.clone(),
            reason,
        })
    }
}

/// Wrap `next` so `f` can edit every response header map it returns.
fn map_response_headers<F>(f: F) -> Middleware
where
    F: Fn(&mut HeaderMap) + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |next: SharedTransport| {
        let f = f.clone();
        transport_fn(move |req| {
            let next = next.clone();
            let f = f.clone();
            async move {
                next.execute(req).await.map(|mut response| {
                    f(response.headers_mut());
                    response
                })
            }
        })
    })
}

/// Log start/end of every attempt including latency.
pub fn request_timing() -> Middleware {
    Arc::new(|next: SharedTransport| {
        transport_fn(move |req| {
            let next = next.clone();
            async move {
                let start = Instant::now();
                let method = req.method().clone();
                let uri = req.uri().clone();
                let (attempt, attempts) = req
                    .extensions()
                    .get::<RequestOptions>()
                    .map_or((1, 1), |options| (options.attempt, options.attempts));

                tracing::info!(
                    "Started processing {} {} [{}/{}]",
                    method,
                    uri,
                    attempt,
                    attempts
                );
                let result = next.execute(req).await;
                match &result {
                    Ok(response) => tracing::info!(
                        "Completed {} {} - {} in {:?}",
                        method,
                        uri,
                        response.status(),
                        start.elapsed()
                    ),
                    Err(e) => tracing::info!(
                        "Failed {} {} in {:?}: {}",
                        method,
                        uri,
                        start.elapsed(),
                        e
                    ),
                }
                result
            }
        })
    })
}

/// Add common security hardening headers.
pub fn security_headers() -> Middleware {
    map_response_headers(|headers| {
        headers.insert(
            "x-content-type-options",
            HeaderValue::from_static("nosniff"),
        );
        headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
        headers.insert(
            "x-xss-protection",
            HeaderValue::from_static("1; mode=block"),
        );
        headers.insert(
            "referrer-policy",
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        );
    })
}

/// Permissive CORS headers.
pub fn cors() -> Middleware {
    map_response_headers(|headers| {
        headers
            .entry("access-control-allow-origin")
            .or_insert(HeaderValue::from_static("*"));
        headers.insert(
            "access-control-allow-methods",
            HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
        );
        headers.insert(
            "access-control-allow-headers",
            HeaderValue::from_static("Content-Type, Authorization, X-Requested-With"),
        );
        headers.insert("access-control-max-age", HeaderValue::from_static("86400"));
    })
}

/// Inject the response headers given as a JSON object of name → value.
pub fn custom_headers(options: &serde_json::Value) -> Result<Middleware, String> {
    let map = options
        .as_object()
        .ok_or_else(|| "options must be an object of header name to value".to_string())?;

    let mut parsed = Vec::with_capacity(map.len());
    for (name, value) in map {
        let value = value
            .as_str()
            .ok_or_else(|| format!("value of header {name} must be a string"))?;
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| format!("{name}: {e}"))?;
        let value = HeaderValue::from_str(value).map_err(|e| format!("{name}: {e}"))?;
        parsed.push((name, value));
    }

    Ok(map_response_headers(move |headers| {
        for (name, value) in &parsed {
            headers.insert(name.clone(), value.clone());
        }
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body as AxumBody;
    use hyper::{Request, Response};
    use serde_json::json;

    use super::*;

    fn ok_transport() -> SharedTransport {
        transport_fn(|_req| async { Ok(Response::new(AxumBody::empty())) })
    }

    async fn run(middleware: Middleware) -> Response<AxumBody> {
        middleware(ok_transport())
            .execute(Request::new(AxumBody::empty()))
            .await
            .unwrap()
    }

    #[test]
    fn test_unknown_middleware_is_not_found() {
        let registry = MiddlewareRegistry::with_builtins();
        let result = registry.build(&MiddlewareConfig::new("rate_limit"));
        assert!(matches!(result, Err(MiddlewareError::NotFound(name)) if name == "rate_limit"));
    }

    #[tokio::test]
    async fn test_security_headers() {
        let registry = MiddlewareRegistry::with_builtins();
        let middleware = registry
            .build(&MiddlewareConfig::new("security_headers"))
            .unwrap();
        let response = run(middleware).await;

        let headers = response.headers();
        assert!(headers.contains_key("x-content-type-options"));
        assert!(headers.contains_key("x-frame-options"));
        assert!(headers.contains_key("x-xss-protection"));
        assert!(headers.contains_key("referrer-policy"));
    }

    #[tokio::test]
    async fn test_custom_headers() {
        let registry = MiddlewareRegistry::with_builtins();
        let config = MiddlewareConfig::new("custom_headers")
            .with_options(json!({ "x-custom-header": "custom-value" }));
        let response = run(registry.build(&config).unwrap()).await;

        assert_eq!(response.headers()["x-custom-header"], "custom-value");
    }

    #[test]
    fn test_custom_headers_invalid_options() {
        let registry = MiddlewareRegistry::with_builtins();
        for options in [json!("nope"), json!({ "x-a": 1 }), json!({ "bad header": "v" })] {
            let config = MiddlewareConfig::new("custom_headers").with_options(options);
            assert!(matches!(
                registry.build(&config),
                Err(MiddlewareError::Invalid { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_registered_constructor() {
        let mut registry = MiddlewareRegistry::new();
        registry.register("tag", |options| {
            let tag = options
                .as_str()
                .ok_or_else(|| "tag must be a string".to_string())?
                .to_string();
            Ok(map_response_headers(move |headers| {
                headers.insert(
                    "x-tag",
                    HeaderValue::from_str(&tag).unwrap_or(HeaderValue::from_static("invalid")),
                );
            }))
        });
        assert!(registry.contains("tag"));

        let config = MiddlewareConfig::new("tag").with_options(json!("blue"));
        let response = run(registry.build(&config).unwrap()).await;
        assert_eq!(response.headers()["x-tag"], "blue");
    }
}
