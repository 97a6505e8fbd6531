//! Immutable routing table.
//!
//! Path templates are matched with `matchit` (`/users/{id}`, `/files/{*rest}`); each template
//! owns a small per-method table. Once built, a [`Router`] is never mutated: configuration
//! updates build a new one and publish it through the proxy's holder.
use std::{collections::HashMap, sync::Arc};

use axum::body::Body as AxumBody;
use http::request::Parts;
use hyper::{HeaderMap, Method, Request, Response, StatusCode, header};
use serde::Serialize;

use crate::{
    config::models::Protocol,
    core::{endpoint::EndpointHandler, error::RouteError},
    ports::metrics_sink::{MetricLabels, MetricsSink},
};

pub const NOT_FOUND_BODY: &str = "404 page not found";
pub const METHOD_NOT_ALLOWED_BODY: &str = "Method Not Allowed";
/// Path label recorded for requests that matched no route.
pub const NOT_FOUND_METRIC_PATH: &str = "/404";

/// Handlers registered under one path template.
#[derive(Default)]
struct MethodRoutes {
    template: String,
    by_method: HashMap<Method, Arc<EndpointHandler>>,
    any: Option<Arc<EndpointHandler>>,
}

impl MethodRoutes {
    fn get(&self, method: &Method) -> Option<&Arc<EndpointHandler>> {
        self.by_method.get(method).or(self.any.as_ref())
    }
}

/// Outcome of matching a request against the table.
pub enum Resolution<'a> {
    Found(&'a Arc<EndpointHandler>),
    NotFound,
    MethodNotAllowed,
}

/// `None` for "any method" (empty or `*`).
fn parse_method(method: &str, path: &str) -> Result<Option<Method>, RouteError> {
    let method = method.trim();
    if method.is_empty() || method == "*" {
        return Ok(None);
    }
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map(Some)
        .map_err(|_| RouteError::InvalidMethod {
            method: method.to_string(),
            path: path.to_string(),
        })
}

pub struct Router {
    paths: matchit::Router<usize>,
    slots: Vec<MethodRoutes>,
    index: HashMap<String, usize>,
    metrics: Arc<dyn MetricsSink>,
}

impl Router {
    /// An empty table; every request falls through to the not-found handler.
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            paths: matchit::Router::new(),
            slots: Vec::new(),
            index: HashMap::new(),
            metrics,
        }
    }

    /// Register `handler` for `method` on the path template.
    pub fn insert(
        &mut self,
        path: &str,
        method: &str,
        handler: Arc<EndpointHandler>,
    ) -> Result<(), RouteError> {
        let method = parse_method(method, path)?;

        let slot = match self.index.get(path) {
            Some(&slot) => slot,
            None => {
                let slot = self.slots.len();
                self.paths.insert(path, slot).map_err(|e| match e {
                    matchit::InsertError::Conflict { with } => RouteError::Conflict {
                        method: method
                            .as_ref()
                            .map_or_else(|| "*".to_string(), ToString::to_string),
                        path: format!("{path} (conflicts with {with})"),
                    },
                    other => RouteError::InvalidPath {
                        path: path.to_string(),
                        reason: other.to_string(),
                    },
                })?;
                self.slots.push(MethodRoutes {
                    template: path.to_string(),
                    ..Default::default()
                });
                self.index.insert(path.to_string(), slot);
                slot
            }
        };

        let routes = &mut self.slots[slot];
        let conflict = |method: &str| RouteError::Conflict {
            method: method.to_string(),
            path: path.to_string(),
        };
        match method {
            None if routes.any.is_some() => Err(conflict("*")),
            None => {
                routes.any = Some(handler);
                Ok(())
            }
            Some(method) if routes.by_method.contains_key(&method) => {
                Err(conflict(method.as_str()))
            }
            Some(method) => {
                routes.by_method.insert(method, handler);
                Ok(())
            }
        }
    }

    pub fn resolve(&self, method: &Method, path: &str) -> Resolution<'_> {
        let Ok(matched) = self.paths.at(path) else {
            return Resolution::NotFound;
        };
        match self.slots[*matched.value].get(method) {
            Some(handler) => Resolution::Found(handler),
            None => Resolution::MethodNotAllowed,
        }
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .map(|routes| routes.by_method.len() + usize::from(routes.any.is_some()))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Match and serve one request.
    pub async fn serve(&self, req: Request<AxumBody>) -> Response<AxumBody> {
        match self.resolve(req.method(), req.uri().path()) {
            Resolution::Found(handler) => handler.handle(req).await,
            Resolution::NotFound => {
                let (parts, _) = req.into_parts();
                not_found(&parts, self.metrics.as_ref())
            }
            Resolution::MethodNotAllowed => {
                let (parts, _) = req.into_parts();
                method_not_allowed(&parts, self.metrics.as_ref())
            }
        }
    }

    /// Serializable view of the table for the debug endpoint.
    pub fn inspect(&self) -> RouterInspect {
        let mut routes = Vec::with_capacity(self.len());
        for slot in &self.slots {
            let mut methods: Vec<(String, &Arc<EndpointHandler>)> = slot
                .by_method
                .iter()
                .map(|(method, handler)| (method.to_string(), handler))
                .collect();
            methods.sort_by(|a, b| a.0.cmp(&b.0));
            if let Some(handler) = &slot.any {
                methods.push(("*".to_string(), handler));
            }
            routes.extend(
                methods
                    .into_iter()
                    .map(|(method, handler)| RouteInspect::new(&slot.template, method, handler)),
            );
        }
        routes.sort_by(|a, b| a.path.cmp(&b.path));
        RouterInspect {
            total: routes.len(),
            routes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterInspect {
    pub total: usize,
    pub routes: Vec<RouteInspect>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteInspect {
    pub path: String,
    pub method: String,
    pub protocol: Protocol,
    pub service: String,
    pub base_path: String,
    pub middlewares: Vec<String>,
    pub backends: Vec<String>,
    pub attempts: u32,
    pub timeout: String,
    pub per_try_timeout: String,
}

impl RouteInspect {
    fn new(path: &str, method: String, handler: &EndpointHandler) -> Self {
        let endpoint = handler.endpoint();
        let strategy = handler.strategy();
        Self {
            path: path.to_string(),
            method,
            protocol: endpoint.protocol,
            service: endpoint.service().to_string(),
            base_path: endpoint.base_path().to_string(),
            middlewares: endpoint.middlewares.iter().map(|m| m.name.clone()).collect(),
            backends: endpoint.backends.iter().map(|b| b.target.clone()).collect(),
            attempts: strategy.attempts(),
            timeout: humantime::format_duration(strategy.timeout()).to_string(),
            per_try_timeout: humantime::format_duration(strategy.per_try_timeout()).to_string(),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

fn plain_text(status: StatusCode, body: &'static str) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Access-log entry for a request answered by a fallback; `error` carries the response body.
fn access_log(parts: &Parts, status: StatusCode, error: &str) {
    let host = parts
        .uri
        .host()
        .unwrap_or_else(|| header_str(&parts.headers, header::HOST));
    tracing::error!(
        source = "accesslog",
        host = %host,
        method = %parts.method,
        path = %parts.uri.path(),
        query = %parts.uri.query().unwrap_or_default(),
        user_agent = %header_str(&parts.headers, header::USER_AGENT),
        code = status.as_u16(),
        error = %error,
        "Request not routed"
    );
}

fn record_fallback(metrics: &dyn MetricsSink, parts: &Parts, path: &str, status: StatusCode) {
    let labels = MetricLabels::new(Protocol::Http.as_str(), parts.method.as_str(), path, "", "");
    metrics.increment_requests(&labels, status.as_u16());
}

/// Fallback for requests that matched no path template.
pub fn not_found(parts: &Parts, metrics: &dyn MetricsSink) -> Response<AxumBody> {
    access_log(parts, StatusCode::NOT_FOUND, NOT_FOUND_BODY);
    record_fallback(metrics, parts, NOT_FOUND_METRIC_PATH, StatusCode::NOT_FOUND);
    plain_text(StatusCode::NOT_FOUND, NOT_FOUND_BODY)
}

/// Fallback for a matched path without a handler for the request method.
pub fn method_not_allowed(parts: &Parts, metrics: &dyn MetricsSink) -> Response<AxumBody> {
    access_log(parts, StatusCode::METHOD_NOT_ALLOWED, METHOD_NOT_ALLOWED_BODY);
    record_fallback(
        metrics,
        parts,
        parts.uri.path(),
        StatusCode::METHOD_NOT_ALLOWED,
    );
    plain_text(StatusCode::METHOD_NOT_ALLOWED, METHOD_NOT_ALLOWED_BODY)
}
