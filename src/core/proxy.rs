//! Top-level dispatcher.
//!
//! [`Proxy`] owns the currently published [`Router`] and the factories used to build new
//! ones. `update` builds a complete table off to the side and publishes it in one atomic
//! store; `serve` loads whatever table is current and runs the request through it inside a
//! panic boundary.
use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
};

use arc_swap::ArcSwap;
use axum::{Json, body::Body as AxumBody, extract::State, routing::get};
use futures_util::FutureExt;
use hyper::{Request, Response, StatusCode};

use crate::{
    config::models::GatewayConfig,
    core::{
        endpoint::{EndpointHandler, Factories},
        error::BuildError,
        router::{Router, RouterInspect},
    },
    ports::{metrics_sink::MetricsSink, middleware::MiddlewareFactory, transport::TransportFactory},
};

pub const INSPECT_PATH: &str = "/debug/proxy/router/inspect";

/// Single-writer, many-reader holder of the published routing table.
pub struct RouterHolder {
    current: ArcSwap<Router>,
}

impl RouterHolder {
    pub fn new(router: Router) -> Self {
        Self {
            current: ArcSwap::from_pointee(router),
        }
    }

    pub fn store(&self, router: Arc<Router>) {
        self.current.store(router);
    }

    /// The table published last. The returned snapshot stays valid for as long as the caller
    /// holds it, regardless of later stores.
    pub fn load(&self) -> Arc<Router> {
        self.current.load_full()
    }
}

pub struct Proxy {
    holder: RouterHolder,
    factories: Factories,
    update_lock: Mutex<()>,
}

impl Proxy {
    /// A proxy serving an empty table until the first successful [`Proxy::update`].
    pub fn new(
        transports: Arc<dyn TransportFactory>,
        middlewares: Arc<dyn MiddlewareFactory>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let factories = Factories {
            transports,
            middlewares,
            metrics,
        };
        Self {
            holder: RouterHolder::new(Router::new(factories.metrics.clone())),
            factories,
            update_lock: Mutex::new(()),
        }
    }

    /// Build a routing table for `config` and publish it.
    ///
    /// Any endpoint failing to build aborts the update; the previously published table stays
    /// in force.
    pub fn update(&self, config: &GatewayConfig) -> Result<(), BuildError> {
        let _guard = self
            .update_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut router = Router::new(self.factories.metrics.clone());
        for endpoint in &config.endpoints {
            tracing::info!(
                "build endpoint: [{}] {} {}",
                endpoint.protocol,
                endpoint.method,
                endpoint.path
            );
            let handler = EndpointHandler::build(endpoint, &config.middlewares, &self.factories)?;
            router.insert(&endpoint.path, &endpoint.method, Arc::new(handler))?;
        }

        tracing::info!(
            "Publishing routing table '{}' with {} routes",
            config.name,
            router.len()
        );
        self.holder.store(Arc::new(router));
        Ok(())
    }

    pub fn current(&self) -> Arc<Router> {
        self.holder.load()
    }

    /// Serve one request against the current table.
    ///
    /// A panic anywhere below is logged and answered with `502 Bad Gateway`.
    pub async fn serve(&self, req: Request<AxumBody>) -> Response<AxumBody> {
        let router = self.holder.load();
        let method = req.method().clone();
        let uri = req.uri().clone();

        match AssertUnwindSafe(router.serve(req)).catch_unwind().await {
            Ok(response) => response,
            Err(panic) => {
                tracing::error!(
                    "Recovered from panic while serving {} {}: {}",
                    method,
                    uri,
                    panic_message(panic.as_ref())
                );
                let mut response = Response::new(AxumBody::empty());
                *response.status_mut() = StatusCode::BAD_GATEWAY;
                response
            }
        }
    }

    /// Debug surface exposing the current table as JSON.
    pub fn debug_router(self: &Arc<Self>) -> axum::Router {
        axum::Router::new()
            .route(INSPECT_PATH, get(inspect_handler))
            .with_state(self.clone())
    }
}

async fn inspect_handler(State(proxy): State<Arc<Proxy>>) -> Json<RouterInspect> {
    Json(proxy.current().inspect())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
