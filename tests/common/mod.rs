// Scripted in-memory upstreams shared by the integration tests
#![allow(dead_code)]

use std::{
    collections::HashMap,
    convert::Infallible,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{body::Body as AxumBody, extract::ConnectInfo};
use bytes::Bytes;
use futures_util::stream;
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody};
use hyper::{HeaderMap, Request, Response, header::HeaderValue};
use portway::{
    InMemoryMetrics, MiddlewareRegistry, Proxy,
    config::models::EndpointConfig,
    core::RequestOptions,
    ports::transport::{SharedTransport, TransportError, TransportResult, transport_fn},
};

pub const PEER: [u8; 4] = [10, 0, 0, 7];

/// What a scripted upstream does on one call.
#[derive(Debug, Clone)]
pub enum Step {
    Status(u16),
    Delay(Duration, u16),
    Canceled,
    DeadlineExceeded,
    Refused,
    /// 200 with a body and `grpc-status: 0` trailers.
    GrpcOk,
}

/// One call observed by a scripted upstream.
#[derive(Debug, Clone)]
pub struct Seen {
    pub body: Bytes,
    pub forwarded_for: Option<String>,
    pub attempt: Option<u32>,
}

/// Upstream that plays `steps` in order, repeating the last one, and answers with `name`
/// as the body.
#[derive(Clone)]
pub struct Script {
    name: String,
    steps: Arc<Vec<Step>>,
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Script {
    pub fn new(name: &str, steps: Vec<Step>) -> Self {
        Self {
            name: name.to_string(),
            steps: Arc::new(steps),
            calls: Arc::default(),
            seen: Arc::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn transport(&self) -> SharedTransport {
        let script = self.clone();
        transport_fn(move |req: Request<AxumBody>| {
            let script = script.clone();
            async move { script.call(req).await }
        })
    }

    async fn call(&self, req: Request<AxumBody>) -> TransportResult<Response<AxumBody>> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .steps
            .get(index)
            .or(self.steps.last())
            .cloned()
            .unwrap_or(Step::Status(200));

        let (parts, body) = req.into_parts();
        let body = body.collect().await.unwrap().to_bytes();
        self.seen.lock().unwrap().push(Seen {
            body,
            forwarded_for: parts
                .headers
                .get("x-forwarded-for")
                .map(|v| v.to_str().unwrap().to_string()),
            attempt: parts
                .extensions
                .get::<RequestOptions>()
                .map(|options| options.attempt),
        });

        match step {
            Step::Status(status) => Ok(self.respond(status)),
            Step::Delay(delay, status) => {
                tokio::time::sleep(delay).await;
                Ok(self.respond(status))
            }
            Step::Canceled => Err(TransportError::Canceled("upstream canceled".into())),
            Step::DeadlineExceeded => {
                Err(TransportError::DeadlineExceeded("upstream too slow".into()))
            }
            Step::Refused => Err(TransportError::Connection("connection refused".into())),
            Step::GrpcOk => {
                let mut trailers = HeaderMap::new();
                trailers.insert("grpc-status", HeaderValue::from_static("0"));
                let frames = stream::iter(vec![
                    Ok::<_, Infallible>(Frame::data(Bytes::from(self.name.clone()))),
                    Ok(Frame::trailers(trailers)),
                ]);
                let mut response = Response::new(AxumBody::new(StreamBody::new(frames)));
                response
                    .headers_mut()
                    .insert("content-type", HeaderValue::from_static("application/grpc"));
                Ok(response)
            }
        }
    }

    fn respond(&self, status: u16) -> Response<AxumBody> {
        Response::builder()
            .status(status)
            .body(AxumBody::from(self.name.clone()))
            .unwrap()
    }
}

/// Scripts addressed by the first backend target of an endpoint.
#[derive(Clone, Default)]
pub struct Upstreams {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
}

impl Upstreams {
    pub fn add(&self, script: Script) -> Script {
        self.scripts
            .lock()
            .unwrap()
            .insert(script.name.clone(), script.clone());
        script
    }

    pub fn proxy(&self, metrics: Arc<InMemoryMetrics>) -> Proxy {
        let scripts = self.scripts.clone();
        let transports = move |endpoint: &EndpointConfig| -> TransportResult<SharedTransport> {
            let target = endpoint
                .backends
                .first()
                .map(|b| b.target.clone())
                .unwrap_or_default();
            scripts
                .lock()
                .unwrap()
                .get(&target)
                .map(Script::transport)
                .ok_or_else(|| TransportError::InvalidConfig(format!("unknown upstream {target}")))
        };
        Proxy::new(
            Arc::new(transports),
            Arc::new(MiddlewareRegistry::with_builtins()),
            metrics,
        )
    }
}

pub fn request(method: &str, uri: &str, body: impl Into<AxumBody>) -> Request<AxumBody> {
    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .body(body.into())
        .unwrap();
    req.extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((PEER, 40000))));
    req
}

pub async fn body_text(response: Response<AxumBody>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}
