//! Per-endpoint request handler.
//!
//! An [`EndpointHandler`] is built once per endpoint per configuration update and then
//! serves every request routed to that endpoint:
//!
//! 1. propagate `X-Forwarded-For`
//! 2. attach [`RequestOptions`] and derive the overall deadline
//! 3. capture the request body once ([`BodySnapshot`])
//! 4. run the retry loop against the composed transport
//! 5. stream the terminal response back while counting bytes
//!
//! Every exit records its metrics through a [`RequestRecorder`].
use std::{
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{body::Body as AxumBody, extract::ConnectInfo};
use bytes::Bytes;
use http::request::Parts;
use http_body::{Body as HttpBody, Frame, SizeHint};
use hyper::{
    HeaderMap, Request, Response,
    header::{HeaderName, HeaderValue},
};
use tokio::time::{Instant, timeout_at};

use crate::{
    config::models::{EndpointConfig, MiddlewareConfig, Protocol},
    core::{
        body::BodySnapshot,
        chain::build_middleware_chain,
        error::{BuildError, ProxyError, error_response},
        retry::RetryStrategy,
    },
    metrics::RequestRecorder,
    ports::{
        metrics_sink::{MetricLabels, MetricsSink},
        middleware::MiddlewareFactory,
        transport::{SharedTransport, TransportFactory},
    },
};

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Collaborators needed to turn endpoint configuration into handlers.
#[derive(Clone)]
pub struct Factories {
    pub transports: Arc<dyn TransportFactory>,
    pub middlewares: Arc<dyn MiddlewareFactory>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// Request extension visible to middlewares and transports for each attempt.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub endpoint: Arc<EndpointConfig>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub attempts: u32,
    /// Deadline of this attempt, already clamped to the overall deadline.
    pub deadline: Instant,
}

/// Append the peer address to `X-Forwarded-For`.
///
/// Prior values are kept as a comma+space separated list, folding multiple header lines
/// into one; their bytes are carried over as received, even when they are not UTF-8. A
/// single empty `X-Forwarded-For` value means "do not populate": the header is removed and
/// nothing is appended. Without a known peer address the headers are left alone.
pub fn set_forwarded_for(headers: &mut HeaderMap, peer: Option<IpAddr>) {
    let Some(peer) = peer else {
        return;
    };
    let prior: Vec<&HeaderValue> = headers.get_all(&X_FORWARDED_FOR).iter().collect();
    if prior.len() == 1 && prior[0].is_empty() {
        headers.remove(&X_FORWARDED_FOR);
        return;
    }

    let mut chain = prior
        .iter()
        .map(|value| value.as_bytes())
        .collect::<Vec<_>>()
        .join(&b", "[..]);
    if !chain.is_empty() {
        chain.extend_from_slice(b", ");
    }
    chain.extend_from_slice(peer.to_string().as_bytes());

    match HeaderValue::from_bytes(&chain) {
        Ok(value) => {
            headers.insert(X_FORWARDED_FOR, value);
        }
        Err(e) => tracing::warn!(
            "Invalid X-Forwarded-For value {:?}: {}",
            String::from_utf8_lossy(&chain),
            e
        ),
    }
}

/// Labels captured once at build time and reused for every request.
#[derive(Debug, Clone)]
struct EndpointLabels {
    protocol: Protocol,
    service: String,
    base_path: String,
}

/// The composed request handler of one endpoint.
pub struct EndpointHandler {
    endpoint: Arc<EndpointConfig>,
    transport: SharedTransport,
    strategy: RetryStrategy,
    labels: EndpointLabels,
    metrics: Arc<dyn MetricsSink>,
}

impl EndpointHandler {
    /// Build the handler: base transport, endpoint middlewares (inner), gateway middlewares
    /// (outer), retry strategy.
    pub fn build(
        endpoint: &EndpointConfig,
        global_middlewares: &[MiddlewareConfig],
        factories: &Factories,
    ) -> Result<Self, BuildError> {
        let transport =
            factories
                .transports
                .build(endpoint)
                .map_err(|source| BuildError::Transport {
                    method: endpoint.method.clone(),
                    path: endpoint.path.clone(),
                    source,
                })?;
        let chain_error = |source| BuildError::Middleware {
            path: endpoint.path.clone(),
            source,
        };
        let transport = build_middleware_chain(
            factories.middlewares.as_ref(),
            &endpoint.middlewares,
            transport,
        )
        .map_err(chain_error)?;
        let transport =
            build_middleware_chain(factories.middlewares.as_ref(), global_middlewares, transport)
                .map_err(chain_error)?;
        let strategy =
            RetryStrategy::from_endpoint(endpoint).map_err(|source| BuildError::Retry {
                path: endpoint.path.clone(),
                source,
            })?;

        Ok(Self {
            endpoint: Arc::new(endpoint.clone()),
            transport,
            strategy,
            labels: EndpointLabels {
                protocol: endpoint.protocol,
                service: endpoint.service().to_string(),
                base_path: endpoint.base_path().to_string(),
            },
            metrics: factories.metrics.clone(),
        })
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    pub fn strategy(&self) -> &RetryStrategy {
        &self.strategy
    }

    fn recorder(&self, parts: &Parts, start: Instant) -> RequestRecorder {
        RequestRecorder::new(
            self.metrics.clone(),
            MetricLabels::new(
                self.labels.protocol.as_str(),
                parts.method.as_str(),
                parts.uri.path(),
                &self.labels.service,
                &self.labels.base_path,
            ),
            start,
        )
    }

    fn fail(&self, recorder: RequestRecorder, err: ProxyError) -> Response<AxumBody> {
        let (response, code) = error_response(&err, self.labels.protocol);
        recorder.finish_error(code);
        response
    }

    /// Serve one inbound request.
    pub async fn handle(&self, req: Request<AxumBody>) -> Response<AxumBody> {
        let start = Instant::now();
        let (mut parts, body) = req.into_parts();

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        set_forwarded_for(&mut parts.headers, peer);

        let recorder = self.recorder(&parts, start);
        let deadline = start + self.strategy.timeout();

        let snapshot = match timeout_at(deadline, BodySnapshot::read(body)).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => return self.fail(recorder, ProxyError::Body(e.to_string())),
            Err(_) => return self.fail(recorder, ProxyError::DeadlineExceeded),
        };
        recorder.received(snapshot.len());

        let attempts = self.strategy.attempts();
        let mut last_error = None;
        let mut terminal = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                recorder.retry();
            }
            let now = Instant::now();
            if now >= deadline {
                last_error = Some(ProxyError::DeadlineExceeded);
                break;
            }
            let attempt_deadline = self.strategy.attempt_deadline(deadline, now);

            let mut outgoing = attempt_request(&parts, snapshot.replay());
            outgoing.extensions_mut().insert(RequestOptions {
                endpoint: self.endpoint.clone(),
                attempt,
                attempts,
                deadline: attempt_deadline,
            });

            let result = match timeout_at(attempt_deadline, self.transport.execute(outgoing)).await
            {
                Ok(result) => result.map_err(ProxyError::from),
                Err(_) => Err(ProxyError::DeadlineExceeded),
            };

            match result {
                Err(err) => {
                    tracing::error!(
                        "Attempt at [{}/{}], failed to handle request: {}: {}",
                        attempt,
                        attempts,
                        parts.uri,
                        err
                    );
                    last_error = Some(err);
                }
                Ok(response) if self.strategy.retry_required(&response) => {
                    tracing::debug!(
                        "Attempt at [{}/{}] returned retryable status {} for {}",
                        attempt,
                        attempts,
                        response.status(),
                        parts.uri
                    );
                    last_error = Some(ProxyError::RetriesExhausted {
                        attempts: attempt,
                        status: response.status().as_u16(),
                    });
                }
                Ok(response) => {
                    if attempt > 1 {
                        recorder.retry_success();
                    }
                    terminal = Some(response);
                    break;
                }
            }
        }

        let Some(response) = terminal else {
            let err = last_error.unwrap_or(ProxyError::DeadlineExceeded);
            return self.fail(recorder, err);
        };

        let (response_parts, upstream) = response.into_parts();
        let status = response_parts.status.as_u16();
        let body = MeteredBody::new(upstream, recorder, status, self.endpoint.clone());
        Response::from_parts(response_parts, AxumBody::new(body))
    }
}

/// A fresh outgoing request for one attempt.
fn attempt_request(parts: &Parts, body: AxumBody) -> Request<AxumBody> {
    let mut req = Request::new(body);
    *req.method_mut() = parts.method.clone();
    *req.uri_mut() = parts.uri.clone();
    *req.version_mut() = parts.version;
    *req.headers_mut() = parts.headers.clone();
    *req.extensions_mut() = parts.extensions.clone();
    req
}

/// Upstream response body that counts bytes sent to the caller.
///
/// Trailers are passed through as the final frame. When the body is finished or dropped
/// (client gone, copy failure) the success metrics are recorded with the bytes sent so far.
struct MeteredBody {
    inner: AxumBody,
    recorder: Option<RequestRecorder>,
    status: u16,
    sent: u64,
    endpoint: Arc<EndpointConfig>,
}

impl MeteredBody {
    fn new(
        inner: AxumBody,
        recorder: RequestRecorder,
        status: u16,
        endpoint: Arc<EndpointConfig>,
    ) -> Self {
        Self {
            inner,
            recorder: Some(recorder),
            status,
            sent: 0,
            endpoint,
        }
    }

    fn finish(&mut self) {
        if let Some(recorder) = self.recorder.take() {
            recorder.finish_success(self.status, self.sent);
        }
    }
}

impl HttpBody for MeteredBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.sent += data.len() as u64;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::error!(
                    "Failed to copy backend response body to client: [{}] {} {} {}",
                    this.endpoint.protocol,
                    this.endpoint.method,
                    this.endpoint.path,
                    e
                );
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for MeteredBody {
    fn drop(&mut self) {
        self.finish();
    }
}
