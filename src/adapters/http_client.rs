use std::{error::Error as StdError, sync::Arc};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use http::uri::{Authority, PathAndQuery, Scheme};
use hyper::{Request, Response, Uri, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;

use crate::{
    adapters::load_balancer::WeightedPool,
    config::models::{EndpointConfig, Protocol},
    core::endpoint::RequestOptions,
    ports::transport::{
        SharedTransport, Transport, TransportError, TransportFactory, TransportResult,
    },
    tracing_setup::create_backend_span,
};

type HyperClient = Client<HttpsConnector<HttpConnector>, AxumBody>;

fn tls_config() -> rustls::ClientConfig {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let mut root_cert_store = rustls::RootCertStore::empty();
    let native_certs = load_native_certs();

    if !native_certs.certs.is_empty() {
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        tracing::info!("Loaded {} native root certificates.", root_cert_store.len());
    }

    if !native_certs.errors.is_empty() {
        tracing::warn!(
            "Some native certificates failed to load: {:?}",
            native_certs.errors
        );
    }

    rustls::ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth()
}

/// Builds one [`HttpTransport`] per endpoint over two shared connection pools.
///
/// HTTP endpoints use a client speaking HTTP/1.1 with h2 negotiated over ALPN; gRPC
/// endpoints use an HTTP/2-only client (prior knowledge on plaintext backends).
#[derive(Clone)]
pub struct HttpTransportFactory {
    http: HyperClient,
    grpc: HyperClient,
}

impl HttpTransportFactory {
    pub fn new() -> Result<Self> {
        let tls = tls_config();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http_connector);

        let http =
            Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector.clone());
        let grpc = Client::builder(TokioExecutor::new())
            .http2_only(true)
            .build::<_, AxumBody>(https_connector);

        tracing::info!("Created upstream HTTP clients with HTTP/2 and HTTP/1.1 support");
        Ok(Self { http, grpc })
    }
}

impl TransportFactory for HttpTransportFactory {
    fn build(&self, endpoint: &EndpointConfig) -> TransportResult<SharedTransport> {
        let backends = endpoint
            .backends
            .iter()
            .map(|backend| -> TransportResult<_> {
                Ok((Backend::parse(&backend.target)?, backend.weight))
            })
            .collect::<TransportResult<Vec<_>>>()?;
        let backends = WeightedPool::new(backends, endpoint.load_balance);
        if backends.is_empty() {
            return Err(TransportError::InvalidConfig(format!(
                "endpoint {} {} has no usable backends",
                endpoint.method, endpoint.path
            )));
        }

        let (client, version) = match endpoint.protocol {
            Protocol::Http => (self.http.clone(), Version::HTTP_11),
            Protocol::Grpc => (self.grpc.clone(), Version::HTTP_2),
        };
        Ok(Arc::new(HttpTransport {
            client,
            version,
            backends,
        }))
    }
}

/// An upstream address plus an optional path prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    scheme: Scheme,
    authority: Authority,
    prefix: String,
}

impl Backend {
    /// Parse `http://host:port[/prefix]`; a bare `host:port` is taken as plain HTTP.
    pub fn parse(target: &str) -> TransportResult<Self> {
        let invalid = |reason: String| {
            TransportError::InvalidConfig(format!("invalid backend '{target}': {reason}"))
        };
        let with_scheme = if target.contains("://") {
            target.to_string()
        } else {
            format!("http://{target}")
        };
        let uri: Uri = with_scheme.parse().map_err(|e| invalid(format!("{e}")))?;
        let scheme = uri
            .scheme()
            .cloned()
            .ok_or_else(|| invalid("missing scheme".to_string()))?;
        if scheme != Scheme::HTTP && scheme != Scheme::HTTPS {
            return Err(invalid(format!("unsupported scheme {scheme}")));
        }
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| invalid("missing host".to_string()))?;
        Ok(Self {
            scheme,
            authority,
            prefix: uri.path().trim_end_matches('/').to_string(),
        })
    }

    /// Point `uri` at this backend, keeping its path and query after the prefix.
    pub fn rewrite(&self, uri: &Uri) -> TransportResult<Uri> {
        let path_and_query = uri
            .path_and_query()
            .map_or("/", PathAndQuery::as_str);
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(format!("{}{}", self.prefix, path_and_query))
            .build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }
}

/// Forwards requests to the endpoint's backends over a pooled hyper client.
pub struct HttpTransport {
    client: HyperClient,
    version: Version,
    backends: WeightedPool<Backend>,
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, req: Request<AxumBody>) -> TransportResult<Response<AxumBody>> {
        let backend = self
            .backends
            .pick()
            .ok_or_else(|| TransportError::NoBackend(req.uri().path().to_string()))?;

        let (mut parts, body) = req.into_parts();
        parts.uri = backend.rewrite(&parts.uri)?;
        parts.version = self.version;
        match HeaderValue::from_str(backend.authority().as_str()) {
            Ok(host) => {
                parts.headers.insert(header::HOST, host);
            }
            Err(e) => tracing::warn!("Invalid Host for backend {}: {}", backend.authority(), e),
        }

        let span = create_backend_span(
            backend.authority().as_str(),
            parts.method.as_str(),
            parts.uri.path(),
        );
        if let Some(options) = parts.extensions.get::<RequestOptions>() {
            tracing::debug!(
                parent: &span,
                "Sending attempt [{}/{}] to {}",
                options.attempt,
                options.attempts,
                parts.uri
            );
        }

        let method = parts.method.clone();
        let uri = parts.uri.clone();
        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                span.record("http.status_code", response.status().as_u16());
                let (mut parts, hyper_body) = response.into_parts();
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Err(e) => {
                span.record("http.status_code", 599u16);
                tracing::error!(
                    parent: &span,
                    "Error making request to backend ({} {}): {}",
                    method,
                    uri,
                    e
                );
                Err(classify(&e, &method, &uri))
            }
        }
    }
}

/// Map a client error to the transport taxonomy by walking its source chain.
fn classify(
    err: &hyper_util::client::legacy::Error,
    method: &hyper::Method,
    uri: &Uri,
) -> TransportError {
    let message = format!("Request to {method} {uri} failed: {err}");
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(hyper_err) = cause.downcast_ref::<hyper::Error>() {
            if hyper_err.is_canceled() {
                return TransportError::Canceled(message);
            }
            if hyper_err.is_timeout() {
                return TransportError::DeadlineExceeded(message);
            }
        }
        source = cause.source();
    }
    TransportError::Connection(message)
}
