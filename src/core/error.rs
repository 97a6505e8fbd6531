//! Error taxonomy of the forwarding core.
//!
//! Two families live here:
//! * configuration-time errors ([`ConfigError`], [`RouteError`], [`BuildError`]) which abort a
//!   routing-table update and leave the previously published table in force;
//! * per-request errors ([`ProxyError`]) which are classified into a client-visible status
//!   code and written out by [`error_response`].
//!
//! Classification is coarse: cancellation is `499`, running out of time is `504`
//! and everything else is `502`. For gRPC endpoints the code is carried in `grpc-status`
//! and the HTTP status line is always `200`.
use axum::body::Body as AxumBody;
use hyper::{
    Response, StatusCode,
    header::{self, HeaderValue},
};
use thiserror::Error;

use crate::{
    config::models::Protocol,
    ports::{middleware::MiddlewareError, transport::TransportError},
};

/// Non-standard status used when the caller went away before we answered.
pub const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

/// Invalid values in an endpoint's retry / timeout settings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Invalid retry attempts {0}: must not be negative")]
    InvalidAttempts(i64),

    #[error("Invalid duration '{value}' for {field}: {reason}")]
    InvalidDuration {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid status code condition '{0}'")]
    InvalidStatusCode(String),

    #[error("Invalid header condition '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },
}

/// Route registration failures reported by the matcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RouteError {
    #[error("Invalid method '{method}' for route {path}")]
    InvalidMethod { method: String, path: String },

    #[error("Invalid route {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Route conflict: {method} {path} is already registered")]
    Conflict { method: String, path: String },
}

/// Anything that can abort building an endpoint or a routing table.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BuildError {
    #[error("Failed to build transport for {method} {path}: {source}")]
    Transport {
        method: String,
        path: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to build middleware chain for {path}: {source}")]
    Middleware {
        path: String,
        #[source]
        source: MiddlewareError,
    },

    #[error("Invalid retry policy for {path}: {source}")]
    Retry {
        path: String,
        #[source]
        source: ConfigError,
    },

    #[error(transparent)]
    Route(#[from] RouteError),
}

/// Terminal failure of one inbound request.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("failed to read request body: {0}")]
    Body(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("retry conditions still matched after {attempts} attempts (last status {status})")]
    RetriesExhausted { attempts: u32, status: u16 },
}

impl ProxyError {
    /// Client-visible HTTP status for this failure, before any gRPC translation.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::Canceled => STATUS_CLIENT_CLOSED_REQUEST,
            ProxyError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT.as_u16(),
            ProxyError::Transport(err) if err.is_canceled() => STATUS_CLIENT_CLOSED_REQUEST,
            ProxyError::Transport(err) if err.is_deadline_exceeded() => {
                StatusCode::GATEWAY_TIMEOUT.as_u16()
            }
            _ => StatusCode::BAD_GATEWAY.as_u16(),
        }
    }
}

/// Map an HTTP status to the gRPC code a gRPC client expects for it.
pub fn grpc_code_from_http(status: u16) -> tonic::Code {
    match status {
        200 => tonic::Code::Ok,
        400 => tonic::Code::InvalidArgument,
        401 => tonic::Code::Unauthenticated,
        403 => tonic::Code::PermissionDenied,
        404 => tonic::Code::NotFound,
        409 => tonic::Code::Aborted,
        429 => tonic::Code::ResourceExhausted,
        STATUS_CLIENT_CLOSED_REQUEST => tonic::Code::Cancelled,
        500 => tonic::Code::Internal,
        501 => tonic::Code::Unimplemented,
        503 => tonic::Code::Unavailable,
        504 => tonic::Code::DeadlineExceeded,
        _ => tonic::Code::Unknown,
    }
}

/// Build the response written to the caller for a classified failure.
///
/// Returns the response together with the pre-translation status code, which is the value
/// metrics are labelled with.
pub fn error_response(err: &ProxyError, protocol: Protocol) -> (Response<AxumBody>, u16) {
    let code = err.status_code();
    let mut response = Response::new(AxumBody::empty());

    match protocol {
        Protocol::Grpc => {
            let grpc_code = grpc_code_from_http(code) as i32;
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/grpc"),
            );
            headers.insert("grpc-status", HeaderValue::from(grpc_code));
            let message = HeaderValue::from_str(&err.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("upstream failure"));
            headers.insert("grpc-message", message);
            *response.status_mut() = StatusCode::OK;
        }
        Protocol::Http => {
            *response.status_mut() =
                StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY);
        }
    }

    (response, code)
}
