//! Retry strategy derived from an endpoint's configuration.
//!
//! The strategy is a pure policy object: how many attempts, how long the whole request may
//! take, how long a single attempt may take, and which responses mean "try again".
use std::time::Duration;

use hyper::{
    Response,
    header::{HeaderName, HeaderValue},
};
use tokio::time::Instant;

use crate::{
    config::models::{EndpointConfig, RetryConditionConfig},
    core::error::ConfigError,
};

/// Overall timeout used when an endpoint does not configure one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_ATTEMPTS: u32 = 1;

/// A predicate over a backend response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryCondition {
    /// Inclusive status code range.
    StatusCode { min: u16, max: u16 },
    /// Response header equals a value.
    Header { name: HeaderName, value: HeaderValue },
}

impl RetryCondition {
    pub fn parse(config: &RetryConditionConfig) -> Result<Self, ConfigError> {
        match config {
            RetryConditionConfig::ByStatusCode(codes) => parse_status_range(codes),
            RetryConditionConfig::ByHeader { name, value } => {
                let header_name =
                    HeaderName::from_bytes(name.as_bytes()).map_err(|e| ConfigError::InvalidHeader {
                        name: name.clone(),
                        reason: e.to_string(),
                    })?;
                let header_value =
                    HeaderValue::from_str(value).map_err(|e| ConfigError::InvalidHeader {
                        name: name.clone(),
                        reason: e.to_string(),
                    })?;
                Ok(RetryCondition::Header {
                    name: header_name,
                    value: header_value,
                })
            }
        }
    }

    /// Whether this response asks for another attempt.
    pub fn matches<B>(&self, response: &Response<B>) -> bool {
        match self {
            RetryCondition::StatusCode { min, max } => {
                let status = response.status().as_u16();
                (*min..=*max).contains(&status)
            }
            RetryCondition::Header { name, value } => response
                .headers()
                .get_all(name)
                .iter()
                .any(|candidate| candidate == value),
        }
    }
}

fn parse_status_code(raw: &str, codes: &str) -> Result<u16, ConfigError> {
    raw.trim()
        .parse::<u16>()
        .ok()
        .filter(|code| (100..=999).contains(code))
        .ok_or_else(|| ConfigError::InvalidStatusCode(codes.to_string()))
}

/// Parse `"503"` or `"500-504"`.
fn parse_status_range(codes: &str) -> Result<RetryCondition, ConfigError> {
    let (min, max) = match codes.split_once('-') {
        Some((lo, hi)) => (parse_status_code(lo, codes)?, parse_status_code(hi, codes)?),
        None => {
            let code = parse_status_code(codes, codes)?;
            (code, code)
        }
    };
    if min > max {
        return Err(ConfigError::InvalidStatusCode(codes.to_string()));
    }
    Ok(RetryCondition::StatusCode { min, max })
}

fn parse_duration(field: &'static str, raw: Option<&str>) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let duration = humantime::parse_duration(raw).map_err(|e| ConfigError::InvalidDuration {
        field,
        value: raw.to_string(),
        reason: e.to_string(),
    })?;
    Ok(Some(duration).filter(|d| !d.is_zero()))
}

/// Attempt budget and deadlines for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryStrategy {
    attempts: u32,
    timeout: Duration,
    per_try_timeout: Duration,
    conditions: Vec<RetryCondition>,
}

impl RetryStrategy {
    /// Derive and validate the strategy of an endpoint.
    ///
    /// Unset or zero values fall back to defaults: one attempt, a one second overall
    /// timeout, and a per-attempt timeout equal to the overall one.
    pub fn from_endpoint(endpoint: &EndpointConfig) -> Result<Self, ConfigError> {
        let timeout = parse_duration("timeout", endpoint.timeout.as_deref())?
            .unwrap_or(DEFAULT_TIMEOUT);

        let Some(retry) = endpoint.retry.as_ref() else {
            return Ok(Self {
                attempts: DEFAULT_ATTEMPTS,
                timeout,
                per_try_timeout: timeout,
                conditions: Vec::new(),
            });
        };

        let attempts = match retry.attempts {
            Some(n) if n < 0 => return Err(ConfigError::InvalidAttempts(n)),
            Some(0) | None => DEFAULT_ATTEMPTS,
            Some(n) => u32::try_from(n).map_err(|_| ConfigError::InvalidAttempts(n))?,
        };
        let per_try_timeout = parse_duration("per_try_timeout", retry.per_try_timeout.as_deref())?
            .unwrap_or(timeout);
        let conditions = retry
            .conditions
            .iter()
            .map(RetryCondition::parse)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            attempts,
            timeout,
            per_try_timeout,
            conditions,
        })
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn per_try_timeout(&self) -> Duration {
        self.per_try_timeout
    }

    pub fn conditions(&self) -> &[RetryCondition] {
        &self.conditions
    }

    /// True when any configured condition matches the response.
    pub fn retry_required<B>(&self, response: &Response<B>) -> bool {
        self.conditions.iter().any(|c| c.matches(response))
    }

    /// Deadline of an attempt starting at `now`, never later than the overall deadline.
    pub fn attempt_deadline(&self, overall: Instant, now: Instant) -> Instant {
        overall.min(now + self.per_try_timeout)
    }
}
