use std::{collections::HashSet, net::SocketAddr};

use hyper::{Method, Uri};

use crate::{
    config::models::{EndpointConfig, MiddlewareConfig, ServerConfig},
    core::retry::RetryStrategy,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Static checks run before a configuration is handed to the proxy.
///
/// Everything the routing-table build would reject is reported here too, all at once,
/// so `portway validate` can list every problem in a file.
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }
        if let Some(debug_addr) = &config.debug_addr {
            if let Err(e) = Self::validate_listen_address(debug_addr) {
                errors.push(e);
            }
            if *debug_addr == config.listen_addr {
                errors.push(ValidationError::InvalidField {
                    field: "debug_addr".to_string(),
                    message: "must differ from listen_addr".to_string(),
                });
            }
        }

        if config.gateway.endpoints.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "endpoints".to_string(),
            });
        }

        Self::validate_middlewares("middlewares", &config.gateway.middlewares, &mut errors);
        for endpoint in &config.gateway.endpoints {
            if let Err(mut endpoint_errors) = Self::validate_endpoint(endpoint) {
                errors.append(&mut endpoint_errors);
            }
        }

        if let Err(conflicts) = Self::check_route_conflicts(&config.gateway.endpoints) {
            errors.extend(conflicts);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        address
            .parse::<SocketAddr>()
            .map(|_| ())
            .map_err(|e| ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: e.to_string(),
            })
    }

    fn validate_middlewares(
        context: &str,
        middlewares: &[MiddlewareConfig],
        errors: &mut Vec<ValidationError>,
    ) {
        for (i, middleware) in middlewares.iter().enumerate() {
            if middleware.name.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("{context}[{i}].name"),
                });
            }
        }
    }

    fn validate_endpoint(endpoint: &EndpointConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let path = &endpoint.path;

        if !path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("endpoints[{path}].path"),
                message: "must start with '/'".to_string(),
            });
        }

        let method = endpoint.method.trim();
        if !method.is_empty()
            && method != "*"
            && Method::from_bytes(method.to_ascii_uppercase().as_bytes()).is_err()
        {
            errors.push(ValidationError::InvalidField {
                field: format!("endpoints[{path}].method"),
                message: format!("'{method}' is not a valid HTTP method"),
            });
        }

        if endpoint.backends.is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("endpoints[{path}].backends"),
            });
        }
        for backend in &endpoint.backends {
            if let Err(e) = Self::validate_backend_target(&backend.target) {
                errors.push(ValidationError::InvalidField {
                    field: format!("endpoints[{path}].backends"),
                    message: e,
                });
            }
        }
        if !endpoint.backends.is_empty()
            && endpoint.backends.iter().all(|b| b.weight == Some(0))
        {
            errors.push(ValidationError::InvalidField {
                field: format!("endpoints[{path}].backends"),
                message: "at least one backend needs a non-zero weight".to_string(),
            });
        }

        Self::validate_middlewares(
            &format!("endpoints[{path}].middlewares"),
            &endpoint.middlewares,
            &mut errors,
        );

        if let Err(e) = RetryStrategy::from_endpoint(endpoint) {
            errors.push(ValidationError::InvalidField {
                field: format!("endpoints[{path}].retry"),
                message: e.to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_backend_target(target: &str) -> Result<(), String> {
        let with_scheme = if target.contains("://") {
            target.to_string()
        } else {
            format!("http://{target}")
        };
        let uri: Uri = with_scheme
            .parse()
            .map_err(|e| format!("invalid backend '{target}': {e}"))?;
        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            other => {
                return Err(format!(
                    "invalid backend '{target}': unsupported scheme {}",
                    other.unwrap_or_default()
                ));
            }
        }
        if uri.host().is_none_or(str::is_empty) {
            return Err(format!("invalid backend '{target}': missing host"));
        }
        Ok(())
    }

    /// Two endpoints with the same path template and method (or both matching any method)
    /// cannot be registered together.
    fn check_route_conflicts(endpoints: &[EndpointConfig]) -> Result<(), Vec<ValidationError>> {
        let mut seen = HashSet::new();
        let mut errors = Vec::new();
        for endpoint in endpoints {
            let method = match endpoint.method.trim() {
                "" | "*" => "*".to_string(),
                m => m.to_ascii_uppercase(),
            };
            if !seen.insert((endpoint.path.clone(), method.clone())) {
                errors.push(ValidationError::RouteConflict {
                    message: format!("{method} {} is defined more than once", endpoint.path),
                });
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
