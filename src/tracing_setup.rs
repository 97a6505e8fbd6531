use std::backtrace::Backtrace;

use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Output format of the log sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, optionally with the active span list.
    Json { spans: bool },
    /// Multi-line, colored output for local runs.
    Pretty,
}

/// Build the level filter. `RUST_LOG` wins over `level` when it is set and parses.
fn level_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))
}

/// Install the global subscriber.
///
/// Fails if the level directive does not parse or a global subscriber is already set.
pub fn init_tracing(level: &str, format: LogFormat) -> Result<()> {
    let filter = level_filter(level)?;
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let registry = Registry::default().with(filter);
    let installed = match format {
        LogFormat::Json { spans } => registry
            .with(
                fmt_layer
                    .json()
                    .with_current_span(spans)
                    .with_span_list(spans),
            )
            .try_init(),
        LogFormat::Pretty => registry.with(fmt_layer.pretty().with_ansi(true)).try_init(),
    };
    installed.wrap_err("Failed to install tracing subscriber")?;

    tracing::info!("Portway logging initialized: level={}, format={:?}", level, format);
    Ok(())
}

/// Log panics through `tracing` together with a captured backtrace.
///
/// The dispatcher recovers from panics raised while serving a request; this hook is where
/// the stack trace of such a panic ends up.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        let message = info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| info.payload().downcast_ref::<String>().map(String::as_str))
            .unwrap_or("unknown panic");
        tracing::error!(
            panic.location = %location,
            "panic: {}\n{}",
            message,
            Backtrace::force_capture()
        );
    }));
}

/// Span covering one attempt against one backend. `http.status_code` is recorded once the
/// backend answers (599 when it never does).
pub fn create_backend_span(backend: &str, method: &str, path: &str) -> tracing::Span {
    tracing::info_span!(
        "backend_request",
        backend.authority = backend,
        http.method = method,
        http.path = path,
        http.status_code = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_json() {
        let result = init_tracing("debug", LogFormat::Json { spans: true });
        assert!(result.is_ok());
    }
}
