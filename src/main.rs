use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use axum::{extract::Request, routing::get};
use clap::Parser;
use color_eyre::{Result, eyre::Context};
use metrics_exporter_prometheus::PrometheusHandle;
use portway::{
    adapters::{FileConfigProvider, HttpTransportFactory, MiddlewareRegistry},
    config::{ServerConfigValidator, loader::load_config, models::ServerConfig},
    core::Proxy,
    metrics::{self, GatewayMetrics},
    ports::config_provider::ConfigProvider,
    tracing_setup::{self, LogFormat},
};
use tower_http::trace::TraceLayer;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "gateway.yaml")]
    config: String,

    /// Log filter directive (e.g. `info`, `portway=debug`)
    #[clap(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit human-readable logs instead of JSON
    #[clap(long, global = true)]
    pretty: bool,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "gateway.yaml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "gateway.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config, &args.log_level, args.pretty).await,
        None => serve(&args.config, &args.log_level, args.pretty).await,
    }
}

async fn serve(config_path: &str, log_level: &str, pretty: bool) -> Result<()> {
    let log_format = if pretty {
        LogFormat::Pretty
    } else {
        LogFormat::Json { spans: true }
    };
    tracing_setup::init_tracing(log_level, log_format).context("Failed to initialize tracing")?;
    tracing_setup::install_panic_hook();

    let prometheus =
        metrics::install_prometheus_recorder().context("Failed to install metrics recorder")?;

    tracing::info!("Loading initial configuration from {config_path}");
    let config_provider: Arc<dyn ConfigProvider> = Arc::new(
        FileConfigProvider::new(config_path).context("Failed to create config provider")?,
    );
    let config: ServerConfig = config_provider
        .load_config()
        .await
        .with_context(|| format!("Failed to load initial config from {config_path}"))?;
    ServerConfigValidator::validate(&config).context("Invalid initial configuration")?;

    let proxy = Arc::new(Proxy::new(
        Arc::new(HttpTransportFactory::new().context("Failed to create upstream clients")?),
        Arc::new(MiddlewareRegistry::with_builtins()),
        Arc::new(GatewayMetrics::new()),
    ));
    proxy
        .update(&config.gateway)
        .context("Failed to build initial routing table")?;

    spawn_config_watcher(config_provider, proxy.clone());

    if let Some(debug_addr) = &config.debug_addr {
        spawn_debug_server(debug_addr, proxy.clone(), prometheus).await?;
    }

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;

    let gateway = proxy.clone();
    let app = axum::Router::new()
        .fallback(move |req: Request| {
            let gateway = gateway.clone();
            async move { gateway.serve(req).await }
        })
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!(
        "Portway gateway '{}' listening on {} with {} routes",
        config.gateway.name,
        addr,
        proxy.current().len()
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    tracing::info!("Portway shut down gracefully");
    Ok(())
}

/// Rebuild the routing table whenever the configuration source changes.
///
/// A configuration that fails to load, validate or build is logged and the current table
/// keeps serving.
fn spawn_config_watcher(config_provider: Arc<dyn ConfigProvider>, proxy: Arc<Proxy>) {
    let debounce_duration = Duration::from_secs(2);
    let mut notify_rx = config_provider.watch();

    tokio::spawn(async move {
        tracing::info!("Config watcher task started.");
        let mut last_reload_attempt_time = tokio::time::Instant::now();
        last_reload_attempt_time = last_reload_attempt_time
            .checked_sub(debounce_duration)
            .unwrap_or(last_reload_attempt_time);

        while notify_rx.recv().await.is_some() {
            if last_reload_attempt_time.elapsed() < debounce_duration {
                tracing::info!("Debouncing config reload event. Still within cooldown period.");
                while notify_rx.try_recv().is_ok() {}
                continue;
            }
            last_reload_attempt_time = tokio::time::Instant::now();

            tracing::info!(
                "Attempting to reload configuration from {}",
                config_provider.source()
            );

            let reloaded = config_provider
                .load_config()
                .await
                .and_then(|config| {
                    ServerConfigValidator::validate(&config)?;
                    Ok(config)
                })
                .and_then(|config| {
                    proxy.update(&config.gateway)?;
                    Ok(config)
                });
            match reloaded {
                Ok(config) => tracing::info!(
                    "Configuration '{}' reloaded; routing table replaced.",
                    config.gateway.name
                ),
                Err(e) => tracing::error!(
                    "Failed to reload configuration: {:#}. Keeping old configuration.",
                    e
                ),
            }
            while notify_rx.try_recv().is_ok() {}
        }
        tracing::info!("Config watcher task is shutting down.");
    });
}

async fn spawn_debug_server(
    debug_addr: &str,
    proxy: Arc<Proxy>,
    prometheus: PrometheusHandle,
) -> Result<()> {
    let addr: SocketAddr = debug_addr
        .parse()
        .context("Failed to parse debug address")?;
    let app = proxy
        .debug_router()
        .route(
            "/metrics",
            get(move || {
                let prometheus = prometheus.clone();
                async move { prometheus.render() }
            }),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind debug address")?;
    tracing::info!("Debug endpoints listening on {}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Debug server error: {}", e);
        }
    });
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown..."),
        _ = terminate => tracing::info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}

async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!(
                "   • Debug Address: {}",
                config.debug_addr.as_deref().unwrap_or("disabled")
            );
            println!("   • Endpoints: {}", config.gateway.endpoints.len());
            println!(
                "   • Gateway Middlewares: {}",
                config.gateway.middlewares.len()
            );
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure every endpoint path starts with '/'");
            println!("   • Ensure backend targets use http:// or https://");
            println!("   • Use humantime durations for timeouts (e.g. '500ms', '2s')");
            println!("   • Verify listen address format (e.g., '127.0.0.1:3000')");
            std::process::exit(1);
        }
    }
}
