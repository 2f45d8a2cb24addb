use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use std::fmt::Display;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;

use aether_internal::config_parser::Config;
use aether_internal::endpoints;
use aether_internal::endpoints::status::AETHER_VERSION;
use aether_internal::gateway_util;
use aether_internal::observability::{self, LogFormat};
use aether_internal::tier::ResourceKind;
use aether_internal::usage::middleware::quota_middleware;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Use the `aether.toml` config file at the specified path. Incompatible with `--default-config`
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Use a default config file. Incompatible with `--config-file`
    #[arg(long)]
    default_config: bool,

    /// Sets the log format used for all gateway logs.
    #[arg(long)]
    #[arg(value_enum)]
    #[clap(default_value_t = LogFormat::default())]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    // Set up logs immediately, so that we can use `tracing`.
    observability::setup_observability(args.log_format).expect_pretty("Failed to set up logs");

    tracing::info!("Starting Aether Gateway {AETHER_VERSION}");

    if args.config_file.is_some() && args.default_config {
        tracing::error!("Cannot specify both `--config-file` and `--default-config`");
        std::process::exit(1);
    }

    let config = if let Some(path) = &args.config_file {
        Arc::new(Config::load_from_path(path).expect_pretty("Failed to load config"))
    } else {
        if !args.default_config {
            tracing::warn!(
                "No config file provided, starting with default settings. Use `--config-file path/to/aether.toml` to specify a config file."
            );
        }
        Arc::new(Config::default())
    };

    // Initialize AppState (selects Redis or in-memory stores)
    let app_state = gateway_util::AppStateData::new(config.clone())
        .await
        .expect_pretty("Failed to initialize AppState");

    // Insight routes: generation hits the premium model, so it is gated by
    // the premium-call quota before the cooldown tracker ever runs.
    // Note: In Axum, middleware layers run in REVERSE order of application
    let insight_routes = Router::new()
        .route(
            "/v1/insights/{category}",
            post(endpoints::insights::generate_insight_handler),
        )
        .layer(axum::middleware::from_fn_with_state(
            (
                app_state.usage_counter.clone(),
                ResourceKind::PremiumCall,
            ),
            quota_middleware,
        ));

    // Usage routes: the check-and-consume boundary for services producing
    // rate-limited actions (e.g. chat responses).
    let usage_routes = Router::new()
        .route("/v1/usage/{kind}", get(endpoints::usage::get_usage_handler))
        .route(
            "/v1/usage/{kind}/consume",
            post(endpoints::usage::consume_usage_handler),
        );

    // Routes that don't require authentication
    let public_routes = Router::new()
        .route("/status", get(endpoints::status::status_handler))
        .route("/health", get(endpoints::status::health_handler));

    let router = Router::new()
        .merge(insight_routes)
        .merge(usage_routes)
        .merge(public_routes)
        .fallback(endpoints::fallback::handle_404)
        // This is only used to output request/response information to our logs.
        // We log failed requests at 'DEBUG', since we already have our own error-logging code.
        .layer(TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::DEBUG)))
        .with_state(app_state);

    // Bind to the socket address specified in the config, or default to 0.0.0.0:3000
    let bind_address = config
        .gateway
        .bind_address
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

    let listener = match tokio::net::TcpListener::bind(bind_address).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            tracing::error!(
                "Failed to bind to socket address {bind_address}: {e}. Tip: Ensure no other process is using port {} or try a different port.",
                bind_address.port()
            );
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Failed to bind to socket address {bind_address}: {e}");
            std::process::exit(1);
        }
    };
    // This will give us the chosen port if the user specified a port of 0
    let actual_bind_address = listener
        .local_addr()
        .expect_pretty("Failed to get bind address from listener");

    let config_path_pretty = if let Some(path) = &args.config_file {
        format!("config file `{}`", path.to_string_lossy())
    } else {
        "no config file".to_string()
    };

    tracing::info!(
        "Aether Gateway is listening on {actual_bind_address} with {config_path_pretty}.",
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect_pretty("Failed to start server");
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect_pretty("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        }
    };
}

/// ┌──────────────────────────────────────────────────────────────────────────┐
/// │                           MAIN.RS ESCAPE HATCH                           │
/// └──────────────────────────────────────────────────────────────────────────┘
///
/// We don't allow panic, escape, unwrap, or similar methods in the codebase,
/// except for the private `expect_pretty` method, which is to be used only in
/// main.rs during initialization. After initialization, we expect all code to
/// handle errors gracefully.
///
/// We use `expect_pretty` for better DX when handling errors in main.rs.
/// `expect_pretty` will print an error message and exit with a status code of 1.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err}");
                std::process::exit(1);
            }
        }
    }
}

impl<T> ExpectPretty<T> for Option<T> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Some(value) => value,
            None => {
                tracing::error!("{msg}");
                std::process::exit(1);
            }
        }
    }
}
