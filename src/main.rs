//! CircleIn server.
//!
//! Usage:
//!   cargo run --bin seed_data     # demo community, admins, amenities, codes
//!   cargo run --bin circlein      # start the API on CIRCLEIN_BIND (0.0.0.0:11111)
//!
//! Sweeps are not scheduled in-process; point a cron at `/api/cron/*`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal::{self, ctrl_c};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tower_http::LatencyUnit;
use tracing::{info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use circlein::clock::SystemClock;
use circlein::config::AppConfig;
use circlein::notifications::{HttpMailer, LogMailer, Mailer};
use circlein::rest::{create_router, AppState};
use circlein::storage::Storage;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env().context("invalid configuration")?;
    let _log_guard = init_logger(&config)?;
    bootstrap(config).await
}

/// Console logs (JSON in production) plus an optional daily rolling file.
fn init_logger(config: &AppConfig) -> Result<Option<WorkerGuard>> {
    let log_level = if config.is_production() { "info" } else { "debug" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| log_level.into());

    let console = if config.is_production() {
        fmt::layer().json().with_target(false).boxed()
    } else {
        fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_target(false)
            .boxed()
    };

    let (file, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "circlein.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().json().with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .with(env_filter)
        .try_init()?;
    Ok(guard)
}

async fn bootstrap(config: AppConfig) -> Result<()> {
    let storage = Storage::open(&config.data_path)
        .with_context(|| format!("cannot open store at {}", config.data_path.display()))?;

    let mailer: Arc<dyn Mailer> = match &config.mail.relay_url {
        Some(url) => {
            info!(relay = %url, "mail relay configured");
            Arc::new(HttpMailer::new(url.clone(), config.mail.api_key.clone())?)
        }
        None => {
            info!("no MAIL_RELAY_URL, emails will only be logged");
            Arc::new(LogMailer)
        }
    };
    if config.cron_secret.is_none() {
        tracing::warn!("CRON_SECRET not set, /api/cron endpoints accept any caller");
    }

    let addr = config.bind_addr;
    let state = AppState::new(config, storage.clone(), Arc::new(SystemClock), mailer);

    let app = create_router(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(
                    DefaultOnResponse::new()
                        .level(Level::INFO)
                        .latency_unit(LatencyUnit::Millis),
                ),
        );

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!("🚀 CircleIn listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
        .inspect_err(|e| tracing::error!(error.cause_chain = ?e, error.message = %e, "unexpected error"))?;

    storage.flush().await.context("flushing store on shutdown")?;
    info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("received terminate signal, shutting down");
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
