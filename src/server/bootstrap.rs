//! Startup sequence: config → counter store connection → servers →
//! graceful shutdown.

use crate::config::Config;
use crate::server::{self, AppState};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Gateway lifecycle: init → connect → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let mut config = Config::load(&args.config_path)?;
    if !args.listen.is_empty() {
        if let Some((host, port)) = args.listen.rsplit_once(':') {
            if let Ok(p) = port.parse() {
                config.server.host = host.to_string();
                config.server.port = p;
            }
        }
    }
    if !args.admin_listen.is_empty() {
        config.admin.listen = args.admin_listen.clone();
    }
    let config = Arc::new(config);

    // A connection failure here is StoreFatal — refuse to start rather
    // than admit requests against a store we can't reach.
    let state = AppState::new(config.clone()).await?;

    let shutdown = Arc::new(Notify::new());

    let admin_handle = tokio::spawn({
        let listen = config.admin.listen.clone();
        let state = state.clone();
        async move {
            if let Err(e) = server::run_admin_server(&listen, state).await {
                tracing::error!("server: admin failed, error={}", e);
            }
        }
    });

    tracing::info!("server: starting gateway, listen={}", config.server.listen_addr());

    let public_handle = tokio::spawn({
        let listen = config.server.listen_addr();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_public_server(&listen, state, shutdown).await }
    });

    wait_for_shutdown(&shutdown).await;

    if let Err(e) = public_handle.await {
        tracing::error!("server: public task error: {}", e);
    }
    admin_handle.abort();

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
