use crate::auth::NoAuthenticationProvider;
use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::server;
use crate::upstream::HttpDownstreamClient;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Gateway lifecycle: load → wire → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config = GatewayConfig::load(&args.config_path)?;
    let client = Arc::new(HttpDownstreamClient::new(&config.global.downstream));
    // Token validation lives outside the gateway; routes that require
    // authentication are refused until a provider is wired in here.
    let authenticator = Arc::new(NoAuthenticationProvider);
    let state = server::GatewayState::new(config, authenticator, client)?
        .with_metrics(Metrics::install()?);

    let shutdown = Arc::new(Notify::new());
    let gc = [state.rate_limiter.start_gc(), state.cache.start_gc()];
    start_reload_watcher(&state, args.config_path.clone(), &shutdown);
    start_admin_server(&state, &args);

    tracing::info!(
        "server: starting gateway, listen={}, routes={}",
        args.listen,
        state.route_count()
    );

    let proxy_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    wait_for_shutdown(&shutdown).await;

    match proxy_handle.await {
        Ok(Err(e)) => tracing::error!("server: proxy failed, error={}", e),
        Err(e) => tracing::error!("server: proxy task error: {}", e),
        Ok(Ok(())) => {}
    }
    for handle in gc {
        handle.abort();
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

/// JSON logs to stdout through a non-blocking writer. `RUST_LOG` overrides
/// the default `info` filter.
pub fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
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

    // The writer flushes on guard drop; keep it for the process lifetime.
    std::mem::forget(guard);
}

/// Reload the route table from `path` on SIGHUP. A config that fails to
/// load or compile is logged and the running table stays in place.
#[cfg(unix)]
fn start_reload_watcher(state: &server::GatewayState, path: PathBuf, shutdown: &Arc<Notify>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("config: reload on SIGHUP unavailable, error={}", e);
            return;
        }
    };
    let state = state.clone();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = hangup.recv() => {
                    if received.is_none() {
                        return;
                    }
                }
                _ = shutdown.notified() => return,
            }

            tracing::info!("config: SIGHUP received, reloading from {}", path.display());
            let result = match GatewayConfig::load(&path) {
                Ok(config) => state.reload(config).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::error!("config: reload failed, keeping current routes, error={:#}", e);
            }
        }
    });
}

#[cfg(not(unix))]
fn start_reload_watcher(_state: &server::GatewayState, _path: PathBuf, _shutdown: &Arc<Notify>) {
    tracing::info!("config: reload on SIGHUP unavailable on this platform");
}

fn start_admin_server(state: &server::GatewayState, args: &BootstrapArgs) {
    let s = state.clone();
    let admin_addr = args.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, s).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!("server: SIGTERM handler unavailable, error={}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    // Stop the accept loop and background watchers.
    shutdown.notify_waiters();
}
