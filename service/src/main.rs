//! Abacus service binary
//!
//! Startup: load `.env`, read configuration, connect the store (or the
//! in-memory mock under `TESTING=true`), start the engine and the stats
//! aggregator, serve HTTP.
//!
//! Shutdown, in order: flush stats and wait for the aggregator's echo,
//! release the store handle, then drain the HTTP server under a five-second
//! deadline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use abacus_service::{
    http, metrics::Metrics, AppState, Config, MemoryStore, RedisStore, Store, VERSION,
};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };
    init_tracing(config.debug);
    info!(version = VERSION, port = config.port, "abacus starting");

    let store: Arc<dyn Store> = if config.testing {
        info!("TESTING enabled, using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        match RedisStore::connect(&config.redis).await {
            Ok(store) => Arc::new(store),
            Err(err) => {
                error!(error = %err, "failed to connect to the store");
                std::process::exit(1);
            }
        }
    };

    if let Err(err) = Metrics::init() {
        warn!(error = %err, "metrics registration failed, continuing without");
    }

    let port = config.port;
    let state = AppState::new(config, Arc::clone(&store));

    let (stats_control, stats_control_rx) = mpsc::channel(1);
    tokio::spawn(state.stats.clone().run(Arc::clone(&store), stats_control_rx));

    let app = http::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, %addr, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(%addr, "listening");

    let (graceful_tx, graceful_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = graceful_rx.await;
        })
        .await
    });

    shutdown_signal().await;
    info!("shutdown signal received");

    // Stats first: hold the store open until the final flush is confirmed.
    let (echo_tx, echo_rx) = oneshot::channel();
    if stats_control.send(echo_tx).await.is_ok() {
        let _ = echo_rx.await;
    }
    info!("stats flush confirmed");

    drop(store);
    info!("store handle released");

    let _ = graceful_tx.send(());
    match tokio::time::timeout(SHUTDOWN_DEADLINE, server).await {
        Ok(Ok(Ok(()))) => info!("server exited cleanly"),
        Ok(Ok(Err(err))) => error!(error = %err, "server error during shutdown"),
        Ok(Err(err)) => error!(error = %err, "server task failed"),
        Err(_) => warn!(
            deadline = ?SHUTDOWN_DEADLINE,
            "shutdown deadline exceeded, exiting anyway"
        ),
    }
    info!("server exiting");
}

fn init_tracing(debug: bool) {
    let default_filter = if debug {
        "abacus_service=debug,info"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(error = %err, "SIGTERM handler unavailable, relying on ctrl-c");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
