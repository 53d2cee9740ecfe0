use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use runcash_core::config::RelayConfig;
use runcash_poller::PollerEngine;
use runcash_relay::app::{self, AppState};
use runcash_relay::ws::broadcast::Broadcaster;
use runcash_store::{SharedStore, SqliteConnector, StoreLink};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "runcash-relay", version, about = "Relays roulette outcomes to live viewers")]
struct Args {
    /// Config file (defaults to $RUNCASH_CONFIG, then ~/.runcash/runcash.toml).
    #[arg(long, short)]
    config: Option<String>,

    /// Create the store file and schema if missing instead of opening read-only.
    #[arg(long)]
    init_store: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "runcash_relay=info,runcash_poller=info,runcash_store=info,tower_http=debug".into()
            }),
        )
        .init();

    let args = Args::parse();

    let config = RelayConfig::load(args.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        RelayConfig::default()
    });

    let mut connector = SqliteConnector::new(&config.store.path);
    if args.init_store {
        connector = connector.with_schema_init();
    }
    info!(path = %config.store.path, init = args.init_store, "store configured");
    let link = Arc::new(
        StoreLink::new(connector).with_stamp_capacity(config.store.dedup_capacity),
    );
    if !link.check() {
        tracing::warn!("store unreachable at startup, poller will keep retrying");
    }

    let broadcaster = Arc::new(
        Broadcaster::new(config.server.recent_window, config.server.history_limit)
            .with_store(Arc::clone(&link) as Arc<dyn SharedStore>),
    );

    let poller = PollerEngine::new(Arc::clone(&link), broadcaster.clone(), &config.store);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let poller_task = tokio::spawn(async move { poller.run(shutdown_rx).await });

    let addr: SocketAddr = config.bind_addr().parse()?;
    let state = Arc::new(AppState::new(config, broadcaster, link));
    let router = app::build_router(state);

    info!("RunCash relay listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // stop the poller and wait for its loop to exit
    let _ = shutdown_tx.send(true);
    let _ = poller_task.await;
    Ok(())
}
