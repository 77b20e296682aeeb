//! Process entry point: load config, open the database, wire every
//! component, serve HTTP with graceful shutdown. Follows the teacher's own
//! `runtime.rs` bootstrap shape (tracing init, `tokio::sync::watch<bool>`
//! shutdown signal, `axum::serve(...).with_graceful_shutdown(...)`), stripped
//! of the P2P/relay/tunnel machinery this service does not have.

use actorhub::accounts::AccountRegistry;
use actorhub::activities::ActivityEngine;
use actorhub::addressing::AddressingResolver;
use actorhub::auth::AuthFilter;
use actorhub::collections::CollectionEngine;
use actorhub::config::Config;
use actorhub::db::Db;
use actorhub::delivery::{DeliveryQueue, QueueSettings};
use actorhub::http_sig::KeyResolver;
use actorhub::net_metrics::NetMetrics;
use actorhub::routes::{self, AppState};
use actorhub::store::ObjectStore;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse().unwrap()),
        )
        .try_init()
        .ok();

    let cfg = Config::from_env()?;
    let base_url = cfg.base_url();
    info!("data dir: {}", cfg.data_dir.display());

    let db = Db::open(cfg.db_path())?;
    let net = Arc::new(NetMetrics::new());

    let objects = ObjectStore::new(db.clone());
    let collections = CollectionEngine::new(db.clone(), base_url.clone(), cfg.page_size);
    let accounts = AccountRegistry::new(db.clone(), base_url.clone());
    let addressing = AddressingResolver::new(collections.clone(), base_url.clone());
    let auth = AuthFilter::new(objects.clone(), collections.clone(), accounts.clone());
    let delivery = DeliveryQueue::new(db.clone(), net.clone());
    let activities = ActivityEngine::new(
        objects.clone(),
        collections.clone(),
        accounts.clone(),
        addressing.clone(),
        auth.clone(),
        delivery.clone(),
        base_url.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let queue_settings = QueueSettings {
        max_attempts: cfg.delivery_max_attempts,
        ..QueueSettings::default()
    };
    delivery.start_workers(cfg.delivery_workers, accounts.clone(), queue_settings, shutdown_rx.clone());

    let state = AppState {
        objects,
        collections,
        accounts,
        auth,
        activities,
        key_resolver: KeyResolver::new(),
        base_url: base_url.clone(),
        max_date_skew: Duration::from_secs(300),
        metrics: net.clone(),
    };

    let max_body_bytes = 10 * 1024 * 1024;
    let router = routes::router(state, max_body_bytes);

    let addr: std::net::SocketAddr = cfg.bind_addr().parse().context("parse bind addr")?;
    let listener = tokio::net::TcpListener::bind(addr).await.context("bind listener")?;
    info!("actorhub listening on http://{addr}, base url {base_url}");

    let mut shutdown_rx_for_serve = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx_for_serve.changed().await;
        };
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
    let _ = shutdown_tx.send(true);
    let _ = server.await;
    Ok(())
}
