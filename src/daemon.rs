//! Orchestrates the four long-running services as cancellable tasks sharing one
//! Telegram connection, database pool, broker, and object store: discovery (folder
//! sync + gap detection), backfill, the live listener, and the processor pool.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broker::Broker;
use crate::config::Config;
use crate::object_store::ObjectStore;
use crate::processor::Processor;
use crate::{backfill, db, discovery, listener, store, telegram};

pub async fn run(config: Config) -> Result<()> {
    let pool = db::create_pool(&config).await.context("creating database pool")?;
    info!("database ready");

    let conn = telegram::connect(&config, &pool).await.context("connecting to Telegram")?;
    match conn.client.is_authorized().await {
        Ok(true) => {}
        Ok(false) => anyhow::bail!("Telegram not authorized. Run 'tg-archiver tg login' first."),
        Err(e) => anyhow::bail!("Telegram auth check failed: {e}"),
    }

    let broker = Arc::new(Broker::connect(&config.broker).await.context("connecting to broker")?);
    let object_store = Arc::new(ObjectStore::connect(&config.object_store).await.context("connecting to object store")?);
    let config = Arc::new(config);
    let cancel = CancellationToken::new();

    discover_and_prime(&conn.client, &pool, &config).await?;

    let discovery_handle = tokio::spawn(discovery::run_loop(conn.client.clone(), pool.clone(), config.clone(), cancel.clone()));

    let backfill_handle = tokio::spawn(backfill::run_loop(
        conn.client.clone(),
        pool.clone(),
        broker.clone(),
        config.clone(),
        cancel.clone(),
    ));

    let listener_handle = tokio::spawn(listener::listener_loop(
        conn.client.clone(),
        pool.clone(),
        broker.clone(),
        config.clone(),
        conn.updates_rx,
        cancel.clone(),
    ));

    let processor = Arc::new(Processor::new(broker.clone(), pool.clone(), object_store.clone(), config.clone()));
    let processor_cancel = cancel.clone();
    let processor_handle = tokio::spawn(async move { processor.run(processor_cancel).await });

    wait_for_shutdown().await;
    info!("shutdown signal received");
    cancel.cancel();

    let shutdown_grace = humantime::parse_duration(&config.archiver.shutdown_grace).unwrap_or(std::time::Duration::from_secs(30));
    let _ = tokio::time::timeout(shutdown_grace, async {
        let _ = discovery_handle.await;
        let _ = backfill_handle.await;
        let _ = listener_handle.await;
        let _ = processor_handle.await;
    })
    .await;

    conn.client.disconnect();
    conn.runner_handle.abort();
    pool.close().await;
    info!("shutdown complete");

    Ok(())
}

/// Run discovery once up front so the daemon starts with a populated channel table
/// and a warm peer cache instead of waiting out the first sync interval.
async fn discover_and_prime(client: &grammers_client::Client, pool: &sqlx::PgPool, config: &Config) -> Result<()> {
    match discovery::discover_once(client, pool, config).await? {
        Some(folder) => info!(folder, "initial discovery complete"),
        None => info!("initial discovery found no matching folder"),
    }

    let channels = store::get_active_channels(pool).await.context("loading active channels")?;
    telegram::ensure_peer_cache(client, pool, &channels)
        .await
        .context("warming peer cache")?;

    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
