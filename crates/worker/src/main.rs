//! Wechat Relay worker entrypoint.
//!
//! Consumes the dispatch queue and runs the periodic sweep and purge.

use std::sync::Arc;

use tokio::sync::watch;

use tracing_subscriber::EnvFilter;

use relay_common::config::AppConfig;
use relay_common::db::{connect_postgres, connect_redis};
use relay_dispatcher::lock::RedisDispatchLock;
use relay_dispatcher::queue::RedisTaskQueue;
use relay_dispatcher::store::PgStore;
use relay_dispatcher::templates::validate_template_table;
use relay_dispatcher::{DispatchPorts, Housekeeper, NotificationDispatcher};
use relay_wechat::WechatClient;
use relay_worker::consumer::QueueConsumer;
use relay_worker::maintenance::Maintenance;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("relay_worker=info,relay_dispatcher=info,relay_wechat=info")
        }))
        .json()
        .init();

    tracing::info!("Wechat Relay worker starting...");

    // Load configuration
    let config = AppConfig::from_env()?;
    validate_template_table()?;

    let pool = connect_postgres(&config.database_url, config.db_max_connections).await?;
    let redis = connect_redis(&config.redis_url).await?;

    let store = Arc::new(PgStore::new(pool));
    let queue = Arc::new(RedisTaskQueue::new(redis.clone()));
    let messenger = Arc::new(WechatClient::new(&config.wechat_api_base)?);

    let dispatcher = Arc::new(NotificationDispatcher::new(
        DispatchPorts {
            jobs: store.clone(),
            apps: store.clone(),
            documents: store.clone(),
            bindings: store.clone(),
            messenger,
            lock: Arc::new(RedisDispatchLock::new(redis)),
        },
        config.dispatch,
        config.system_language.clone(),
    ));
    tracing::info!(
        finish_policy = ?config.dispatch.finish_policy,
        guard = ?config.dispatch.guard,
        "Dispatcher configured"
    );

    let housekeeper = Arc::new(Housekeeper::new(
        store,
        queue.clone(),
        config.sweep_window_hours,
        config.retention_days,
    ));

    match queue.depth().await {
        Ok(depth) => tracing::info!(depth, "Dispatch queue connected"),
        Err(e) => tracing::warn!(error = %e, "Could not read dispatch queue depth"),
    }

    let consumer = QueueConsumer::new(
        queue,
        dispatcher,
        config.worker_concurrency,
        config.queue_block_secs,
    );
    let maintenance = Maintenance::new(
        housekeeper,
        config.sweep_interval_secs,
        config.purge_interval_secs,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut consumer_task = tokio::spawn(async move { consumer.run(shutdown_rx).await });

    // Run with graceful shutdown on Ctrl+C
    tokio::select! {
        result = &mut consumer_task => {
            let result = result.map_err(anyhow::Error::from).and_then(|r| r);
            if let Err(e) = &result {
                tracing::error!(error = %e, "Queue consumer exited with error");
            }
            return result;
        }
        result = maintenance.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Maintenance exited with error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    // In-flight dispatches persist their jobs before the consumer returns
    let _ = shutdown_tx.send(true);
    consumer_task.await??;

    tracing::info!("Wechat Relay worker stopped.");
    Ok(())
}
