//! smfd: SMF session store daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use smf_core::config::{CacheConfig, DatabaseConfig};
use smf_core::SmfStoreConfig;
use smf_services::{DocumentStore, KeyValueCache, MemoryDocumentStore, SessionRepository, Supervisor};

mod status;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    let config = SmfStoreConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SmfStoreConfig::default()
    });
    tracing::info!(
        database = %config.database.masked_url(),
        database_name = %config.database.name,
        scaling = config.scaling.enabled,
        "smfd starting"
    );

    // Backends
    let db = if config.database.is_embedded() {
        tracing::warn!("no database url configured, using the embedded in-process store");
        Arc::new(MemoryDocumentStore::new()) as Arc<dyn DocumentStore>
    } else {
        connect_database(&config.database).await?
    };
    let cache = if config.scaling.enabled {
        Some(connect_cache(&config.cache).await?)
    } else {
        None
    };

    // Repository
    let mut supervisor = Supervisor::new();
    let repository = Arc::new(
        SessionRepository::open(&config, db, cache, &mut supervisor)
            .await
            .context("failed to open session repository")?,
    );

    // ── Shutdown signal ──────────────────────────────────────────────────────
    {
        let shutdown = supervisor.shutdown_sender();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    {
        let repository = repository.clone();
        let mut shutdown = supervisor.subscribe();
        supervisor.spawn("pool-printer", async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        repository.pool().log_contents();
                        if let Some(stats) = repository.pipeline_stats() {
                            tracing::info!(
                                context = stats.context_queued,
                                index = stats.index_queued,
                                delete = stats.delete_queued,
                                in_flight = stats.in_flight,
                                "write-behind queues"
                            );
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    if config.status.port != 0 {
        let state = status::StatusState {
            repository: repository.clone(),
        };
        let port = config.status.port;
        let shutdown = supervisor.subscribe();
        supervisor.spawn("status-server", async move {
            if let Err(e) = status::serve(state, port, shutdown).await {
                tracing::error!(error = %e, "status server failed");
            }
        });
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = supervisor.subscribe();
    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        exit = supervisor.next_exit() => tracing::error!(?exit, "supervised task exited, shutting down"),
    }

    let exits = supervisor.shutdown().await;
    tracing::info!(
        tasks = exits.len(),
        contexts = repository.pool().len(),
        "all tasks stopped"
    );
    Ok(())
}

#[cfg(feature = "mongodb")]
async fn connect_database(config: &DatabaseConfig) -> Result<Arc<dyn DocumentStore>> {
    let store = smf_services::MongoDocumentStore::connect(&config.url, &config.name)
        .await
        .with_context(|| format!("failed to connect to {}", config.masked_url()))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "mongodb"))]
async fn connect_database(config: &DatabaseConfig) -> Result<Arc<dyn DocumentStore>> {
    anyhow::bail!(
        "database url {} is set but smfd was built without the `mongodb` feature",
        config.masked_url()
    )
}

#[cfg(feature = "redis")]
async fn connect_cache(config: &CacheConfig) -> Result<Arc<dyn KeyValueCache>> {
    let cache = smf_services::RedisCache::connect(&config.url)
        .await
        .context("failed to connect to cache")?;
    Ok(Arc::new(cache))
}

#[cfg(not(feature = "redis"))]
async fn connect_cache(config: &CacheConfig) -> Result<Arc<dyn KeyValueCache>> {
    tracing::warn!(
        url = %smf_core::config::mask_credentials(&config.url),
        "built without the `redis` feature, session state is cached in this process only"
    );
    Ok(Arc::new(smf_services::MemoryCache::new()))
}
