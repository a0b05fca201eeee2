//! Startup wiring: window store, queue publisher and the flush loop.

use std::sync::Arc;

use anyhow::Context;
use tally_core::publisher::connect_optional;
use tally_core::{
    Aggregator, AggregatorHandle, AmqpPublisher, CountPublisher, MemoryStore, Notifier,
    RedisStore, WindowStore,
};

use crate::state::{AppState, Config, StoreKind};

/// Open the configured window store.
pub async fn connect_store(config: &Config) -> anyhow::Result<Arc<dyn WindowStore>> {
    match config.store {
        StoreKind::Redis => {
            let url = RedisStore::url(&config.redis_host, config.redis_port);
            let store = RedisStore::connect(&url)
                .await
                .with_context(|| format!("Failed to set up redis pool for {url}"))?;
            Ok(Arc::new(store))
        }
        StoreKind::Memory => {
            tracing::warn!("using in-memory window store, counts are local to this process");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// A running service: request state plus the background aggregator.
pub struct Service {
    /// State to hand to the router.
    pub state: AppState,
    aggregator: AggregatorHandle,
}

impl Service {
    /// Connect to the store and queue, then start the aggregator loop.
    ///
    /// A queue that cannot be reached is not fatal: counts go to the log for
    /// the lifetime of the process.
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let store = connect_store(&config).await?;

        let amqp_url = AmqpPublisher::url(&config.rabbit_host, config.rabbit_port);
        let publisher = connect_optional(&amqp_url, &config.rabbit_queue)
            .await
            .map(|p| Arc::new(p) as Arc<dyn CountPublisher>);

        Self::with_parts(config, store, publisher)
    }

    /// Start the aggregator over already-connected parts.
    pub fn with_parts(
        config: Config,
        store: Arc<dyn WindowStore>,
        publisher: Option<Arc<dyn CountPublisher>>,
    ) -> anyhow::Result<Self> {
        let notifier =
            Notifier::new(config.notify_timeout).context("Failed to create notifier")?;

        let aggregator = Arc::new(Aggregator::new(
            Arc::clone(&store),
            publisher,
            notifier,
            config.aggregator,
        ));

        Ok(Self {
            state: AppState::new(store),
            aggregator: aggregator.spawn(),
        })
    }

    /// Stop the aggregator loop, letting an in-flight flush finish.
    pub async fn shutdown(self) {
        tracing::info!("stopping aggregator");
        self.aggregator.shutdown().await;
    }
}
