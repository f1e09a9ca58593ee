use std::sync::Arc;

use dispatch_core::archive::JobArchive;
use dispatch_events::{ChannelHub, ConnectionRegistry, RelayBridge, RelayConfig};
use dispatch_queue::JobQueue;
use dispatch_store::StateStore;

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::metrics::Metrics;

/// Shared application state available to all handlers via axum's `State` extractor.
///
/// Cheaply cloneable because every component sits behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration (immutable after startup).
    pub config: Arc<ServerConfig>,
    /// Shared state store (Redis or in-memory).
    pub store: Arc<dyn StateStore>,
    /// System of record for finished jobs.
    pub archive: Arc<dyn JobArchive>,
    /// Connection registry and channel fan-out.
    pub hub: Arc<ChannelHub>,
    pub queue: Arc<JobQueue>,
    /// Socket protocol handler.
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Wire the dispatch components together over the given backends.
    pub fn build(
        config: ServerConfig,
        store: Arc<dyn StateStore>,
        archive: Arc<dyn JobArchive>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let hub = if config.relay_enabled {
            let relay = Arc::new(RelayBridge::new(
                Arc::clone(&store),
                RelayConfig {
                    node_id: config.node_id.clone(),
                    enabled: true,
                },
            ));
            Arc::new(ChannelHub::with_relay(registry, relay))
        } else {
            Arc::new(ChannelHub::new(registry))
        };

        let queue = Arc::new(JobQueue::new(Arc::clone(&store), config.queue.clone()));
        let metrics = Arc::new(Metrics::new(config.dispatch.metrics_window));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&hub),
            Arc::clone(&queue),
            Arc::clone(&store),
            Arc::clone(&archive),
            Arc::clone(&metrics),
            config.dispatch.clone(),
            config.node_id.clone(),
        ));

        Self {
            config: Arc::new(config),
            store,
            archive,
            hub,
            queue,
            dispatcher,
            metrics,
        }
    }
}
