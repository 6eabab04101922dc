//! # Conduit Engine
//!
//! The coordinator's execution core: the state store, worker registry,
//! scheduler and workflow engine described in `spec.md`. This crate has no
//! dependency on any web framework — it is driven purely through the narrow
//! interfaces in [`scheduler::Dispatcher`] and [`registry::JobEventSink`],
//! plus the [`store::StateStore`]/[`store::ConnectionSink`] traits. The
//! request-handling layer lives in `conduit-api`.

pub mod config;
pub mod engine;
pub mod registry;
pub mod scheduler;
pub mod store;

pub use config::EngineConfig;
pub use engine::{DefinitionError, EngineError, WorkflowEngine};
pub use registry::{FailureReason, JobEventSink, WorkerRegistry};
pub use scheduler::{Dispatcher, Scheduler};
pub use store::{
    CacheTier, ConnectionSink, InMemoryStateStore, JobUpdate, PersistenceError, PostgresPersistence,
    RedisCache, SendError, StateStore, StoreError,
};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Wires the four components together and owns their shared lifetime. This
/// is the type `conduit-api` constructs once at startup and holds behind an
/// `Arc` alongside its own HTTP/WebSocket state.
pub struct Coordinator {
    pub store: Arc<dyn StateStore>,
    pub registry: Arc<WorkerRegistry>,
    pub engine: Arc<WorkflowEngine>,
}

impl Coordinator {
    /// Build the component graph for a given config. Breaks the
    /// engine/registry circular dependency (spec.md §9) via two narrow
    /// interfaces: the engine implements [`JobEventSink`] for the registry
    /// to call into, and the scheduler implements [`Dispatcher`] for the
    /// engine to call into.
    pub async fn build(config: &EngineConfig) -> Result<Self, store::StoreError> {
        let mut memory = if let Some(database_url) = &config.database_url {
            let persistence = Arc::new(PostgresPersistence::connect(database_url).await?);
            persistence.ensure_schema().await?;
            InMemoryStateStore::with_persistence(persistence)
        } else {
            InMemoryStateStore::new()
        };

        if let Some(redis_url) = &config.redis_url {
            match RedisCache::connect(redis_url) {
                Ok(cache) => memory = memory.with_cache(Arc::new(cache)),
                Err(err) => tracing::warn!(%err, "failed to connect cache, continuing without it"),
            }
        }

        memory.rebuild().await?;
        let store: Arc<dyn StateStore> = Arc::new(memory);

        let dispatcher: Arc<dyn Dispatcher> = Arc::new(Scheduler::new(store.clone()));
        let engine = Arc::new(WorkflowEngine::new(store.clone(), dispatcher));
        let sink: Arc<dyn JobEventSink> = engine.clone();
        let registry = Arc::new(WorkerRegistry::new(store.clone(), sink));

        engine.reconcile_after_restart().await;

        Ok(Self {
            store,
            registry,
            engine,
        })
    }

    /// Start the heartbeat liveness monitor. Returns a token that cancels
    /// the background task on drop/shutdown.
    #[instrument(skip(self))]
    pub fn spawn_heartbeat_monitor(&self) -> CancellationToken {
        info!("starting heartbeat monitor");
        self.registry.clone().spawn_heartbeat_monitor()
    }
}
