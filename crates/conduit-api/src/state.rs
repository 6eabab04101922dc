//! Shared application state. Every route handler needs at most the store,
//! the engine, and the registry — so unlike the teacher's per-module
//! `AppState` split (each module only needed its own slice of `Database`),
//! this workspace's three components are cheap to clone together.

use std::sync::Arc;

use conduit_engine::{StateStore, WorkerRegistry, WorkflowEngine};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub engine: Arc<WorkflowEngine>,
    pub registry: Arc<WorkerRegistry>,
}
