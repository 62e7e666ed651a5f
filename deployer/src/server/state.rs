//! Server state

use std::sync::Arc;

use crate::deploy::orchestrator::Orchestrator;
use crate::queue::JobQueue;
use crate::store::SiteStore;

/// Server state shared across handlers
pub struct ServerState {
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn SiteStore>,
    pub orchestrator: Arc<Orchestrator>,
}

impl ServerState {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn SiteStore>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            queue,
            store,
            orchestrator,
        }
    }
}
