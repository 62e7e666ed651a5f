//! Site and deployment log storage.
//!
//! Sites live in `generated_sites` keyed by site id; every orchestration
//! attempt appends one row to `deployment_logs`. All site status changes go
//! through [`SiteStore::transition_site`], which applies the lifecycle rules
//! in [`crate::deploy::fsm`] under the store's own locking, so concurrent
//! writers (a worker finishing a deploy, an API delete) serialize per site.

mod memory;
mod postgres;

pub use memory::MemorySiteStore;
pub use postgres::PostgresSiteStore;

use async_trait::async_trait;

use crate::deploy::fsm::SiteEvent;
use crate::errors::DeployResult;
use crate::models::site::{DeploymentLog, LogCompletion, Site};

/// Backend for site metadata and deployment history
#[async_trait]
pub trait SiteStore: Send + Sync {
    /// Get a site by id
    async fn get_site(&self, site_id: &str) -> DeployResult<Option<Site>>;

    /// Apply `event` to the site, creating it as `pending` first if it does
    /// not exist yet. Returns the updated site; rejected transitions leave
    /// the stored site untouched.
    async fn transition_site(&self, site_id: &str, event: SiteEvent) -> DeployResult<Site>;

    /// Append a log row for a new attempt
    async fn insert_log(&self, log: &DeploymentLog) -> DeployResult<()>;

    /// Finalize a started log row. Rows that already finished are left
    /// as they are.
    async fn finish_log(&self, log_id: &str, completion: LogCompletion) -> DeployResult<()>;

    /// Most recent attempts first
    async fn list_logs(&self, site_id: &str, limit: usize) -> DeployResult<Vec<DeploymentLog>>;

    /// Reachability probe
    async fn ping(&self) -> DeployResult<()>;

    /// Close connections
    async fn shutdown(&self) -> DeployResult<()> {
        Ok(())
    }
}
