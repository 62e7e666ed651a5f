//! In-memory site store for tests and single-process development.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use super::SiteStore;
use crate::deploy::fsm::{self, SiteEvent};
use crate::errors::{DeployError, DeployResult};
use crate::models::site::{DeploymentLog, LogCompletion, LogStatus, Site};

/// Site store held in process memory. Data is lost on exit.
#[derive(Debug, Default)]
pub struct MemorySiteStore {
    sites: RwLock<HashMap<String, Site>>,
    logs: RwLock<Vec<DeploymentLog>>,
}

impl MemorySiteStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> DeployError {
    DeployError::StoreError("lock poisoned".to_string())
}

#[async_trait]
impl SiteStore for MemorySiteStore {
    async fn get_site(&self, site_id: &str) -> DeployResult<Option<Site>> {
        let sites = self.sites.read().map_err(poisoned)?;
        Ok(sites.get(site_id).cloned())
    }

    async fn transition_site(&self, site_id: &str, event: SiteEvent) -> DeployResult<Site> {
        let mut sites = self.sites.write().map_err(poisoned)?;
        let mut site = sites
            .get(site_id)
            .cloned()
            .unwrap_or_else(|| Site::new(site_id));

        fsm::apply(&mut site, event, Utc::now())?;
        sites.insert(site_id.to_string(), site.clone());
        Ok(site)
    }

    async fn insert_log(&self, log: &DeploymentLog) -> DeployResult<()> {
        {
            let mut sites = self.sites.write().map_err(poisoned)?;
            sites
                .entry(log.site_id.clone())
                .or_insert_with(|| Site::new(&log.site_id));
        }
        let mut logs = self.logs.write().map_err(poisoned)?;
        if logs.iter().any(|l| l.id == log.id) {
            return Err(DeployError::Conflict(format!("log {} already exists", log.id)));
        }
        logs.push(log.clone());
        Ok(())
    }

    async fn finish_log(&self, log_id: &str, completion: LogCompletion) -> DeployResult<()> {
        let mut logs = self.logs.write().map_err(poisoned)?;
        let log = logs
            .iter_mut()
            .find(|l| l.id == log_id)
            .ok_or_else(|| DeployError::NotFound(format!("deployment log {}", log_id)))?;

        if log.status == LogStatus::Started {
            log.status = completion.status;
            log.completed_at = Some(completion.completed_at);
            log.duration_ms = Some(completion.duration_ms);
            log.metadata = completion.metadata;
            log.error_message = completion.error_message;
        }
        Ok(())
    }

    async fn list_logs(&self, site_id: &str, limit: usize) -> DeployResult<Vec<DeploymentLog>> {
        let logs = self.logs.read().map_err(poisoned)?;
        let mut matching: Vec<DeploymentLog> = logs
            .iter()
            .filter(|l| l.site_id == site_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn ping(&self) -> DeployResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::ProviderKind;
    use crate::models::site::SiteStatus;

    #[tokio::test]
    async fn test_transition_creates_site() {
        let store = MemorySiteStore::new();
        assert!(store.get_site("s1").await.unwrap().is_none());

        let site = store.transition_site("s1", SiteEvent::Build).await.unwrap();
        assert_eq!(site.status, SiteStatus::Building);
        assert_eq!(
            store.get_site("s1").await.unwrap().unwrap().status,
            SiteStatus::Building
        );
    }

    #[tokio::test]
    async fn test_rejected_transition_keeps_site() {
        let store = MemorySiteStore::new();
        store.transition_site("s1", SiteEvent::Delete).await.unwrap();

        let result = store.transition_site("s1", SiteEvent::Build).await;
        assert!(matches!(result, Err(DeployError::SiteDeleted(_))));
        assert_eq!(
            store.get_site("s1").await.unwrap().unwrap().status,
            SiteStatus::Deleted
        );
    }

    #[tokio::test]
    async fn test_finished_log_is_not_rewritten() {
        let store = MemorySiteStore::new();
        let log = DeploymentLog::started("s1", ProviderKind::Netlify);
        store.insert_log(&log).await.unwrap();

        let done = LogCompletion {
            status: LogStatus::Completed,
            completed_at: Utc::now(),
            duration_ms: 1200,
            metadata: serde_json::json!({"deployedUrl": "https://s1.netlify.app"}),
            error_message: None,
        };
        store.finish_log(&log.id, done).await.unwrap();

        let late = LogCompletion {
            status: LogStatus::Failed,
            completed_at: Utc::now(),
            duration_ms: 5000,
            metadata: serde_json::json!({}),
            error_message: Some("late".to_string()),
        };
        store.finish_log(&log.id, late).await.unwrap();

        let logs = store.list_logs("s1", 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Completed);
        assert_eq!(logs[0].duration_ms, Some(1200));
    }

    #[tokio::test]
    async fn test_finish_unknown_log() {
        let store = MemorySiteStore::new();
        let done = LogCompletion {
            status: LogStatus::Completed,
            completed_at: Utc::now(),
            duration_ms: 1,
            metadata: serde_json::json!({}),
            error_message: None,
        };
        assert!(matches!(
            store.finish_log("missing", done).await,
            Err(DeployError::NotFound(_))
        ));
    }
}
