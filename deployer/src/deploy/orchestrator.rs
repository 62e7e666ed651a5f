//! Deployment orchestrator.
//!
//! Drives one attempt end to end: open a log row, move the site to
//! `building`, validate the bundle, dispatch to the provider adapter, then
//! persist the outcome. Completion writes go through the site state machine,
//! so a site deleted while its deploy was in flight stays deleted.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use tracing::{info, warn};

use crate::deploy::bundle::{validate_bundle, BundleSummary, DEFAULT_ENTRY_POINT};
use crate::deploy::fsm::SiteEvent;
use crate::errors::{DeployError, DeployResult};
use crate::models::deployment::{DeploymentConfig, DeploymentResult};
use crate::models::job::{DeploymentJob, FailedJob, ProviderChoice, ProviderKind};
use crate::models::site::{DeploymentLog, LogCompletion, LogStatus, Site, SiteStatus};
use crate::providers::ProviderRegistry;
use crate::store::SiteStore;

/// Error recorded when a deploy finishes after its site was deleted
pub const SITE_DELETED_ERROR: &str = "site deleted during deployment";

/// Orchestrator options
#[derive(Debug, Clone)]
pub struct Options {
    /// Used when auto-selection finds no healthy provider
    pub default_provider: ProviderKind,
    /// Auto-selection preference, most preferred first
    pub priority_order: Vec<ProviderKind>,
    pub entry_point: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            default_provider: ProviderKind::Vercel,
            priority_order: ProviderKind::ALL.to_vec(),
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
        }
    }
}

pub struct Orchestrator {
    providers: ProviderRegistry,
    store: Arc<dyn SiteStore>,
    options: Options,
}

impl Orchestrator {
    pub fn new(providers: ProviderRegistry, store: Arc<dyn SiteStore>, options: Options) -> Self {
        Self {
            providers,
            store,
            options,
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Resolve the provider for a job and run it
    pub async fn process_job(&self, job: &DeploymentJob) -> DeployResult<DeploymentResult> {
        let provider = self.resolve_provider(job.data.provider).await;
        let config = DeploymentConfig::from(job);
        info!(job_id = %job.id, site_id = %config.site_id, provider = %provider, retry_count = job.retry_count, "Processing deployment");
        self.run(provider, &config).await
    }

    pub async fn resolve_provider(&self, choice: ProviderChoice) -> ProviderKind {
        match choice.pinned() {
            Some(kind) => kind,
            None => self.auto_select_provider().await,
        }
    }

    /// First healthy provider in priority order, else the configured default
    pub async fn auto_select_provider(&self) -> ProviderKind {
        let candidates: Vec<ProviderKind> = self
            .options
            .priority_order
            .iter()
            .copied()
            .filter(|kind| self.providers.get(*kind).is_ok())
            .collect();

        let checks = candidates.iter().map(|kind| async move {
            match self.providers.get(*kind) {
                Ok(provider) => provider.health_check().await,
                Err(_) => false,
            }
        });
        let health = join_all(checks).await;

        match candidates
            .iter()
            .zip(health)
            .find(|(_, healthy)| *healthy)
            .map(|(kind, _)| *kind)
        {
            Some(kind) => kind,
            None => {
                warn!(default = %self.options.default_provider, "No healthy provider, falling back to default");
                self.options.default_provider
            }
        }
    }

    /// One orchestration attempt.
    ///
    /// Input problems (bad bundle, unconfigured provider, deleted site) come
    /// back as `Err`. A provider that fails the deploy yields `Ok` with an
    /// unsuccessful result. Other `Err`s are infrastructure failures.
    pub async fn run(&self, provider: ProviderKind, config: &DeploymentConfig) -> DeployResult<DeploymentResult> {
        let started = Instant::now();
        let log = DeploymentLog::started(&config.site_id, provider);
        self.store.insert_log(&log).await?;

        let attempt = Attempt {
            orchestrator: self,
            log_id: &log.id,
            started,
        };

        if let Err(e) = self.store.transition_site(&config.site_id, SiteEvent::Build).await {
            attempt.fail(json!({}), &e.to_string()).await?;
            return Err(e);
        }

        let summary = match validate_bundle(&config.upload_dir(), &self.options.entry_point).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(site_id = %config.site_id, error = %e, "Bundle validation failed");
                attempt.fail(json!({}), &e.to_string()).await?;
                return Err(e);
            }
        };

        let outcome = match self.providers.get(provider) {
            Ok(adapter) => adapter.deploy(config).await,
            Err(e) => Err(e),
        };
        let result = match outcome {
            Ok(result) => result,
            Err(e @ DeployError::ProviderNotConfigured(_)) => {
                attempt.fail(bundle_metadata(&summary), &e.to_string()).await?;
                return Err(e);
            }
            Err(e) => DeploymentResult::failed(e.to_string()),
        };

        if !result.success {
            let error = result.error.clone().unwrap_or_else(|| "deployment failed".to_string());
            warn!(site_id = %config.site_id, provider = %provider, error = %error, "Deployment failed");
            attempt.fail(result_metadata(&summary, &result), &error).await?;
            return Ok(result);
        }

        let (Some(deployed_url), Some(deployment_id)) = (result.deployed_url.clone(), result.deployment_id.clone()) else {
            let error = "provider reported success without a URL";
            attempt.fail(result_metadata(&summary, &result), error).await?;
            return Ok(DeploymentResult::failed(error));
        };

        let event = SiteEvent::Succeed {
            provider,
            deployed_url: deployed_url.clone(),
            deployment_id,
        };
        if let Err(e) = self.store.transition_site(&config.site_id, event).await {
            let error = match &e {
                DeployError::SiteDeleted(_) => SITE_DELETED_ERROR.to_string(),
                other => other.to_string(),
            };
            warn!(site_id = %config.site_id, error = %error, "Deployment result not recorded");
            attempt.fail(result_metadata(&summary, &result), &error).await?;
            return Err(e);
        }

        if let Some(domain) = &config.custom_domain {
            let event = SiteEvent::AttachDomain {
                domain: domain.clone(),
                provider,
            };
            if let Err(e) = self.store.transition_site(&config.site_id, event).await {
                warn!(site_id = %config.site_id, domain = %domain, error = %e, "Custom domain not recorded");
            }
        }

        attempt
            .finish(LogStatus::Completed, result_metadata(&summary, &result), None)
            .await?;
        info!(site_id = %config.site_id, provider = %provider, url = %deployed_url, "Deployment live");
        Ok(result)
    }

    /// Record a job that will not be retried
    pub async fn mark_failed(&self, site_id: &str, error: &str) -> DeployResult<()> {
        let event = SiteEvent::Fail {
            error: error.to_string(),
        };
        match self.store.transition_site(site_id, event).await {
            Ok(_) => Ok(()),
            Err(e @ (DeployError::SiteDeleted(_) | DeployError::InvalidTransition(_))) => {
                warn!(site_id = %site_id, error = %e, "Site not marked failed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Repair a dead-lettered job whose site write was lost. A site still
    /// `building` and untouched since the job failed is marked failed;
    /// returns whether it was.
    pub async fn reconcile_dead_letter(&self, entry: &FailedJob) -> DeployResult<bool> {
        let site_id = entry.job.site_id();
        let stale = match self.store.get_site(site_id).await? {
            Some(site) => site.status == SiteStatus::Building && site.updated_at <= entry.failed_at,
            None => false,
        };
        if !stale {
            return Ok(false);
        }
        self.mark_failed(site_id, &entry.error).await?;
        info!(site_id = %site_id, job_id = %entry.job.id, "Site marked failed after dead letter");
        Ok(true)
    }

    /// Mark the site deleted. Remote resources are left in place.
    pub async fn delete(&self, site_id: &str) -> DeployResult<Site> {
        if self.store.get_site(site_id).await?.is_none() {
            return Err(DeployError::NotFound(format!("site {}", site_id)));
        }
        let site = self.store.transition_site(site_id, SiteEvent::Delete).await?;
        info!(site_id = %site_id, "Site deleted");
        Ok(site)
    }

    pub async fn rollback(&self, site_id: &str, target_deployment_id: &str) -> DeployResult<Site> {
        Err(DeployError::Unsupported(format!(
            "rollback of site {} to deployment {}",
            site_id, target_deployment_id
        )))
    }
}

/// Log row bookkeeping for one attempt
struct Attempt<'a> {
    orchestrator: &'a Orchestrator,
    log_id: &'a str,
    started: Instant,
}

impl Attempt<'_> {
    async fn finish(
        &self,
        status: LogStatus,
        metadata: serde_json::Value,
        error_message: Option<String>,
    ) -> DeployResult<()> {
        let completion = LogCompletion {
            status,
            completed_at: Utc::now(),
            duration_ms: self.started.elapsed().as_millis() as i64,
            metadata,
            error_message,
        };
        self.orchestrator.store.finish_log(self.log_id, completion).await
    }

    async fn fail(&self, metadata: serde_json::Value, error: &str) -> DeployResult<()> {
        self.finish(LogStatus::Failed, metadata, Some(error.to_string())).await
    }
}

fn bundle_metadata(summary: &BundleSummary) -> serde_json::Value {
    json!({ "bundle": summary })
}

fn result_metadata(summary: &BundleSummary, result: &DeploymentResult) -> serde_json::Value {
    json!({
        "bundle": summary,
        "deployedUrl": result.deployed_url,
        "deploymentId": result.deployment_id,
        "provider": result.metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::models::site::SiteStatus;
    use crate::providers::Provider;
    use crate::store::MemorySiteStore;

    struct FakeProvider {
        kind: ProviderKind,
        configured: bool,
        healthy: bool,
        fail_with: Option<String>,
        calls: AtomicUsize,
    }

    impl FakeProvider {
        fn new(kind: ProviderKind) -> Self {
            Self {
                kind,
                configured: true,
                healthy: true,
                fail_with: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        fn is_configured(&self) -> bool {
            self.configured
        }

        async fn health_check(&self) -> bool {
            self.configured && self.healthy
        }

        async fn deploy(&self, config: &DeploymentConfig) -> DeployResult<DeploymentResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.configured {
                return Err(DeployError::ProviderNotConfigured(self.kind));
            }
            match &self.fail_with {
                Some(error) => Err(DeployError::provider(self.kind, Some(502), error.clone())),
                None => Ok(DeploymentResult::succeeded(
                    format!("https://{}.{}.test", config.project_id, self.kind),
                    "dpl_fake",
                )),
            }
        }
    }

    fn bundle() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>ok</h1>").unwrap();
        dir
    }

    fn orchestrator(providers: Vec<Arc<FakeProvider>>, store: Arc<MemorySiteStore>) -> Orchestrator {
        let registry = providers.into_iter().fold(ProviderRegistry::new(), |registry, p| {
            registry.with_provider(p as Arc<dyn Provider>)
        });
        Orchestrator::new(registry, store, Options::default())
    }

    #[tokio::test]
    async fn test_successful_run() {
        let store = Arc::new(MemorySiteStore::new());
        let vercel = Arc::new(FakeProvider::new(ProviderKind::Vercel));
        let orchestrator = orchestrator(vec![vercel.clone()], store.clone());

        let dir = bundle();
        let mut config = DeploymentConfig::new("s1", dir.path());
        config.custom_domain = Some("www.example.com".to_string());

        let result = orchestrator.run(ProviderKind::Vercel, &config).await.unwrap();
        assert!(result.success);

        let site = store.get_site("s1").await.unwrap().unwrap();
        assert_eq!(site.status, SiteStatus::Live);
        assert_eq!(site.deployed_url.as_deref(), Some("https://s1.vercel.test"));
        assert_eq!(site.custom_domain.as_deref(), Some("www.example.com"));

        let logs = store.list_logs("s1", 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Completed);
        assert_eq!(logs[0].metadata["bundle"]["fileCount"], 1);
    }

    #[tokio::test]
    async fn test_invalid_bundle_makes_no_provider_call() {
        let store = Arc::new(MemorySiteStore::new());
        let vercel = Arc::new(FakeProvider::new(ProviderKind::Vercel));
        let orchestrator = orchestrator(vec![vercel.clone()], store.clone());

        let dir = tempfile::tempdir().unwrap();
        let config = DeploymentConfig::new("s1", dir.path());

        let err = orchestrator.run(ProviderKind::Vercel, &config).await.unwrap_err();
        assert!(matches!(err, DeployError::ValidationError(_)));
        assert!(!err.is_retryable());
        assert_eq!(vercel.calls.load(Ordering::SeqCst), 0);

        let logs = store.list_logs("s1", 10).await.unwrap();
        assert_eq!(logs[0].status, LogStatus::Failed);
        assert!(logs[0].error_message.as_deref().unwrap().contains("index.html"));
    }

    #[tokio::test]
    async fn test_provider_failure_keeps_site_building() {
        let store = Arc::new(MemorySiteStore::new());
        let mut netlify = FakeProvider::new(ProviderKind::Netlify);
        netlify.fail_with = Some("bad gateway".to_string());
        let orchestrator = orchestrator(vec![Arc::new(netlify)], store.clone());

        let dir = bundle();
        let result = orchestrator
            .run(ProviderKind::Netlify, &DeploymentConfig::new("s2", dir.path()))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.error.unwrap().contains("bad gateway"));
        let site = store.get_site("s2").await.unwrap().unwrap();
        assert_eq!(site.status, SiteStatus::Building);

        orchestrator.mark_failed("s2", "bad gateway").await.unwrap();
        let site = store.get_site("s2").await.unwrap().unwrap();
        assert_eq!(site.status, SiteStatus::DeploymentFailed);
        assert!(site.deployed_url.is_none());
    }

    #[tokio::test]
    async fn test_unregistered_provider_is_terminal() {
        let store = Arc::new(MemorySiteStore::new());
        let orchestrator = orchestrator(vec![], store.clone());

        let dir = bundle();
        let err = orchestrator
            .run(ProviderKind::Cloudflare, &DeploymentConfig::new("s3", dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::ProviderNotConfigured(ProviderKind::Cloudflare)));
    }

    #[tokio::test]
    async fn test_auto_select_skips_unconfigured() {
        let store = Arc::new(MemorySiteStore::new());
        let mut vercel = FakeProvider::new(ProviderKind::Vercel);
        vercel.configured = false;
        let netlify = FakeProvider::new(ProviderKind::Netlify);
        let orchestrator = orchestrator(vec![Arc::new(vercel), Arc::new(netlify)], store);

        assert_eq!(orchestrator.auto_select_provider().await, ProviderKind::Netlify);
        assert_eq!(
            orchestrator.resolve_provider(ProviderChoice::Vercel).await,
            ProviderKind::Vercel
        );
    }

    #[tokio::test]
    async fn test_auto_select_falls_back_to_default() {
        let store = Arc::new(MemorySiteStore::new());
        let mut netlify = FakeProvider::new(ProviderKind::Netlify);
        netlify.healthy = false;
        let registry = ProviderRegistry::new().with_provider(Arc::new(netlify));
        let options = Options {
            default_provider: ProviderKind::Cloudflare,
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(registry, store, options);

        assert_eq!(orchestrator.auto_select_provider().await, ProviderKind::Cloudflare);
    }

    #[tokio::test]
    async fn test_delete_during_deploy_is_fenced() {
        struct DeletingProvider {
            store: Arc<MemorySiteStore>,
        }

        #[async_trait]
        impl Provider for DeletingProvider {
            fn kind(&self) -> ProviderKind {
                ProviderKind::Vercel
            }
            fn is_configured(&self) -> bool {
                true
            }
            async fn health_check(&self) -> bool {
                true
            }
            async fn deploy(&self, config: &DeploymentConfig) -> DeployResult<DeploymentResult> {
                self.store.transition_site(&config.site_id, SiteEvent::Delete).await?;
                Ok(DeploymentResult::succeeded("https://late.vercel.test", "dpl_late"))
            }
        }

        let store = Arc::new(MemorySiteStore::new());
        let registry = ProviderRegistry::new().with_provider(Arc::new(DeletingProvider { store: store.clone() }));
        let orchestrator = Orchestrator::new(registry, store.clone(), Options::default());

        let dir = bundle();
        let err = orchestrator
            .run(ProviderKind::Vercel, &DeploymentConfig::new("s1", dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::SiteDeleted(_)));

        let site = store.get_site("s1").await.unwrap().unwrap();
        assert_eq!(site.status, SiteStatus::Deleted);
        assert!(site.deployed_url.is_none());

        let logs = store.list_logs("s1", 1).await.unwrap();
        assert_eq!(logs[0].error_message.as_deref(), Some(SITE_DELETED_ERROR));
    }

    #[tokio::test]
    async fn test_delete_and_rollback() {
        let store = Arc::new(MemorySiteStore::new());
        let orchestrator = orchestrator(vec![], store.clone());

        assert!(matches!(orchestrator.delete("ghost").await, Err(DeployError::NotFound(_))));

        store.transition_site("s1", SiteEvent::Build).await.unwrap();
        let site = orchestrator.delete("s1").await.unwrap();
        assert_eq!(site.status, SiteStatus::Deleted);

        assert!(matches!(
            orchestrator.rollback("s1", "dpl_1").await,
            Err(DeployError::Unsupported(_))
        ));
    }
}
