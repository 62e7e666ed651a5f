//! Application state management

use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::{info, warn};

use crate::app::options::{AppOptions, ProvidersOptions, QueueBackend, StoreBackend};
use crate::deploy::orchestrator::Orchestrator;
use crate::errors::DeployResult;
use crate::providers::{CloudflareProvider, NetlifyProvider, ProviderRegistry, VercelProvider};
use crate::queue::{JobQueue, MemoryJobQueue, RedisJobQueue};
use crate::store::{MemorySiteStore, PostgresSiteStore, SiteStore};

/// Main application state
pub struct AppState {
    pub queue: Arc<dyn JobQueue>,

    pub store: Arc<dyn SiteStore>,

    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    /// Connect the queue and store and build the provider registry
    pub async fn init(options: &AppOptions) -> DeployResult<Self> {
        info!("Initializing application state...");

        let queue = init_queue(&options.queue).await?;
        let store = init_store(&options.store).await?;
        let providers = init_providers(&options.providers)?;

        let configured = providers.configured();
        if configured.is_empty() {
            warn!("No provider credentials configured; every deployment will fail");
        } else {
            info!(providers = ?configured, "Provider adapters configured");
        }

        let orchestrator = Arc::new(Orchestrator::new(
            providers,
            store.clone(),
            options.orchestrator.clone(),
        ));

        Ok(Self {
            queue,
            store,
            orchestrator,
        })
    }

    /// Close the queue and store connections
    pub async fn shutdown(&self) -> DeployResult<()> {
        info!("Shutting down application state...");
        self.queue.shutdown().await?;
        self.store.shutdown().await
    }
}

async fn init_queue(backend: &QueueBackend) -> DeployResult<Arc<dyn JobQueue>> {
    match backend {
        QueueBackend::Memory => {
            warn!("REDIS_URL not set, using the in-memory queue (single process only)");
            Ok(Arc::new(MemoryJobQueue::new()))
        }
        QueueBackend::Redis { url, options } => {
            let queue = RedisJobQueue::connect(url.expose_secret(), options.clone()).await?;
            Ok(Arc::new(queue))
        }
    }
}

async fn init_store(backend: &StoreBackend) -> DeployResult<Arc<dyn SiteStore>> {
    match backend {
        StoreBackend::Memory => {
            warn!("DATABASE_URL not set, using the in-memory site store (single process only)");
            Ok(Arc::new(MemorySiteStore::new()))
        }
        StoreBackend::Postgres { url, max_connections } => {
            let store = PostgresSiteStore::new(url.expose_secret(), *max_connections).await?;
            Ok(Arc::new(store))
        }
    }
}

fn init_providers(options: &ProvidersOptions) -> DeployResult<ProviderRegistry> {
    Ok(ProviderRegistry::new()
        .with_provider(Arc::new(VercelProvider::new(options.vercel.clone(), options.client.clone())?))
        .with_provider(Arc::new(NetlifyProvider::new(options.netlify.clone(), options.client.clone())?))
        .with_provider(Arc::new(CloudflareProvider::new(
            options.cloudflare.clone(),
            options.client.clone(),
        )?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    #[tokio::test]
    async fn test_init_in_memory() {
        let mut options = AppOptions::default();
        options.providers.netlify.token = Some(SecretString::from("ntl".to_string()));

        let state = AppState::init(&options).await.unwrap();
        assert_eq!(
            state.orchestrator.providers().configured(),
            vec![crate::models::job::ProviderKind::Netlify]
        );
        assert_eq!(state.queue.stats().await.unwrap().pending, 0);
        state.shutdown().await.unwrap();
    }
}
