//! Hosting provider adapters.
//!
//! Every adapter follows the same sequence: pack the bundle, find or create
//! the remote project named after the job's project id, upload the archive,
//! then map the provider response into a [`DeploymentResult`]. An adapter
//! without credentials reports itself unhealthy and refuses to deploy
//! without touching the network.

pub mod archive;
pub mod cloudflare;
pub mod netlify;
pub mod vercel;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::errors::{DeployError, DeployResult};
use crate::models::deployment::{DeploymentConfig, DeploymentResult};
use crate::models::job::ProviderKind;

pub use cloudflare::CloudflareProvider;
pub use netlify::NetlifyProvider;
pub use vercel::VercelProvider;

// Provider resource names are DNS labels
const MAX_PROJECT_NAME: usize = 63;

/// Uniform deploy contract
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Whether credentials are present
    fn is_configured(&self) -> bool;

    /// False when unconfigured or the provider API does not answer
    async fn health_check(&self) -> bool;

    /// Publish the bundle described by `config`
    async fn deploy(&self, config: &DeploymentConfig) -> DeployResult<DeploymentResult>;
}

/// Connection settings for one provider API
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_url: String,
    pub token: Option<SecretString>,
    /// Cloudflare account id; unused elsewhere
    pub account_id: Option<String>,
}

impl ProviderConfig {
    pub fn new(api_url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            api_url: api_url.into(),
            token,
            account_id: None,
        }
    }
}

/// Deterministic remote resource name for a project id
pub fn remote_project_name(project_id: &str) -> String {
    let mut name = String::with_capacity(project_id.len());
    for c in project_id.trim().chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            name.push(c);
        } else if !name.ends_with('-') {
            name.push('-');
        }
    }
    name.truncate(MAX_PROJECT_NAME);
    let name = name.trim_matches('-');
    if name.is_empty() {
        "site".to_string()
    } else {
        name.to_string()
    }
}

/// Providers report bare hostnames in some responses
pub(crate) fn https_url(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

/// The set of adapters available to the orchestrator
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<ProviderKind, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> DeployResult<Arc<dyn Provider>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or(DeployError::ProviderNotConfigured(kind))
    }

    /// Kinds with credentials present
    pub fn configured(&self) -> Vec<ProviderKind> {
        self.providers
            .values()
            .filter(|p| p.is_configured())
            .map(|p| p.kind())
            .collect()
    }
}
