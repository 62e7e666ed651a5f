//! Cloudflare Pages adapter.
//!
//! Cloudflare wraps every response in a `{success, errors, result}`
//! envelope; a 2xx with `success: false` is still a failure.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::archive::BundleArchive;
use super::{https_url, remote_project_name, Provider, ProviderConfig};
use crate::cache::project::{ProjectCache, RemoteProject};
use crate::errors::{DeployError, DeployResult};
use crate::http::client::{ApiClient, ClientOptions};
use crate::models::deployment::{DeploymentConfig, DeploymentResult};
use crate::models::job::{ProviderKind, ProviderOptions};

pub const DEFAULT_API_URL: &str = "https://api.cloudflare.com/client/v4";

const DEFAULT_BRANCH: &str = "main";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<EnvelopeError>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeError {
    #[serde(default)]
    code: i64,
    message: String,
}

impl<T> Envelope<T> {
    fn into_result(self) -> DeployResult<T> {
        if !self.success {
            let message = self
                .errors
                .iter()
                .map(|e| format!("{} ({})", e.message, e.code))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(DeployError::provider(ProviderKind::Cloudflare, None, message));
        }
        self.result
            .ok_or_else(|| DeployError::provider(ProviderKind::Cloudflare, None, "empty result"))
    }
}

#[derive(Debug, Deserialize)]
struct PagesProject {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    subdomain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PagesDeployment {
    id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    environment: Option<String>,
}

pub struct CloudflareProvider {
    api: ApiClient,
    account_id: Option<String>,
    projects: ProjectCache,
}

impl CloudflareProvider {
    pub fn new(config: ProviderConfig, options: ClientOptions) -> DeployResult<Self> {
        Ok(Self {
            api: ApiClient::new(ProviderKind::Cloudflare, &config.api_url, config.token, options)?,
            account_id: config.account_id.filter(|a| !a.trim().is_empty()),
            projects: ProjectCache::new(256),
        })
    }

    fn account(&self) -> DeployResult<&str> {
        self.account_id
            .as_deref()
            .ok_or(DeployError::ProviderNotConfigured(ProviderKind::Cloudflare))
    }

    async fn get_enveloped<T: DeserializeOwned>(&self, path: &str) -> DeployResult<Option<T>> {
        match self.api.get_optional::<Envelope<T>>(path).await? {
            Some(envelope) => envelope.into_result().map(Some),
            None => Ok(None),
        }
    }

    async fn ensure_project(&self, name: &str, branch: &str) -> DeployResult<RemoteProject> {
        if let Some(project) = self.projects.get(name) {
            return Ok(project);
        }

        let account = self.account()?;
        let lookup = format!("/accounts/{}/pages/projects/{}", account, name);
        let project = match self.get_enveloped::<PagesProject>(&lookup).await? {
            Some(project) => project,
            None => {
                let body = json!({ "name": name, "production_branch": branch });
                let created = self
                    .api
                    .post::<Envelope<PagesProject>, _>(&format!("/accounts/{}/pages/projects", account), &body)
                    .await;
                match created {
                    Ok(envelope) => {
                        let project = envelope.into_result()?;
                        info!(project = %project.name, "Created Cloudflare Pages project");
                        project
                    }
                    Err(DeployError::Conflict(_)) => self
                        .get_enveloped::<PagesProject>(&lookup)
                        .await?
                        .ok_or_else(|| {
                            DeployError::provider(ProviderKind::Cloudflare, None, "project vanished after conflict")
                        })?,
                    Err(e) => return Err(e),
                }
            }
        };

        let project = RemoteProject {
            id: project.id.unwrap_or_else(|| project.name.clone()),
            hostname: project
                .subdomain
                .clone()
                .or_else(|| Some(format!("{}.pages.dev", project.name))),
            name: project.name,
        };
        self.projects.insert(project.clone());
        Ok(project)
    }
}

#[async_trait]
impl Provider for CloudflareProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cloudflare
    }

    fn is_configured(&self) -> bool {
        self.api.is_configured() && self.account_id.is_some()
    }

    async fn health_check(&self) -> bool {
        self.is_configured() && self.api.probe("/user/tokens/verify").await
    }

    async fn deploy(&self, config: &DeploymentConfig) -> DeployResult<DeploymentResult> {
        if !self.is_configured() {
            return Err(DeployError::ProviderNotConfigured(ProviderKind::Cloudflare));
        }

        let branch = match &config.options {
            Some(ProviderOptions::Cloudflare { production_branch }) => production_branch.as_deref(),
            _ => None,
        }
        .unwrap_or(DEFAULT_BRANCH);

        let archive = BundleArchive::create(&config.upload_dir()).await?;
        let project = self
            .ensure_project(&remote_project_name(&config.project_id), branch)
            .await?;

        let data = archive.read().await?;
        let envelope: Envelope<PagesDeployment> = self
            .api
            .post_bytes(
                &format!("/accounts/{}/pages/projects/{}/deployments", self.account()?, project.name),
                "application/gzip",
                &[("x-bundle-sha256", archive.sha256.clone()), ("x-branch", branch.to_string())],
                data,
            )
            .await?;
        let deployment = envelope.into_result()?;

        // Production traffic is served from the project subdomain
        let subdomain = project
            .hostname
            .clone()
            .unwrap_or_else(|| format!("{}.pages.dev", project.name));
        let mut result = DeploymentResult::succeeded(https_url(&subdomain), deployment.id)
            .with_metadata("subdomain", subdomain)
            .with_metadata("projectName", project.name);
        if let Some(url) = deployment.url {
            result = result.with_metadata("previewUrl", url);
        }
        if let Some(environment) = deployment.environment {
            result = result.with_metadata("environment", environment);
        }
        Ok(result)
    }
}
