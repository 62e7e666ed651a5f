//! Netlify adapter

use async_trait::async_trait;
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

pub const DEFAULT_API_URL: &str = "https://api.netlify.com/api/v1";

#[derive(Debug, Deserialize)]
struct NetlifySite {
    id: String,
    name: String,
    #[serde(default)]
    ssl_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NetlifyDeploy {
    id: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    ssl_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    deploy_ssl_url: Option<String>,
}

pub struct NetlifyProvider {
    api: ApiClient,
    sites: ProjectCache,
}

impl NetlifyProvider {
    pub fn new(config: ProviderConfig, options: ClientOptions) -> DeployResult<Self> {
        Ok(Self {
            api: ApiClient::new(ProviderKind::Netlify, &config.api_url, config.token, options)?,
            sites: ProjectCache::new(256),
        })
    }

    fn remote(site: NetlifySite) -> RemoteProject {
        RemoteProject {
            id: site.id,
            name: site.name,
            hostname: site.ssl_url.or(site.url),
        }
    }

    async fn ensure_site(&self, name: &str, account_slug: Option<&str>) -> DeployResult<RemoteProject> {
        if let Some(site) = self.sites.get(name) {
            return Ok(site);
        }

        let lookup = format!("/sites/{}.netlify.app", name);
        let site = match self.api.get_optional::<NetlifySite>(&lookup).await? {
            Some(site) => site,
            None => {
                let path = match account_slug {
                    Some(slug) => format!("/{}/sites", slug),
                    None => "/sites".to_string(),
                };
                match self.api.post::<NetlifySite, _>(&path, &json!({ "name": name })).await {
                    Ok(site) => {
                        info!(site = %site.name, "Created Netlify site");
                        site
                    }
                    // Name already taken by an earlier attempt
                    Err(DeployError::Conflict(_)) => self.api.get::<NetlifySite>(&lookup).await?,
                    Err(e) => return Err(e),
                }
            }
        };

        let site = Self::remote(site);
        self.sites.insert(site.clone());
        Ok(site)
    }
}

#[async_trait]
impl Provider for NetlifyProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Netlify
    }

    fn is_configured(&self) -> bool {
        self.api.is_configured()
    }

    async fn health_check(&self) -> bool {
        self.api.probe("/user").await
    }

    async fn deploy(&self, config: &DeploymentConfig) -> DeployResult<DeploymentResult> {
        if !self.is_configured() {
            return Err(DeployError::ProviderNotConfigured(ProviderKind::Netlify));
        }

        let account_slug = match &config.options {
            Some(ProviderOptions::Netlify { account_slug }) => account_slug.as_deref(),
            _ => None,
        };

        let archive = BundleArchive::create(&config.upload_dir()).await?;
        let site = self
            .ensure_site(&remote_project_name(&config.project_id), account_slug)
            .await?;

        let data = archive.read().await?;
        let deploy: NetlifyDeploy = self
            .api
            .post_bytes(
                &format!("/sites/{}/deploys", site.id),
                "application/gzip",
                &[("x-bundle-sha256", archive.sha256.clone())],
                data,
            )
            .await?;

        let url = deploy
            .ssl_url
            .or(deploy.url)
            .or_else(|| site.hostname.clone())
            .ok_or_else(|| {
                DeployError::provider(ProviderKind::Netlify, None, "deploy response carried no URL")
            })?;

        let mut result = DeploymentResult::succeeded(https_url(&url), deploy.id)
            .with_metadata("siteId", site.id)
            .with_metadata("siteName", site.name);
        if let Some(permalink) = deploy.deploy_ssl_url {
            result = result.with_metadata("permalink", permalink);
        }
        if let Some(state) = deploy.state {
            result = result.with_metadata("state", state);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn provider(url: &str) -> NetlifyProvider {
        let config = ProviderConfig::new(url, Some(SecretString::from("ntl_tok".to_string())));
        NetlifyProvider::new(config, ClientOptions::default()).unwrap()
    }

    fn bundle() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>s2</h1>").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_deploy_creates_site_under_account() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sites/s2.netlify.app")
            .with_status(404)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/acme/sites")
            .match_body(mockito::Matcher::Json(json!({ "name": "s2" })))
            .with_status(201)
            .with_body(r#"{"id":"site_1","name":"s2","ssl_url":"https://s2.netlify.app"}"#)
            .expect(1)
            .create_async()
            .await;
        let upload = server
            .mock("POST", "/sites/site_1/deploys")
            .match_header("content-type", "application/gzip")
            .with_status(200)
            .with_body(r#"{"id":"dep_1","state":"uploaded","ssl_url":"https://s2.netlify.app","deploy_ssl_url":"https://dep_1--s2.netlify.app"}"#)
            .create_async()
            .await;

        let netlify = provider(&server.url());
        let dir = bundle();
        let mut config = DeploymentConfig::new("s2", dir.path());
        config.options = Some(ProviderOptions::Netlify {
            account_slug: Some("acme".to_string()),
        });

        let result = netlify.deploy(&config).await.unwrap();
        assert_eq!(result.deployed_url.as_deref(), Some("https://s2.netlify.app"));
        assert_eq!(result.deployment_id.as_deref(), Some("dep_1"));
        assert_eq!(
            result.metadata.get("permalink").map(String::as_str),
            Some("https://dep_1--s2.netlify.app")
        );

        create.assert_async().await;
        upload.assert_async().await;
    }

    #[tokio::test]
    async fn test_upload_failure_is_provider_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sites/s2.netlify.app")
            .with_status(200)
            .with_body(r#"{"id":"site_1","name":"s2"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/sites/site_1/deploys")
            .with_status(500)
            .with_body("internal error")
            .create_async()
            .await;

        let dir = bundle();
        let err = provider(&server.url())
            .deploy(&DeploymentConfig::new("s2", dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeployError::ProviderError {
                provider: ProviderKind::Netlify,
                status: Some(500),
                ..
            }
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_site_conflict_falls_back_to_lookup() {
        let mut server = mockito::Server::new_async().await;
        let missing = server
            .mock("GET", "/sites/s2.netlify.app")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/sites")
            .with_status(422)
            .with_body(r#"{"errors":{"subdomain":["must be unique"]}}"#)
            .expect(1)
            .create_async()
            .await;
        let found = server
            .mock("GET", "/sites/s2.netlify.app")
            .with_status(200)
            .with_body(r#"{"id":"site_raced","name":"s2","ssl_url":"https://s2.netlify.app"}"#)
            .expect(1)
            .create_async()
            .await;
        let upload = server
            .mock("POST", "/sites/site_raced/deploys")
            .with_status(200)
            .with_body(r#"{"id":"dep_2","state":"uploaded","ssl_url":"https://s2.netlify.app"}"#)
            .expect(1)
            .create_async()
            .await;

        let netlify = provider(&server.url());
        let dir = bundle();
        let result = netlify.deploy(&DeploymentConfig::new("s2", dir.path())).await.unwrap();

        assert_eq!(result.deployment_id.as_deref(), Some("dep_2"));
        assert_eq!(result.metadata.get("siteId").map(String::as_str), Some("site_raced"));
        missing.assert_async().await;
        create.assert_async().await;
        found.assert_async().await;
        upload.assert_async().await;
    }
}
