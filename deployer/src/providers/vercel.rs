//! Vercel adapter

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::archive::BundleArchive;
use super::{https_url, remote_project_name, Provider, ProviderConfig};
use crate::cache::project::{ProjectCache, RemoteProject};
use crate::errors::{DeployError, DeployResult};
use crate::http::client::{ApiClient, ClientOptions};
use crate::models::deployment::{DeploymentConfig, DeploymentResult};
use crate::models::job::{ProviderKind, ProviderOptions};

pub const DEFAULT_API_URL: &str = "https://api.vercel.com";

#[derive(Debug, Deserialize)]
struct VercelProject {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VercelDeployment {
    id: String,
    url: String,
    #[serde(default)]
    ready_state: Option<String>,
}

pub struct VercelProvider {
    api: ApiClient,
    projects: ProjectCache,
}

impl VercelProvider {
    pub fn new(config: ProviderConfig, options: ClientOptions) -> DeployResult<Self> {
        Ok(Self {
            api: ApiClient::new(ProviderKind::Vercel, &config.api_url, config.token, options)?,
            projects: ProjectCache::new(256),
        })
    }

    /// Look the project up by name, creating it if absent
    async fn ensure_project(
        &self,
        name: &str,
        framework: Option<&str>,
        team_query: &str,
    ) -> DeployResult<RemoteProject> {
        if let Some(project) = self.projects.get(name) {
            return Ok(project);
        }

        let lookup = format!("/v9/projects/{}{}", name, team_query);
        let project = match self.api.get_optional::<VercelProject>(&lookup).await? {
            Some(project) => project,
            None => {
                let body = json!({ "name": name, "framework": framework });
                match self
                    .api
                    .post::<VercelProject, _>(&format!("/v10/projects{}", team_query), &body)
                    .await
                {
                    Ok(project) => {
                        info!(project = %project.name, "Created Vercel project");
                        project
                    }
                    // Created concurrently by another worker
                    Err(DeployError::Conflict(_)) => self.api.get::<VercelProject>(&lookup).await?,
                    Err(e) => return Err(e),
                }
            }
        };

        let project = RemoteProject {
            id: project.id,
            name: project.name,
            hostname: None,
        };
        self.projects.insert(project.clone());
        Ok(project)
    }
}

/// `?teamId=...` suffix for team-scoped calls, or empty
fn team_query(team_id: Option<&str>) -> String {
    match team_id {
        Some(team_id) => {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .append_pair("teamId", team_id)
                .finish();
            format!("?{}", query)
        }
        None => String::new(),
    }
}

#[async_trait]
impl Provider for VercelProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Vercel
    }

    fn is_configured(&self) -> bool {
        self.api.is_configured()
    }

    async fn health_check(&self) -> bool {
        self.api.probe("/v2/user").await
    }

    async fn deploy(&self, config: &DeploymentConfig) -> DeployResult<DeploymentResult> {
        if !self.is_configured() {
            return Err(DeployError::ProviderNotConfigured(ProviderKind::Vercel));
        }

        let (team_id, framework) = match &config.options {
            Some(ProviderOptions::Vercel { team_id, framework }) => (team_id.as_deref(), framework.as_deref()),
            _ => (None, None),
        };
        let team_query = team_query(team_id);

        let archive = BundleArchive::create(&config.upload_dir()).await?;
        let project = self
            .ensure_project(&remote_project_name(&config.project_id), framework, &team_query)
            .await?;

        let data = archive.read().await?;
        let _: serde_json::Value = self
            .api
            .post_bytes(
                &format!("/v2/files{}", team_query),
                "application/gzip",
                &[("x-vercel-digest", archive.sha256.clone())],
                data,
            )
            .await?;
        debug!(project = %project.name, sha = %archive.sha256, "Uploaded bundle to Vercel");

        let body = json!({
            "name": project.name,
            "project": project.id,
            "target": "production",
            "files": [{ "file": "bundle.tar.gz", "sha": archive.sha256, "size": archive.size }],
            "projectSettings": {
                "framework": framework,
                "buildCommand": config.build_command,
                "outputDirectory": config.output_directory,
            },
            "env": config.env_vars,
        });
        let deployment: VercelDeployment = self
            .api
            .post(&format!("/v13/deployments{}", team_query), &body)
            .await?;

        let mut result = DeploymentResult::succeeded(https_url(&deployment.url), deployment.id)
            .with_metadata("projectId", project.id)
            .with_metadata("projectName", project.name);
        if let Some(state) = deployment.ready_state {
            result = result.with_metadata("readyState", state);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn provider(url: &str, token: Option<&str>) -> VercelProvider {
        let config = ProviderConfig::new(url, token.map(|t| SecretString::from(t.to_string())));
        VercelProvider::new(config, ClientOptions::default()).unwrap()
    }

    fn bundle() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>s1</h1>").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_project_created_once() {
        let mut server = mockito::Server::new_async().await;
        let lookup = server
            .mock("GET", "/v9/projects/s1")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/v10/projects")
            .with_status(200)
            .with_body(r#"{"id":"prj_1","name":"s1"}"#)
            .expect(1)
            .create_async()
            .await;
        let files = server
            .mock("POST", "/v2/files")
            .match_header("x-vercel-digest", mockito::Matcher::Regex("^[0-9a-f]{64}$".into()))
            .with_status(200)
            .with_body("{}")
            .expect(2)
            .create_async()
            .await;
        let deployments = server
            .mock("POST", "/v13/deployments")
            .with_status(200)
            .with_body(r#"{"id":"dpl_1","url":"s1-abc.vercel.app","readyState":"QUEUED"}"#)
            .expect(2)
            .create_async()
            .await;

        let vercel = provider(&server.url(), Some("tok"));
        let dir = bundle();
        let config = DeploymentConfig::new("s1", dir.path());

        for _ in 0..2 {
            let result = vercel.deploy(&config).await.unwrap();
            assert!(result.success);
            assert_eq!(result.deployed_url.as_deref(), Some("https://s1-abc.vercel.app"));
            assert_eq!(result.deployment_id.as_deref(), Some("dpl_1"));
        }

        lookup.assert_async().await;
        create.assert_async().await;
        files.assert_async().await;
        deployments.assert_async().await;
    }

    #[tokio::test]
    async fn test_existing_project_is_reused() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v9/projects/s1")
            .with_status(200)
            .with_body(r#"{"id":"prj_existing","name":"s1"}"#)
            .create_async()
            .await;
        let create = server.mock("POST", "/v10/projects").expect(0).create_async().await;
        server
            .mock("POST", "/v2/files")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;
        server
            .mock("POST", "/v13/deployments")
            .with_status(200)
            .with_body(r#"{"id":"dpl_2","url":"s1-def.vercel.app"}"#)
            .create_async()
            .await;

        let vercel = provider(&server.url(), Some("tok"));
        let dir = bundle();
        let result = vercel.deploy(&DeploymentConfig::new("s1", dir.path())).await.unwrap();

        assert_eq!(result.metadata.get("projectId").map(String::as_str), Some("prj_existing"));
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_unconfigured_makes_no_calls() {
        let mut server = mockito::Server::new_async().await;
        let any = server
            .mock("GET", mockito::Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let vercel = provider(&server.url(), None);
        assert!(!vercel.health_check().await);

        let dir = bundle();
        let result = vercel.deploy(&DeploymentConfig::new("s1", dir.path())).await;
        assert!(matches!(result, Err(DeployError::ProviderNotConfigured(ProviderKind::Vercel))));
        any.assert_async().await;
    }

    #[tokio::test]
    async fn test_health_check() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/user")
            .match_header("authorization", "Bearer tok")
            .with_status(200)
            .with_body(r#"{"user":{"id":"u1"}}"#)
            .create_async()
            .await;

        assert!(provider(&server.url(), Some("tok")).health_check().await);
    }

    #[test]
    fn test_team_query_is_encoded() {
        assert_eq!(team_query(None), "");
        assert_eq!(team_query(Some("team_1")), "?teamId=team_1");
        assert_eq!(team_query(Some("a&b=c d")), "?teamId=a%26b%3Dc+d");
    }

    #[tokio::test]
    async fn test_project_conflict_falls_back_to_lookup() {
        let mut server = mockito::Server::new_async().await;
        let missing = server
            .mock("GET", "/v9/projects/s1")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/v10/projects")
            .with_status(409)
            .with_body(r#"{"error":{"code":"conflict","message":"Project already exists"}}"#)
            .expect(1)
            .create_async()
            .await;
        let found = server
            .mock("GET", "/v9/projects/s1")
            .with_status(200)
            .with_body(r#"{"id":"prj_raced","name":"s1"}"#)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("POST", "/v2/files")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;
        let deployments = server
            .mock("POST", "/v13/deployments")
            .match_body(mockito::Matcher::PartialJson(json!({ "project": "prj_raced" })))
            .with_status(200)
            .with_body(r#"{"id":"dpl_3","url":"s1-ghi.vercel.app"}"#)
            .expect(1)
            .create_async()
            .await;

        let vercel = provider(&server.url(), Some("tok"));
        let dir = bundle();
        let result = vercel.deploy(&DeploymentConfig::new("s1", dir.path())).await.unwrap();

        assert!(result.success);
        assert_eq!(result.metadata.get("projectId").map(String::as_str), Some("prj_raced"));
        missing.assert_async().await;
        create.assert_async().await;
        found.assert_async().await;
        deployments.assert_async().await;
    }

    #[tokio::test]
    async fn test_team_scoped_calls() {
        let mut server = mockito::Server::new_async().await;
        let lookup = server
            .mock("GET", "/v9/projects/s1")
            .match_query(mockito::Matcher::UrlEncoded("teamId".into(), "team&1".into()))
            .with_status(200)
            .with_body(r#"{"id":"prj_team","name":"s1"}"#)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("POST", "/v2/files")
            .match_query(mockito::Matcher::UrlEncoded("teamId".into(), "team&1".into()))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;
        server
            .mock("POST", "/v13/deployments")
            .match_query(mockito::Matcher::UrlEncoded("teamId".into(), "team&1".into()))
            .with_status(200)
            .with_body(r#"{"id":"dpl_4","url":"s1-team.vercel.app"}"#)
            .create_async()
            .await;

        let vercel = provider(&server.url(), Some("tok"));
        let dir = bundle();
        let mut config = DeploymentConfig::new("s1", dir.path());
        config.options = Some(ProviderOptions::Vercel {
            team_id: Some("team&1".to_string()),
            framework: None,
        });

        let result = vercel.deploy(&config).await.unwrap();
        assert_eq!(result.deployment_id.as_deref(), Some("dpl_4"));
        lookup.assert_async().await;
    }
}
