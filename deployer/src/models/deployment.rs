//! Deployment request and result models

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::models::job::{DeploymentJob, ProviderOptions};

/// Everything a provider adapter needs to publish one bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    pub site_id: String,
    pub project_id: String,
    pub bundle_path: PathBuf,
    pub custom_domain: Option<String>,
    pub env_vars: HashMap<String, String>,
    pub build_command: Option<String>,
    pub output_directory: String,
    pub options: Option<ProviderOptions>,
}

impl DeploymentConfig {
    pub fn new(site_id: impl Into<String>, bundle_path: impl Into<PathBuf>) -> Self {
        let site_id = site_id.into();
        Self {
            project_id: site_id.clone(),
            site_id,
            bundle_path: bundle_path.into(),
            custom_domain: None,
            env_vars: HashMap::new(),
            build_command: None,
            output_directory: ".".to_string(),
            options: None,
        }
    }

    /// The directory that actually gets archived and uploaded
    pub fn upload_dir(&self) -> PathBuf {
        if self.output_directory.is_empty() || self.output_directory == "." {
            self.bundle_path.clone()
        } else {
            self.bundle_path.join(&self.output_directory)
        }
    }
}

impl From<&DeploymentJob> for DeploymentConfig {
    fn from(job: &DeploymentJob) -> Self {
        let data = &job.data;
        Self {
            site_id: data.site_id.clone(),
            project_id: data.project_id().to_string(),
            bundle_path: PathBuf::from(&data.bundle_path),
            custom_domain: data.custom_domain.clone(),
            env_vars: data.env_vars.clone(),
            build_command: data.build_command.clone(),
            output_directory: data
                .output_directory
                .clone()
                .unwrap_or_else(|| ".".to_string()),
            options: data.options.clone(),
        }
    }
}

/// Outcome of one provider invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl DeploymentResult {
    pub fn succeeded(deployed_url: impl Into<String>, deployment_id: impl Into<String>) -> Self {
        Self {
            success: true,
            deployed_url: Some(deployed_url.into()),
            deployment_id: Some(deployment_id.into()),
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            deployed_url: None,
            deployment_id: None,
            error: Some(error.into()),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
