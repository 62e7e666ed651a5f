//! Deployment job models

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DeployError, DeployResult};

/// Default retry budget for a job
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Accepted priority range. Keeps `priority * K` well inside the exact
/// integer range of an f64 score.
pub const MIN_PRIORITY: i64 = -1000;
pub const MAX_PRIORITY: i64 = 1000;

/// Supported hosting providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Vercel,
    Netlify,
    Cloudflare,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::Vercel,
        ProviderKind::Netlify,
        ProviderKind::Cloudflare,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Vercel => "vercel",
            ProviderKind::Netlify => "netlify",
            ProviderKind::Cloudflare => "cloudflare",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "vercel" => Ok(ProviderKind::Vercel),
            "netlify" => Ok(ProviderKind::Netlify),
            "cloudflare" | "cloudflare-pages" | "cloudflare_pages" => Ok(ProviderKind::Cloudflare),
            other => Err(DeployError::ValidationError(format!(
                "Unknown provider: {}",
                other
            ))),
        }
    }
}

/// Provider requested by a caller: pinned, or left to auto-selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderChoice {
    Auto,
    Vercel,
    Netlify,
    Cloudflare,
}

impl ProviderChoice {
    /// The pinned provider, if any
    pub fn pinned(&self) -> Option<ProviderKind> {
        match self {
            ProviderChoice::Auto => None,
            ProviderChoice::Vercel => Some(ProviderKind::Vercel),
            ProviderChoice::Netlify => Some(ProviderKind::Netlify),
            ProviderChoice::Cloudflare => Some(ProviderKind::Cloudflare),
        }
    }
}

impl From<ProviderKind> for ProviderChoice {
    fn from(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Vercel => ProviderChoice::Vercel,
            ProviderKind::Netlify => ProviderChoice::Netlify,
            ProviderKind::Cloudflare => ProviderChoice::Cloudflare,
        }
    }
}

/// Provider-specific settings carried by a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderOptions {
    #[serde(rename_all = "camelCase")]
    Vercel {
        #[serde(default)]
        team_id: Option<String>,
        #[serde(default)]
        framework: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Netlify {
        #[serde(default)]
        account_slug: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Cloudflare {
        #[serde(default)]
        production_branch: Option<String>,
    },
}

impl ProviderOptions {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderOptions::Vercel { .. } => ProviderKind::Vercel,
            ProviderOptions::Netlify { .. } => ProviderKind::Netlify,
            ProviderOptions::Cloudflare { .. } => ProviderKind::Cloudflare,
        }
    }
}

/// Job data supplied by the caller at enqueue time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    pub site_id: String,

    /// Remote project key; defaults to the site id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    /// Directory containing the built site
    pub bundle_path: String,

    pub provider: ProviderChoice,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_domain: Option<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env_vars: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,

    /// Sub-directory of the bundle to upload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_directory: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ProviderOptions>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl JobData {
    /// Minimal job data for a pinned or auto provider
    pub fn new(
        site_id: impl Into<String>,
        bundle_path: impl Into<String>,
        provider: impl Into<ProviderChoice>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            project_id: None,
            bundle_path: bundle_path.into(),
            provider: provider.into(),
            custom_domain: None,
            env_vars: HashMap::new(),
            build_command: None,
            output_directory: None,
            options: None,
            max_retries: None,
        }
    }

    pub fn project_id(&self) -> &str {
        self.project_id
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(&self.site_id)
    }

    /// Reject malformed job data before it reaches the queue
    pub fn validate(&self) -> DeployResult<()> {
        if self.site_id.trim().is_empty() {
            return Err(DeployError::ValidationError("siteId is required".to_string()));
        }
        if self.bundle_path.trim().is_empty() {
            return Err(DeployError::ValidationError("bundlePath is required".to_string()));
        }
        if let Some(options) = &self.options {
            match self.provider.pinned() {
                Some(kind) if kind == options.kind() => {}
                Some(kind) => {
                    return Err(DeployError::ValidationError(format!(
                        "options for {} do not match provider {}",
                        options.kind(),
                        kind
                    )));
                }
                None => {
                    return Err(DeployError::ValidationError(
                        "provider options require a pinned provider".to_string(),
                    ));
                }
            }
        }
        if let Some(domain) = &self.custom_domain {
            validate_domain(domain)?;
        }
        if let Some(dir) = &self.output_directory {
            if dir.split(['/', '\\']).any(|part| part == "..") || dir.starts_with('/') {
                return Err(DeployError::ValidationError(format!(
                    "outputDirectory must stay inside the bundle: {}",
                    dir
                )));
            }
        }
        if self.max_retries == Some(0) {
            return Err(DeployError::ValidationError(
                "maxRetries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_domain(domain: &str) -> DeployResult<()> {
    let valid = !domain.is_empty()
        && domain.len() <= 253
        && domain.contains('.')
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if valid {
        Ok(())
    } else {
        Err(DeployError::ValidationError(format!(
            "customDomain is not a valid hostname: {}",
            domain
        )))
    }
}

/// A queued unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentJob {
    pub id: String,

    #[serde(flatten)]
    pub data: JobData,

    pub priority: i64,

    pub retry_count: u32,

    pub max_retries: u32,

    pub created_at: DateTime<Utc>,
}

impl DeploymentJob {
    /// Build a fresh job from validated data
    pub fn new(mut data: JobData, priority: i64) -> DeployResult<Self> {
        data.validate()?;
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(DeployError::ValidationError(format!(
                "priority must be within [{}, {}], got {}",
                MIN_PRIORITY, MAX_PRIORITY, priority
            )));
        }
        // The job-level field is authoritative once queued
        let max_retries = data.max_retries.take().unwrap_or(DEFAULT_MAX_RETRIES);
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            data,
            priority,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
        })
    }

    pub fn site_id(&self) -> &str {
        &self.data.site_id
    }

    /// Whether another failure should requeue rather than dead-letter
    pub fn can_retry(&self) -> bool {
        self.retry_count + 1 < self.max_retries
    }
}

/// Dead-letter entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJob {
    pub job: DeploymentJob,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}
