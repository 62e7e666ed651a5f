//! Service settings.
//!
//! Settings come from an optional JSON file, then environment variables
//! override individual fields. Provider credentials are only ever read from
//! the environment.

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::{DeployError, DeployResult};
use crate::logs::LogLevel;
use crate::models::job::ProviderKind;
use crate::providers::{cloudflare, netlify, vercel};

/// Service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default)]
    pub log_json: bool,

    /// Daily-rolling log files are written here when set
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Queue connection string; the in-memory queue is used without it
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default = "default_queue_prefix")]
    pub queue_key_prefix: String,

    /// Metadata store connection string; the in-memory store is used without it
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Run the HTTP front door in this process
    #[serde(default = "default_true")]
    pub enable_server: bool,

    /// Number of worker loops; 0 runs the front door only
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_provider")]
    pub default_provider: ProviderKind,

    /// Auto-selection preference, most preferred first
    #[serde(default = "default_provider_priority")]
    pub provider_priority: Vec<ProviderKind>,

    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,

    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    #[serde(default)]
    pub providers: ProviderSettings,

    #[serde(skip)]
    pub credentials: Credentials,
}

fn default_true() -> bool {
    true
}

fn default_queue_prefix() -> String {
    "deploy".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_worker_concurrency() -> usize {
    1
}

fn default_provider() -> ProviderKind {
    ProviderKind::Vercel
}

fn default_provider_priority() -> Vec<ProviderKind> {
    ProviderKind::ALL.to_vec()
}

fn default_visibility_timeout() -> u64 {
    15 * 60
}

fn default_reaper_interval() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            redis_url: None,
            queue_key_prefix: default_queue_prefix(),
            database_url: None,
            database_max_connections: default_max_connections(),
            host: default_host(),
            port: default_port(),
            enable_server: true,
            worker_concurrency: default_worker_concurrency(),
            default_provider: default_provider(),
            provider_priority: default_provider_priority(),
            visibility_timeout_secs: default_visibility_timeout(),
            reaper_interval_secs: default_reaper_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            providers: ProviderSettings::default(),
            credentials: Credentials::default(),
        }
    }
}

/// Provider API endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_vercel_api_url")]
    pub vercel_api_url: String,

    #[serde(default = "default_netlify_api_url")]
    pub netlify_api_url: String,

    #[serde(default = "default_cloudflare_api_url")]
    pub cloudflare_api_url: String,

    #[serde(default)]
    pub cloudflare_account_id: Option<String>,
}

fn default_vercel_api_url() -> String {
    vercel::DEFAULT_API_URL.to_string()
}

fn default_netlify_api_url() -> String {
    netlify::DEFAULT_API_URL.to_string()
}

fn default_cloudflare_api_url() -> String {
    cloudflare::DEFAULT_API_URL.to_string()
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            vercel_api_url: default_vercel_api_url(),
            netlify_api_url: default_netlify_api_url(),
            cloudflare_api_url: default_cloudflare_api_url(),
            cloudflare_account_id: None,
        }
    }
}

/// Provider API tokens
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub vercel_token: Option<SecretString>,
    pub netlify_token: Option<SecretString>,
    pub cloudflare_token: Option<SecretString>,
}

impl Settings {
    /// Read the settings file (if any), then apply the process environment
    pub async fn load(path: Option<&Path>) -> DeployResult<Self> {
        let mut settings = match path {
            Some(path) => {
                let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
                    DeployError::ConfigError(format!("cannot read {}: {}", path.display(), e))
                })?;
                serde_json::from_str(&raw).map_err(|e| {
                    DeployError::ConfigError(format!("invalid settings file {}: {}", path.display(), e))
                })?
            }
            None => Settings::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Override fields from environment variables; empty values are ignored
    pub fn apply_env<F>(&mut self, lookup: F) -> DeployResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = var("LOG_LEVEL") {
            self.log_level = v.parse().map_err(DeployError::ConfigError)?;
        }
        if let Some(v) = var("LOG_JSON") {
            self.log_json = parse_bool("LOG_JSON", &v)?;
        }
        if let Some(v) = var("LOG_DIR") {
            self.log_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("REDIS_URL") {
            self.redis_url = Some(v);
        }
        if let Some(v) = var("DATABASE_URL") {
            self.database_url = Some(v);
        }
        if let Some(v) = var("HOST") {
            self.host = v;
        }
        if let Some(v) = var("PORT") {
            self.port = parse_number("PORT", &v)?;
        }
        if let Some(v) = var("ENABLE_SERVER") {
            self.enable_server = parse_bool("ENABLE_SERVER", &v)?;
        }
        if let Some(v) = var("WORKER_CONCURRENCY") {
            self.worker_concurrency = parse_number("WORKER_CONCURRENCY", &v)?;
        }
        if let Some(v) = var("DEFAULT_PROVIDER") {
            self.default_provider = v.parse()?;
        }
        if let Some(v) = var("PROVIDER_PRIORITY") {
            self.provider_priority = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect::<DeployResult<Vec<ProviderKind>>>()?;
        }
        if let Some(v) = var("VISIBILITY_TIMEOUT_SECS") {
            self.visibility_timeout_secs = parse_number("VISIBILITY_TIMEOUT_SECS", &v)?;
        }

        if let Some(v) = var("VERCEL_API_URL") {
            self.providers.vercel_api_url = v;
        }
        if let Some(v) = var("NETLIFY_API_URL") {
            self.providers.netlify_api_url = v;
        }
        if let Some(v) = var("CLOUDFLARE_API_URL") {
            self.providers.cloudflare_api_url = v;
        }
        if let Some(v) = var("CLOUDFLARE_ACCOUNT_ID") {
            self.providers.cloudflare_account_id = Some(v);
        }

        self.credentials = Credentials {
            vercel_token: var("VERCEL_TOKEN").map(SecretString::from),
            netlify_token: var("NETLIFY_TOKEN").map(SecretString::from),
            cloudflare_token: var("CLOUDFLARE_API_TOKEN").map(SecretString::from),
        };
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> DeployResult<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(DeployError::ConfigError(format!("{} must be a boolean, got {}", key, value))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> DeployResult<T> {
    value
        .parse()
        .map_err(|_| DeployError::ConfigError(format!("{} must be a number, got {}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_from_empty_file() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.port, 3000);
        assert_eq!(settings.worker_concurrency, 1);
        assert_eq!(settings.provider_priority, ProviderKind::ALL.to_vec());
        assert_eq!(settings.providers.vercel_api_url, vercel::DEFAULT_API_URL);
        assert!(settings.enable_server);
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = Settings::default();
        settings
            .apply_env(env(&[
                ("PORT", "8081"),
                ("REDIS_URL", "redis://localhost:6379"),
                ("PROVIDER_PRIORITY", "netlify, cloudflare"),
                ("ENABLE_SERVER", "false"),
                ("VERCEL_TOKEN", "tok"),
                ("NETLIFY_TOKEN", "  "),
            ]))
            .unwrap();

        assert_eq!(settings.port, 8081);
        assert_eq!(settings.redis_url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(
            settings.provider_priority,
            vec![ProviderKind::Netlify, ProviderKind::Cloudflare]
        );
        assert!(!settings.enable_server);
        assert_eq!(
            settings.credentials.vercel_token.as_ref().map(|t| t.expose_secret()),
            Some("tok")
        );
        assert!(settings.credentials.netlify_token.is_none());
    }

    #[test]
    fn test_invalid_env_values() {
        let mut settings = Settings::default();
        assert!(matches!(
            settings.apply_env(env(&[("PORT", "http")])),
            Err(DeployError::ConfigError(_))
        ));
        assert!(settings.apply_env(env(&[("DEFAULT_PROVIDER", "heroku")])).is_err());
    }

    #[test]
    fn test_tokens_not_in_debug_output() {
        let mut settings = Settings::default();
        settings
            .apply_env(env(&[("CLOUDFLARE_API_TOKEN", "cf-super-secret")]))
            .unwrap();
        assert!(!format!("{:?}", settings).contains("cf-super-secret"));
    }
}
