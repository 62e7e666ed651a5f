//! Application configuration options

use std::time::Duration;

use secrecy::SecretString;

use crate::app::settings::Settings;
use crate::deploy::orchestrator;
use crate::http::client::ClientOptions;
use crate::providers::ProviderConfig;
use crate::queue::RedisQueueOptions;
use crate::workers::{deployer, reaper};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    pub lifecycle: LifecycleOptions,

    pub queue: QueueBackend,

    pub store: StoreBackend,

    /// Enable the HTTP front door
    pub enable_server: bool,

    pub server: ServerOptions,

    /// Number of deployment worker loops
    pub worker_concurrency: usize,

    pub deployer: deployer::Options,

    pub reaper: reaper::Options,

    pub orchestrator: orchestrator::Options,

    pub providers: ProvidersOptions,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            queue: QueueBackend::Memory,
            store: StoreBackend::Memory,
            enable_server: true,
            server: ServerOptions::default(),
            worker_concurrency: 1,
            deployer: deployer::Options::default(),
            reaper: reaper::Options::default(),
            orchestrator: orchestrator::Options::default(),
            providers: ProvidersOptions::default(),
        }
    }
}

impl AppOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let queue = match &settings.redis_url {
            Some(url) => QueueBackend::Redis {
                url: SecretString::from(url.clone()),
                options: RedisQueueOptions {
                    key_prefix: settings.queue_key_prefix.clone(),
                    ..Default::default()
                },
            },
            None => QueueBackend::Memory,
        };
        let store = match &settings.database_url {
            Some(url) => StoreBackend::Postgres {
                url: SecretString::from(url.clone()),
                max_connections: settings.database_max_connections,
            },
            None => StoreBackend::Memory,
        };

        let credentials = &settings.credentials;
        let mut cloudflare = ProviderConfig::new(
            settings.providers.cloudflare_api_url.clone(),
            credentials.cloudflare_token.clone(),
        );
        cloudflare.account_id = settings.providers.cloudflare_account_id.clone();

        Self {
            lifecycle: LifecycleOptions {
                max_shutdown_delay: Duration::from_secs(settings.shutdown_timeout_secs),
            },
            queue,
            store,
            enable_server: settings.enable_server,
            server: ServerOptions {
                host: settings.host.clone(),
                port: settings.port,
            },
            worker_concurrency: settings.worker_concurrency,
            deployer: deployer::Options::default(),
            reaper: reaper::Options {
                interval: Duration::from_secs(settings.reaper_interval_secs),
                visibility_timeout: Duration::from_secs(settings.visibility_timeout_secs),
                ..Default::default()
            },
            orchestrator: orchestrator::Options {
                default_provider: settings.default_provider,
                priority_order: settings.provider_priority.clone(),
                ..Default::default()
            },
            providers: ProvidersOptions {
                vercel: ProviderConfig::new(
                    settings.providers.vercel_api_url.clone(),
                    credentials.vercel_token.clone(),
                ),
                netlify: ProviderConfig::new(
                    settings.providers.netlify_api_url.clone(),
                    credentials.netlify_token.clone(),
                ),
                cloudflare,
                client: ClientOptions::default(),
            },
        }
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Where jobs are queued
#[derive(Debug, Clone)]
pub enum QueueBackend {
    /// Single-process development queue
    Memory,
    Redis {
        url: SecretString,
        options: RedisQueueOptions,
    },
}

/// Where site and log rows live
#[derive(Debug, Clone)]
pub enum StoreBackend {
    /// Single-process development store
    Memory,
    Postgres {
        url: SecretString,
        max_connections: u32,
    },
}

/// Provider adapter configuration
#[derive(Debug, Clone)]
pub struct ProvidersOptions {
    pub vercel: ProviderConfig,
    pub netlify: ProviderConfig,
    pub cloudflare: ProviderConfig,
    pub client: ClientOptions,
}

impl Default for ProvidersOptions {
    fn default() -> Self {
        use crate::providers::{cloudflare, netlify, vercel};
        Self {
            vercel: ProviderConfig::new(vercel::DEFAULT_API_URL, None),
            netlify: ProviderConfig::new(netlify::DEFAULT_API_URL, None),
            cloudflare: ProviderConfig::new(cloudflare::DEFAULT_API_URL, None),
            client: ClientOptions::default(),
        }
    }
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::ProviderKind;

    #[test]
    fn test_backends_follow_connection_strings() {
        let options = AppOptions::from_settings(&Settings::default());
        assert!(matches!(options.queue, QueueBackend::Memory));
        assert!(matches!(options.store, StoreBackend::Memory));

        let settings = Settings {
            redis_url: Some("redis://:hunter2@cache:6379".to_string()),
            database_url: Some("postgres://app:hunter2@db/sites".to_string()),
            ..Default::default()
        };
        let options = AppOptions::from_settings(&settings);
        assert!(matches!(options.queue, QueueBackend::Redis { .. }));
        assert!(matches!(options.store, StoreBackend::Postgres { max_connections: 10, .. }));
        assert!(!format!("{:?}", options).contains("hunter2"));
    }

    #[test]
    fn test_orchestrator_and_reaper_settings() {
        let settings = Settings {
            default_provider: ProviderKind::Netlify,
            provider_priority: vec![ProviderKind::Cloudflare],
            visibility_timeout_secs: 60,
            ..Default::default()
        };
        let options = AppOptions::from_settings(&settings);
        assert_eq!(options.orchestrator.default_provider, ProviderKind::Netlify);
        assert_eq!(options.orchestrator.priority_order, vec![ProviderKind::Cloudflare]);
        assert_eq!(options.reaper.visibility_timeout, Duration::from_secs(60));
    }
}
