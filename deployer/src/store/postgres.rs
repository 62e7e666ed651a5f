//! PostgreSQL site store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use super::SiteStore;
use crate::deploy::fsm::{self, SiteEvent};
use crate::errors::{DeployError, DeployResult};
use crate::models::job::ProviderKind;
use crate::models::site::{DeploymentLog, LogCompletion, Site};

const SITE_COLUMNS: &str = "site_id, status, provider, deployed_url, deployment_id, custom_domain, \
                            last_error, last_deployed_at, updated_at";

const LOG_COLUMNS: &str = "id, site_id, provider, status, started_at, completed_at, duration_ms, \
                           metadata, error_message";

/// PostgreSQL-backed site store
#[derive(Clone)]
pub struct PostgresSiteStore {
    pool: PgPool,
}

impl PostgresSiteStore {
    /// Connect and make sure the tables exist
    pub async fn new(url: &str, max_connections: u32) -> DeployResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        info!("Connected to metadata store");
        Ok(store)
    }

    async fn ensure_schema(&self) -> DeployResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS generated_sites (
                site_id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'pending',
                provider TEXT,
                deployed_url TEXT,
                deployment_id TEXT,
                custom_domain TEXT,
                last_error TEXT,
                last_deployed_at TIMESTAMPTZ,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployment_logs (
                id TEXT PRIMARY KEY,
                site_id TEXT NOT NULL REFERENCES generated_sites(site_id),
                provider TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                duration_ms BIGINT,
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                error_message TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployment_logs_site_started
            ON deployment_logs (site_id, started_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn parse_provider(raw: Option<String>) -> DeployResult<Option<ProviderKind>> {
        raw.map(|p| {
            p.parse()
                .map_err(|_| DeployError::StoreError(format!("Unknown provider in store: {}", p)))
        })
        .transpose()
    }

    fn row_to_site(row: &PgRow) -> DeployResult<Site> {
        let status: String = row.get("status");
        let provider: Option<String> = row.get("provider");
        let last_deployed_at: Option<DateTime<Utc>> = row.get("last_deployed_at");

        Ok(Site {
            site_id: row.get("site_id"),
            status: status.parse()?,
            provider: Self::parse_provider(provider)?,
            deployed_url: row.get("deployed_url"),
            deployment_id: row.get("deployment_id"),
            custom_domain: row.get("custom_domain"),
            last_error: row.get("last_error"),
            last_deployed_at,
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_log(row: &PgRow) -> DeployResult<DeploymentLog> {
        let provider: String = row.get("provider");
        let status: String = row.get("status");

        Ok(DeploymentLog {
            id: row.get("id"),
            site_id: row.get("site_id"),
            provider: Self::parse_provider(Some(provider))?
                .ok_or_else(|| DeployError::StoreError("log row without provider".to_string()))?,
            status: status.parse()?,
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            duration_ms: row.get("duration_ms"),
            metadata: row.get("metadata"),
            error_message: row.get("error_message"),
        })
    }
}

#[async_trait]
impl SiteStore for PostgresSiteStore {
    async fn get_site(&self, site_id: &str) -> DeployResult<Option<Site>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM generated_sites WHERE site_id = $1",
            SITE_COLUMNS
        ))
        .bind(site_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_site).transpose()
    }

    async fn transition_site(&self, site_id: &str, event: SiteEvent) -> DeployResult<Site> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO generated_sites (site_id) VALUES ($1) ON CONFLICT (site_id) DO NOTHING")
            .bind(site_id)
            .execute(&mut *tx)
            .await?;

        // Row lock serializes concurrent transitions for this site
        let row = sqlx::query(&format!(
            "SELECT {} FROM generated_sites WHERE site_id = $1 FOR UPDATE",
            SITE_COLUMNS
        ))
        .bind(site_id)
        .fetch_one(&mut *tx)
        .await?;

        let mut site = Self::row_to_site(&row)?;
        // An Err drops `tx`, which rolls back
        fsm::apply(&mut site, event, Utc::now())?;

        sqlx::query(
            r#"
            UPDATE generated_sites
            SET status = $2, provider = $3, deployed_url = $4, deployment_id = $5,
                custom_domain = $6, last_error = $7, last_deployed_at = $8, updated_at = $9
            WHERE site_id = $1
            "#,
        )
        .bind(&site.site_id)
        .bind(site.status.as_str())
        .bind(site.provider.map(|p| p.as_str()))
        .bind(&site.deployed_url)
        .bind(&site.deployment_id)
        .bind(&site.custom_domain)
        .bind(&site.last_error)
        .bind(site.last_deployed_at)
        .bind(site.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(site)
    }

    async fn insert_log(&self, log: &DeploymentLog) -> DeployResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO generated_sites (site_id) VALUES ($1) ON CONFLICT (site_id) DO NOTHING")
            .bind(&log.site_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO deployment_logs (
                id, site_id, provider, status, started_at, completed_at,
                duration_ms, metadata, error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&log.id)
        .bind(&log.site_id)
        .bind(log.provider.as_str())
        .bind(log.status.as_str())
        .bind(log.started_at)
        .bind(log.completed_at)
        .bind(log.duration_ms)
        .bind(&log.metadata)
        .bind(&log.error_message)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn finish_log(&self, log_id: &str, completion: LogCompletion) -> DeployResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE deployment_logs
            SET status = $2, completed_at = $3, duration_ms = $4, metadata = $5, error_message = $6
            WHERE id = $1 AND status = 'started'
            "#,
        )
        .bind(log_id)
        .bind(completion.status.as_str())
        .bind(completion.completed_at)
        .bind(completion.duration_ms)
        .bind(&completion.metadata)
        .bind(&completion.error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM deployment_logs WHERE id = $1")
                .bind(log_id)
                .fetch_optional(&self.pool)
                .await?;
            if exists.is_none() {
                return Err(DeployError::NotFound(format!("deployment log {}", log_id)));
            }
        }
        Ok(())
    }

    async fn list_logs(&self, site_id: &str, limit: usize) -> DeployResult<Vec<DeploymentLog>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM deployment_logs WHERE site_id = $1 ORDER BY started_at DESC LIMIT $2",
            LOG_COLUMNS
        ))
        .bind(site_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_log).collect()
    }

    async fn ping(&self) -> DeployResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn shutdown(&self) -> DeployResult<()> {
        self.pool.close().await;
        Ok(())
    }
}
