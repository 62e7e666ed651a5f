//! Finite State Machine for site deployment status

use chrono::{DateTime, Utc};

use crate::errors::DeployError;
use crate::models::job::ProviderKind;
use crate::models::site::{Site, SiteStatus};

/// Site event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteEvent {
    /// An orchestration attempt started
    Build,

    /// The provider accepted the bundle
    Succeed {
        provider: ProviderKind,
        deployed_url: String,
        deployment_id: String,
    },

    /// The job ended without a live deployment
    Fail { error: String },

    /// Custom domain intent recorded for the live deployment
    AttachDomain {
        domain: String,
        provider: ProviderKind,
    },

    /// Site removed by its owner
    Delete,
}

impl SiteEvent {
    fn name(&self) -> &'static str {
        match self {
            SiteEvent::Build => "build",
            SiteEvent::Succeed { .. } => "succeed",
            SiteEvent::Fail { .. } => "fail",
            SiteEvent::AttachDomain { .. } => "attach_domain",
            SiteEvent::Delete => "delete",
        }
    }
}

/// Apply an event to a site, enforcing the status lifecycle.
///
/// `Deleted` is absorbing: every event other than a repeated delete is
/// rejected with [`DeployError::SiteDeleted`]. A live site always carries a
/// URL and a failed or deleted site never does.
pub fn apply(site: &mut Site, event: SiteEvent, now: DateTime<Utc>) -> Result<(), DeployError> {
    if site.status == SiteStatus::Deleted {
        return match event {
            SiteEvent::Delete => Ok(()),
            _ => Err(DeployError::SiteDeleted(site.site_id.clone())),
        };
    }

    let new_status = match (site.status, event) {
        // Any live state can be rebuilt
        (_, SiteEvent::Build) => {
            site.last_error = None;
            SiteStatus::Building
        }

        (SiteStatus::Building | SiteStatus::Live, SiteEvent::Succeed {
            provider,
            deployed_url,
            deployment_id,
        }) => {
            if deployed_url.is_empty() {
                return Err(DeployError::InvalidTransition(format!(
                    "site {} cannot go live without a URL",
                    site.site_id
                )));
            }
            site.provider = Some(provider);
            site.deployed_url = Some(deployed_url);
            site.deployment_id = Some(deployment_id);
            site.last_deployed_at = Some(now);
            site.last_error = None;
            SiteStatus::Live
        }

        (SiteStatus::Pending | SiteStatus::Building, SiteEvent::Fail { error }) => {
            site.deployed_url = None;
            site.deployment_id = None;
            site.last_error = Some(error);
            SiteStatus::DeploymentFailed
        }

        (SiteStatus::Live, SiteEvent::AttachDomain { domain, provider }) => {
            site.custom_domain = Some(domain);
            site.provider = Some(provider);
            SiteStatus::Live
        }

        (_, SiteEvent::Delete) => {
            site.deployed_url = None;
            site.deployment_id = None;
            SiteStatus::Deleted
        }

        // Invalid transitions
        (status, event) => {
            return Err(DeployError::InvalidTransition(format!(
                "site {}: {} -> {}",
                site.site_id,
                status,
                event.name()
            )));
        }
    };

    site.status = new_status;
    site.updated_at = now;
    Ok(())
}
