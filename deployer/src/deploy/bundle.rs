//! Bundle validation

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::task::spawn_blocking;

use crate::errors::{DeployError, DeployResult};

/// Entry file every bundle must contain
pub const DEFAULT_ENTRY_POINT: &str = "index.html";

/// Size facts recorded with each attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleSummary {
    pub file_count: u64,
    pub total_bytes: u64,
}

/// Check that `dir` is a directory holding `entry_point`, and summarize it.
/// Failures are [`DeployError::ValidationError`] and never touch a provider.
pub async fn validate_bundle(dir: &Path, entry_point: &str) -> DeployResult<BundleSummary> {
    let dir = dir.to_owned();
    let entry_point = entry_point.to_string();
    spawn_blocking(move || validate_sync(&dir, &entry_point))
        .await
        .map_err(|e| DeployError::Internal(format!("bundle validation task failed: {}", e)))?
}

fn validate_sync(dir: &Path, entry_point: &str) -> DeployResult<BundleSummary> {
    if !dir.is_dir() {
        return Err(DeployError::ValidationError(format!(
            "bundle path is not a directory: {}",
            dir.display()
        )));
    }
    if !dir.join(entry_point).is_file() {
        return Err(DeployError::ValidationError(format!(
            "bundle is missing {}: {}",
            entry_point,
            dir.display()
        )));
    }

    let mut summary = BundleSummary::default();
    let mut stack: Vec<PathBuf> = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            // Symlinks are not followed
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                summary.file_count += 1;
                summary.total_bytes += entry.metadata()?.len();
            }
        }
    }
    Ok(summary)
}
