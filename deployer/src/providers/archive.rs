//! Bundle archives.
//!
//! A bundle directory is packed into a gzip-compressed tar written to a named
//! temp file. The file is removed when the [`BundleArchive`] is dropped, so
//! every exit path of an upload cleans up after itself.

use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;
use tokio::task::spawn_blocking;
use tracing::debug;

use crate::errors::{DeployError, DeployResult};
use crate::utils::sha256_hex;

/// A packed bundle ready for upload
#[derive(Debug)]
pub struct BundleArchive {
    file: NamedTempFile,
    /// Hex SHA-256 of the compressed archive
    pub sha256: String,
    /// Compressed size in bytes
    pub size: u64,
}

impl BundleArchive {
    /// Pack `dir` into a new archive
    pub async fn create(dir: &Path) -> DeployResult<Self> {
        let dir = dir.to_owned();
        spawn_blocking(move || Self::create_sync(&dir))
            .await
            .map_err(|e| DeployError::Internal(format!("archive task failed: {}", e)))?
    }

    fn create_sync(dir: &Path) -> DeployResult<Self> {
        if !dir.is_dir() {
            return Err(DeployError::ValidationError(format!(
                "bundle is not a directory: {}",
                dir.display()
            )));
        }

        let file = tempfile::Builder::new()
            .prefix("bundle-")
            .suffix(".tar.gz")
            .tempfile()?;

        let encoder = GzEncoder::new(file.as_file().try_clone()?, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        builder.append_dir_all(".", dir)?;
        builder.into_inner()?.finish()?;

        let data = std::fs::read(file.path())?;
        let archive = Self {
            sha256: sha256_hex(&data),
            size: data.len() as u64,
            file,
        };
        debug!(path = %archive.path().display(), size = archive.size, "Created bundle archive");
        Ok(archive)
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Archive contents for the request body
    pub async fn read(&self) -> DeployResult<Vec<u8>> {
        Ok(tokio::fs::read(self.file.path()).await?)
    }
}
