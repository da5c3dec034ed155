//! Remote object storage
//!
//! The shared copy of the data directory lives behind [`RemoteStorage`]:
//! a plain directory tree (network share, mounted bucket) or, with the
//! `native_s3` feature, an S3-compatible bucket.

mod filesystem;
mod remote;

#[cfg(feature = "native_s3")]
pub mod native_s3;

pub use filesystem::*;
pub use remote::*;

use crate::config::{RemoteKind, RemoteSettings};
use crate::error::{Result, TableSyncError};
use std::sync::Arc;

/// Build the configured remote storage backend
pub async fn from_settings(settings: &RemoteSettings) -> Result<Arc<dyn RemoteStorage>> {
    match settings.kind {
        RemoteKind::Filesystem => {
            let root = settings.root.clone().ok_or_else(|| {
                TableSyncError::config("filesystem remote requires 'root'")
            })?;
            let prefix = settings.key_prefix();
            let root = if prefix.is_empty() { root } else { root.join(prefix.trim_end_matches('/')) };
            Ok(Arc::new(FilesystemStorage::new(root)))
        }
        #[cfg(feature = "native_s3")]
        RemoteKind::S3 => Ok(Arc::new(native_s3::S3Storage::new(settings).await?)),
        #[cfg(not(feature = "native_s3"))]
        RemoteKind::S3 => Err(TableSyncError::config(
            "S3 remote requires building with the 'native_s3' feature",
        )),
    }
}
