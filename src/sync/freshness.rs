//! Local versus remote freshness

use crate::error::{IoResultExt, Result, TableSyncError};
use crate::storage::RemoteStorage;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;
use std::path::Path;

/// Clock skew tolerated between the local and remote timestamps
pub const FRESHNESS_TOLERANCE_SECS: i64 = 60;

/// Which copy is more recent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessState {
    /// Local copy is newer beyond the tolerance
    LocalNewer,
    /// Remote copy is newer beyond the tolerance
    CloudNewer,
    /// Timestamps agree within the tolerance
    UpToDate,
    /// Neither timestamp is known
    Unknown,
}

impl fmt::Display for FreshnessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LocalNewer => "local_newer",
            Self::CloudNewer => "cloud_newer",
            Self::UpToDate => "up_to_date",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Compares modification times with a skew tolerance
#[derive(Debug, Clone)]
pub struct FreshnessComparator {
    tolerance: Duration,
}

impl Default for FreshnessComparator {
    fn default() -> Self {
        Self {
            tolerance: Duration::seconds(FRESHNESS_TOLERANCE_SECS),
        }
    }
}

impl FreshnessComparator {
    /// Comparator with a custom tolerance
    pub fn with_tolerance(tolerance: Duration) -> Self {
        Self { tolerance }
    }

    /// Compare the local and remote modification times.
    ///
    /// A missing side is older than any known side; the difference
    /// `local - cloud` must exceed the tolerance in either direction to
    /// pick a winner.
    pub fn compare(
        &self,
        local: Option<DateTime<Utc>>,
        cloud: Option<DateTime<Utc>>,
    ) -> FreshnessState {
        match (local, cloud) {
            (None, None) => FreshnessState::Unknown,
            (Some(_), None) => FreshnessState::LocalNewer,
            (None, Some(_)) => FreshnessState::CloudNewer,
            (Some(local), Some(cloud)) => {
                let diff = local - cloud;
                if diff > self.tolerance {
                    FreshnessState::LocalNewer
                } else if diff < -self.tolerance {
                    FreshnessState::CloudNewer
                } else {
                    FreshnessState::UpToDate
                }
            }
        }
    }
}

/// Existence and freshness of the local store against its remote copy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncMetadata {
    /// Local file exists
    pub local_exists: bool,
    /// Remote object exists
    pub cloud_exists: bool,
    /// Local modification time
    pub local_modified: Option<DateTime<Utc>>,
    /// Remote modification time
    pub cloud_modified: Option<DateTime<Utc>>,
    /// Comparison result
    pub freshness_state: FreshnessState,
}

impl SyncMetadata {
    /// Inspect `local_path` and the remote object `key`
    pub async fn gather(
        local_path: &Path,
        remote: &dyn RemoteStorage,
        key: &str,
        comparator: &FreshnessComparator,
    ) -> Result<Self> {
        let local_modified = match tokio::fs::metadata(local_path).await {
            Ok(meta) if meta.is_file() => Some(
                meta.modified()
                    .map(DateTime::<Utc>::from)
                    .with_path(local_path)?,
            ),
            Ok(_) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(TableSyncError::io(local_path, e)),
        };
        let local_exists = local_modified.is_some();

        let remote_meta = remote.get_metadata(key).await?;
        let cloud_exists = remote_meta.is_some();
        let cloud_modified = remote_meta.and_then(|m| m.updated_at);

        let freshness_state = comparator.compare(local_modified, cloud_modified);
        tracing::debug!(
            "Freshness of {}: local={:?} remote={:?} -> {}",
            local_path.display(),
            local_modified,
            cloud_modified,
            freshness_state
        );

        Ok(Self {
            local_exists,
            cloud_exists,
            local_modified,
            cloud_modified,
            freshness_state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FilesystemStorage;
    use filetime::FileTime;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_compare_table() {
        let c = FreshnessComparator::default();
        let t = t0();
        assert_eq!(c.compare(Some(t), Some(t)), FreshnessState::UpToDate);
        assert_eq!(
            c.compare(Some(t + Duration::seconds(61)), Some(t)),
            FreshnessState::LocalNewer
        );
        assert_eq!(
            c.compare(Some(t - Duration::seconds(61)), Some(t)),
            FreshnessState::CloudNewer
        );
        assert_eq!(c.compare(None, Some(t)), FreshnessState::CloudNewer);
        assert_eq!(c.compare(Some(t), None), FreshnessState::LocalNewer);
        assert_eq!(c.compare(None, None), FreshnessState::Unknown);
    }

    #[test]
    fn test_tolerance_is_inclusive() {
        let c = FreshnessComparator::default();
        let t = t0();
        assert_eq!(
            c.compare(Some(t + Duration::seconds(60)), Some(t)),
            FreshnessState::UpToDate
        );
        assert_eq!(
            c.compare(Some(t - Duration::seconds(60)), Some(t)),
            FreshnessState::UpToDate
        );
    }

    proptest! {
        #[test]
        fn prop_within_band_is_up_to_date(offset in -60i64..=60) {
            let c = FreshnessComparator::default();
            let t = t0();
            prop_assert_eq!(
                c.compare(Some(t + Duration::seconds(offset)), Some(t)),
                FreshnessState::UpToDate
            );
        }

        #[test]
        fn prop_outside_band_picks_newer(offset in 61i64..1_000_000) {
            let c = FreshnessComparator::default();
            let t = t0();
            prop_assert_eq!(
                c.compare(Some(t + Duration::seconds(offset)), Some(t)),
                FreshnessState::LocalNewer
            );
            prop_assert_eq!(
                c.compare(Some(t), Some(t + Duration::seconds(offset))),
                FreshnessState::CloudNewer
            );
        }
    }

    #[tokio::test]
    async fn test_gather_uses_file_times() {
        let local = tempdir().unwrap();
        let remote_dir = tempdir().unwrap();
        let remote = FilesystemStorage::new(remote_dir.path());

        let db = local.path().join("tablesync.db");
        std::fs::write(&db, b"local").unwrap();
        std::fs::write(remote_dir.path().join("tablesync.db"), b"remote").unwrap();

        let now = FileTime::from_unix_time(1_700_000_000, 0);
        let later = FileTime::from_unix_time(1_700_000_600, 0);
        filetime::set_file_mtime(&db, now).unwrap();
        filetime::set_file_mtime(remote_dir.path().join("tablesync.db"), later).unwrap();

        let meta = SyncMetadata::gather(&db, &remote, "tablesync.db", &FreshnessComparator::default())
            .await
            .unwrap();
        assert!(meta.local_exists);
        assert!(meta.cloud_exists);
        assert_eq!(meta.freshness_state, FreshnessState::CloudNewer);

        let missing = SyncMetadata::gather(
            &local.path().join("absent.db"),
            &remote,
            "absent.db",
            &FreshnessComparator::default(),
        )
        .await
        .unwrap();
        assert!(!missing.local_exists);
        assert_eq!(missing.freshness_state, FreshnessState::Unknown);
    }
}
