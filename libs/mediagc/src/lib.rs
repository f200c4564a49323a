//! Media cleanup sweeper.
//!
//! On a fixed interval, for each tenant with auto-delete enabled, collects
//! every media path still referenced by messages and campaigns, resolves it
//! under the media root (rejecting traversal), and deletes files older than
//! the tenant's cutoff. Deletion failures are logged and counted, never
//! fatal.

use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use omc_core::path_safety::resolve_under_root;
use omc_storage::Store;
use time::{Duration, OffsetDateTime};
use tokio::sync::watch;
use uuid::Uuid;

pub struct MediaSweeper {
    store: Store,
    media_root: PathBuf,
    interval: StdDuration,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepCounts {
    pub checked: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl MediaSweeper {
    pub fn new(store: Store, media_root: PathBuf, interval: StdDuration) -> Self {
        Self {
            store,
            media_root,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval = ?self.interval, root = %self.media_root.display(), "media cleanup sweeper started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("media cleanup sweeper stopped");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.sweep_all().await;
                }
            }
        }
    }

    async fn sweep_all(&self) {
        let orgs = match self.store.org_ids().await {
            Ok(orgs) => orgs,
            Err(err) => {
                tracing::error!(error = %err, "failed to list organizations for media cleanup");
                return;
            }
        };
        for org_id in orgs {
            if let Err(err) = self.sweep_org(org_id).await {
                tracing::error!(error = %err, org = %org_id, "media sweep failed");
            }
        }
    }

    async fn sweep_org(&self, org_id: Uuid) -> omc_core::Result<()> {
        let settings = self.store.org_settings(org_id).await?;
        if !settings.auto_delete_media_enabled || settings.auto_delete_media_days <= 0 {
            return Ok(());
        }
        let cutoff =
            OffsetDateTime::now_utc() - Duration::days(settings.auto_delete_media_days as i64);

        let mut paths = self.store.media_paths(org_id).await?;
        paths.extend(self.store.campaign_media_paths(org_id).await?);
        paths.sort();
        paths.dedup();

        let counts = sweep_paths(&self.media_root, &paths, cutoff).await;
        if counts.deleted > 0 || counts.errors > 0 {
            tracing::info!(
                org = %org_id,
                checked = counts.checked,
                deleted = counts.deleted,
                errors = counts.errors,
                "media cleanup completed"
            );
        }
        Ok(())
    }
}

/// Deletes referenced files under `root` whose mtime is older than `cutoff`.
/// Paths that traverse out of the root, are missing, or are directories are
/// skipped.
pub async fn sweep_paths(root: &Path, paths: &[String], cutoff: OffsetDateTime) -> SweepCounts {
    let mut counts = SweepCounts::default();
    for raw in paths {
        counts.checked += 1;
        let resolved = match resolve_under_root(root, raw) {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(path = %raw, error = %err, "skipping suspicious media path");
                counts.skipped += 1;
                continue;
            }
        };

        let metadata = match tokio::fs::metadata(&resolved).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                counts.skipped += 1;
                continue;
            }
            Err(err) => {
                tracing::warn!(path = %resolved.display(), error = %err, "stat failed");
                counts.errors += 1;
                continue;
            }
        };
        if metadata.is_dir() {
            counts.skipped += 1;
            continue;
        }
        let modified = match metadata.modified() {
            Ok(modified) => OffsetDateTime::from(modified),
            Err(_) => {
                counts.skipped += 1;
                continue;
            }
        };
        if modified > cutoff {
            counts.skipped += 1;
            continue;
        }

        match tokio::fs::remove_file(&resolved).await {
            Ok(()) => counts.deleted += 1,
            Err(err) => {
                tracing::warn!(path = %resolved.display(), error = %err, "failed to delete media file");
                counts.errors += 1;
            }
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deletes_only_aged_files_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir(root.join("org")).unwrap();
        std::fs::write(root.join("org/old.jpg"), b"x").unwrap();
        std::fs::write(root.join("org/also-old.jpg"), b"x").unwrap();

        // cutoff in the future: everything on disk counts as aged
        let cutoff = OffsetDateTime::now_utc() + Duration::hours(1);
        let paths = vec![
            "org/old.jpg".to_string(),
            "org/also-old.jpg".to_string(),
            "org/missing.jpg".to_string(),
            "../escape.jpg".to_string(),
            "org".to_string(),
        ];
        let counts = sweep_paths(root, &paths, cutoff).await;

        assert_eq!(counts.deleted, 2);
        assert_eq!(counts.checked, 5);
        assert!(!root.join("org/old.jpg").exists());
    }

    #[tokio::test]
    async fn fresh_files_survive() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("fresh.jpg"), b"x").unwrap();

        let cutoff = OffsetDateTime::now_utc() - Duration::days(30);
        let counts = sweep_paths(root, &["fresh.jpg".to_string()], cutoff).await;

        assert_eq!(counts.deleted, 0);
        assert_eq!(counts.skipped, 1);
        assert!(root.join("fresh.jpg").exists());
    }

    #[tokio::test]
    async fn traversal_is_rejected_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::NamedTempFile::new().unwrap();
        let raw = format!("../{}", outside.path().file_name().unwrap().to_string_lossy());

        let cutoff = OffsetDateTime::now_utc() + Duration::hours(1);
        let counts = sweep_paths(dir.path(), &[raw], cutoff).await;

        assert_eq!(counts.deleted, 0);
        assert_eq!(counts.skipped, 1);
        assert!(outside.path().exists());
    }
}
