/*!
Local filesystem backend.
*/

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::{partial_name, StoreBackend, StoreKind, PARTIAL_SUFFIX};
use crate::artifact::Tier;
use crate::{BackupError, Result};

/// Tier directories under a local backup root
///
/// Entries are hard links to the staged payload when the staging area shares
/// the filesystem, so an artifact kept in several tiers occupies its bytes
/// once and those bytes disappear with the last tier entry. Across
/// filesystems the payload is copied instead.
///
/// # Example
/// ```rust,no_run
/// use dbrotate_core::storage::LocalDirBackend;
///
/// let backend = LocalDirBackend::new("/backups");
/// // tier entries live in /backups/daily, /backups/weekly, /backups/monthly
/// ```
#[derive(Debug, Clone)]
pub struct LocalDirBackend {
    root: PathBuf,
}

impl LocalDirBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the entries of `tier`
    pub fn tier_dir(&self, tier: Tier) -> PathBuf {
        self.root.join(tier.dir_name())
    }

    fn io_error(action: &str, path: &Path, e: io::Error) -> BackupError {
        BackupError::store_io(
            StoreKind::Local,
            format!("Failed to {action} {}: {e}", path.display()),
        )
    }

    async fn place(payload: &Path, tmp: &Path) -> io::Result<()> {
        match fs::hard_link(payload, tmp).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(error = %e, "hard link failed, copying payload");
                fs::copy(payload, tmp).await?;
                let file = fs::File::open(tmp).await?;
                file.sync_all().await
            }
        }
    }
}

#[async_trait]
impl StoreBackend for LocalDirBackend {
    fn kind(&self) -> StoreKind {
        StoreKind::Local
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }

    async fn list(&self, tier: Tier) -> Result<Vec<String>> {
        let dir = self.tier_dir(tier);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_error("list", &dir, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_error("list", &dir, e))?
        {
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if is_file {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    async fn install(&self, payload: &Path, tier: Tier, file_name: &str) -> Result<()> {
        let dir = self.tier_dir(tier);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| Self::io_error("create directory", &dir, e))?;

        let tmp = dir.join(partial_name(file_name));
        let target = dir.join(file_name);

        match fs::remove_file(&tmp).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Self::io_error("clear", &tmp, e)),
        }

        Self::place(payload, &tmp)
            .await
            .map_err(|e| Self::io_error("write", &tmp, e))?;

        if let Err(e) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Self::io_error("publish", &target, e));
        }

        debug!(path = %target.display(), "installed tier entry");
        Ok(())
    }

    async fn remove(&self, tier: Tier, file_name: &str) -> Result<()> {
        let path = self.tier_dir(tier).join(file_name);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error("delete", &path, e)),
        }
    }

    async fn sweep_partials(&self) -> Result<usize> {
        let mut removed = 0;
        for tier in Tier::ALL {
            for name in self.list(tier).await? {
                if name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX) {
                    self.remove(tier, &name).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}
