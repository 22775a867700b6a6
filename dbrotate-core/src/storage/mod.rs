/*!
Storage backends for retention stores.

A backend is the physical side of a retention store: one directory per tier
under a root, each holding artifact files. The store logic in
[`crate::retention`] only sees this trait, so the directory listing could be
replaced by an explicit index without touching the classifier or the
orchestrator.
*/

pub mod local;
pub mod remote;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::artifact::Tier;
use crate::Result;

pub use local::LocalDirBackend;
pub use remote::RemoteBackend;

/// Suffix of the hidden temporary a tier entry is written to before it is
/// renamed into place.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Name of the hidden temporary used while installing `file_name`
pub fn partial_name(file_name: &str) -> String {
    format!(".{file_name}{PARTIAL_SUFFIX}")
}

/// Which retention domain a store or error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Local,
    Remote,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Local => f.write_str("local"),
            StoreKind::Remote => f.write_str("remote"),
        }
    }
}

/// Physical storage of tier directories
///
/// Implementations must make `install` atomic from the point of view of
/// `list`: an entry is either absent or complete, never partially written.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Which store this backend serves
    fn kind(&self) -> StoreKind;

    /// Human-readable location, for logs
    fn location(&self) -> String;

    /// File names present in the tier directory
    ///
    /// A missing tier directory is an empty tier, not an error.
    async fn list(&self, tier: Tier) -> Result<Vec<String>>;

    /// Make `payload` available as `file_name` inside `tier`
    async fn install(&self, payload: &Path, tier: Tier, file_name: &str) -> Result<()>;

    /// Delete `file_name` from `tier`; deleting a missing entry succeeds
    async fn remove(&self, tier: Tier, file_name: &str) -> Result<()>;

    /// Delete temporaries left behind by interrupted installs
    ///
    /// # Returns
    /// The number of temporaries removed
    async fn sweep_partials(&self) -> Result<usize>;
}

/// Memory-based backend for testing
///
/// Tracks which file names exist in which tier and counts writes, without
/// touching the filesystem.
#[cfg(test)]
pub struct MemoryBackend {
    kind: StoreKind,
    files: std::sync::Mutex<std::collections::BTreeMap<Tier, std::collections::BTreeSet<String>>>,
    installs: std::sync::atomic::AtomicUsize,
    fail_installs: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MemoryBackend {
    pub fn new(kind: StoreKind) -> Self {
        Self {
            kind,
            files: std::sync::Mutex::new(std::collections::BTreeMap::new()),
            installs: std::sync::atomic::AtomicUsize::new(0),
            fail_installs: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Seed a file as if an earlier run had installed it
    pub fn seed(&self, tier: Tier, file_name: &str) {
        self.files
            .lock()
            .unwrap()
            .entry(tier)
            .or_default()
            .insert(file_name.to_string());
    }

    pub fn files(&self, tier: Tier) -> Vec<String> {
        self.files
            .lock()
            .unwrap()
            .get(&tier)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `file_name` is present in any tier
    pub fn holds(&self, file_name: &str) -> bool {
        self.files
            .lock()
            .unwrap()
            .values()
            .any(|set| set.contains(file_name))
    }

    pub fn install_count(&self) -> usize {
        self.installs.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn fail_installs(&self, fail: bool) {
        self.fail_installs
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
#[async_trait]
impl StoreBackend for MemoryBackend {
    fn kind(&self) -> StoreKind {
        self.kind
    }

    fn location(&self) -> String {
        format!("memory:{}", self.kind)
    }

    async fn list(&self, tier: Tier) -> Result<Vec<String>> {
        Ok(self.files(tier))
    }

    async fn install(&self, _payload: &Path, tier: Tier, file_name: &str) -> Result<()> {
        if self.fail_installs.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(crate::BackupError::store_io(self.kind, "disk full"));
        }
        self.installs
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.seed(tier, file_name);
        Ok(())
    }

    async fn remove(&self, tier: Tier, file_name: &str) -> Result<()> {
        if let Some(set) = self.files.lock().unwrap().get_mut(&tier) {
            set.remove(file_name);
        }
        Ok(())
    }

    async fn sweep_partials(&self) -> Result<usize> {
        let mut files = self.files.lock().unwrap();
        let mut removed = 0;
        for set in files.values_mut() {
            let before = set.len();
            set.retain(|name| !name.ends_with(PARTIAL_SUFFIX));
            removed += before - set.len();
        }
        Ok(removed)
    }
}
