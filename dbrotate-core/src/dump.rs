/*!
Dump production.

[`DumpSource`] is the seam to the external dump utility; [`MysqlDump`] drives
`mysqldump`. [`DumpProducer`] wraps a source into the one-artifact-per-run
contract: it stamps the capture instant, writes into the staging area,
compresses and digests the payload, and leaves nothing behind on failure.
*/

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::artifact::{Artifact, ArtifactName, PayloadFormat, TierSet};
use crate::clock::Clock;
use crate::compression::{adapter_for, CompressionAdapter};
use crate::config::{DatabaseConfig, DatabaseSelection, Secret};
use crate::storage::partial_name;
use crate::{BackupError, Result};

/// Something that can write a logical dump of a database selection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DumpSource: Send + Sync {
    /// Name of the utility, for logs
    fn describe(&self) -> String;

    /// Write a dump of `databases` to the file at `sink`
    ///
    /// # Errors
    /// `BackupError::Dump` if the utility cannot be started or exits with a
    /// failure status
    async fn dump(&self, databases: &DatabaseSelection, sink: &Path) -> Result<()>;
}

/// `mysqldump` invoked as a child process.
///
/// The password is handed over in `MYSQL_PWD` so it never shows up in the
/// process list.
#[derive(Debug, Clone)]
pub struct MysqlDump {
    binary: PathBuf,
    host: Option<String>,
    user: String,
    password: Option<Secret>,
}

impl MysqlDump {
    pub fn new(config: &DatabaseConfig) -> Self {
        Self {
            binary: PathBuf::from("mysqldump"),
            host: config.host.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        }
    }

    pub fn with_binary<P: Into<PathBuf>>(mut self, binary: P) -> Self {
        self.binary = binary.into();
        self
    }

    /// Command-line arguments for a dump of `databases`
    pub fn args(&self, databases: &DatabaseSelection) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(host) = &self.host {
            args.push("-h".to_string());
            args.push(host.clone());
        }
        args.push("-u".to_string());
        args.push(self.user.clone());
        match databases {
            DatabaseSelection::All => args.push("--all-databases".to_string()),
            DatabaseSelection::Named(names) => {
                args.push("--databases".to_string());
                args.extend(names.iter().cloned());
            }
        }
        args
    }

    fn command(&self, databases: &DatabaseSelection, sink: File) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args(self.args(databases))
            .stdin(Stdio::null())
            .stdout(Stdio::from(sink))
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(password) = &self.password {
            command.env("MYSQL_PWD", password.expose());
        }
        command
    }
}

#[async_trait]
impl DumpSource for MysqlDump {
    fn describe(&self) -> String {
        self.binary.display().to_string()
    }

    async fn dump(&self, databases: &DatabaseSelection, sink: &Path) -> Result<()> {
        let file = File::create(sink)
            .map_err(|e| BackupError::dump(format!("Failed to create {}: {e}", sink.display())))?;

        debug!(binary = %self.binary.display(), args = ?self.args(databases), "running dump utility");
        // `output()` would re-pipe stdout; waiting on the child keeps it on the sink
        let child = self
            .command(databases, file)
            .spawn()
            .map_err(|e| BackupError::dump(format!("Failed to start {}: {e}", self.binary.display())))?;
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BackupError::dump(format!("Failed to wait for {}: {e}", self.binary.display())))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if !output.status.success() {
            return Err(BackupError::dump(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                stderr
            )));
        }
        if !stderr.is_empty() {
            warn!(stderr = %stderr, "dump utility reported warnings");
        }
        Ok(())
    }
}

/// Produces exactly one artifact per call, or nothing at all.
pub struct DumpProducer<D: DumpSource, C: Clock> {
    source: D,
    clock: C,
    compressor: Arc<dyn CompressionAdapter>,
}

impl<D: DumpSource, C: Clock> DumpProducer<D, C> {
    pub fn new(source: D, clock: C, format: PayloadFormat) -> Self {
        Self {
            source,
            clock,
            compressor: Arc::from(adapter_for(format)),
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Dump `databases` into `staging_dir`
    ///
    /// The artifact's capture instant is the moment the dump was started.
    /// Its tier set is empty; the payload stays in `staging_dir` under the
    /// artifact's file name until a store admits it.
    ///
    /// # Errors
    /// `BackupError::Config` for an empty explicit selection (checked before
    /// the utility is invoked), `BackupError::Dump` for any failure of the
    /// utility or of post-processing. On error no file is left in
    /// `staging_dir`.
    pub async fn produce(&self, databases: &DatabaseSelection, staging_dir: &Path) -> Result<Artifact> {
        if let DatabaseSelection::Named(names) = databases {
            if names.is_empty() {
                return Err(BackupError::config("database list is empty"));
            }
        }

        let captured_at = self.clock.now();
        let name = ArtifactName::new(databases.set_key(), captured_at, self.compressor.format());
        let raw = staging_dir.join(partial_name(&name.file_name()));
        let payload = staging_dir.join(name.file_name());

        info!(source = %self.source.describe(), databases = %databases, "dumping");
        let started = Instant::now();
        if let Err(e) = self.source.dump(databases, &raw).await {
            discard(&raw);
            return Err(e);
        }

        debug!(compression = self.compressor.algorithm_name(), "post-processing dump");
        let compressor = Arc::clone(&self.compressor);
        let (raw_path, payload_path) = (raw.clone(), payload.clone());
        let digest = tokio::task::spawn_blocking(move || {
            compressor.compress_file(&raw_path, &payload_path)?;
            Artifact::digest_file(&payload_path).map_err(|e| {
                BackupError::dump(format!("Failed to read back {}: {e}", payload_path.display()))
            })
        })
        .await
        .map_err(|e| BackupError::dump(format!("Post-processing task failed: {e}")))
        .and_then(|result| result);

        discard(&raw);
        let (content_hash, size_bytes) = match digest {
            Ok(digest) => digest,
            Err(e) => {
                discard(&payload);
                return Err(e);
            }
        };

        info!(
            artifact = %name,
            size_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "dump complete"
        );

        Ok(Artifact {
            name,
            databases: databases.clone(),
            payload_ref: payload,
            tiers: TierSet::new(),
            size_bytes,
            content_hash,
        })
    }
}

fn discard(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove staged file"),
    }
}
