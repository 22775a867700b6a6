/*!
Run orchestration.

One run walks a fixed state machine:

```text
Init -> Dumping -> LocalAdmit -> Transferring -> RemoteAdmit -> Done
  \________\__________\______________________________________-> Failed
```

`LocalAdmit` is skipped with `skip_local`, `Transferring`/`RemoteAdmit` with
`skip_remote`. Only configuration, lock, dump and local store errors are
fatal. Transfer and remote store errors end the run in `Done` with a
warning, and the local outcome is never rolled back.
*/

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::artifact::Artifact;
use crate::clock::Clock;
use crate::config::{BackupConfig, RemoteConfig};
use crate::dump::{DumpProducer, DumpSource};
use crate::lock::RunLock;
use crate::retention::{EvictionReport, RetentionStore};
use crate::storage::{LocalDirBackend, RemoteBackend, StoreBackend, StoreKind};
use crate::transport::{TransferGateway, Transport};
use crate::{BackupError, Result};

/// Prefix of the per-run staging directory inside the local root
pub const STAGING_PREFIX: &str = ".staging-";

/// States of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    Dumping,
    LocalAdmit,
    Transferring,
    RemoteAdmit,
    Done,
    Failed,
}

impl RunState {
    /// Whether the machine may move from `self` to `next`
    pub fn can_transition(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Init, Dumping)
                | (Init, Failed)
                | (Dumping, LocalAdmit)
                | (Dumping, Transferring)
                | (Dumping, Failed)
                | (LocalAdmit, Transferring)
                | (LocalAdmit, Done)
                | (LocalAdmit, Failed)
                | (Transferring, RemoteAdmit)
                | (Transferring, Done)
                | (RemoteAdmit, Done)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Init => "init",
            RunState::Dumping => "dumping",
            RunState::LocalAdmit => "local_admit",
            RunState::Transferring => "transferring",
            RunState::RemoteAdmit => "remote_admit",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A non-fatal problem surfaced by a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum RunWarning {
    /// The payload could not be relayed to the remote host
    Transfer(String),
    /// The remote store could not admit or prune
    RemoteStore(String),
    /// Temporary files could not be cleaned up
    Cleanup(String),
}

impl fmt::Display for RunWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunWarning::Transfer(m) => write!(f, "transfer: {m}"),
            RunWarning::RemoteStore(m) => write!(f, "remote store: {m}"),
            RunWarning::Cleanup(m) => write!(f, "cleanup: {m}"),
        }
    }
}

/// What a run did to one store.
#[derive(Debug, Clone, Serialize)]
pub struct StoreOutcome {
    pub store: StoreKind,
    pub location: String,
    #[serde(flatten)]
    pub report: EvictionReport,
}

/// Result of a run that reached `Done`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: RunState,
    pub artifact: Artifact,
    /// `None` when the local store was skipped
    pub local: Option<StoreOutcome>,
    /// `None` when the remote store was skipped or not reached
    pub remote: Option<StoreOutcome>,
    pub warnings: Vec<RunWarning>,
}

impl RunReport {
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Tracks the current state and logs every transition.
#[derive(Debug)]
struct Progress {
    state: RunState,
}

impl Progress {
    fn new() -> Self {
        Self {
            state: RunState::Init,
        }
    }

    fn advance(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_transition(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        info!(from = %self.state, to = %next, "state transition");
        self.state = next;
    }

    fn fail(&mut self, err: BackupError) -> BackupError {
        error!(state = %self.state, kind = err.kind(), error = %err, "run failed");
        self.advance(RunState::Failed);
        #[cfg(feature = "metrics")]
        if let Some(metrics) = crate::observability::BackupMetrics::global() {
            metrics.record_failure();
        }
        err
    }
}

/// Sequences dump, local admission, transfer and remote admission.
pub struct Orchestrator<D: DumpSource, T: Transport, C: Clock> {
    config: BackupConfig,
    producer: DumpProducer<D, C>,
    transport: Option<Arc<T>>,
}

impl<D: DumpSource, T: Transport, C: Clock> Orchestrator<D, T, C> {
    /// # Arguments
    /// * `config` - Run configuration; validated when the run starts
    /// * `source` - Dump utility
    /// * `transport` - Remote access; required unless `skip_remote` is set
    /// * `clock` - Source of capture timestamps
    pub fn new(config: BackupConfig, source: D, transport: Option<Arc<T>>, clock: C) -> Self {
        let format = config.payload_format();
        Self {
            producer: DumpProducer::new(source, clock, format),
            config,
            transport,
        }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Perform one backup run
    ///
    /// # Returns
    /// The run report once the run reaches `Done`, possibly with warnings
    ///
    /// # Errors
    /// The fatal error that moved the run to `Failed`
    pub async fn run(&self) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunReport> {
        let mut progress = Progress::new();
        let started_at = self.producer.clock().now();
        #[cfg(feature = "metrics")]
        if let Some(metrics) = crate::observability::BackupMetrics::global() {
            metrics.record_run();
        }

        // Init
        if let Err(e) = self.config.validate() {
            return Err(progress.fail(e));
        }
        let remote = match self.remote_parts() {
            Ok(remote) => remote,
            Err(e) => return Err(progress.fail(e)),
        };

        let local_dir = self.config.local_dir.as_path();
        let _lock = match RunLock::acquire(local_dir, &run_id.to_string()) {
            Ok(lock) => lock,
            Err(e) => return Err(progress.fail(e)),
        };
        let mut warnings = Vec::new();
        sweep_staging(local_dir, &mut warnings);

        let staging = match tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(local_dir)
        {
            Ok(dir) => dir,
            Err(e) => return Err(progress.fail(e.into())),
        };

        // Dumping
        progress.advance(RunState::Dumping);
        let dump_started = std::time::Instant::now();
        let artifact = match self
            .producer
            .produce(&self.config.database.databases, staging.path())
            .await
        {
            Ok(artifact) => artifact,
            Err(e) => return Err(progress.fail(e)),
        };
        #[cfg(feature = "metrics")]
        if let Some(metrics) = crate::observability::BackupMetrics::global() {
            metrics.record_dump(artifact.size_bytes, dump_started.elapsed());
        }
        #[cfg(not(feature = "metrics"))]
        let _ = dump_started;

        // LocalAdmit
        let mut local = None;
        if !self.config.skip_local {
            progress.advance(RunState::LocalAdmit);
            let backend = LocalDirBackend::new(local_dir);
            match self.admit(backend, &artifact).await {
                Ok(outcome) => local = Some(outcome),
                Err(e) => return Err(progress.fail(e)),
            }
        } else {
            info!("local store skipped");
        }

        // Transferring / RemoteAdmit
        let mut remote_outcome = None;
        if let Some((transport, remote)) = remote {
            progress.advance(RunState::Transferring);
            remote_outcome = self
                .relay_and_admit(&mut progress, transport, remote, &artifact, &mut warnings)
                .await;
        } else {
            info!("remote store skipped");
        }

        progress.advance(RunState::Done);
        if let Err(e) = staging.close() {
            warnings.push(RunWarning::Cleanup(format!("failed to remove staging directory: {e}")));
        }

        let finished_at = self.producer.clock().now();
        for warning in &warnings {
            warn!(%warning, "run finished with warning");
        }
        info!(
            artifact = %artifact.name,
            size_bytes = artifact.size_bytes,
            warnings = warnings.len(),
            "run complete"
        );
        #[cfg(feature = "metrics")]
        if let Some(metrics) = crate::observability::BackupMetrics::global() {
            metrics.record_success(finished_at);
        }

        Ok(RunReport {
            run_id,
            started_at,
            finished_at,
            state: progress.state,
            artifact,
            local,
            remote: remote_outcome,
            warnings,
        })
    }

    fn remote_parts(&self) -> Result<Option<(Arc<T>, &RemoteConfig)>> {
        if self.config.skip_remote {
            return Ok(None);
        }
        let remote = self
            .config
            .remote
            .as_ref()
            .ok_or_else(|| BackupError::config("remote host settings are required unless skip_remote is set"))?;
        let transport = self
            .transport
            .clone()
            .ok_or_else(|| BackupError::config("no transport configured for the remote store"))?;
        Ok(Some((transport, remote)))
    }

    /// Open a store, sweep its leftovers, classify and admit
    async fn admit<B: StoreBackend>(&self, backend: B, artifact: &Artifact) -> Result<StoreOutcome> {
        let mut store = RetentionStore::open(
            backend,
            self.config.retention,
            self.config.database.databases.set_key(),
        )
        .await?;
        store.sweep_partials().await?;

        let tiers = store.classify(artifact.captured_at());
        info!(store = %store.kind(), %tiers, "classified");
        let report = store.admit(artifact, &tiers).await?;

        #[cfg(feature = "metrics")]
        if let Some(metrics) = crate::observability::BackupMetrics::global() {
            metrics.record_evictions(&store.kind().to_string(), report.evicted.len());
        }

        Ok(StoreOutcome {
            store: store.kind(),
            location: store.backend().location(),
            report,
        })
    }

    async fn relay_and_admit(
        &self,
        progress: &mut Progress,
        transport: Arc<T>,
        remote: &RemoteConfig,
        artifact: &Artifact,
        warnings: &mut Vec<RunWarning>,
    ) -> Option<StoreOutcome> {
        let gateway = TransferGateway::new(transport.clone(), &remote.dir);
        let relayed = match gateway.relay(&artifact.payload_ref).await {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "transfer failed, local backup kept");
                #[cfg(feature = "metrics")]
                if let Some(metrics) = crate::observability::BackupMetrics::global() {
                    metrics.record_transfer_failure();
                }
                warnings.push(RunWarning::Transfer(e.to_string()));
                return None;
            }
        };

        progress.advance(RunState::RemoteAdmit);
        let remote_artifact = Artifact {
            payload_ref: relayed.clone(),
            ..artifact.clone()
        };
        let backend = RemoteBackend::new(transport, &remote.dir);
        let outcome = match self.admit(backend, &remote_artifact).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(error = %e, "remote admission failed");
                warnings.push(RunWarning::RemoteStore(e.to_string()));
                None
            }
        };

        if let Err(e) = gateway.discard(&relayed).await {
            warnings.push(RunWarning::Cleanup(format!(
                "failed to remove relayed copy {}: {e}",
                relayed.display()
            )));
        }
        outcome
    }
}

/// Remove staging directories left by interrupted runs
///
/// Only called while holding the run lock, so no live run owns them.
fn sweep_staging(local_dir: &Path, warnings: &mut Vec<RunWarning>) {
    let entries = match std::fs::read_dir(local_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warnings.push(RunWarning::Cleanup(format!("failed to scan {}: {e}", local_dir.display())));
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let is_staging = name.to_string_lossy().starts_with(STAGING_PREFIX)
            && entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_staging {
            continue;
        }
        match std::fs::remove_dir_all(entry.path()) {
            Ok(()) => warn!(path = %entry.path().display(), "removed staging area of an interrupted run"),
            Err(e) => warnings.push(RunWarning::Cleanup(format!(
                "failed to remove {}: {e}",
                entry.path().display()
            ))),
        }
    }
}
