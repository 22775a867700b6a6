/*!
# dbrotate core

Scheduled database dumps with daily, weekly and monthly retention on a local
backup root and, optionally, a remote host reached over SSH.

A run produces one artifact with the external dump utility, files it into
the tiers of the local store, relays it to the remote host and files it into
the tiers of the remote store. Each store keeps at most the configured number
of members per tier and deletes a payload once no tier references it.

## Architecture

- [`dump`], [`transport`] and [`storage`] are the adapters to the outside
  world: `mysqldump`, `ssh`/`scp` and tier directories.
- [`classifier`] and [`retention`] hold the tier rules and know nothing about
  processes or filesystems.
- [`orchestrator`] sequences a run and decides which failures are fatal.

## Usage

```rust,no_run
use std::sync::Arc;
use dbrotate_core::{
    BackupConfig, DatabaseSelection, MysqlDump, Orchestrator, OpenSshTransport, SystemClock,
};

# async fn run() -> dbrotate_core::Result<()> {
let mut config = BackupConfig::new(DatabaseSelection::parse("shop billing")?);
config.skip_remote = true;

let dumper = MysqlDump::new(&config.database);
let orchestrator = Orchestrator::<_, OpenSshTransport, _>::new(config, dumper, None, SystemClock);
let report = orchestrator.run().await?;
println!("stored {}", report.artifact.file_name());
# Ok(())
# }
```
*/

pub mod artifact;
pub mod classifier;
pub mod clock;
pub mod compression;
pub mod config;
pub mod dump;
pub mod error;
pub mod lock;
pub mod observability;
pub mod orchestrator;
pub mod retention;
pub mod storage;
pub mod transport;


pub use artifact::{Artifact, ArtifactName, PayloadFormat, Tier, TierSet};
pub use classifier::classify;
pub use clock::{Clock, FixedClock, SystemClock};
pub use compression::{CompressionAdapter, GzipCompressor};
pub use config::{
    BackupConfig, Credential, DatabaseConfig, DatabaseSelection, RemoteConfig, RetentionPolicy, Secret,
};
pub use dump::{DumpProducer, DumpSource, MysqlDump};
pub use error::{BackupError, Result};
pub use lock::RunLock;
pub use observability::{init_observability, LogFormat};
pub use orchestrator::{Orchestrator, RunReport, RunState, RunWarning, StoreOutcome};
pub use retention::{EvictionReport, Inventory, RetentionStore};
pub use storage::{LocalDirBackend, RemoteBackend, StoreBackend, StoreKind};
pub use transport::{OpenSshTransport, TransferGateway, Transport};

#[cfg(feature = "metrics")]
pub use observability::BackupMetrics;
