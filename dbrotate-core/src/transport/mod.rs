/*!
Remote transport and the transfer gateway.

The transport is the external collaborator that moves bytes to the remote
host and runs commands there. The core never deals with the protocol: it
only needs `upload` and `exec`. [`TransferGateway`] builds the relay step of
a run on top of it.
*/

pub mod ssh;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::storage::partial_name;
use crate::{BackupError, Result};

pub use ssh::OpenSshTransport;

/// Directory under the remote root that receives relayed payloads before
/// they are admitted into tiers. Hidden, so it never looks like a tier.
pub const INCOMING_DIR: &str = ".incoming";

/// Access to the remote host
///
/// Every method is a single attempt; failures surface as
/// `BackupError::Transfer`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// `user@host:port`, for logs
    fn endpoint(&self) -> String;

    /// Copy a local file to a path on the remote host
    async fn upload(&self, local: &Path, remote: &Path) -> Result<()>;

    /// Run a POSIX shell command on the remote host and return its stdout
    async fn exec(&self, command: &str) -> Result<String>;
}

/// Quote a string for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Quote a remote path for a POSIX shell
pub fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Relays a locally held payload to the remote host.
pub struct TransferGateway<T: Transport> {
    transport: Arc<T>,
    remote_root: PathBuf,
}

impl<T: Transport> TransferGateway<T> {
    pub fn new<P: Into<PathBuf>>(transport: Arc<T>, remote_root: P) -> Self {
        Self {
            transport,
            remote_root: remote_root.into(),
        }
    }

    /// Remote directory relayed payloads land in
    pub fn incoming_dir(&self) -> PathBuf {
        self.remote_root.join(INCOMING_DIR)
    }

    /// Copy `payload` to the remote host
    ///
    /// The file is uploaded under a hidden temporary name and renamed once
    /// complete, so a half-transferred payload is never mistaken for a whole
    /// one. No retry and no resume.
    ///
    /// # Returns
    /// The remote path of the relayed payload
    ///
    /// # Errors
    /// `BackupError::Transfer` if any step fails
    pub async fn relay(&self, payload: &Path) -> Result<PathBuf> {
        let file_name = payload
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                BackupError::transfer(format!("payload {} has no file name", payload.display()))
            })?;

        let incoming = self.incoming_dir();
        let tmp = incoming.join(partial_name(&file_name));
        let target = incoming.join(&file_name);

        debug!(endpoint = %self.transport.endpoint(), dir = %incoming.display(), "preparing remote incoming directory");
        self.transport
            .exec(&format!("mkdir -p {}", quote_path(&incoming)))
            .await?;

        self.transport.upload(payload, &tmp).await?;
        self.transport
            .exec(&format!("mv -f {} {}", quote_path(&tmp), quote_path(&target)))
            .await?;

        info!(endpoint = %self.transport.endpoint(), remote = %target.display(), "payload relayed");
        Ok(target)
    }

    /// Remove a relayed payload once it has been admitted (or rejected)
    pub async fn discard(&self, remote: &Path) -> Result<()> {
        self.transport
            .exec(&format!("rm -f {}", quote_path(remote)))
            .await
            .map(|_| ())
    }
}
