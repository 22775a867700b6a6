/*!
Remote backend: the local layout mirrored on the remote host, driven through
shell commands over a [`Transport`].
*/

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{partial_name, StoreBackend, StoreKind, PARTIAL_SUFFIX};
use crate::artifact::Tier;
use crate::transport::{quote_path, shell_quote, Transport};
use crate::{BackupError, Result};

/// Tier directories under a backup root on the remote host
///
/// `install` expects the payload to already be on the remote host (see
/// [`crate::transport::TransferGateway::relay`]); it hard-links it into the
/// tier directory under a hidden name and renames it into place, falling
/// back to a copy where links are not possible.
pub struct RemoteBackend<T: Transport> {
    transport: Arc<T>,
    root: PathBuf,
}

impl<T: Transport> RemoteBackend<T> {
    pub fn new<P: Into<PathBuf>>(transport: Arc<T>, root: P) -> Self {
        Self {
            transport,
            root: root.into(),
        }
    }

    pub fn tier_dir(&self, tier: Tier) -> PathBuf {
        self.root.join(tier.dir_name())
    }

    async fn run(&self, command: String) -> Result<String> {
        debug!(endpoint = %self.transport.endpoint(), %command, "remote store command");
        self.transport
            .exec(&command)
            .await
            .map_err(|e| BackupError::store_io(StoreKind::Remote, e.to_string()))
    }
}

#[async_trait]
impl<T: Transport> StoreBackend for RemoteBackend<T> {
    fn kind(&self) -> StoreKind {
        StoreKind::Remote
    }

    fn location(&self) -> String {
        format!("{}:{}", self.transport.endpoint(), self.root.display())
    }

    async fn list(&self, tier: Tier) -> Result<Vec<String>> {
        let dir = quote_path(&self.tier_dir(tier));
        let output = self
            .run(format!("if [ -d {dir} ]; then ls -1A {dir}; fi"))
            .await?;
        Ok(output
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn install(&self, payload: &Path, tier: Tier, file_name: &str) -> Result<()> {
        let dir = self.tier_dir(tier);
        let src = quote_path(payload);
        let tmp = quote_path(&dir.join(partial_name(file_name)));
        let dst = quote_path(&dir.join(file_name));
        self.run(format!(
            "mkdir -p {} && {{ ln -f {src} {tmp} 2>/dev/null || cp -f {src} {tmp}; }} && mv -f {tmp} {dst}",
            quote_path(&dir)
        ))
        .await?;
        Ok(())
    }

    async fn remove(&self, tier: Tier, file_name: &str) -> Result<()> {
        let path = quote_path(&self.tier_dir(tier).join(file_name));
        self.run(format!("rm -f {path}")).await?;
        Ok(())
    }

    async fn sweep_partials(&self) -> Result<usize> {
        let dirs: Vec<String> = Tier::ALL
            .iter()
            .map(|tier| quote_path(&self.tier_dir(*tier)))
            .collect();
        let pattern = shell_quote(&format!(".*{PARTIAL_SUFFIX}"));
        let output = self
            .run(format!(
                "for d in {}; do [ -d \"$d\" ] && find \"$d\" -maxdepth 1 -type f -name {pattern} -print -exec rm -f {{}} +; done; true",
                dirs.join(" ")
            ))
            .await?;
        Ok(output.lines().filter(|line| !line.trim().is_empty()).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn backend(transport: MockTransport) -> RemoteBackend<MockTransport> {
        RemoteBackend::new(Arc::new(transport), "/srv/backups")
    }

    #[tokio::test]
    async fn test_list_parses_lines() {
        let mut transport = MockTransport::new();
        transport.expect_endpoint().returning(|| "backup@nas:22".to_string());
        transport
            .expect_exec()
            .withf(|cmd| cmd == "if [ -d '/srv/backups/weekly' ]; then ls -1A '/srv/backups/weekly'; fi")
            .returning(|_| Ok("all_20240101T000000000Z.sql\n.all_20240108T000000000Z.sql.partial\n\n".to_string()));

        let names = backend(transport).list(Tier::Weekly).await.unwrap();
        assert_eq!(
            names,
            vec![
                "all_20240101T000000000Z.sql".to_string(),
                ".all_20240108T000000000Z.sql.partial".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_install_links_then_renames() {
        let mut transport = MockTransport::new();
        transport.expect_endpoint().returning(|| "backup@nas:22".to_string());
        transport
            .expect_exec()
            .withf(|cmd| {
                cmd.starts_with("mkdir -p '/srv/backups/daily' && ")
                    && cmd.contains("ln -f '/srv/backups/.incoming/x_20240101T000000000Z.sql' '/srv/backups/daily/.x_20240101T000000000Z.sql.partial'")
                    && cmd.ends_with("mv -f '/srv/backups/daily/.x_20240101T000000000Z.sql.partial' '/srv/backups/daily/x_20240101T000000000Z.sql'")
            })
            .times(1)
            .returning(|_| Ok(String::new()));

        backend(transport)
            .install(
                Path::new("/srv/backups/.incoming/x_20240101T000000000Z.sql"),
                Tier::Daily,
                "x_20240101T000000000Z.sql",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_transport_failure_becomes_remote_store_error() {
        let mut transport = MockTransport::new();
        transport.expect_endpoint().returning(|| "backup@nas:22".to_string());
        transport
            .expect_exec()
            .returning(|_| Err(BackupError::transfer("Permission denied (publickey)")));

        let err = backend(transport)
            .remove(Tier::Monthly, "all_20240101T000000000Z.sql")
            .await
            .unwrap_err();
        match err {
            BackupError::StoreIo { store, message } => {
                assert_eq!(store, StoreKind::Remote);
                assert!(message.contains("Permission denied"));
            }
            other => panic!("expected remote StoreIo, got {other:?}"),
        }
    }
}
