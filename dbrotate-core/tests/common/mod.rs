/*!
Shared fixtures for the pipeline tests: a transport that runs the remote
commands on this machine, and a dump source that writes fixed content.
*/

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dbrotate_core::{
    BackupConfig, BackupError, Credential, DatabaseSelection, DumpSource, RemoteConfig, Result,
    RetentionPolicy, Transport,
};

/// Runs "remote" commands with the local `sh`, against local paths.
#[derive(Debug, Default)]
pub struct LocalShellTransport {
    pub uploads: AtomicUsize,
}

#[async_trait]
impl Transport for LocalShellTransport {
    fn endpoint(&self) -> String {
        "local-shell".to_string()
    }

    async fn upload(&self, local: &Path, remote: &Path) -> Result<()> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        tokio::fs::copy(local, remote)
            .await
            .map(|_| ())
            .map_err(|e| BackupError::transfer(format!("copy to {} failed: {e}", remote.display())))
    }

    async fn exec(&self, command: &str) -> Result<String> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BackupError::transfer(e.to_string()))?;
        if !output.status.success() {
            return Err(BackupError::transfer(format!(
                "`{command}` failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// A remote host that never answers.
#[derive(Debug, Default)]
pub struct UnreachableTransport;

#[async_trait]
impl Transport for UnreachableTransport {
    fn endpoint(&self) -> String {
        "backup@10.255.255.1:22".to_string()
    }

    async fn upload(&self, _local: &Path, _remote: &Path) -> Result<()> {
        Err(BackupError::transfer("ssh: connect to host 10.255.255.1 port 22: Connection timed out"))
    }

    async fn exec(&self, _command: &str) -> Result<String> {
        Err(BackupError::transfer("ssh: connect to host 10.255.255.1 port 22: Connection timed out"))
    }
}

/// Writes a small, fixed SQL script; optionally fails.
#[derive(Debug, Default)]
pub struct FakeDump {
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl FakeDump {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

pub const DUMP_CONTENT: &[u8] = b"-- dump\nCREATE TABLE orders (id INT PRIMARY KEY);\n";

#[async_trait]
impl DumpSource for FakeDump {
    fn describe(&self) -> String {
        "fake-dump".to_string()
    }

    async fn dump(&self, _databases: &DatabaseSelection, sink: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(BackupError::dump("mysqldump: Got error: 2002: Can't connect to MySQL server"));
        }
        tokio::fs::write(sink, DUMP_CONTENT).await?;
        Ok(())
    }
}

pub fn day(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap() + chrono::Duration::days(n)
}

pub fn config(local: &Path, remote: &Path, policy: RetentionPolicy) -> BackupConfig {
    let mut config = BackupConfig::new(DatabaseSelection::All);
    config.local_dir = local.to_path_buf();
    config.retention = policy;
    config.remote = Some(RemoteConfig {
        host: "localhost".to_string(),
        user: "backup".to_string(),
        port: 22,
        dir: remote.to_path_buf(),
        credential: Credential::Default,
    });
    config
}

/// Sorted file names in a tier directory; empty if it does not exist
pub fn tier_files(root: &Path, tier: &str) -> Vec<String> {
    let mut names: Vec<String> = match std::fs::read_dir(root.join(tier)) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

/// Sorted entry names directly under `root`
pub fn entries(root: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(root)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(data))
}

pub fn gunzip(path: &Path) -> Vec<u8> {
    use std::io::Read;
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(std::fs::File::open(path).unwrap())
        .read_to_end(&mut out)
        .unwrap();
    out
}

pub fn path_in(root: &Path, tier: &str, name: &str) -> PathBuf {
    root.join(tier).join(name)
}
