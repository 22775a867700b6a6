/*!
Transport over the OpenSSH command-line tools.
*/

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::Transport;
use crate::config::{Credential, RemoteConfig};
use crate::{BackupError, Result};

/// Runs `ssh` and `scp` as child processes.
///
/// Key-file and default-identity authentication run in batch mode so a
/// missing key fails fast instead of prompting. Password authentication
/// goes through `sshpass -e`, with the password in the child's environment
/// rather than its argument list. Unknown host keys are accepted on first
/// contact and pinned afterwards.
#[derive(Debug, Clone)]
pub struct OpenSshTransport {
    host: String,
    user: String,
    port: u16,
    credential: Credential,
    ssh_program: PathBuf,
    scp_program: PathBuf,
}

impl OpenSshTransport {
    pub fn new(remote: &RemoteConfig) -> Self {
        Self {
            host: remote.host.clone(),
            user: remote.user.clone(),
            port: remote.port,
            credential: remote.credential.clone(),
            ssh_program: PathBuf::from("ssh"),
            scp_program: PathBuf::from("scp"),
        }
    }

    /// Use different `ssh`/`scp` executables
    pub fn with_programs<P1: Into<PathBuf>, P2: Into<PathBuf>>(mut self, ssh: P1, scp: P2) -> Self {
        self.ssh_program = ssh.into();
        self.scp_program = scp.into();
        self
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Options shared by ssh and scp; they only differ in the port flag
    fn common_options(&self, port_flag: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            port_flag.into(),
            self.port.to_string().into(),
            "-o".into(),
            "StrictHostKeyChecking=accept-new".into(),
        ];
        let extra: &[&str] = match &self.credential {
            Credential::KeyFile(_) => &["-o", "BatchMode=yes", "-i"],
            Credential::Password(_) => &["-o", "PreferredAuthentications=password,keyboard-interactive"],
            Credential::Default => &["-o", "BatchMode=yes"],
        };
        args.extend(extra.iter().map(OsString::from));
        if let Credential::KeyFile(key) = &self.credential {
            args.push(key.as_os_str().to_os_string());
        }
        args
    }

    /// Arguments passed to `ssh` to run `remote_command`
    pub fn ssh_args(&self, remote_command: &str) -> Vec<OsString> {
        let mut args = self.common_options("-p");
        args.push(self.destination().into());
        args.push("--".into());
        args.push(remote_command.into());
        args
    }

    /// Arguments passed to `scp` to copy `local` to `remote`
    pub fn scp_args(&self, local: &Path, remote: &Path) -> Vec<OsString> {
        let mut args = self.common_options("-P");
        args.push("-q".into());
        args.push(local.as_os_str().to_os_string());
        args.push(format!("{}:{}", self.destination(), remote.display()).into());
        args
    }

    fn command(&self, program: &Path, args: Vec<OsString>) -> Command {
        let mut command = match &self.credential {
            Credential::Password(password) => {
                let mut command = Command::new("sshpass");
                command.arg("-e").arg(program).env("SSHPASS", password.expose());
                command
            }
            _ => Command::new(program),
        };
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn execute(&self, mut command: Command, what: &str) -> Result<String> {
        let output = command
            .output()
            .await
            .map_err(|e| BackupError::transfer(format!("failed to start {what}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackupError::transfer(format!(
                "{what} to {} exited with {}: {}",
                self.endpoint(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Transport for OpenSshTransport {
    fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    async fn upload(&self, local: &Path, remote: &Path) -> Result<()> {
        debug!(endpoint = %self.endpoint(), local = %local.display(), remote = %remote.display(), "scp upload");
        let command = self.command(&self.scp_program, self.scp_args(local, remote));
        self.execute(command, "scp").await.map(|_| ())
    }

    async fn exec(&self, command: &str) -> Result<String> {
        let command = self.command(&self.ssh_program, self.ssh_args(command));
        self.execute(command, "ssh").await
    }
}
