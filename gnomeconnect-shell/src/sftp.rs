//! Mounts a device's sftp share and opens it in the file manager.
//!
//! The engine negotiates the sftp session; the shell only gets the
//! connection details. Mounting goes through gvfs so the share shows up
//! like any other location, with the one-time password fed on stdin.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use gnomeconnect_engine::SftpEvent;

/// External commands used to mount and open the share.
#[derive(Debug, Clone)]
pub struct SftpCommands {
    pub mount_command: String,
    pub open_command: String,
    pub mount_timeout: Duration,
}

impl SftpCommands {
    fn location(event: &SftpEvent) -> String {
        format!("sftp://{}@{}:{}", event.user, event.ip, event.port)
    }

    /// Mount the share, then hand the browse path to the file manager.
    ///
    /// The mount blocks until gvfs has the share or the timeout fires; the
    /// file manager is fire-and-forget.
    pub async fn browse(&self, event: &SftpEvent) -> Result<()> {
        let location = Self::location(event);
        info!(device = %event.device.name, %location, "mounting sftp share");

        let mut mount = Command::new(&self.mount_command)
            .arg(&location)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.mount_command))?;

        if let Some(mut stdin) = mount.stdin.take() {
            stdin
                .write_all(format!("{}\n", event.password).as_bytes())
                .await
                .context("Failed to write sftp password")?;
        }

        let status = timeout(self.mount_timeout, mount.wait())
            .await
            .context("Mount timed out")?
            .context("Mount process failed")?;
        if !status.success() {
            bail!("{} exited with {status}", self.mount_command);
        }

        let target = format!("{location}/{}", event.path.trim_start_matches('/'));
        debug!(%target, "opening file manager");
        Command::new(&self.open_command)
            .arg(&target)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.open_command))?;

        Ok(())
    }
}
