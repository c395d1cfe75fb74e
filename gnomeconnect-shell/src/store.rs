//! On-disk state: identity key, known devices and the single-instance lock.
//!
//! Everything lives in the config directory next to shell.toml. The known
//! device list is advisory; a corrupt or missing file just means starting
//! with no known devices.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use openssl::rsa::Rsa;
use tracing::{debug, info, warn};

use gnomeconnect_engine::KnownDevice;

const PRIVATE_KEY_FILE: &str = "private.pem";
const KNOWN_DEVICES_FILE: &str = "known-devices.json";
const LOCK_FILE: &str = "shell.lock";

/// Load the identity key, generating one on first run.
pub fn load_or_generate_identity(dir: &Path) -> Result<String> {
    let path = dir.join(PRIVATE_KEY_FILE);

    match fs::read_to_string(&path) {
        Ok(pem) => Ok(pem),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "generating identity key");
            let rsa = Rsa::generate(2048).context("Failed to generate RSA key")?;
            let pem_bytes = rsa
                .private_key_to_pem()
                .context("Failed to encode private key")?;
            let pem = String::from_utf8(pem_bytes).context("Key PEM is not UTF-8")?;

            fs::write(&path, &pem).context("Failed to write identity key")?;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
                .context("Failed to restrict key permissions")?;
            Ok(pem)
        }
        Err(err) => Err(err).context("Failed to read identity key"),
    }
}

/// Load the persisted known-device list. Missing or unreadable files are
/// not fatal; pairing state lives on the devices themselves.
pub fn load_known_devices(dir: &Path) -> Vec<KnownDevice> {
    let path = dir.join(KNOWN_DEVICES_FILE);

    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!(path = %path.display(), %err, "failed to read known devices");
            return Vec::new();
        }
    };

    match serde_json::from_str(&contents) {
        Ok(devices) => devices,
        Err(err) => {
            warn!(path = %path.display(), %err, "failed to parse known devices");
            Vec::new()
        }
    }
}

pub fn save_known_devices(dir: &Path, devices: &[KnownDevice]) -> Result<()> {
    let path = dir.join(KNOWN_DEVICES_FILE);
    let contents = serde_json::to_string_pretty(devices)
        .context("Failed to serialize known devices")?;
    fs::write(&path, contents).context("Failed to write known devices")?;
    debug!(count = devices.len(), "saved known devices");
    Ok(())
}

/// Pid-file based single-instance lock.
///
/// A live holder gets a SIGUSR1 nudge so it re-issues its presence
/// notifications; a stale file from a dead process is taken over.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Try to acquire the lock. Returns `None` when another live instance
    /// holds it, after nudging that instance.
    pub fn acquire(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(LOCK_FILE);

        if let Ok(contents) = fs::read_to_string(&path) {
            if let Ok(pid) = contents.trim().parse::<i32>() {
                let holder = Pid::from_raw(pid);
                if kill(holder, None).is_ok() {
                    info!(pid, "shell already running, nudging it");
                    if let Err(err) = kill(holder, Signal::SIGUSR1) {
                        warn!(pid, %err, "failed to signal running instance");
                    }
                    return Ok(None);
                }
                debug!(pid, "removing stale lock file");
            }
        }

        fs::write(&path, std::process::id().to_string())
            .context("Failed to write lock file")?;
        Ok(Some(Self { path }))
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "failed to remove lock file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_known_devices_file_yields_empty_list() {
        let dir = TempDir::new().unwrap();
        assert!(load_known_devices(dir.path()).is_empty());
    }

    #[test]
    fn corrupt_known_devices_file_yields_empty_list() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(KNOWN_DEVICES_FILE), "not json").unwrap();
        assert!(load_known_devices(dir.path()).is_empty());
    }

    #[test]
    fn known_devices_round_trip() {
        let dir = TempDir::new().unwrap();
        let devices = vec![
            KnownDevice {
                id: "dev-1".into(),
                name: "Pixel".into(),
            },
            KnownDevice {
                id: "dev-2".into(),
                name: "Tab".into(),
            },
        ];

        save_known_devices(dir.path(), &devices).unwrap();
        let loaded = load_known_devices(dir.path());
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "dev-1");
        assert_eq!(loaded[1].name, "Tab");
    }

    #[test]
    fn identity_key_is_generated_once() {
        let dir = TempDir::new().unwrap();
        let first = load_or_generate_identity(dir.path()).unwrap();
        assert!(first.contains("PRIVATE KEY"));

        let second = load_or_generate_identity(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = TempDir::new().unwrap();
        // i32::MAX is above any real pid_max, so the holder is never alive.
        fs::write(dir.path().join(LOCK_FILE), i32::MAX.to_string()).unwrap();

        let lock = InstanceLock::acquire(dir.path()).unwrap();
        assert!(lock.is_some());

        let contents = fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
        assert_eq!(contents, std::process::id().to_string());
    }

    #[test]
    fn lock_file_is_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let lock = InstanceLock::acquire(dir.path()).unwrap().unwrap();
        assert!(dir.path().join(LOCK_FILE).exists());

        drop(lock);
        assert!(!dir.path().join(LOCK_FILE).exists());
    }
}
