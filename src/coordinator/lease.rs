// stackvault/src/coordinator/lease.rs
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::errors::{AppError, Result};

pub const LOCK_FILE: &str = ".stackvault.lock";

/// Exclusive hold on a snapshot root for one run, released on drop.
#[derive(Debug)]
pub struct SnapshotLease {
    path: PathBuf,
    token: String,
}

impl SnapshotLease {
    /// Creates the root if needed, then takes the lock file. A lock left by a dead process is reclaimed.
    pub fn acquire(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| {
            AppError::Precondition(format!(
                "snapshot root {} is not reachable: {}",
                root.display(),
                e
            ))
        })?;
        let path = root.join(LOCK_FILE);
        let token = format!("{} {}", std::process::id(), Uuid::new_v4());

        for _ in 0..3 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", token)?;
                    tracing::debug!(lock = %path.display(), "snapshot root lease acquired");
                    return Ok(SnapshotLease { path, token });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let holder = match fs::read_to_string(&path) {
                        Ok(text) => text,
                        Err(e) if e.kind() == ErrorKind::NotFound => continue,
                        Err(e) => return Err(e.into()),
                    };
                    let pid = holder
                        .split_whitespace()
                        .next()
                        .and_then(|p| p.parse::<u32>().ok());
                    if let Some(pid) = pid {
                        if Path::new("/proc").join(pid.to_string()).exists() {
                            return Err(AppError::ConcurrentRun(format!(
                                "{} is held by process {}",
                                path.display(),
                                pid
                            )));
                        }
                    }
                    tracing::warn!(lock = %path.display(), holder = holder.trim(), "reclaiming stale lock");
                    match fs::remove_file(&path) {
                        Ok(()) => continue,
                        Err(e) if e.kind() == ErrorKind::NotFound => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::ConcurrentRun(format!(
            "could not take {} after repeated attempts",
            path.display()
        )))
    }
}

impl Drop for SnapshotLease {
    fn drop(&mut self) {
        // Only remove the file if it is still ours.
        if let Ok(text) = fs::read_to_string(&self.path) {
            if text.trim() == self.token {
                let _ = fs::remove_file(&self.path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_lease_rejected_until_release() -> anyhow::Result<()> {
        let root = tempdir()?;
        let lease = SnapshotLease::acquire(root.path())?;
        assert!(matches!(
            SnapshotLease::acquire(root.path()),
            Err(AppError::ConcurrentRun(_))
        ));
        drop(lease);
        assert!(!root.path().join(LOCK_FILE).exists());
        let _again = SnapshotLease::acquire(root.path())?;
        Ok(())
    }

    #[test]
    fn test_stale_lock_reclaimed() -> anyhow::Result<()> {
        let root = tempdir()?;
        fs::write(root.path().join(LOCK_FILE), "4294967290 dead-run\n")?;
        let _lease = SnapshotLease::acquire(root.path())?;
        let holder = fs::read_to_string(root.path().join(LOCK_FILE))?;
        assert!(holder.starts_with(&std::process::id().to_string()));
        Ok(())
    }

    #[test]
    fn test_missing_root_is_created() -> anyhow::Result<()> {
        let base = tempdir()?;
        let root = base.path().join("nested/snapshots");
        let _lease = SnapshotLease::acquire(&root)?;
        assert!(root.is_dir());
        Ok(())
    }
}
