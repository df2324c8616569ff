// stackvault/src/retention.rs
use std::cmp::Reverse;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// One snapshot directory found under the root.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub name: String,
    pub path: PathBuf,
    pub created: SystemTime,
}

#[derive(Debug, Default)]
pub struct PruneReport {
    pub kept: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

/// Immediate child directories of `root`, newest first.
///
/// Ordered by creation time where the filesystem records it, otherwise by
/// modification time; equal times fall back to the name.
pub fn list_snapshots(root: &Path) -> io::Result<Vec<SnapshotEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        // DirEntry::file_type does not follow symlinks.
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let metadata = entry.metadata()?;
        let created = metadata.created().or_else(|_| metadata.modified())?;
        entries.push(SnapshotEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path(),
            created,
        });
    }
    entries.sort_by_key(|e| Reverse((e.created, e.name.clone())));
    Ok(entries)
}

/// Keeps the `keep` newest snapshot directories and deletes the rest. `keep == 0` means unlimited.
///
/// A failed deletion is recorded and the remaining candidates are still attempted.
pub fn prune(root: &Path, keep: usize) -> io::Result<PruneReport> {
    let mut report = PruneReport::default();
    if keep == 0 {
        return Ok(report);
    }

    let snapshots = list_snapshots(root)?;
    for (index, snapshot) in snapshots.into_iter().enumerate() {
        if index < keep {
            report.kept.push(snapshot.path);
            continue;
        }
        tracing::info!(snapshot = %snapshot.name, "removing old snapshot");
        match fs::remove_dir_all(&snapshot.path) {
            Ok(()) => report.removed.push(snapshot.path),
            Err(e) => report.failed.push((snapshot.path, e.to_string())),
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;
    use tempfile::tempdir;

    fn make_snapshots(root: &Path, names: &[&str]) -> io::Result<()> {
        for name in names {
            fs::create_dir(root.join(name))?;
            fs::write(root.join(name).join("database.sql"), name.as_bytes())?;
            sleep(Duration::from_millis(20));
        }
        Ok(())
    }

    fn remaining(root: &Path) -> io::Result<Vec<String>> {
        Ok(list_snapshots(root)?.into_iter().map(|e| e.name).collect())
    }

    #[test]
    fn test_keeps_newest() -> io::Result<()> {
        let root = tempdir()?;
        make_snapshots(root.path(), &["20240101_000000", "20240102_000000", "20240103_000000", "20240104_000000"])?;

        let report = prune(root.path(), 2)?;
        assert_eq!(report.removed.len(), 2);
        assert!(report.failed.is_empty());
        assert_eq!(remaining(root.path())?, vec!["20240104_000000", "20240103_000000"]);
        Ok(())
    }

    #[test]
    fn test_orders_by_time_not_name() -> io::Result<()> {
        let root = tempdir()?;
        make_snapshots(root.path(), &["b-older", "a-newer"])?;
        prune(root.path(), 1)?;
        assert_eq!(remaining(root.path())?, vec!["a-newer"]);
        Ok(())
    }

    #[test]
    fn test_keep_zero_is_noop() -> io::Result<()> {
        let root = tempdir()?;
        make_snapshots(root.path(), &["1", "2", "3"])?;
        let report = prune(root.path(), 0)?;
        assert!(report.removed.is_empty());
        assert_eq!(remaining(root.path())?.len(), 3);
        Ok(())
    }

    #[test]
    fn test_keep_more_than_present() -> io::Result<()> {
        let root = tempdir()?;
        make_snapshots(root.path(), &["1", "2"])?;
        let report = prune(root.path(), 5)?;
        assert_eq!(report.kept.len(), 2);
        assert_eq!(remaining(root.path())?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_files_and_symlinks_untouched() -> io::Result<()> {
        let root = tempdir()?;
        let outside = tempdir()?;
        fs::write(outside.path().join("precious"), b"keep me")?;
        fs::write(root.path().join(".stackvault.lock"), b"123 token")?;
        make_snapshots(root.path(), &["1", "2"])?;
        std::os::unix::fs::symlink(outside.path(), root.path().join("zz-link"))?;

        prune(root.path(), 1)?;
        assert!(root.path().join(".stackvault.lock").is_file());
        assert!(root.path().join("zz-link").exists());
        assert!(outside.path().join("precious").is_file());
        assert_eq!(remaining(root.path())?, vec!["2"]);
        Ok(())
    }
}
