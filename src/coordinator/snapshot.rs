// stackvault/src/coordinator/snapshot.rs
use chrono::{DateTime, Local, NaiveDateTime};
use regex::Regex;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::config::ArtifactNames;
use crate::errors::{AppError, Result};

const ID_FORMAT: &str = "%Y%m%d_%H%M%S";

static ID_PATTERN: OnceLock<Regex> = OnceLock::new();

fn matches_id_pattern(input: &str) -> bool {
    if let Some(pattern) = ID_PATTERN.get() {
        return pattern.is_match(input);
    }
    match Regex::new(r"^\d{8}_\d{6}$") {
        Ok(pattern) => ID_PATTERN.get_or_init(|| pattern).is_match(input),
        Err(_) => false,
    }
}

/// Second-resolution creation timestamp naming one snapshot directory, e.g. `20210327_200514`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn now() -> Self {
        Self::from_time(Local::now())
    }

    pub fn from_time(time: DateTime<Local>) -> Self {
        SnapshotId(time.format(ID_FORMAT).to_string())
    }

    /// Accepts only well-formed timestamps, so an identifier can never name a path outside the snapshot root.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if !matches_id_pattern(input) || NaiveDateTime::parse_from_str(input, ID_FORMAT).is_err() {
            return Err(AppError::Precondition(format!(
                "'{}' is not a snapshot identifier (expected YYYYMMDD_HHMMSS)",
                input
            )));
        }
        Ok(SnapshotId(input.to_string()))
    }

    #[cfg(test)]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn dir_in(&self, root: &Path) -> PathBuf {
        root.join(&self.0)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Creates the empty snapshot directory. An existing directory is never reused.
pub fn create_snapshot_dir(root: &Path, id: &SnapshotId) -> Result<PathBuf> {
    let dir = id.dir_in(root);
    match fs::create_dir(&dir) {
        Ok(()) => Ok(dir),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(AppError::Precondition(format!(
            "snapshot {} already exists at {}; refusing to overwrite it",
            id,
            dir.display()
        ))),
        Err(e) => Err(AppError::Precondition(format!(
            "cannot create snapshot directory {}: {}",
            dir.display(),
            e
        ))),
    }
}

/// Names of artifacts that are missing or empty.
pub fn missing_artifacts(dir: &Path, names: &ArtifactNames) -> Vec<String> {
    names
        .all()
        .iter()
        .filter(|name| {
            fs::metadata(dir.join(name))
                .map(|m| !m.is_file() || m.len() == 0)
                .unwrap_or(true)
        })
        .map(|name| name.to_string())
        .collect()
}

pub fn ensure_complete(dir: &Path, names: &ArtifactNames) -> Result<()> {
    let missing = missing_artifacts(dir, names);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(AppError::Precondition(format!(
            "snapshot {} is incomplete; missing or empty: {}",
            dir.display(),
            missing.join(", ")
        )))
    }
}
