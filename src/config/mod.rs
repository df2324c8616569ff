// stackvault/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use crate::errors::{AppError, Result as AppResult};

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonArtifactNames {
    pub installation: Option<String>,
    pub data: Option<String>,
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonPolicyOptions {
    pub continue_on_artifact_error: Option<bool>,
    pub verify_archives_before_delete: Option<bool>,
    pub require_complete_snapshot: Option<bool>,
    pub on_cancel: Option<CancelChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub snapshot_root: Option<PathBuf>,
    pub installation_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub compression: Option<bool>,
    pub service_name: Option<String>,
    pub service_user: Option<String>,
    pub app_cli: Option<Vec<String>>,
    pub database_engine: Option<String>,
    pub database_host: Option<String>,
    pub database_port: Option<u16>,
    pub retention: Option<usize>,
    pub artifacts: Option<JsonArtifactNames>,
    pub secrets_env_file: Option<PathBuf>,
    pub policy: Option<JsonPolicyOptions>,
}

/// Supported database engines, resolved once when the configuration is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseEngine {
    MySql,
    Postgres,
}

impl DatabaseEngine {
    pub fn default_port(self) -> u16 {
        match self {
            DatabaseEngine::MySql => 3306,
            DatabaseEngine::Postgres => 5432,
        }
    }
}

impl FromStr for DatabaseEngine {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(DatabaseEngine::MySql),
            "postgresql" | "pgsql" => Ok(DatabaseEngine::Postgres),
            other => Err(anyhow::anyhow!(
                "Unsupported database_engine '{}'. Expected one of: mysql, mariadb, postgresql, pgsql",
                other
            )),
        }
    }
}

impl fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseEngine::MySql => write!(f, "mysql"),
            DatabaseEngine::Postgres => write!(f, "postgresql"),
        }
    }
}

/// Answer to the "stay in maintenance mode?" question asked on cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelChoice {
    Ask,
    KeepMaintenance,
    DisableMaintenance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNames {
    pub installation: String,
    pub data: String,
    pub database: String,
}

impl ArtifactNames {
    fn defaults(compression: bool) -> Self {
        let ext = if compression { "tar.gz" } else { "tar" };
        ArtifactNames {
            installation: format!("installation.{}", ext),
            data: format!("data.{}", ext),
            database: "database.sql".to_string(),
        }
    }

    pub fn all(&self) -> [&str; 3] {
        [&self.installation, &self.data, &self.database]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub continue_on_artifact_error: bool,
    pub verify_archives_before_delete: bool,
    pub require_complete_snapshot: bool,
    pub on_cancel: CancelChoice,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            continue_on_artifact_error: true,
            verify_archives_before_delete: true,
            require_complete_snapshot: true,
            on_cancel: CancelChoice::Ask,
        }
    }
}

/// Immutable settings for one run.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub snapshot_root: PathBuf,
    pub installation_dir: PathBuf,
    pub data_dir: PathBuf,
    pub compression: bool,
    pub service_name: String,
    pub service_user: String,
    pub app_cli: Vec<String>,
    pub database_engine: DatabaseEngine,
    pub database_host: String,
    pub database_port: u16,
    pub retention: usize,
    pub artifacts: ArtifactNames,
    pub secrets_env_file: Option<PathBuf>,
    pub policy: Policy,
}

impl StackConfig {
    pub fn load_from_json(config_path: &Path) -> AppResult<Self> {
        Self::read_json(config_path)
            .and_then(Self::build)
            .map_err(AppError::config)
    }

    pub fn from_raw(raw: RawJsonConfig) -> AppResult<Self> {
        Self::build(raw).map_err(AppError::config)
    }

    fn read_json(config_path: &Path) -> Result<RawJsonConfig> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;
        Ok(raw_json_config)
    }

    fn build(raw: RawJsonConfig) -> Result<Self> {
        let snapshot_root = raw
            .snapshot_root
            .context("snapshot_root must be set in config.json")?;
        let installation_dir = raw
            .installation_dir
            .context("installation_dir must be set in config.json")?;
        let data_dir = raw.data_dir.context("data_dir must be set in config.json")?;
        let engine_name = raw
            .database_engine
            .context("database_engine must be set in config.json")?;
        let database_engine: DatabaseEngine = engine_name.parse()?;

        let compression = raw.compression.unwrap_or(true);
        let defaults = ArtifactNames::defaults(compression);
        let json_names = raw.artifacts.unwrap_or_default();
        let artifacts = ArtifactNames {
            installation: json_names.installation.unwrap_or(defaults.installation),
            data: json_names.data.unwrap_or(defaults.data),
            database: json_names.database.unwrap_or(defaults.database),
        };

        let app_cli = raw.app_cli.unwrap_or_else(|| {
            vec!["php".to_string(), installation_dir.join("occ").to_string_lossy().into_owned()]
        });
        if app_cli.is_empty() {
            anyhow::bail!("app_cli cannot be an empty list in config.json.");
        }

        let json_policy = raw.policy.unwrap_or_default();
        let default_policy = Policy::default();
        let policy = Policy {
            continue_on_artifact_error: json_policy
                .continue_on_artifact_error
                .unwrap_or(default_policy.continue_on_artifact_error),
            verify_archives_before_delete: json_policy
                .verify_archives_before_delete
                .unwrap_or(default_policy.verify_archives_before_delete),
            require_complete_snapshot: json_policy
                .require_complete_snapshot
                .unwrap_or(default_policy.require_complete_snapshot),
            on_cancel: json_policy.on_cancel.unwrap_or(default_policy.on_cancel),
        };

        let config = StackConfig {
            snapshot_root,
            installation_dir,
            data_dir,
            compression,
            service_name: raw.service_name.unwrap_or_else(|| "nginx".to_string()),
            service_user: raw.service_user.unwrap_or_else(|| "www-data".to_string()),
            app_cli,
            database_engine,
            database_host: raw.database_host.unwrap_or_else(|| "localhost".to_string()),
            database_port: raw
                .database_port
                .unwrap_or_else(|| database_engine.default_port()),
            retention: raw.retention.unwrap_or(0),
            artifacts,
            secrets_env_file: raw.secrets_env_file,
            policy,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (key, path) in [
            ("snapshot_root", &self.snapshot_root),
            ("installation_dir", &self.installation_dir),
            ("data_dir", &self.data_dir),
        ] {
            if !path.is_absolute() {
                anyhow::bail!("{} must be an absolute path, got {}", key, path.display());
            }
            if path.components().any(|c| matches!(c, Component::ParentDir)) {
                anyhow::bail!("{} must not contain '..': {}", key, path.display());
            }
            if path.parent().is_none() {
                anyhow::bail!("{} cannot be the filesystem root", key);
            }
        }

        let live = [
            ("installation_dir", &self.installation_dir),
            ("data_dir", &self.data_dir),
        ];
        for (key, dir) in live {
            if self.snapshot_root.starts_with(dir) || dir.starts_with(&self.snapshot_root) {
                anyhow::bail!(
                    "snapshot_root {} and {} {} must not contain one another",
                    self.snapshot_root.display(),
                    key,
                    dir.display()
                );
            }
        }
        // Restore wipes each live directory in turn, so nesting would lose the inner one.
        if self.installation_dir.starts_with(&self.data_dir)
            || self.data_dir.starts_with(&self.installation_dir)
        {
            anyhow::bail!("installation_dir and data_dir must not contain one another");
        }

        let names = self.artifacts.all();
        for name in names {
            if name.is_empty() || name.contains('/') || name == "." || name == ".." {
                anyhow::bail!("artifact file name '{}' must be a plain file name", name);
            }
        }
        if names[0] == names[1] || names[0] == names[2] || names[1] == names[2] {
            anyhow::bail!("artifact file names must be distinct: {:?}", names);
        }
        Ok(())
    }
}
