// stackvault/src/secrets.rs
#[cfg(test)]
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::Path;

use crate::errors::{AppError, Result};

pub const DB_NAME_KEY: &str = "STACKVAULT_DB_NAME";
pub const DB_USER_KEY: &str = "STACKVAULT_DB_USER";
pub const DB_PASSWORD_KEY: &str = "STACKVAULT_DB_PASSWORD";

/// Read-only lookup of named secrets.
pub trait SecretProvider {
    fn lookup(&self, key: &str) -> Result<String>;
}

/// Database credentials, held in memory for the duration of a run.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub database: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn resolve(provider: &dyn SecretProvider) -> Result<Self> {
        let credentials = Credentials {
            database: provider.lookup(DB_NAME_KEY)?,
            user: provider.lookup(DB_USER_KEY)?,
            password: provider.lookup(DB_PASSWORD_KEY)?,
        };
        // Database and user names end up in SQL identifiers.
        for (key, value) in [(DB_NAME_KEY, &credentials.database), (DB_USER_KEY, &credentials.user)] {
            if value.is_empty()
                || value.contains(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
            {
                return Err(AppError::Secret(format!(
                    "{} must be non-empty and contain only letters, digits, '_' or '-'",
                    key
                )));
            }
        }
        Ok(credentials)
    }
}

/// Secrets taken from the process environment, optionally seeded from a dotenv file.
pub struct EnvSecretProvider;

impl EnvSecretProvider {
    pub fn new(env_file: Option<&Path>) -> Result<Self> {
        if let Some(path) = env_file {
            dotenv::from_path(path).map_err(|e| {
                AppError::Secret(format!("Failed to load secrets file {}: {}", path.display(), e))
            })?;
            tracing::debug!(file = %path.display(), "loaded secrets env file");
        }
        Ok(EnvSecretProvider)
    }
}

impl SecretProvider for EnvSecretProvider {
    fn lookup(&self, key: &str) -> Result<String> {
        env::var(key).map_err(|_| AppError::Secret(format!("{} is not set", key)))
    }
}

/// Fixed secrets.
#[cfg(test)]
#[derive(Default)]
pub struct StaticSecretProvider {
    values: HashMap<String, String>,
}

#[cfg(test)]
impl StaticSecretProvider {
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }
}

#[cfg(test)]
impl SecretProvider for StaticSecretProvider {
    fn lookup(&self, key: &str) -> Result<String> {
        self.values
            .get(key)
            .cloned()
            .ok_or_else(|| AppError::Secret(format!("{} is not set", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn full() -> StaticSecretProvider {
        StaticSecretProvider::default()
            .with(DB_NAME_KEY, "nextcloud")
            .with(DB_USER_KEY, "nc_admin")
            .with(DB_PASSWORD_KEY, "s3cr3t p@ss")
    }

    #[test]
    fn test_resolve_credentials() {
        let creds = Credentials::resolve(&full()).unwrap();
        assert_eq!(creds.database, "nextcloud");
        assert_eq!(creds.user, "nc_admin");
        assert_eq!(creds.password, "s3cr3t p@ss");
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials::resolve(&full()).unwrap();
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("s3cr3t"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_missing_secret() {
        let provider = StaticSecretProvider::default().with(DB_NAME_KEY, "nextcloud");
        let err = Credentials::resolve(&provider).unwrap_err();
        assert!(matches!(err, AppError::Secret(_)));
        assert!(err.to_string().contains(DB_USER_KEY));
    }

    #[test]
    fn test_identifier_characters_checked() {
        let provider = full().with(DB_NAME_KEY, "next\"cloud; DROP");
        assert!(matches!(Credentials::resolve(&provider), Err(AppError::Secret(_))));
    }

    #[test]
    fn test_env_provider_reads_dotenv_file() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "STACKVAULT_TEST_ONLY_SECRET=from-file")?;
        let provider = EnvSecretProvider::new(Some(file.path()))?;
        assert_eq!(provider.lookup("STACKVAULT_TEST_ONLY_SECRET")?, "from-file");
        assert!(provider.lookup("STACKVAULT_TEST_ONLY_MISSING").is_err());
        Ok(())
    }
}
