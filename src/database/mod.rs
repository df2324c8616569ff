//! Engine-specific dump, drop, create and import.
//!
//! The engine is chosen once, from [`DatabaseEngine`], when the adapter is built;
//! nothing downstream branches on the engine name again.

pub mod mysql;
pub mod postgres;

use async_trait::async_trait;
use std::path::Path;
use url::Url;

use crate::config::{DatabaseEngine, StackConfig};
use crate::errors::{AppError, Result};
use crate::secrets::Credentials;
use crate::utils::find_executable;

pub use self::mysql::MySqlAdapter;
pub use self::postgres::PostgresAdapter;

/// Where the database server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbEndpoint {
    pub host: String,
    pub port: u16,
}

impl DbEndpoint {
    pub fn from_config(config: &StackConfig) -> Self {
        DbEndpoint {
            host: config.database_host.clone(),
            port: config.database_port,
        }
    }

    /// Connection URL for `scheme` with credentials percent-encoded.
    pub fn admin_url(&self, scheme: &str, credentials: &Credentials, database: &str) -> anyhow::Result<Url> {
        let mut url = Url::parse(&format!("{}://{}:{}/", scheme, self.host, self.port))
            .map_err(|e| anyhow::anyhow!("Invalid database endpoint {}:{}: {}", self.host, self.port, e))?;
        url.set_username(&credentials.user)
            .map_err(|_| anyhow::anyhow!("Cannot set user on database URL"))?;
        url.set_password(Some(&credentials.password))
            .map_err(|_| anyhow::anyhow!("Cannot set password on database URL"))?;
        url.set_path(database);
        Ok(url)
    }
}

#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    fn engine(&self) -> DatabaseEngine;

    /// Client executables the adapter shells out to.
    fn required_tools(&self) -> &'static [&'static str];

    fn ensure_client_tools(&self) -> Result<()> {
        for tool in self.required_tools() {
            if let Err(e) = find_executable(tool) {
                tracing::debug!(tool, error = %e, "client tool lookup failed");
                return Err(AppError::ToolMissing {
                    tool: tool.to_string(),
                    engine: self.engine().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Writes a logical, transactionally consistent export of `credentials.database`.
    async fn dump(&self, credentials: &Credentials, dest_file: &Path) -> Result<()>;

    async fn drop_database(&self, credentials: &Credentials) -> Result<()>;

    /// Creates the database with the UTF-8 character set the application expects.
    async fn create_database(&self, credentials: &Credentials) -> Result<()>;

    async fn import(&self, credentials: &Credentials, src_file: &Path) -> Result<()>;
}

pub fn select_adapter(config: &StackConfig) -> Box<dyn DatabaseAdapter> {
    let endpoint = DbEndpoint::from_config(config);
    match config.database_engine {
        DatabaseEngine::MySql => Box::new(MySqlAdapter::new(endpoint)),
        DatabaseEngine::Postgres => Box::new(PostgresAdapter::new(endpoint)),
    }
}

/// Removes a half-written dump so an incomplete snapshot is recognisable.
pub(crate) fn discard_partial(dest_file: &Path) {
    if dest_file.exists() {
        if let Err(e) = std::fs::remove_file(dest_file) {
            tracing::warn!(file = %dest_file.display(), error = %e, "could not remove partial dump");
        }
    }
}
