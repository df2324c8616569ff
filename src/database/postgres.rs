// stackvault/src/database/postgres.rs
use anyhow::Context;
use async_trait::async_trait;
use sqlx::{Connection, Executor, PgConnection};
use std::path::Path;
use tokio::process::Command;

use super::{discard_partial, DatabaseAdapter, DbEndpoint};
use crate::config::DatabaseEngine;
use crate::errors::{AppError, Result};
use crate::secrets::Credentials;
use crate::utils::{check_output, find_executable};

/// PostgreSQL. Administrative statements run against the `postgres` maintenance database.
pub struct PostgresAdapter {
    endpoint: DbEndpoint,
}

impl PostgresAdapter {
    pub fn new(endpoint: DbEndpoint) -> Self {
        PostgresAdapter { endpoint }
    }

    fn connection_args(&self, credentials: &Credentials) -> Vec<String> {
        vec![
            format!("--host={}", self.endpoint.host),
            format!("--port={}", self.endpoint.port),
            format!("--username={}", credentials.user),
            "--no-password".to_string(),
        ]
    }

    fn dump_args(&self, credentials: &Credentials, dest_file: &Path) -> Vec<String> {
        let mut args = self.connection_args(credentials);
        args.extend([
            "--format=plain".to_string(),
            "--no-owner".to_string(),
            format!("--file={}", dest_file.display()),
            credentials.database.clone(),
        ]);
        args
    }

    fn import_args(&self, credentials: &Credentials, src_file: &Path) -> Vec<String> {
        let mut args = vec![
            "-X".to_string(), // Do not read psqlrc
            "-q".to_string(),
            "-v".to_string(),
            "ON_ERROR_STOP=1".to_string(),
        ];
        args.extend(self.connection_args(credentials));
        args.push(format!("--dbname={}", credentials.database));
        args.push(format!("--file={}", src_file.display()));
        args
    }

    async fn admin_connection(&self, credentials: &Credentials) -> anyhow::Result<PgConnection> {
        let url = self.endpoint.admin_url("postgres", credentials, "postgres")?;
        PgConnection::connect(url.as_str()).await.with_context(|| {
            format!(
                "Failed to connect to 'postgres' database on {}:{}",
                self.endpoint.host, self.endpoint.port
            )
        })
    }

    fn tool(&self, name: &str) -> Result<std::path::PathBuf> {
        find_executable(name).map_err(|_| AppError::ToolMissing {
            tool: name.to_string(),
            engine: self.engine().to_string(),
        })
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn create_statement(database: &str, owner: &str) -> String {
    format!(
        "CREATE DATABASE {} WITH OWNER {} TEMPLATE template0 ENCODING 'UTF8'",
        quote_ident(database),
        quote_ident(owner)
    )
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn engine(&self) -> DatabaseEngine {
        DatabaseEngine::Postgres
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["pg_dump", "psql"]
    }

    async fn dump(&self, credentials: &Credentials, dest_file: &Path) -> Result<()> {
        let pg_dump = self.tool("pg_dump")?;

        tracing::debug!(database = %credentials.database, dest = %dest_file.display(), "running pg_dump");
        let result = Command::new(pg_dump)
            .args(self.dump_args(credentials, dest_file))
            .env("PGPASSWORD", &credentials.password)
            .output()
            .await
            .context("Failed to execute pg_dump")
            .and_then(|output| check_output("pg_dump", &output));

        if let Err(e) = result {
            discard_partial(dest_file);
            return Err(AppError::database(e));
        }
        Ok(())
    }

    async fn drop_database(&self, credentials: &Credentials) -> Result<()> {
        let run = async {
            let mut conn = self.admin_connection(credentials).await?;
            sqlx::query(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1 AND pid <> pg_backend_pid()",
            )
            .bind(&credentials.database)
            .execute(&mut conn)
            .await
            .with_context(|| {
                format!(
                    "Failed to terminate connections to database '{}'",
                    credentials.database
                )
            })?;
            let sql = format!("DROP DATABASE IF EXISTS {}", quote_ident(&credentials.database));
            conn.execute(sql.as_str())
                .await
                .with_context(|| format!("Failed to drop database '{}'", credentials.database))?;
            conn.close().await.ok();
            anyhow::Ok(())
        };
        run.await.map_err(AppError::database)
    }

    async fn create_database(&self, credentials: &Credentials) -> Result<()> {
        let run = async {
            let mut conn = self.admin_connection(credentials).await?;
            let sql = create_statement(&credentials.database, &credentials.user);
            conn.execute(sql.as_str())
                .await
                .with_context(|| format!("Failed to create database '{}'", credentials.database))?;
            conn.close().await.ok();
            anyhow::Ok(())
        };
        run.await.map_err(AppError::database)
    }

    async fn import(&self, credentials: &Credentials, src_file: &Path) -> Result<()> {
        if !src_file.is_file() {
            return Err(AppError::Database(format!(
                "SQL dump not found: {}",
                src_file.display()
            )));
        }
        let psql = self.tool("psql")?;

        tracing::debug!(database = %credentials.database, src = %src_file.display(), "importing with psql");
        let output = Command::new(psql)
            .args(self.import_args(credentials, src_file))
            .env("PGPASSWORD", &credentials.password)
            .output()
            .await
            .context("Failed to execute psql")
            .map_err(AppError::database)?;
        check_output("psql import", &output).map_err(AppError::database)
    }
}
