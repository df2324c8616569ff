// stackvault/src/database/mysql.rs
use anyhow::Context;
use async_trait::async_trait;
use sqlx::{Connection, Executor, MySqlConnection};
use std::fs::File;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use super::{discard_partial, DatabaseAdapter, DbEndpoint};
use crate::config::DatabaseEngine;
use crate::errors::{AppError, Result};
use crate::secrets::Credentials;
use crate::utils::{check_output, find_executable};

/// MySQL and MariaDB.
pub struct MySqlAdapter {
    endpoint: DbEndpoint,
}

impl MySqlAdapter {
    pub fn new(endpoint: DbEndpoint) -> Self {
        MySqlAdapter { endpoint }
    }

    fn connection_args(&self, credentials: &Credentials) -> Vec<String> {
        vec![
            format!("--host={}", self.endpoint.host),
            format!("--port={}", self.endpoint.port),
            format!("--user={}", credentials.user),
            "--default-character-set=utf8mb4".to_string(),
        ]
    }

    fn dump_args(&self, credentials: &Credentials) -> Vec<String> {
        let mut args = self.connection_args(credentials);
        args.extend([
            "--single-transaction".to_string(),
            "--routines".to_string(),
            "--triggers".to_string(),
            credentials.database.clone(),
        ]);
        args
    }

    async fn admin_connection(&self, credentials: &Credentials) -> anyhow::Result<MySqlConnection> {
        let url = self.endpoint.admin_url("mysql", credentials, "")?;
        MySqlConnection::connect(url.as_str()).await.with_context(|| {
            format!(
                "Failed to connect to MySQL server at {}:{}",
                self.endpoint.host, self.endpoint.port
            )
        })
    }

    async fn execute_admin(&self, credentials: &Credentials, sql: &str) -> anyhow::Result<()> {
        let mut conn = self.admin_connection(credentials).await?;
        conn.execute(sql)
            .await
            .with_context(|| format!("Failed to execute: {}", sql))?;
        conn.close().await.ok();
        Ok(())
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

pub fn create_statement(database: &str) -> String {
    format!(
        "CREATE DATABASE {} CHARACTER SET utf8mb4 COLLATE utf8mb4_general_ci",
        quote_ident(database)
    )
}

#[async_trait]
impl DatabaseAdapter for MySqlAdapter {
    fn engine(&self) -> DatabaseEngine {
        DatabaseEngine::MySql
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["mysqldump", "mysql"]
    }

    async fn dump(&self, credentials: &Credentials, dest_file: &Path) -> Result<()> {
        let mysqldump = find_executable("mysqldump").map_err(|_| AppError::ToolMissing {
            tool: "mysqldump".into(),
            engine: self.engine().to_string(),
        })?;
        let out = File::create(dest_file)?;

        tracing::debug!(database = %credentials.database, dest = %dest_file.display(), "running mysqldump");
        let result = Command::new(mysqldump)
            .args(self.dump_args(credentials))
            .env("MYSQL_PWD", &credentials.password)
            .stdout(Stdio::from(out))
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to execute mysqldump")
            .and_then(|output| check_output("mysqldump", &output));

        if let Err(e) = result {
            discard_partial(dest_file);
            return Err(AppError::database(e));
        }
        Ok(())
    }

    async fn drop_database(&self, credentials: &Credentials) -> Result<()> {
        let sql = format!("DROP DATABASE IF EXISTS {}", quote_ident(&credentials.database));
        self.execute_admin(credentials, &sql)
            .await
            .map_err(AppError::database)
    }

    async fn create_database(&self, credentials: &Credentials) -> Result<()> {
        self.execute_admin(credentials, &create_statement(&credentials.database))
            .await
            .map_err(AppError::database)
    }

    async fn import(&self, credentials: &Credentials, src_file: &Path) -> Result<()> {
        let mysql = find_executable("mysql").map_err(|_| AppError::ToolMissing {
            tool: "mysql".into(),
            engine: self.engine().to_string(),
        })?;
        let input = File::open(src_file).map_err(|e| {
            AppError::Database(format!("Failed to open dump {}: {}", src_file.display(), e))
        })?;

        let mut args = self.connection_args(credentials);
        args.push(credentials.database.clone());

        tracing::debug!(database = %credentials.database, src = %src_file.display(), "importing with mysql");
        let output = Command::new(mysql)
            .args(args)
            .env("MYSQL_PWD", &credentials.password)
            .stdin(Stdio::from(input))
            .output()
            .await
            .context("Failed to execute mysql")
            .map_err(AppError::database)?;
        check_output("mysql import", &output).map_err(AppError::database)
    }
}
