//! Pooled PostGIS access.
//!
//! Every executor talks to the database through one shared [`Db`] built on
//! a deadpool connection pool. Table names originate from YAML slugs, so
//! anything spliced into SQL as an identifier is validated first.

use anyhow::{Context, Result};
use deadpool_postgres::{Config as PoolConfig, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tokio_postgres::types::ToSql;
use tracing::debug;

use crate::config::PgSettings;

/// A table name that failed validation before being spliced into SQL.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("identifier cannot be empty")]
    Empty,
    #[error("identifier '{0}' exceeds 63 characters")]
    TooLong(String),
    #[error("identifier '{0}' must start with a letter or underscore")]
    BadFirstChar(String),
    #[error("identifier '{0}' contains invalid character '{1}'")]
    BadChar(String, char),
}

/// Validate a PostgreSQL identifier: letters, digits and underscores only,
/// first character a letter or underscore, at most 63 bytes.
pub fn validate_identifier(name: &str) -> Result<(), IdentifierError> {
    if name.is_empty() {
        return Err(IdentifierError::Empty);
    }
    if name.len() > 63 {
        return Err(IdentifierError::TooLong(name.to_string()));
    }

    let mut chars = name.chars();
    let first = chars.next().expect("non-empty checked above");
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(IdentifierError::BadFirstChar(name.to_string()));
    }
    for c in chars {
        if !c.is_ascii_alphanumeric() && c != '_' {
            return Err(IdentifierError::BadChar(name.to_string(), c));
        }
    }
    Ok(())
}

/// Validate and double-quote an identifier for SQL splicing.
pub fn quote_ident(name: &str) -> Result<String> {
    validate_identifier(name).with_context(|| format!("invalid table identifier: {name}"))?;
    Ok(format!("\"{name}\""))
}

/// Escape a string literal for SQL splicing (single quotes doubled).
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Shared database handle. Cloning shares the underlying pool.
#[derive(Clone)]
pub struct Db {
    pool: Pool,
    settings: PgSettings,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("host", &self.settings.host)
            .field("database", &self.settings.database)
            .finish()
    }
}

impl Db {
    /// Build a pool from connection settings. Connections are established
    /// lazily on first use.
    pub fn connect(settings: &PgSettings) -> Result<Self> {
        let mut cfg = PoolConfig::new();
        cfg.host = Some(settings.host.clone());
        cfg.dbname = Some(settings.database.clone());
        cfg.user = Some(settings.user.clone());
        cfg.password = Some(settings.password.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .context("failed to create postgres pool")?;

        Ok(Self {
            pool,
            settings: settings.clone(),
        })
    }

    /// Connection string in the form ogr2ogr expects.
    pub fn ogr_connection_string(&self) -> String {
        self.settings.ogr_connection_string()
    }

    /// Execute a statement, returning the affected row count.
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        debug!(sql, "execute");
        let client = self.pool.get().await.context("pool checkout failed")?;
        client
            .execute(sql, &[])
            .await
            .with_context(|| format!("query failed: {sql}"))
    }

    /// Execute a parameterized statement.
    pub async fn execute_params(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64> {
        debug!(sql, "execute");
        let client = self.pool.get().await.context("pool checkout failed")?;
        client
            .execute(sql, params)
            .await
            .with_context(|| format!("query failed: {sql}"))
    }

    /// Run several statements sequentially on one pooled connection.
    pub async fn execute_batch(&self, statements: &[String]) -> Result<()> {
        let client = self.pool.get().await.context("pool checkout failed")?;
        for sql in statements {
            debug!(sql, "execute");
            client
                .execute(sql.as_str(), &[])
                .await
                .with_context(|| format!("query failed: {sql}"))?;
        }
        Ok(())
    }

    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<tokio_postgres::Row>> {
        debug!(sql, "query");
        let client = self.pool.get().await.context("pool checkout failed")?;
        client
            .query(sql, params)
            .await
            .with_context(|| format!("query failed: {sql}"))
    }

    /// Whether a public base table with this exact name exists.
    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let rows = self
            .query(
                "SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = 'public' AND table_name = $1 \
                 AND table_type = 'BASE TABLE'",
                &[&table],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Names of all public base tables.
    pub async fn table_names(&self) -> Result<Vec<String>> {
        let rows = self
            .query(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = 'public' AND table_type = 'BASE TABLE' \
                 ORDER BY table_name",
                &[],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }

    pub async fn drop_table(&self, table: &str) -> Result<()> {
        let ident = quote_ident(table)?;
        self.execute(&format!("DROP TABLE IF EXISTS {ident} CASCADE"))
            .await?;
        Ok(())
    }

    /// Attach the logical node name to a table so operators can identify
    /// managed tables from psql.
    pub async fn add_table_comment(&self, table: &str, comment: &str) -> Result<()> {
        let ident = quote_ident(table)?;
        let literal = quote_literal(comment);
        self.execute(&format!("COMMENT ON TABLE {ident} IS {literal}"))
            .await?;
        Ok(())
    }

    /// Row count of a table.
    pub async fn count_rows(&self, table: &str) -> Result<i64> {
        let ident = quote_ident(table)?;
        let rows = self
            .query(&format!("SELECT COUNT(*) FROM {ident}"), &[])
            .await?;
        Ok(rows.first().map(|r| r.get::<_, i64>(0)).unwrap_or(0))
    }
}
