use std::{env, path::Path, sync::Arc};

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Builder, Connection, Database as LibSqlDatabase};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};

/// Milliseconds a connection waits on a locked database before failing.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Shared handle to the message store. Cloning is cheap; every repository holds one.
#[derive(Clone)]
pub struct Database {
    inner: Arc<LibSqlDatabase>,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to build database: {0}")]
    Build(libsql::Error),
    #[error("failed to open connection: {0}")]
    Connect(libsql::Error),
    #[error("failed to execute statement: {0}")]
    Statement(libsql::Error),
    #[error("missing required LIBSQL_AUTH_TOKEN for remote database")]
    MissingAuthToken,
}

impl Database {
    pub async fn new(database_path: &Path) -> Result<Self, DbError> {
        let location = database_path.to_string_lossy().to_string();
        let inner = if is_remote(&location) {
            let auth_token = env::var("LIBSQL_AUTH_TOKEN")
                .ok()
                .filter(|token| !token.is_empty())
                .ok_or(DbError::MissingAuthToken)?;

            Builder::new_remote(location, auth_token).build().await
        } else {
            Builder::new_local(location).build().await
        }
        .map_err(DbError::Build)?;

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Opens a connection with foreign keys enforced and a busy timeout so that
    /// concurrent writers queue instead of failing immediately.
    pub async fn connection(&self) -> Result<Connection, DbError> {
        let conn = self.inner.connect().map_err(DbError::Connect)?;
        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(DbError::Statement)?;
        let mut rows = conn
            .query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), ())
            .await
            .map_err(DbError::Statement)?;
        while rows.next().await.map_err(DbError::Statement)?.is_some() {}
        Ok(conn)
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        let conn = self.connection().await?;
        let mut rows = conn
            .query("SELECT COUNT(*) FROM sqlite_master", ())
            .await
            .map_err(DbError::Statement)?;
        let _ = rows.next().await.map_err(DbError::Statement)?;
        Ok(())
    }
}

/// Offset pagination shared by the list and query primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub offset: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    DEFAULT_PAGE_LIMIT
}

impl Page {
    pub fn new(offset: u32, limit: u32) -> Self {
        Self {
            offset,
            limit: limit.clamp(1, MAX_PAGE_LIMIT),
        }
    }

    /// Everything a single query may return.
    pub fn all() -> Self {
        Self {
            offset: 0,
            limit: u32::MAX,
        }
    }

    pub(crate) fn limit_clause(&self) -> String {
        format!("LIMIT {} OFFSET {}", self.limit, self.offset)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(0, DEFAULT_PAGE_LIMIT)
    }
}

/// Stored timestamps are RFC 3339 UTC with millisecond precision so that text
/// comparison in SQL orders them chronologically.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

pub(crate) fn now_rfc3339() -> String {
    format_timestamp(Utc::now())
}

pub(crate) fn is_unique_violation(err: &libsql::Error) -> bool {
    err.to_string()
        .to_ascii_lowercase()
        .contains("unique constraint failed")
}

fn is_remote(location: &str) -> bool {
    ["libsql://", "http://", "https://"]
        .iter()
        .any(|scheme| location.starts_with(scheme))
}
