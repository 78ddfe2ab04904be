// SPDX-License-Identifier: Apache-2.0

//! SQLite Driver
//!
//! Implements [`SqlBackend`] for SQLite databases using SQLx.
//!
//! ## SQLite Specifics
//!
//! - `db_file` holds the file path; `:memory:` opens an in-memory database
//! - An in-memory database lives in a single connection, so its pool is
//!   pinned to one connection that is never recycled
//! - File databases use WAL mode

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Executor, Row, Statement, TypeInfo};

use quarry_core::{ColumnInfo, DataFrame, FederationError, FederationResult, HandlerResponse, Row as QRow, Value};

use crate::engine::args::ConnectionArgs;
use crate::engine::connection::Connector;
use crate::engine::drivers::sql_common::{
    classify_connect_error, classify_error, returns_rows, PoolSettings, SqlBackend, SqlHandler,
};
use crate::engine::sql_generator::SqlDialect;

pub const HANDLER_TYPE: &str = "sqlite";

pub type SqliteHandler = SqlHandler<SqliteBackend>;

/// SQLite backend; arguments are re-read on every connect.
pub struct SqliteBackend {
    args: ConnectionArgs,
}

impl SqliteBackend {
    pub fn new(args: ConnectionArgs) -> Self {
        Self { args }
    }

    fn is_memory(path: &str) -> bool {
        matches!(path.trim(), ":memory:" | "sqlite::memory:")
    }

    /// Validates the SQLite connection path
    fn validate_path(path: &str) -> FederationResult<()> {
        let path = path.trim();

        if Self::is_memory(path) {
            return Ok(());
        }

        if path.eq_ignore_ascii_case("localhost") {
            return Err(FederationError::configuration(
                "Invalid SQLite path: 'localhost'. Please provide a database file path.",
            ));
        }

        if path.contains("://") {
            return Err(FederationError::configuration(format!(
                "Invalid SQLite path format: {}",
                path
            )));
        }

        Ok(())
    }

    fn build_connect_options(path: &str) -> FederationResult<SqliteConnectOptions> {
        if Self::is_memory(path) {
            return SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| FederationError::configuration(e.to_string()));
        }

        Ok(SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30)))
    }

    /// Extracts a value from a SqliteRow at the given index
    ///
    /// SQLite has dynamic typing, so we try multiple types in order of likelihood
    fn extract_value(row: &SqliteRow, idx: usize) -> Value {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }

        Value::Null
    }

    fn convert_row(row: &SqliteRow) -> QRow {
        QRow {
            values: row
                .columns()
                .iter()
                .map(|col| Self::extract_value(row, col.ordinal()))
                .collect(),
        }
    }

    fn column_info<C: Column>(columns: &[C]) -> Vec<ColumnInfo> {
        columns
            .iter()
            .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
            .collect()
    }
}

#[async_trait]
impl Connector for SqliteBackend {
    type Conn = SqlitePool;

    async fn establish(&self) -> FederationResult<SqlitePool> {
        self.args.require(HANDLER_TYPE, &["db_file"])?;
        let path = self.args.required_str(HANDLER_TYPE, "db_file")?;
        Self::validate_path(&path)?;
        let settings = PoolSettings::from_args(&self.args)?;

        let options = Self::build_connect_options(&path)?;
        let pool_options = if Self::is_memory(&path) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(settings.max_connections)
        };

        pool_options
            .acquire_timeout(settings.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(classify_connect_error)
    }

    async fn ping(&self, pool: &SqlitePool) -> FederationResult<()> {
        sqlx::query("SELECT 1")
            .execute(pool)
            .await
            .map(|_| ())
            .map_err(classify_error)
    }

    async fn close(&self, pool: SqlitePool) {
        pool.close().await;
    }
}

#[async_trait]
impl SqlBackend for SqliteBackend {
    const HANDLER_TYPE: &'static str = HANDLER_TYPE;

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    async fn run(&self, pool: &SqlitePool, sql: &str) -> FederationResult<HandlerResponse> {
        if !returns_rows(sql) {
            sqlx::query(sql).execute(pool).await.map_err(classify_error)?;
            return Ok(HandlerResponse::Ok);
        }

        let rows: Vec<SqliteRow> = sqlx::query(sql).fetch_all(pool).await.map_err(classify_error)?;

        let columns = match rows.first() {
            Some(first) => Self::column_info(first.columns()),
            None => {
                let statement = pool.prepare(sql).await.map_err(classify_error)?;
                Self::column_info(statement.columns())
            }
        };
        let rows = rows.iter().map(Self::convert_row).collect();
        Ok(HandlerResponse::table(DataFrame::new(columns, rows)))
    }

    fn tables_sql(&self) -> String {
        "SELECT name, type FROM sqlite_master \
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
         ORDER BY name"
            .to_string()
    }

    fn columns_sql(&self, table: &str) -> String {
        format!(
            "SELECT name, type FROM pragma_table_info({}) ORDER BY cid",
            SqlDialect::Sqlite.format_value(&Value::Text(table.to_string()))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::connection::ConnectionState;
    use crate::engine::traits::Handler;
    use tempfile::tempdir;

    fn memory_handler() -> SqliteHandler {
        SqliteHandler::new(
            "mem",
            SqliteBackend::new(ConnectionArgs::new().with("db_file", ":memory:")),
        )
    }

    #[tokio::test]
    async fn test_connect_disconnect() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let handler = SqliteHandler::new(
            "file",
            SqliteBackend::new(
                ConnectionArgs::new().with("db_file", db_path.to_string_lossy().to_string()),
            ),
        );

        assert_eq!(handler.connect().await.unwrap(), ConnectionState::Connected);
        handler.disconnect().await;
        assert_eq!(handler.connection_state().await, ConnectionState::Disconnected);
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_memory_database() {
        let handler = memory_handler();

        let created = handler
            .native_query("CREATE TABLE test (id INTEGER PRIMARY KEY, name TEXT)")
            .await
            .unwrap();
        assert_eq!(created, HandlerResponse::Ok);

        handler
            .native_query("INSERT INTO test (name) VALUES ('hello')")
            .await
            .unwrap();

        let result = handler.native_query("SELECT * FROM test").await.unwrap();
        let frame = result.frame().unwrap();
        assert_eq!(frame.column_names(), vec!["id", "name"]);
        assert_eq!(frame.value(0, "name"), Some(&Value::Text("hello".into())));
    }

    #[tokio::test]
    async fn test_empty_result_keeps_columns() {
        let handler = memory_handler();
        handler
            .native_query("CREATE TABLE houses (location TEXT, sqft INTEGER)")
            .await
            .unwrap();

        let result = handler
            .native_query("SELECT location, sqft FROM houses WHERE sqft > 10")
            .await
            .unwrap();
        let frame = result.frame().unwrap();
        assert!(frame.is_empty());
        assert_eq!(frame.column_names(), vec!["location", "sqft"]);
    }

    #[tokio::test]
    async fn test_syntax_error_is_error_response() {
        let handler = memory_handler();
        let result = handler.native_query("SELEC nonsense").await.unwrap();
        assert!(result.is_error());
        assert!(!result.error_message().unwrap().is_empty());
        assert_eq!(handler.connection_state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_missing_db_file_is_configuration_error() {
        let handler = SqliteHandler::new("bad", SqliteBackend::new(ConnectionArgs::new()));
        let err = handler.connect().await.unwrap_err();
        assert_eq!(err, FederationError::missing_fields("sqlite", &["db_file"]));
        assert_eq!(handler.connection_state().await, ConnectionState::Disconnected);
    }
}
