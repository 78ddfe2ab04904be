// SPDX-License-Identifier: Apache-2.0

//! PostgreSQL Driver
//!
//! Implements [`SqlBackend`] for PostgreSQL using SQLx.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{Column, Executor, Row, Statement, TypeInfo};

use quarry_core::{ColumnInfo, DataFrame, FederationError, FederationResult, HandlerResponse, Row as QRow, Value};

use crate::engine::args::ConnectionArgs;
use crate::engine::connection::Connector;
use crate::engine::drivers::sql_common::{
    big_decimal_value, classify_connect_error, classify_error, decimal_value, returns_rows, PoolSettings,
    SqlBackend, SqlHandler,
};
use crate::engine::sql_generator::SqlDialect;

pub const HANDLER_TYPE: &str = "postgres";
pub const DEFAULT_PORT: u16 = 5432;
const REQUIRED_ARGS: &[&str] = &["host", "user", "password", "database"];

pub type PostgresHandler = SqlHandler<PostgresBackend>;

pub struct PostgresBackend {
    args: ConnectionArgs,
}

impl PostgresBackend {
    pub fn new(args: ConnectionArgs) -> Self {
        Self { args }
    }

    /// Builds connect options from the arguments
    fn build_connect_options(args: &ConnectionArgs) -> FederationResult<PgConnectOptions> {
        args.require(HANDLER_TYPE, REQUIRED_ARGS)?;

        let port = match args.get_u64("port")? {
            Some(port) => u16::try_from(port)
                .map_err(|_| FederationError::configuration(format!("invalid port {port}")))?,
            None => DEFAULT_PORT,
        };

        let ssl_mode = match args.get_str("sslmode") {
            Some(mode) => mode
                .parse::<PgSslMode>()
                .map_err(|e| FederationError::configuration(format!("invalid sslmode: {e}")))?,
            None if args.get_bool("ssl")?.unwrap_or(false) => PgSslMode::Require,
            None => PgSslMode::Prefer,
        };

        Ok(PgConnectOptions::new()
            .host(&args.required_str(HANDLER_TYPE, "host")?)
            .port(port)
            .username(&args.required_str(HANDLER_TYPE, "user")?)
            .password(&args.required_str(HANDLER_TYPE, "password")?)
            .database(&args.required_str(HANDLER_TYPE, "database")?)
            .ssl_mode(ssl_mode))
    }

    fn extract_value(row: &PgRow, idx: usize) -> Value {
        // try_get with Option<T> handles NULLs gracefully
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return v.map(|f| Value::Float(f as f64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bigdecimal::BigDecimal>, _>(idx) {
            return v.map(big_decimal_value).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<rust_decimal::Decimal>, _>(idx) {
            return v.map(decimal_value).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            return v.map(Value::Json).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
            return v.map(|dt| Value::Text(dt.to_rfc3339())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            return v
                .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
            return v
                .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
            return v
                .map(|t| Value::Text(t.format("%H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }

        Value::Null
    }

    fn convert_row(row: &PgRow) -> QRow {
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
impl Connector for PostgresBackend {
    type Conn = PgPool;

    async fn establish(&self) -> FederationResult<PgPool> {
        let options = Self::build_connect_options(&self.args)?;
        let settings = PoolSettings::from_args(&self.args)?;

        PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(classify_connect_error)
    }

    async fn ping(&self, pool: &PgPool) -> FederationResult<()> {
        sqlx::query("SELECT 1")
            .execute(pool)
            .await
            .map(|_| ())
            .map_err(classify_error)
    }

    async fn close(&self, pool: PgPool) {
        pool.close().await;
    }
}

#[async_trait]
impl SqlBackend for PostgresBackend {
    const HANDLER_TYPE: &'static str = HANDLER_TYPE;

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }

    async fn run(&self, pool: &PgPool, sql: &str) -> FederationResult<HandlerResponse> {
        if !returns_rows(sql) {
            sqlx::query(sql).execute(pool).await.map_err(classify_error)?;
            return Ok(HandlerResponse::Ok);
        }

        let rows: Vec<PgRow> = sqlx::query(sql).fetch_all(pool).await.map_err(classify_error)?;

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
        "SELECT table_schema, table_name, table_type FROM information_schema.tables \
         WHERE table_schema NOT IN ('pg_catalog', 'information_schema') \
         ORDER BY table_schema, table_name"
            .to_string()
    }

    fn columns_sql(&self, table: &str) -> String {
        let (schema, name) = match table.split_once('.') {
            Some((schema, name)) => (Some(schema), name),
            None => (None, table),
        };
        let dialect = SqlDialect::Postgres;
        let schema_filter = match schema {
            Some(schema) => format!(
                "table_schema = {}",
                dialect.format_value(&Value::Text(schema.to_string()))
            ),
            None => "table_schema = ANY (current_schemas(false))".to_string(),
        };
        format!(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_name = {} AND {} ORDER BY ordinal_position",
            dialect.format_value(&Value::Text(name.to_string())),
            schema_filter
        )
    }
}
