// SPDX-License-Identifier: Apache-2.0

//! MySQL / MariaDB Driver
//!
//! Implements [`SqlBackend`] for MySQL using SQLx.

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::{Column, Executor, Row, Statement, TypeInfo};

use quarry_core::{ColumnInfo, DataFrame, FederationError, FederationResult, HandlerResponse, Row as QRow, Value};

use crate::engine::args::ConnectionArgs;
use crate::engine::connection::Connector;
use crate::engine::drivers::sql_common::{
    big_decimal_value, classify_connect_error, classify_error, decimal_value, returns_rows, unsigned_value,
    PoolSettings, SqlBackend, SqlHandler,
};
use crate::engine::sql_generator::SqlDialect;

pub const HANDLER_TYPE: &str = "mysql";
pub const DEFAULT_PORT: u16 = 3306;
const REQUIRED_ARGS: &[&str] = &["host", "user", "password", "database"];

pub type MySqlHandler = SqlHandler<MySqlBackend>;

pub struct MySqlBackend {
    args: ConnectionArgs,
}

impl MySqlBackend {
    pub fn new(args: ConnectionArgs) -> Self {
        Self { args }
    }

    fn build_connect_options(args: &ConnectionArgs) -> FederationResult<MySqlConnectOptions> {
        args.require(HANDLER_TYPE, REQUIRED_ARGS)?;

        let port = match args.get_u64("port")? {
            Some(port) => u16::try_from(port)
                .map_err(|_| FederationError::configuration(format!("invalid port {port}")))?,
            None => DEFAULT_PORT,
        };
        let ssl_mode = if args.get_bool("ssl")?.unwrap_or(false) {
            MySqlSslMode::Required
        } else {
            MySqlSslMode::Preferred
        };

        Ok(MySqlConnectOptions::new()
            .host(&args.required_str(HANDLER_TYPE, "host")?)
            .port(port)
            .username(&args.required_str(HANDLER_TYPE, "user")?)
            .password(&args.required_str(HANDLER_TYPE, "password")?)
            .database(&args.required_str(HANDLER_TYPE, "database")?)
            .ssl_mode(ssl_mode))
    }

    /// Extracts a value from a MySqlRow at the given index
    fn extract_value(row: &MySqlRow, idx: usize) -> Value {
        // u64 first for BIGINT UNSIGNED columns
        if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
            return v.map(unsigned_value).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u32>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i8>, _>(idx) {
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
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            return v.map(Value::Json).unwrap_or(Value::Null);
        }

        Value::Null
    }

    fn convert_row(row: &MySqlRow) -> QRow {
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
impl Connector for MySqlBackend {
    type Conn = MySqlPool;

    async fn establish(&self) -> FederationResult<MySqlPool> {
        let options = Self::build_connect_options(&self.args)?;
        let settings = PoolSettings::from_args(&self.args)?;

        MySqlPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(classify_connect_error)
    }

    async fn ping(&self, pool: &MySqlPool) -> FederationResult<()> {
        sqlx::query("SELECT 1")
            .execute(pool)
            .await
            .map(|_| ())
            .map_err(classify_error)
    }

    async fn close(&self, pool: MySqlPool) {
        pool.close().await;
    }
}

#[async_trait]
impl SqlBackend for MySqlBackend {
    const HANDLER_TYPE: &'static str = HANDLER_TYPE;

    fn dialect(&self) -> SqlDialect {
        SqlDialect::MySql
    }

    async fn run(&self, pool: &MySqlPool, sql: &str) -> FederationResult<HandlerResponse> {
        if !returns_rows(sql) {
            sqlx::query(sql).execute(pool).await.map_err(classify_error)?;
            return Ok(HandlerResponse::Ok);
        }

        let rows: Vec<MySqlRow> = sqlx::query(sql).fetch_all(pool).await.map_err(classify_error)?;

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
        "SELECT table_name AS table_name, table_type AS table_type \
         FROM information_schema.tables WHERE table_schema = DATABASE() \
         ORDER BY table_name"
            .to_string()
    }

    fn columns_sql(&self, table: &str) -> String {
        format!(
            "SELECT column_name AS column_name, data_type AS data_type \
             FROM information_schema.columns \
             WHERE table_schema = DATABASE() AND table_name = {} \
             ORDER BY ordinal_position",
            SqlDialect::MySql.format_value(&Value::Text(table.to_string()))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_credentials_are_listed() {
        let err = MySqlBackend::build_connect_options(
            &ConnectionArgs::new().with("host", "h").with("user", "root"),
        )
        .unwrap_err();
        assert_eq!(
            err,
            FederationError::missing_fields("mysql", &["password", "database"])
        );
    }

    #[test]
    fn test_port_out_of_range() {
        let args = ConnectionArgs::new()
            .with("host", "h")
            .with("user", "u")
            .with("password", "p")
            .with("database", "d")
            .with("port", 70000);
        assert!(matches!(
            MySqlBackend::build_connect_options(&args),
            Err(FederationError::Configuration { .. })
        ));
    }

    #[test]
    fn test_columns_sql_escapes_backslash() {
        let sql = MySqlBackend::new(ConnectionArgs::new()).columns_sql("a\\b");
        assert!(sql.contains("table_name = 'a\\\\b'"));
    }
}
