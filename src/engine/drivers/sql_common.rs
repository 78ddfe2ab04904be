// SPDX-License-Identifier: Apache-2.0

//! Shared plumbing for the sqlx-backed handlers
//!
//! Each driver implements [`SqlBackend`] (connect, run one statement,
//! introspection SQL). [`SqlHandler`] turns that into a full [`Handler`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bigdecimal::{BigDecimal, ToPrimitive};
use rust_decimal::Decimal;
use tracing::{debug, instrument};

use quarry_core::{DataFrame, FederationError, FederationResult, HandlerResponse, StatusResponse, Value};

use crate::engine::args::ConnectionArgs;
use crate::engine::connection::{ConnectionState, Connector, ManagedConnection};
use crate::engine::sql_generator::SqlDialect;
use crate::engine::traits::Handler;

pub const DEFAULT_POOL_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_POOL_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// A relational backend reachable through sqlx.
#[async_trait]
pub trait SqlBackend: Connector {
    const HANDLER_TYPE: &'static str;

    fn dialect(&self) -> SqlDialect;

    /// Runs one statement. Row-returning statements produce `TABLE`.
    async fn run(&self, conn: &Self::Conn, sql: &str) -> FederationResult<HandlerResponse>;

    fn tables_sql(&self) -> String;

    fn columns_sql(&self, table: &str) -> String;
}

/// Pool sizing read from optional connection arguments.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PoolSettings {
    pub fn from_args(args: &ConnectionArgs) -> FederationResult<Self> {
        let max_connections = args
            .get_u64("pool_max_connections")?
            .map(|n| n.clamp(1, u32::MAX as u64) as u32)
            .unwrap_or(DEFAULT_POOL_MAX_CONNECTIONS);
        let acquire_timeout = args
            .get_u64("pool_acquire_timeout_secs")?
            .unwrap_or(DEFAULT_POOL_ACQUIRE_TIMEOUT_SECS);
        Ok(Self {
            max_connections,
            acquire_timeout: Duration::from_secs(acquire_timeout),
        })
    }
}

/// NUMERIC/DECIMAL as a float when it fits, else its exact text.
pub fn big_decimal_value(d: BigDecimal) -> Value {
    match d.to_f64() {
        Some(f) if f.is_finite() => Value::Float(f),
        _ => Value::Text(d.to_string()),
    }
}

pub fn decimal_value(d: Decimal) -> Value {
    match d.to_f64() {
        Some(f) if f.is_finite() => Value::Float(f),
        _ => Value::Text(d.to_string()),
    }
}

/// BIGINT UNSIGNED values above `i64::MAX` keep their digits as text.
pub fn unsigned_value(u: u64) -> Value {
    i64::try_from(u).map(Value::Int).unwrap_or_else(|_| Value::Text(u.to_string()))
}

/// True when the statement produces a result set.
pub fn returns_rows(sql: &str) -> bool {
    let keyword: String = strip_leading_noise(sql)
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();
    matches!(
        keyword.as_str(),
        "SELECT" | "WITH" | "SHOW" | "PRAGMA" | "DESCRIBE" | "DESC" | "EXPLAIN" | "VALUES" | "TABLE"
    )
}

fn strip_leading_noise(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        let trimmed = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(after) = trimmed.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(after) = trimmed.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            return trimmed;
        }
    }
}

/// Maps a sqlx error raised while running a statement.
pub fn classify_error(err: sqlx::Error) -> FederationError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => FederationError::connectivity(err.to_string()),
        sqlx::Error::Configuration(e) => FederationError::configuration(e.to_string()),
        other => FederationError::execution(other.to_string()),
    }
}

/// Maps a sqlx error raised while opening a pool. Authentication failures
/// surface as database errors and count as connectivity here.
pub fn classify_connect_error(err: sqlx::Error) -> FederationError {
    match err {
        sqlx::Error::Configuration(e) => FederationError::configuration(e.to_string()),
        other => FederationError::connectivity(other.to_string()),
    }
}

/// Lowercases column names and applies the canonical renames.
fn normalize_columns(mut frame: DataFrame, renames: &[(&str, &str)]) -> DataFrame {
    for column in &mut frame.columns {
        column.name = column.name.to_ascii_lowercase();
    }
    for (from, to) in renames {
        if frame.column_index(to).is_none() {
            frame.rename_column(from, to);
        }
    }
    frame
}

fn normalize_response(response: HandlerResponse, renames: &[(&str, &str)]) -> HandlerResponse {
    match response {
        HandlerResponse::Table { data } => HandlerResponse::table(normalize_columns(data, renames)),
        other => other,
    }
}

/// Generic handler over a [`SqlBackend`]
pub struct SqlHandler<B: SqlBackend> {
    name: String,
    conn: ManagedConnection<B>,
}

impl<B: SqlBackend> SqlHandler<B> {
    pub fn new(name: impl Into<String>, backend: B) -> Self {
        let name = name.into();
        Self {
            conn: ManagedConnection::new(name.clone(), backend),
            name,
        }
    }

    pub fn backend(&self) -> &B {
        self.conn.connector()
    }
}

#[async_trait]
impl<B: SqlBackend> Handler for SqlHandler<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn handler_type(&self) -> &'static str {
        B::HANDLER_TYPE
    }

    fn dialect(&self) -> Option<SqlDialect> {
        Some(self.conn.connector().dialect())
    }

    async fn connection_state(&self) -> ConnectionState {
        self.conn.state().await
    }

    async fn connect(&self) -> FederationResult<ConnectionState> {
        self.conn.lease().await?;
        Ok(ConnectionState::Connected)
    }

    async fn disconnect(&self) {
        self.conn.disconnect().await;
    }

    async fn check_connection(&self) -> StatusResponse {
        self.conn.check().await
    }

    #[instrument(skip(self, query), fields(handler = %self.name, engine = B::HANDLER_TYPE))]
    async fn native_query(&self, query: &str) -> FederationResult<HandlerResponse> {
        let lease = match self.conn.lease().await {
            Ok(lease) => lease,
            Err(e) => return HandlerResponse::at_boundary(Err(e)),
        };

        let start = Instant::now();
        let result = self.conn.connector().run(&lease.conn, query).await;
        if let Err(e) = &result {
            self.conn.report(lease.epoch, e).await;
        }
        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "native query finished"
        );
        HandlerResponse::at_boundary(result)
    }

    async fn get_tables(&self) -> FederationResult<HandlerResponse> {
        let sql = self.conn.connector().tables_sql();
        let response = self.native_query(&sql).await?;
        Ok(normalize_response(
            response,
            &[("name", "table_name"), ("type", "table_type")],
        ))
    }

    async fn get_columns(&self, table: &str) -> FederationResult<HandlerResponse> {
        if table.trim().is_empty() {
            return Err(FederationError::validation("table name must not be empty"));
        }
        let sql = self.conn.connector().columns_sql(table);
        let response = self.native_query(&sql).await?;
        Ok(normalize_response(
            response,
            &[("name", "column_name"), ("type", "data_type")],
        ))
    }
}
