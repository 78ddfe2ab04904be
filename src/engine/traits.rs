//! Handler trait definition
//!
//! This is the core abstraction every backend implements: relational
//! databases, REST-style APIs and anything else that can answer a query.
//! Handlers are shared as `Arc<dyn Handler>` between concurrent callers.

use async_trait::async_trait;

use quarry_core::{FederationError, FederationResult, HandlerResponse, SelectQuery, StatusResponse};

use crate::engine::connection::ConnectionState;
use crate::engine::sql_generator::{render_select, SqlDialect};

/// Uniform backend contract
///
/// Operations returning `FederationResult<HandlerResponse>` only produce
/// `Err` for errors that propagate at the handler boundary (configuration,
/// malformed queries). Backend failures come back as
/// `HandlerResponse::Error`.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Instance name chosen by the caller (e.g. "warehouse_db")
    fn name(&self) -> &str;

    /// Engine identifier (e.g. "postgres", "shopify")
    fn handler_type(&self) -> &'static str;

    /// Dialect used by the default `query` implementation, if any
    fn dialect(&self) -> Option<SqlDialect> {
        None
    }

    async fn connection_state(&self) -> ConnectionState;

    /// Establishes the connection if needed. Calling it on a connected
    /// handler performs no I/O.
    async fn connect(&self) -> FederationResult<ConnectionState>;

    /// Closes the live connection; a no-op when already disconnected.
    async fn disconnect(&self);

    /// Minimal round-trip that leaves an idle handler idle.
    async fn check_connection(&self) -> StatusResponse;

    /// Executes backend-native query text.
    async fn native_query(&self, query: &str) -> FederationResult<HandlerResponse>;

    /// Executes a structured query.
    ///
    /// The default renders the AST in the handler's dialect and delegates to
    /// [`native_query`](Handler::native_query).
    async fn query(&self, query: &SelectQuery) -> FederationResult<HandlerResponse> {
        let dialect = self.dialect().ok_or_else(|| {
            FederationError::unsupported(format!(
                "structured queries on {} handlers",
                self.handler_type()
            ))
        })?;
        let sql = render_select(dialect, query)?;
        self.native_query(&sql).await
    }

    /// Lists tables; the result always has a `table_name` column.
    async fn get_tables(&self) -> FederationResult<HandlerResponse>;

    /// Lists the columns of one table as `column_name`, `data_type`.
    async fn get_columns(&self, table: &str) -> FederationResult<HandlerResponse>;
}
