// SPDX-License-Identifier: Apache-2.0

//! Generic handler for REST-style backends
//!
//! An [`ApiBackend`] supplies session setup and a set of [`ApiTable`]s;
//! [`ApiHandler`] turns that into a full [`Handler`] with pushdown-based
//! structured queries.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use quarry_core::{
    extract_comparison_conditions, ColumnInfo, DataFrame, FederationError, FederationResult,
    HandlerResponse, Row, SelectQuery, StatusResponse, Value,
};

use crate::config::PushdownConfig;
use crate::engine::args::ConnectionArgs;
use crate::engine::connection::{ConnectionState, Connector, ManagedConnection};
use crate::engine::traits::Handler;
use crate::pushdown::executor::{ApiTable, ApiTableExecutor};

/// A REST-style backend.
#[async_trait]
pub trait ApiBackend: Send + Sync + 'static {
    type Session: Clone + Send + Sync + 'static;

    const HANDLER_TYPE: &'static str;

    /// Arguments checked before `open` is called.
    fn required_args(&self) -> &'static [&'static str];

    /// Builds a session from fresh arguments.
    async fn open(&self, args: &ConnectionArgs) -> FederationResult<Self::Session>;

    async fn ping(&self, session: &Self::Session) -> FederationResult<()>;

    /// Backend-native request (e.g. a REST path).
    async fn native(&self, session: &Self::Session, query: &str) -> FederationResult<HandlerResponse>;

    fn tables(&self) -> Vec<Arc<dyn ApiTable<Self::Session>>>;
}

pub struct ApiConnector<B> {
    backend: Arc<B>,
    args: ConnectionArgs,
}

#[async_trait]
impl<B: ApiBackend> Connector for ApiConnector<B> {
    type Conn = B::Session;

    async fn establish(&self) -> FederationResult<B::Session> {
        self.args.require(B::HANDLER_TYPE, self.backend.required_args())?;
        self.backend.open(&self.args).await
    }

    async fn ping(&self, session: &B::Session) -> FederationResult<()> {
        self.backend.ping(session).await
    }

    async fn close(&self, _session: B::Session) {}
}

pub struct ApiHandler<B: ApiBackend> {
    name: String,
    backend: Arc<B>,
    conn: ManagedConnection<ApiConnector<B>>,
    tables: Vec<ApiTableExecutor<B::Session>>,
    pushdown: PushdownConfig,
}

impl<B: ApiBackend> ApiHandler<B> {
    pub fn new(name: impl Into<String>, backend: B, args: ConnectionArgs, pushdown: PushdownConfig) -> Self {
        let name = name.into();
        let backend = Arc::new(backend);
        let tables = backend
            .tables()
            .into_iter()
            .map(ApiTableExecutor::new)
            .collect();
        Self {
            conn: ManagedConnection::new(
                name.clone(),
                ApiConnector {
                    backend: Arc::clone(&backend),
                    args,
                },
            ),
            name,
            backend,
            tables,
            pushdown,
        }
    }

    fn table(&self, name: &str) -> FederationResult<&ApiTableExecutor<B::Session>> {
        self.tables
            .iter()
            .find(|t| t.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                FederationError::validation(format!(
                    "{} has no table '{}'",
                    B::HANDLER_TYPE,
                    name
                ))
            })
    }
}

#[async_trait]
impl<B: ApiBackend> Handler for ApiHandler<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn handler_type(&self) -> &'static str {
        B::HANDLER_TYPE
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
        let result = self.backend.native(&lease.conn, query).await;
        if let Err(e) = &result {
            self.conn.report(lease.epoch, e).await;
        }
        HandlerResponse::at_boundary(result)
    }

    #[instrument(skip(self, query), fields(handler = %self.name, engine = B::HANDLER_TYPE))]
    async fn query(&self, query: &SelectQuery) -> FederationResult<HandlerResponse> {
        let table_name = query
            .from
            .as_ref()
            .map(|ident| ident.name().to_string())
            .ok_or_else(|| FederationError::validation("query has no FROM table"))?;
        let table = self.table(&table_name)?;
        // reject unsupported WHERE shapes before touching the backend
        extract_comparison_conditions(query.where_clause.as_ref())?;

        let lease = match self.conn.lease().await {
            Ok(lease) => lease,
            Err(e) => return HandlerResponse::at_boundary(Err(e)),
        };
        let result = table
            .select(&lease.conn, lease.epoch, query, &self.pushdown)
            .await
            .map(HandlerResponse::table);
        if let Err(e) = &result {
            self.conn.report(lease.epoch, e).await;
        }
        HandlerResponse::at_boundary(result)
    }

    async fn get_tables(&self) -> FederationResult<HandlerResponse> {
        let rows = self
            .tables
            .iter()
            .map(|t| Row {
                values: vec![Value::Text(t.name().to_string())],
            })
            .collect();
        Ok(HandlerResponse::table(DataFrame::new(
            vec![ColumnInfo::new("table_name", "text")],
            rows,
        )))
    }

    async fn get_columns(&self, table: &str) -> FederationResult<HandlerResponse> {
        let executor = self.table(table)?;
        let lease = match self.conn.lease().await {
            Ok(lease) => lease,
            Err(e) => return HandlerResponse::at_boundary(Err(e)),
        };
        let result = executor.columns(&lease.conn, lease.epoch).await.map(|columns| {
            let rows = columns
                .into_iter()
                .map(|c| Row {
                    values: vec![Value::Text(c.name), Value::Text(c.data_type)],
                })
                .collect();
            HandlerResponse::table(DataFrame::new(
                vec![
                    ColumnInfo::new("column_name", "text"),
                    ColumnInfo::new("data_type", "text"),
                ],
                rows,
            ))
        });
        if let Err(e) = &result {
            self.conn.report(lease.epoch, e).await;
        }
        HandlerResponse::at_boundary(result)
    }
}
