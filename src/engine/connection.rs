// SPDX-License-Identifier: Apache-2.0

//! Connection lifecycle
//!
//! A handler owns exactly one [`ManagedConnection`]. The slot inside it is
//! guarded by an async mutex that stays locked while a connection is being
//! established, so concurrent callers either wait for that attempt or reuse
//! its result. Every lease carries the epoch of the connection it came
//! from; a failure reported against an older epoch is ignored.

use std::future::Future;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use quarry_core::{FederationError, FederationResult, StatusResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Failed,
}

/// A connection handed out to one operation.
#[derive(Debug, Clone)]
pub struct Lease<C> {
    pub conn: C,
    pub epoch: u64,
}

struct SlotInner<C> {
    state: ConnectionState,
    conn: Option<C>,
    epoch: u64,
    last_error: Option<String>,
}

/// Lazily established, cached connection.
pub struct ConnectionSlot<C> {
    inner: Mutex<SlotInner<C>>,
}

impl<C: Clone + Send> ConnectionSlot<C> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                state: ConnectionState::Disconnected,
                conn: None,
                epoch: 0,
                last_error: None,
            }),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.lock().await.last_error.clone()
    }

    /// Number of connections established so far.
    pub async fn epoch(&self) -> u64 {
        self.inner.lock().await.epoch
    }

    /// Returns the cached connection, establishing a new one when the slot
    /// is Disconnected or Failed.
    ///
    /// Configuration errors leave the state untouched (no I/O happened);
    /// any other failure moves the slot to Failed.
    pub async fn get_or_connect<F, Fut>(&self, connect: F) -> FederationResult<Lease<C>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FederationResult<C>>,
    {
        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::Connected {
            if let Some(conn) = &inner.conn {
                return Ok(Lease {
                    conn: conn.clone(),
                    epoch: inner.epoch,
                });
            }
        }

        match connect().await {
            Ok(conn) => {
                inner.epoch += 1;
                inner.state = ConnectionState::Connected;
                inner.conn = Some(conn.clone());
                inner.last_error = None;
                Ok(Lease {
                    conn,
                    epoch: inner.epoch,
                })
            }
            Err(err) => {
                if !matches!(err, FederationError::Configuration { .. }) {
                    inner.state = ConnectionState::Failed;
                    inner.last_error = Some(err.to_string());
                }
                Err(err)
            }
        }
    }

    /// Moves the slot to Failed if `epoch` is still current, returning the
    /// dropped connection so the caller can close it.
    pub async fn mark_failed(&self, epoch: u64, error: &FederationError) -> Option<C> {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch || inner.state != ConnectionState::Connected {
            return None;
        }
        inner.state = ConnectionState::Failed;
        inner.last_error = Some(error.to_string());
        inner.conn.take()
    }

    /// The live connection, without establishing one.
    pub async fn current(&self) -> Option<Lease<C>> {
        let inner = self.inner.lock().await;
        match (&inner.state, &inner.conn) {
            (ConnectionState::Connected, Some(conn)) => Some(Lease {
                conn: conn.clone(),
                epoch: inner.epoch,
            }),
            _ => None,
        }
    }

    /// Records the outcome of a probe made outside the slot. A slot that
    /// got connected in the meantime is left alone.
    pub async fn record_probe(&self, error: Option<&FederationError>) {
        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::Connected {
            return;
        }
        match error {
            Some(err) => {
                inner.state = ConnectionState::Failed;
                inner.last_error = Some(err.to_string());
            }
            None => {
                inner.state = ConnectionState::Disconnected;
                inner.last_error = None;
            }
        }
    }

    /// Resets to Disconnected and hands back the live connection, if any.
    pub async fn take(&self) -> Option<C> {
        let mut inner = self.inner.lock().await;
        inner.state = ConnectionState::Disconnected;
        inner.last_error = None;
        inner.conn.take()
    }
}

impl<C: Clone + Send> Default for ConnectionSlot<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Backend-specific connection establishment.
#[async_trait]
pub trait Connector: Send + Sync {
    type Conn: Clone + Send + Sync + 'static;

    /// Validates arguments and opens a connection.
    async fn establish(&self) -> FederationResult<Self::Conn>;

    /// Minimal round-trip used by health checks.
    async fn ping(&self, conn: &Self::Conn) -> FederationResult<()>;

    /// Releases the connection. Must tolerate an already-closed connection.
    async fn close(&self, conn: Self::Conn);
}

/// A connector plus the slot holding its single live connection.
pub struct ManagedConnection<K: Connector> {
    handler: String,
    connector: K,
    slot: ConnectionSlot<K::Conn>,
}

impl<K: Connector> ManagedConnection<K> {
    pub fn new(handler: impl Into<String>, connector: K) -> Self {
        Self {
            handler: handler.into(),
            connector,
            slot: ConnectionSlot::new(),
        }
    }

    pub fn connector(&self) -> &K {
        &self.connector
    }

    pub async fn state(&self) -> ConnectionState {
        self.slot.state().await
    }

    pub async fn epoch(&self) -> u64 {
        self.slot.epoch().await
    }

    pub async fn lease(&self) -> FederationResult<Lease<K::Conn>> {
        let handler = &self.handler;
        self.slot
            .get_or_connect(|| async move {
                debug!(handler = %handler, "establishing connection");
                let result = self.connector.establish().await;
                match &result {
                    Ok(_) => info!(handler = %handler, "connected"),
                    Err(e) => warn!(handler = %handler, error = %e, "connect failed"),
                }
                result
            })
            .await
    }

    /// Records an operation failure; connectivity failures invalidate the lease.
    pub async fn report(&self, lease_epoch: u64, error: &FederationError) {
        if !error.is_connectivity() {
            return;
        }
        warn!(handler = %self.handler, error = %error, "connection marked failed");
        if let Some(conn) = self.slot.mark_failed(lease_epoch, error).await {
            self.connector.close(conn).await;
        }
    }

    pub async fn disconnect(&self) {
        if let Some(conn) = self.slot.take().await {
            self.connector.close(conn).await;
            info!(handler = %self.handler, "disconnected");
        }
    }

    /// Health check that leaves a previously idle handler idle.
    ///
    /// A connected handler pings its live connection. An idle one probes
    /// with a temporary connection that never enters the slot, so leases
    /// taken meanwhile are unaffected.
    pub async fn check(&self) -> StatusResponse {
        if let Some(lease) = self.slot.current().await {
            return match self.connector.ping(&lease.conn).await {
                Ok(()) => StatusResponse::ok(),
                Err(e) => {
                    let failure = as_connectivity(e);
                    self.report(lease.epoch, &failure).await;
                    StatusResponse::failed(failure.to_string())
                }
            };
        }

        let conn = match self.connector.establish().await {
            Ok(conn) => conn,
            Err(e) => {
                if !matches!(e, FederationError::Configuration { .. }) {
                    self.slot.record_probe(Some(&e)).await;
                }
                return StatusResponse::failed(e.to_string());
            }
        };
        let result = self.connector.ping(&conn).await;
        self.connector.close(conn).await;

        match result {
            Ok(()) => {
                self.slot.record_probe(None).await;
                StatusResponse::ok()
            }
            Err(e) => {
                let failure = as_connectivity(e);
                warn!(handler = %self.handler, error = %failure, "health check failed");
                self.slot.record_probe(Some(&failure)).await;
                StatusResponse::failed(failure.to_string())
            }
        }
    }
}

fn as_connectivity(err: FederationError) -> FederationError {
    match err {
        FederationError::Connectivity { .. } | FederationError::Timeout { .. } => err,
        other => FederationError::connectivity(other.to_string()),
    }
}
