// SPDX-License-Identifier: Apache-2.0

//! Clustered transport
//!
//! Length-delimited frames over TCP. Every frame starts with the 16-byte
//! request id so a single reader task can route responses to the waiting
//! request, whatever order the scheduler answers in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};
use uuid::Uuid;

use quarry_core::{FederationError, FederationResult};

use crate::model_rpc::envelope::{ActionEnvelope, ResultEnvelope};
use crate::model_rpc::transport::{ModelTransport, TransportKind};

pub(crate) const ID_LEN: usize = 16;

type FramedTcp = Framed<TcpStream, LengthDelimitedCodec>;
type Waiters = Mutex<HashMap<Uuid, oneshot::Sender<Bytes>>>;

fn lock(waiters: &Waiters) -> MutexGuard<'_, HashMap<Uuid, oneshot::Sender<Bytes>>> {
    waiters.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn encode_frame(id: Uuid, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(ID_LEN + payload.len());
    frame.put_slice(id.as_bytes());
    frame.put_slice(payload);
    frame.freeze()
}

pub(crate) fn split_frame(frame: &[u8]) -> FederationResult<(Uuid, &[u8])> {
    if frame.len() < ID_LEN {
        return Err(FederationError::protocol(format!(
            "frame of {} bytes is shorter than the request id",
            frame.len()
        )));
    }
    let (id, payload) = frame.split_at(ID_LEN);
    let id = Uuid::from_slice(id).map_err(|e| FederationError::protocol(e.to_string()))?;
    Ok((id, payload))
}

/// One live TCP connection and its response router.
struct Link {
    sink: AsyncMutex<SplitSink<FramedTcp, Bytes>>,
    waiters: Arc<Waiters>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Removes the waiter when the request finishes or is abandoned, so a late
/// response for it is discarded.
struct WaiterGuard<'a> {
    waiters: &'a Waiters,
    id: Uuid,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        lock(self.waiters).remove(&self.id);
    }
}

async fn route_responses(mut stream: SplitStream<FramedTcp>, waiters: Arc<Waiters>, closed: Arc<AtomicBool>) {
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Cluster connection read failed");
                break;
            }
        };
        match split_frame(&frame) {
            Ok((id, payload)) => match lock(&waiters).remove(&id) {
                Some(waiter) => {
                    let _ = waiter.send(Bytes::copy_from_slice(payload));
                }
                None => debug!(request_id = %id, "Discarding response for abandoned request"),
            },
            Err(e) => warn!(error = %e, "Discarding malformed frame"),
        }
    }
    closed.store(true, Ordering::SeqCst);
    // dropping the senders fails every request still waiting
    lock(&waiters).clear();
}

/// Sends actions to a remote scheduler. Connects lazily and reconnects on
/// the next call after the connection drops.
pub struct ClusteredTransport {
    address: String,
    link: AsyncMutex<Option<Arc<Link>>>,
}

impl ClusteredTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            link: AsyncMutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn link(&self) -> FederationResult<Arc<Link>> {
        let mut current = self.link.lock().await;
        if let Some(link) = current.as_ref() {
            if !link.closed.load(Ordering::SeqCst) {
                return Ok(Arc::clone(link));
            }
        }

        let stream = TcpStream::connect(&self.address).await.map_err(|e| {
            FederationError::connectivity(format!("cannot reach model cluster at {}: {e}", self.address))
        })?;
        let _ = stream.set_nodelay(true);
        let (sink, stream) = Framed::new(stream, LengthDelimitedCodec::new()).split();

        let waiters: Arc<Waiters> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(route_responses(stream, Arc::clone(&waiters), Arc::clone(&closed)));
        let link = Arc::new(Link {
            sink: AsyncMutex::new(sink),
            waiters,
            closed,
            reader,
        });
        info!(address = %self.address, "Connected to model cluster");
        *current = Some(Arc::clone(&link));
        Ok(link)
    }
}

#[async_trait]
impl ModelTransport for ClusteredTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Clustered
    }

    async fn round_trip(&self, request: &ActionEnvelope) -> FederationResult<ResultEnvelope> {
        let link = self.link().await?;
        let payload = request.encode()?;

        let (tx, rx) = oneshot::channel();
        lock(&link.waiters).insert(request.request_id, tx);
        let _guard = WaiterGuard {
            waiters: &link.waiters,
            id: request.request_id,
        };

        {
            let mut sink = link.sink.lock().await;
            if let Err(e) = sink.send(encode_frame(request.request_id, &payload)).await {
                link.closed.store(true, Ordering::SeqCst);
                return Err(FederationError::connectivity(format!(
                    "failed to send to model cluster: {e}"
                )));
            }
        }

        let response = rx.await.map_err(|_| {
            FederationError::connectivity("model cluster connection closed before responding")
        })?;
        ResultEnvelope::decode(&response)
    }
}
