//! Action server
//!
//! Serves a [`ModelController`] over the clustered framing. Requests on one
//! connection run concurrently and are answered in completion order.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use quarry_core::{FederationError, FederationResult};

use crate::model_rpc::clustered::{encode_frame, split_frame};
use crate::model_rpc::transport::{dispatch, ModelController};

pub struct ActionServer {
    listener: TcpListener,
    controller: Arc<dyn ModelController>,
}

impl ActionServer {
    pub async fn bind(address: &str, controller: Arc<dyn ModelController>) -> FederationResult<Self> {
        let listener = TcpListener::bind(address).await.map_err(|e| {
            FederationError::configuration(format!("cannot bind action server to {address}: {e}"))
        })?;
        Ok(Self {
            listener,
            controller,
        })
    }

    pub fn local_addr(&self) -> FederationResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| FederationError::internal(e.to_string()))
    }

    /// Accepts connections until the listener fails.
    pub async fn serve(self) -> FederationResult<()> {
        info!(address = ?self.listener.local_addr().ok(), "Action server listening");
        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .map_err(|e| FederationError::connectivity(format!("accept failed: {e}")))?;
            debug!(%peer, "Action client connected");
            tokio::spawn(serve_connection(stream, Arc::clone(&self.controller)));
        }
    }
}

async fn serve_connection(stream: TcpStream, controller: Arc<dyn ModelController>) {
    let _ = stream.set_nodelay(true);
    let (mut sink, mut frames) = Framed::new(stream, LengthDelimitedCodec::new()).split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                warn!(error = %e, "Failed to write action result");
                break;
            }
        }
    });

    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Action connection read failed");
                break;
            }
        };
        let (id, payload) = match split_frame(&frame) {
            Ok((id, payload)) => (id, payload.to_vec()),
            Err(e) => {
                warn!(error = %e, "Discarding malformed frame");
                continue;
            }
        };

        let controller = Arc::clone(&controller);
        let tx = tx.clone();
        tokio::spawn(async move {
            match dispatch(&controller, &payload, Some(id)).await {
                Ok(result) => {
                    let _ = tx.send(encode_frame(id, &result));
                }
                Err(e) => warn!(request_id = %id, error = %e, "Failed to encode action result"),
            }
        });
    }

    drop(tx);
    let _ = writer.await;
    debug!("Action client disconnected");
}
