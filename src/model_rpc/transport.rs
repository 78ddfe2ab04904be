//! Transports for model actions
//!
//! Callers see one [`ModelTransport`] contract; the concrete transport is
//! chosen once from configuration by [`resolve_transport`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use uuid::Uuid;

use quarry_core::{FederationError, FederationResult};

use crate::config::{RpcConfig, TransportMode};
use crate::model_rpc::clustered::ClusteredTransport;
use crate::model_rpc::envelope::{
    ActionEnvelope, ActionName, ActionOutcome, Kwargs, ResultEnvelope, ENVELOPE_VERSION,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Clustered,
    Local,
}

/// Moves one action envelope to the backend and its result back.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn round_trip(&self, request: &ActionEnvelope) -> FederationResult<ResultEnvelope>;
}

/// Executes model actions. Implemented by whatever owns the models.
#[async_trait]
pub trait ModelController: Send + Sync + 'static {
    async fn execute(
        &self,
        action: ActionName,
        args: Vec<JsonValue>,
        kwargs: Kwargs,
    ) -> FederationResult<JsonValue>;
}

/// Runs one decoded request against a controller.
///
/// Value-returning actions are awaited. The others are spawned and
/// acknowledged at once; their failures are only logged.
pub async fn execute_envelope(controller: &Arc<dyn ModelController>, request: ActionEnvelope) -> ResultEnvelope {
    let request_id = request.request_id;
    if request.version != ENVELOPE_VERSION {
        return ResultEnvelope::new(
            request_id,
            ActionOutcome::Failed(FederationError::protocol(format!(
                "envelope version mismatch: expected {ENVELOPE_VERSION}, got {}",
                request.version
            ))),
        );
    }
    let action = match request.action.parse::<ActionName>() {
        Ok(action) => action,
        Err(e) => return ResultEnvelope::new(request_id, ActionOutcome::Failed(e)),
    };

    if action.returns_value() {
        let outcome = match controller.execute(action, request.args, request.kwargs).await {
            Ok(value) => ActionOutcome::Value(value),
            Err(e) => ActionOutcome::Failed(e),
        };
        return ResultEnvelope::new(request_id, outcome);
    }

    let controller = Arc::clone(controller);
    tokio::spawn(async move {
        if let Err(e) = controller.execute(action, request.args, request.kwargs).await {
            warn!(%action, %request_id, error = %e, "Model action failed");
        }
    });
    ResultEnvelope::new(request_id, ActionOutcome::Ack)
}

/// Decodes request bytes, executes them and encodes the result.
///
/// An undecodable request is answered under its own id when that can be
/// read, else under `frame_id`, so the caller sees the decode error.
pub async fn dispatch(
    controller: &Arc<dyn ModelController>,
    request: &[u8],
    frame_id: Option<Uuid>,
) -> FederationResult<Vec<u8>> {
    let result = match ActionEnvelope::decode(request) {
        Ok(envelope) => {
            debug!(action = %envelope.action, request_id = %envelope.request_id, "Dispatching model action");
            execute_envelope(controller, envelope).await
        }
        Err(e) => {
            let request_id = ActionEnvelope::peek_request_id(request)
                .or(frame_id)
                .unwrap_or_else(Uuid::nil);
            warn!(%request_id, error = %e, "Rejecting malformed action");
            ResultEnvelope::new(request_id, ActionOutcome::Failed(e))
        }
    };
    result.encode()
}

/// In-process transport. Requests still go through the envelope codec so
/// both transports see identical bytes.
pub struct LocalTransport {
    controller: Arc<dyn ModelController>,
}

impl LocalTransport {
    pub fn new(controller: Arc<dyn ModelController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl ModelTransport for LocalTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    async fn round_trip(&self, request: &ActionEnvelope) -> FederationResult<ResultEnvelope> {
        let bytes = request.encode()?;
        let response = dispatch(&self.controller, &bytes, None).await?;
        ResultEnvelope::decode(&response)
    }
}

/// Picks the transport from configuration.
///
/// `auto` selects the clustered transport when a cluster address is set;
/// the local transport needs a controller.
pub fn resolve_transport(
    config: &RpcConfig,
    controller: Option<Arc<dyn ModelController>>,
) -> FederationResult<Arc<dyn ModelTransport>> {
    let mode = match config.transport {
        TransportMode::Auto if config.cluster_address.is_some() => TransportMode::Clustered,
        TransportMode::Auto => TransportMode::Local,
        explicit => explicit,
    };

    match mode {
        TransportMode::Clustered => {
            let address = config.cluster_address.clone().ok_or_else(|| {
                FederationError::configuration("clustered transport requires cluster_address")
            })?;
            Ok(Arc::new(ClusteredTransport::new(address)))
        }
        _ => {
            let controller = controller.ok_or_else(|| {
                FederationError::configuration("local transport requires a model controller")
            })?;
            Ok(Arc::new(LocalTransport::new(controller)))
        }
    }
}
