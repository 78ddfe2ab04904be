// SPDX-License-Identifier: Apache-2.0

//! Remote model execution client
//!
//! Construction probes the backend with `ping` under a bounded
//! [`BackoffPolicy`]; a client only exists once the backend answered. After
//! that, [`ModelRpcClient::invoke`] sends one envelope per action.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, instrument, warn};

use quarry_core::{FederationError, FederationResult};

use crate::config::RpcConfig;
use crate::metrics;
use crate::observability::sensitive::redact_json;
use crate::model_rpc::backoff::BackoffPolicy;
use crate::model_rpc::envelope::{ActionEnvelope, ActionName, ActionOutcome, Kwargs};
use crate::model_rpc::transport::{resolve_transport, ModelController, ModelTransport, TransportKind};

pub struct ModelRpcClient {
    transport: Arc<dyn ModelTransport>,
    request_timeout: Duration,
}

impl std::fmt::Debug for ModelRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRpcClient")
            .field("transport", &self.transport.kind())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl ModelRpcClient {
    /// Resolves the transport from configuration and connects.
    pub async fn from_config(
        config: &RpcConfig,
        controller: Option<Arc<dyn ModelController>>,
        deadline: Option<Instant>,
    ) -> FederationResult<Self> {
        let transport = resolve_transport(config, controller)?;
        Self::connect(
            transport,
            &BackoffPolicy::from_config(config),
            config.request_timeout(),
            deadline,
        )
        .await
    }

    /// Probes the backend until it acknowledges `ping` or the policy is
    /// exhausted. A deadline stops the retries early; dropping the future
    /// cancels them.
    #[instrument(skip_all, fields(transport = ?transport.kind(), max_attempts = policy.max_attempts))]
    pub async fn connect(
        transport: Arc<dyn ModelTransport>,
        policy: &BackoffPolicy,
        request_timeout: Duration,
        deadline: Option<Instant>,
    ) -> FederationResult<Self> {
        let client = Self {
            transport,
            request_timeout,
        };
        let max_attempts = policy.max_attempts.max(1);
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=max_attempts {
            // an attempt never runs past the deadline
            let limit = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(FederationError::backend_unavailable(
                            attempt - 1,
                            format!("deadline reached; last error: {last_error}"),
                        ));
                    }
                    request_timeout.min(remaining)
                }
                None => request_timeout,
            };

            debug!(attempt, "Probing model backend");
            match client.ping_within(limit).await {
                Ok(()) => {
                    metrics::record_rpc_attempt(true);
                    info!(attempt, "Model backend ready");
                    return Ok(client);
                }
                Err(e) => {
                    metrics::record_rpc_attempt(false);
                    warn!(attempt, error = %e, "Waiting for model backend");
                    last_error = e.to_string();
                }
            }

            if attempt == max_attempts {
                break;
            }
            let wake = Instant::now() + policy.delay_after(attempt);
            if let Some(deadline) = deadline {
                if wake > deadline {
                    return Err(FederationError::backend_unavailable(
                        attempt,
                        format!("deadline reached; last error: {last_error}"),
                    ));
                }
            }
            sleep_until(wake).await;
        }

        Err(FederationError::backend_unavailable(max_attempts, last_error))
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Liveness check: the backend must answer `ping` with `true`.
    pub async fn ping(&self) -> FederationResult<()> {
        self.ping_within(self.request_timeout).await
    }

    async fn ping_within(&self, limit: Duration) -> FederationResult<()> {
        match self.invoke_within(limit, ActionName::Ping, Vec::new(), Kwargs::new()).await? {
            Some(JsonValue::Bool(true)) => Ok(()),
            other => Err(FederationError::protocol(format!(
                "unexpected ping acknowledgement: {other:?}"
            ))),
        }
    }

    /// Sends one action. Value-returning actions yield `Some(value)`; the
    /// others yield `None` once the backend acknowledged them.
    pub async fn invoke(
        &self,
        action: ActionName,
        args: Vec<JsonValue>,
        kwargs: Kwargs,
    ) -> FederationResult<Option<JsonValue>> {
        self.invoke_named(action.as_str(), args, kwargs, self.request_timeout)
            .await
    }

    /// Like [`invoke`](Self::invoke) with a caller-chosen timeout.
    pub async fn invoke_within(
        &self,
        limit: Duration,
        action: ActionName,
        args: Vec<JsonValue>,
        kwargs: Kwargs,
    ) -> FederationResult<Option<JsonValue>> {
        self.invoke_named(action.as_str(), args, kwargs, limit).await
    }

    /// Sends an action by wire name. Names the backend does not know come
    /// back as `UnknownAction`.
    #[instrument(skip(self, args, kwargs), fields(transport = ?self.transport.kind()))]
    pub async fn invoke_named(
        &self,
        action: &str,
        args: Vec<JsonValue>,
        kwargs: Kwargs,
        limit: Duration,
    ) -> FederationResult<Option<JsonValue>> {
        let request = ActionEnvelope::new(action, args, kwargs);
        metrics::record_rpc_invocation();
        debug!(
            request_id = %request.request_id,
            kwargs = %redact_json(&JsonValue::Object(request.kwargs.clone())),
            "Sending model action"
        );

        let result = match timeout(limit, self.transport.round_trip(&request)).await {
            Ok(result) => result?,
            Err(_) => {
                metrics::record_rpc_timeout();
                warn!(request_id = %request.request_id, "Model action timed out");
                return Err(FederationError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                });
            }
        };
        result.verify(request.request_id)?;

        match result.outcome {
            ActionOutcome::Ack => Ok(None),
            ActionOutcome::Value(value) => Ok(Some(value)),
            ActionOutcome::Failed(err) => Err(err),
        }
    }
}
