//! Action envelopes
//!
//! One MessagePack envelope per invocation and one per result. Both carry a
//! format version and the request id so stale or foreign frames can be
//! rejected by name.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use quarry_core::{FederationError, FederationResult};

pub const ENVELOPE_VERSION: u16 = 1;

pub type Kwargs = Map<String, JsonValue>;

/// Actions understood by the model backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionName {
    Ping,
    Create,
    Learn,
    Predict,
    AnalyseDataset,
    GetModelData,
    GetModels,
    DeleteModel,
}

impl ActionName {
    pub const ALL: [ActionName; 8] = [
        ActionName::Ping,
        ActionName::Create,
        ActionName::Learn,
        ActionName::Predict,
        ActionName::AnalyseDataset,
        ActionName::GetModelData,
        ActionName::GetModels,
        ActionName::DeleteModel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionName::Ping => "ping",
            ActionName::Create => "create",
            ActionName::Learn => "learn",
            ActionName::Predict => "predict",
            ActionName::AnalyseDataset => "analyse_dataset",
            ActionName::GetModelData => "get_model_data",
            ActionName::GetModels => "get_models",
            ActionName::DeleteModel => "delete_model",
        }
    }

    /// Whether the caller waits for a value rather than an acknowledgement.
    pub fn returns_value(&self) -> bool {
        matches!(
            self,
            ActionName::Ping
                | ActionName::Predict
                | ActionName::AnalyseDataset
                | ActionName::GetModelData
                | ActionName::GetModels
        )
    }
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionName {
    type Err = FederationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionName::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| FederationError::unknown_action(s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEnvelope {
    pub version: u16,
    pub request_id: Uuid,
    /// Kept as text on the wire so unknown names reach the server intact.
    pub action: String,
    pub args: Vec<JsonValue>,
    pub kwargs: Kwargs,
}

impl ActionEnvelope {
    pub fn new(action: impl Into<String>, args: Vec<JsonValue>, kwargs: Kwargs) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            request_id: Uuid::new_v4(),
            action: action.into(),
            args,
            kwargs,
        }
    }

    pub fn encode(&self) -> FederationResult<Vec<u8>> {
        rmp_serde::to_vec_named(self)
            .map_err(|e| FederationError::protocol(format!("failed to encode action: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> FederationResult<Self> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| FederationError::protocol(format!("malformed action envelope: {e}")))
    }

    /// Reads only the request id, for answering envelopes that fail to decode.
    pub fn peek_request_id(bytes: &[u8]) -> Option<Uuid> {
        #[derive(Deserialize)]
        struct Header {
            request_id: Uuid,
        }
        rmp_serde::from_slice::<Header>(bytes).ok().map(|h| h.request_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionOutcome {
    Ack,
    Value(JsonValue),
    Failed(FederationError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub version: u16,
    pub request_id: Uuid,
    pub outcome: ActionOutcome,
}

impl ResultEnvelope {
    pub fn new(request_id: Uuid, outcome: ActionOutcome) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            request_id,
            outcome,
        }
    }

    pub fn encode(&self) -> FederationResult<Vec<u8>> {
        rmp_serde::to_vec_named(self)
            .map_err(|e| FederationError::protocol(format!("failed to encode result: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> FederationResult<Self> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| FederationError::protocol(format!("malformed result envelope: {e}")))
    }

    /// Checks version and correlation against the request that was sent.
    pub fn verify(&self, request_id: Uuid) -> FederationResult<()> {
        if self.version != ENVELOPE_VERSION {
            return Err(FederationError::protocol(format!(
                "envelope version mismatch: expected {ENVELOPE_VERSION}, got {}",
                self.version
            )));
        }
        if self.request_id != request_id {
            return Err(FederationError::protocol(format!(
                "response {} does not match request {request_id}",
                self.request_id
            )));
        }
        Ok(())
    }
}
