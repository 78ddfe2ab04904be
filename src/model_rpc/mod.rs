// Remote Model Execution
// Named model actions over a clustered or in-process transport

pub mod backoff;
pub mod client;
pub mod clustered;
pub mod envelope;
pub mod interface;
pub mod server;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use client::ModelRpcClient;
pub use clustered::ClusteredTransport;
pub use envelope::{ActionEnvelope, ActionName, ActionOutcome, Kwargs, ResultEnvelope, ENVELOPE_VERSION};
pub use interface::{CompanyScoped, ModelInterface};
pub use server::ActionServer;
pub use transport::{
    dispatch, resolve_transport, LocalTransport, ModelController, ModelTransport, TransportKind,
};
