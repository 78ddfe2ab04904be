// Pushdown Module
// Structured queries against API-style backends

pub mod api_handler;
pub mod executor;
pub mod plan;

pub use api_handler::{ApiBackend, ApiHandler};
pub use executor::{ApiTable, ApiTableExecutor, FetchPage, FetchRequest};
pub use plan::{ProjectedColumn, PushdownPlan, SortKey, TableCapabilities};
