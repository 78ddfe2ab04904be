// Handler Engine Module
// Uniform contract over relational databases and API-style backends

pub mod args;
pub mod connection;
pub mod drivers;
pub mod handler_manager;
pub mod predictors;
pub mod registry;
pub mod sql_generator;
pub mod traits;

pub use args::ConnectionArgs;
pub use connection::{ConnectionState, Connector, Lease, ManagedConnection};
pub use handler_manager::{HandlerManager, HandlerSummary};
pub use predictors::{Predictor, PredictorHandler};
pub use registry::{HandlerFactory, HandlerInfo, HandlerRegistry, HandlerSpec};
pub use sql_generator::{render_select, SqlDialect};
pub use traits::Handler;
