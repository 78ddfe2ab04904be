// SPDX-License-Identifier: Apache-2.0

//! Core domain model for the Quarry federation layer: values and frames,
//! the query AST, WHERE-clause condition extraction, responses and errors.

pub mod ast;
pub mod conditions;
pub mod error;
pub mod response;
pub mod types;

pub use ast::{col, lit, Expr, Identifier, OrderBy, SelectQuery, SortDirection, Target};
pub use conditions::{extract_comparison_conditions, ComparisonOp, CompiledCondition, Condition};
pub use error::{FederationError, FederationResult};
pub use response::{HandlerResponse, ResponseKind, StatusResponse};
pub use types::{ColumnInfo, DataFrame, Record, Row, Value};
