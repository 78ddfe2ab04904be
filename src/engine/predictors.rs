// SPDX-License-Identifier: Apache-2.0

//! Predictor tables
//!
//! Trained models registered with the manager show up as tables of one
//! handler. A query supplies the model inputs as `column = value` filters
//! and gets back the prediction row.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use quarry_core::{
    extract_comparison_conditions, ColumnInfo, ComparisonOp, DataFrame, Expr, FederationError,
    FederationResult, HandlerResponse, Record, Row, SelectQuery, StatusResponse, Value,
};

use crate::engine::connection::ConnectionState;
use crate::engine::traits::Handler;
use crate::model_rpc::{Kwargs, ModelInterface};

pub const HANDLER_TYPE: &str = "predictors";

/// Name the manager registers the predictor handler under.
pub const PREDICTORS_HANDLER: &str = "predictors";

/// One trained model as a table: its input columns followed by the targets.
#[derive(Debug, Clone, PartialEq)]
pub struct Predictor {
    pub name: String,
    pub targets: Vec<String>,
    pub columns: Vec<ColumnInfo>,
}

impl Predictor {
    /// Reads the `name`, `predict` and optional `dtype_dict` fields of a
    /// model description.
    pub fn from_model_data(data: &JsonValue) -> FederationResult<Self> {
        let name = data
            .get("name")
            .and_then(JsonValue::as_str)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| FederationError::validation("model data has no name"))?
            .to_string();

        let targets: Vec<String> = match data.get("predict") {
            Some(JsonValue::String(target)) => vec![target.clone()],
            Some(JsonValue::Array(items)) => items
                .iter()
                .filter_map(JsonValue::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };
        if targets.is_empty() {
            return Err(FederationError::validation(format!(
                "model '{name}' has no target column"
            )));
        }

        let mut columns: Vec<ColumnInfo> = data
            .get("dtype_dict")
            .and_then(JsonValue::as_object)
            .map(|dtypes| {
                dtypes
                    .iter()
                    .map(|(column, dtype)| {
                        ColumnInfo::new(column.clone(), dtype.as_str().unwrap_or("unknown"))
                    })
                    .collect()
            })
            .unwrap_or_default();
        for target in &targets {
            if !columns.iter().any(|c| &c.name == target) {
                columns.push(ColumnInfo::new(target.clone(), "unknown"));
            }
        }

        Ok(Self {
            name,
            targets,
            columns,
        })
    }

    fn is_target(&self, column: &str) -> bool {
        self.targets.iter().any(|t| t == column)
    }

    fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.name == column)
    }

    /// Turns `input = value` filters into the row handed to the model.
    fn when_data(&self, query: &SelectQuery) -> FederationResult<Map<String, JsonValue>> {
        let conditions = extract_comparison_conditions(query.where_clause.as_ref())?;
        if conditions.is_empty() {
            return Err(FederationError::validation(format!(
                "querying predictor '{}' needs input values in WHERE",
                self.name
            )));
        }
        let mut row = Map::new();
        for condition in conditions {
            if condition.op != ComparisonOp::Eq {
                return Err(FederationError::unsupported(format!(
                    "'{}' on predictor input '{}'",
                    condition.op, condition.column
                )));
            }
            if !self.has_column(&condition.column) || self.is_target(&condition.column) {
                return Err(FederationError::unknown_column(condition.column));
            }
            let value = serde_json::to_value(&condition.value)
                .map_err(|e| FederationError::validation(e.to_string()))?;
            row.insert(condition.column, value);
        }
        Ok(row)
    }

    /// Output names paired with the column each one reads.
    fn projection(&self, query: &SelectQuery) -> FederationResult<Vec<(String, String)>> {
        let mut out = Vec::new();
        for target in &query.targets {
            match &target.expr {
                Expr::Star => out.extend(self.columns.iter().map(|c| (c.name.clone(), c.name.clone()))),
                Expr::Identifier(ident) => {
                    let column = ident.name();
                    if !self.has_column(column) {
                        return Err(FederationError::unknown_column(column));
                    }
                    let label = target.alias.clone().unwrap_or_else(|| column.to_string());
                    out.push((label, column.to_string()));
                }
                other => return Err(FederationError::unsupported(other.describe())),
            }
        }
        Ok(out)
    }
}

/// Prediction rows come back as one object or a list of objects.
fn prediction_records(value: JsonValue) -> FederationResult<Vec<Record>> {
    match value {
        JsonValue::Object(object) => Ok(vec![Record::flatten(&object)]),
        JsonValue::Array(items) => items
            .iter()
            .map(|item| {
                item.as_object().map(Record::flatten).ok_or_else(|| {
                    FederationError::protocol("prediction rows must be objects")
                })
            })
            .collect(),
        other => Err(FederationError::protocol(format!(
            "unexpected prediction payload: {other}"
        ))),
    }
}

/// Serves registered models as tables.
pub struct PredictorHandler {
    name: String,
    models: Arc<dyn ModelInterface>,
    predictors: RwLock<BTreeMap<String, Predictor>>,
}

impl PredictorHandler {
    pub fn new(name: impl Into<String>, models: Arc<dyn ModelInterface>) -> Self {
        Self {
            name: name.into(),
            models,
            predictors: RwLock::new(BTreeMap::new()),
        }
    }

    /// Adds or replaces predictors; returns how many were registered.
    pub async fn register(&self, model_data: &[JsonValue]) -> FederationResult<usize> {
        let parsed = model_data
            .iter()
            .map(Predictor::from_model_data)
            .collect::<FederationResult<Vec<_>>>()?;
        let count = parsed.len();
        let mut predictors = self.predictors.write().await;
        for predictor in parsed {
            debug!(predictor = %predictor.name, "Registering predictor");
            predictors.insert(predictor.name.clone(), predictor);
        }
        info!(count, "Predictors registered");
        Ok(count)
    }

    /// Returns whether a predictor by that name existed.
    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.predictors.write().await.remove(name).is_some();
        if removed {
            info!(predictor = name, "Predictor unregistered");
        }
        removed
    }

    pub async fn predictor(&self, name: &str) -> Option<Predictor> {
        self.predictors.read().await.get(name).cloned()
    }

    async fn require(&self, table: &str) -> FederationResult<Predictor> {
        self.predictor(table)
            .await
            .ok_or_else(|| FederationError::validation(format!("no predictor named '{table}'")))
    }

    async fn predict(&self, query: &SelectQuery) -> FederationResult<HandlerResponse> {
        let table = query
            .from
            .as_ref()
            .map(|ident| ident.name().to_string())
            .ok_or_else(|| FederationError::validation("query has no FROM table"))?;
        let predictor = self.require(&table).await?;
        if !query.order_by.is_empty() {
            return Err(FederationError::unsupported("ORDER BY on a predictor"));
        }
        let when = predictor.when_data(query)?;
        let projection = predictor.projection(query)?;

        let raw = self
            .models
            .predict(
                vec![JsonValue::String(predictor.name.clone()), JsonValue::Object(when.clone())],
                Kwargs::new(),
            )
            .await?;
        let mut records = prediction_records(raw)?;
        if let Some(limit) = query.limit {
            records.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }

        let columns = projection
            .iter()
            .map(|(label, column)| {
                let data_type = predictor
                    .columns
                    .iter()
                    .find(|c| &c.name == column)
                    .map(|c| c.data_type.clone())
                    .unwrap_or_default();
                ColumnInfo::new(label.clone(), data_type)
            })
            .collect();
        let rows = records
            .iter()
            .map(|record| Row {
                values: projection
                    .iter()
                    .map(|(_, column)| match record.get(column) {
                        Some(value) => value.clone(),
                        // inputs are echoed when the model leaves them out
                        None => when.get(column).map(Value::from_json).unwrap_or(Value::Null),
                    })
                    .collect(),
            })
            .collect();
        Ok(HandlerResponse::table(DataFrame::new(columns, rows)))
    }
}

#[async_trait]
impl Handler for PredictorHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handler_type(&self) -> &'static str {
        HANDLER_TYPE
    }

    async fn connection_state(&self) -> ConnectionState {
        ConnectionState::Connected
    }

    async fn connect(&self) -> FederationResult<ConnectionState> {
        Ok(ConnectionState::Connected)
    }

    async fn disconnect(&self) {}

    async fn check_connection(&self) -> StatusResponse {
        match self.models.get_models(Vec::new(), Kwargs::new()).await {
            Ok(_) => StatusResponse::ok(),
            Err(e) => StatusResponse::failed(e.to_string()),
        }
    }

    async fn native_query(&self, _query: &str) -> FederationResult<HandlerResponse> {
        Err(FederationError::unsupported("native queries on predictors"))
    }

    #[instrument(skip(self, query), fields(handler = %self.name))]
    async fn query(&self, query: &SelectQuery) -> FederationResult<HandlerResponse> {
        HandlerResponse::at_boundary(self.predict(query).await)
    }

    async fn get_tables(&self) -> FederationResult<HandlerResponse> {
        let rows = self
            .predictors
            .read()
            .await
            .keys()
            .map(|name| Row {
                values: vec![Value::Text(name.clone())],
            })
            .collect();
        Ok(HandlerResponse::table(DataFrame::new(
            vec![ColumnInfo::new("table_name", "text")],
            rows,
        )))
    }

    async fn get_columns(&self, table: &str) -> FederationResult<HandlerResponse> {
        let predictor = self.require(table).await?;
        let rows = predictor
            .columns
            .into_iter()
            .map(|c| Row {
                values: vec![Value::Text(c.name), Value::Text(c.data_type)],
            })
            .collect();
        Ok(HandlerResponse::table(DataFrame::new(
            vec![
                ColumnInfo::new("column_name", "text"),
                ColumnInfo::new("data_type", "text"),
            ],
            rows,
        )))
    }
}
