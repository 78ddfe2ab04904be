//! Pushdown Plan
//!
//! Splits a [`SelectQuery`] against an API table into what the backend can
//! evaluate (pushed) and what must run locally after the fetch (residual).
//! Each WHERE condition lands in exactly one of the two lists.

use serde::Serialize;

use quarry_core::ast::{Expr, SelectQuery, SortDirection};
use quarry_core::{extract_comparison_conditions, ComparisonOp, Condition, FederationError, FederationResult};

use crate::config::PushdownConfig;

/// What an API table can evaluate server-side.
#[derive(Debug, Clone, Default)]
pub struct TableCapabilities {
    /// Column to operators accepted as fetch filters.
    pub filters: Vec<(String, Vec<ComparisonOp>)>,
    /// Columns accepted as sort keys.
    pub sortable: Vec<String>,
    /// Maximum number of sort keys in one fetch.
    pub max_sort_keys: usize,
    /// Whether the fetch call can restrict the returned fields.
    pub projection: bool,
    /// Largest page the backend returns; `None` when unbounded.
    pub max_page_size: Option<usize>,
    /// Used when the probe returns no rows.
    pub declared_columns: Vec<String>,
}

impl TableCapabilities {
    pub fn filter(mut self, column: &str, ops: &[ComparisonOp]) -> Self {
        self.filters.push((column.to_string(), ops.to_vec()));
        self
    }

    pub fn supports_condition(&self, condition: &Condition) -> bool {
        self.filters
            .iter()
            .any(|(column, ops)| *column == condition.column && ops.contains(&condition.op))
    }

    /// Sort pushdown is all-or-nothing across the ORDER BY keys.
    pub fn supports_sort(&self, keys: &[SortKey]) -> bool {
        !keys.is_empty()
            && keys.len() <= self.max_sort_keys
            && keys.iter().all(|key| self.sortable.contains(&key.column))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SortKey {
    pub column: String,
    pub direction: SortDirection,
}

/// One output column: the source field and the label it is returned under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectedColumn {
    pub source: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushdownPlan {
    pub projected_columns: Vec<ProjectedColumn>,
    /// Fields requested from the backend; `None` fetches everything.
    pub fetch_fields: Option<Vec<String>>,
    pub pushed_conditions: Vec<Condition>,
    pub residual_conditions: Vec<Condition>,
    pub pushed_sort: Vec<SortKey>,
    pub residual_sort: Vec<SortKey>,
    /// Rows returned to the caller.
    pub row_limit: usize,
    /// Rows requested from the backend across all pages.
    pub fetch_limit: usize,
}

impl PushdownPlan {
    /// Builds the plan. Fails before any I/O on unknown columns or
    /// constructs that cannot be evaluated.
    pub fn build(
        query: &SelectQuery,
        available: &[String],
        capabilities: &TableCapabilities,
        config: &PushdownConfig,
    ) -> FederationResult<Self> {
        let check = |column: &str| -> FederationResult<()> {
            if available.iter().any(|c| c == column) {
                Ok(())
            } else {
                Err(FederationError::unknown_column(column))
            }
        };

        let mut projected_columns = Vec::new();
        for target in &query.targets {
            match &target.expr {
                Expr::Star => projected_columns.extend(available.iter().map(|c| ProjectedColumn {
                    source: c.clone(),
                    label: c.clone(),
                })),
                Expr::Identifier(ident) => {
                    let source = ident.name().to_string();
                    check(&source)?;
                    projected_columns.push(ProjectedColumn {
                        label: target.alias.clone().unwrap_or_else(|| source.clone()),
                        source,
                    });
                }
                other => return Err(FederationError::unsupported(other.describe())),
            }
        }
        if projected_columns.is_empty() && !query.selects_all() {
            return Err(FederationError::validation("SELECT without targets"));
        }

        let conditions = extract_comparison_conditions(query.where_clause.as_ref())?;
        for condition in &conditions {
            check(&condition.column)?;
            if condition.op == ComparisonOp::Like && !matches!(condition.value, quarry_core::Value::Text(_)) {
                return Err(FederationError::validation(format!(
                    "LIKE pattern for '{}' must be text",
                    condition.column
                )));
            }
        }
        // one pushed condition per column and operator; repeats stay local
        let mut pushed_conditions: Vec<Condition> = Vec::new();
        let mut residual_conditions = Vec::new();
        for condition in conditions {
            let repeated = pushed_conditions
                .iter()
                .any(|p| p.column == condition.column && p.op == condition.op);
            if !repeated && capabilities.supports_condition(&condition) {
                pushed_conditions.push(condition);
            } else {
                residual_conditions.push(condition);
            }
        }

        let mut sort = Vec::with_capacity(query.order_by.len());
        for key in &query.order_by {
            let column = match &key.field {
                Expr::Identifier(ident) => ident.name().to_string(),
                other => return Err(FederationError::unsupported(other.describe())),
            };
            check(&column)?;
            sort.push(SortKey {
                column,
                direction: key.direction,
            });
        }
        let (pushed_sort, residual_sort) = if capabilities.supports_sort(&sort) {
            (sort, Vec::new())
        } else {
            (Vec::new(), sort)
        };

        let row_limit = query
            .limit
            .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
            .unwrap_or(config.default_limit);
        let fetch_limit = if residual_conditions.is_empty() && residual_sort.is_empty() {
            row_limit
        } else {
            config.max_scan_rows.max(row_limit)
        };

        let fetch_fields = capabilities.projection.then(|| {
            let mut fields: Vec<String> = Vec::new();
            let needed = projected_columns
                .iter()
                .map(|c| c.source.as_str())
                .chain(residual_conditions.iter().map(|c| c.column.as_str()))
                .chain(residual_sort.iter().map(|k| k.column.as_str()));
            for field in needed {
                if !fields.iter().any(|f| f == field) {
                    fields.push(field.to_string());
                }
            }
            fields
        });

        Ok(Self {
            projected_columns,
            fetch_fields,
            pushed_conditions,
            residual_conditions,
            pushed_sort,
            residual_sort,
            row_limit,
            fetch_limit,
        })
    }

    pub fn has_residual(&self) -> bool {
        !self.residual_conditions.is_empty() || !self.residual_sort.is_empty()
    }
}
