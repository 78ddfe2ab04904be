//! API table execution
//!
//! Runs a [`PushdownPlan`] against one API table: paginated fetch with the
//! pushed parameters, then local residual filter, stable sort, limit and
//! projection.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use quarry_core::ast::SortDirection;
use quarry_core::{
    ColumnInfo, CompiledCondition, Condition, DataFrame, FederationError, FederationResult, Record, SelectQuery,
    Value,
};

use crate::config::PushdownConfig;
use crate::pushdown::plan::{PushdownPlan, SortKey, TableCapabilities};

/// Parameters for one backend fetch call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchRequest {
    pub conditions: Vec<Condition>,
    pub sort: Vec<SortKey>,
    pub fields: Option<Vec<String>>,
    pub limit: usize,
    /// Opaque continuation token from the previous page.
    pub cursor: Option<String>,
}

impl FetchRequest {
    /// Minimal fetch used to discover the column list.
    pub fn probe() -> Self {
        Self {
            limit: 1,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchPage {
    pub records: Vec<Record>,
    pub next_cursor: Option<String>,
}

/// A logical table exposed by an API-style backend.
#[async_trait]
pub trait ApiTable<S>: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> TableCapabilities;

    /// Fetches one page. Pushed conditions must be applied exactly.
    async fn fetch(&self, session: &S, request: &FetchRequest) -> FederationResult<FetchPage>;
}

struct ColumnCache {
    epoch: u64,
    columns: Vec<ColumnInfo>,
}

pub struct ApiTableExecutor<S> {
    table: Arc<dyn ApiTable<S>>,
    cache: Mutex<Option<ColumnCache>>,
}

impl<S: Send + Sync> ApiTableExecutor<S> {
    pub fn new(table: Arc<dyn ApiTable<S>>) -> Self {
        Self {
            table,
            cache: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        self.table.name()
    }

    /// Column list discovered with a one-row probe, cached per connection epoch.
    pub async fn columns(&self, session: &S, epoch: u64) -> FederationResult<Vec<ColumnInfo>> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref().filter(|c| c.epoch == epoch) {
            return Ok(cached.columns.clone());
        }

        let probe = self.table.fetch(session, &FetchRequest::probe()).await?;
        let columns: Vec<ColumnInfo> = match probe.records.first() {
            Some(record) => record
                .keys()
                .map(|key| {
                    let data_type = match record.get(key) {
                        Some(value) if !value.is_null() => value.type_name(),
                        _ => "unknown",
                    };
                    ColumnInfo::new(key, data_type)
                })
                .collect(),
            None => self
                .table
                .capabilities()
                .declared_columns
                .iter()
                .map(|name| ColumnInfo::new(name.as_str(), "unknown"))
                .collect(),
        };
        debug!(table = self.table.name(), columns = columns.len(), "probed columns");

        *cache = Some(ColumnCache {
            epoch,
            columns: columns.clone(),
        });
        Ok(columns)
    }

    pub async fn select(
        &self,
        session: &S,
        epoch: u64,
        query: &SelectQuery,
        config: &PushdownConfig,
    ) -> FederationResult<DataFrame> {
        let columns = self.columns(session, epoch).await?;
        let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        let capabilities = self.table.capabilities();
        let plan = PushdownPlan::build(query, &names, &capabilities, config)?;
        let residual = plan
            .residual_conditions
            .iter()
            .map(Condition::compile)
            .collect::<FederationResult<Vec<CompiledCondition>>>()?;

        debug!(
            table = self.table.name(),
            pushed = plan.pushed_conditions.len(),
            residual = plan.residual_conditions.len(),
            sort_pushed = !plan.pushed_sort.is_empty(),
            fetch_limit = plan.fetch_limit,
            "executing pushdown plan"
        );

        let fetched = self.fetch_all(session, &plan, &capabilities).await?;
        let mut rows: Vec<Record> = fetched
            .into_iter()
            .filter(|record| residual.iter().all(|c| c.matches(record)))
            .collect();
        if !plan.residual_sort.is_empty() {
            rows.sort_by(|a, b| compare_records(a, b, &plan.residual_sort));
        }
        rows.truncate(plan.row_limit);

        let sources: Vec<&str> = plan
            .projected_columns
            .iter()
            .map(|c| c.source.as_str())
            .collect();
        let mut frame = DataFrame::from_records(&sources, &rows);
        for (info, projected) in frame.columns.iter_mut().zip(&plan.projected_columns) {
            info.name = projected.label.clone();
            if info.data_type == "unknown" {
                if let Some(known) = columns.iter().find(|c| c.name == projected.source) {
                    info.data_type = known.data_type.clone();
                }
            }
        }
        Ok(frame)
    }

    /// Issues fetch calls in page order until the limit or the last page.
    ///
    /// With residual work, reaching the scan cap while pages remain fails.
    async fn fetch_all(
        &self,
        session: &S,
        plan: &PushdownPlan,
        capabilities: &TableCapabilities,
    ) -> FederationResult<Vec<Record>> {
        let mut records = Vec::new();
        let mut cursor = None;
        let mut pages = 0usize;
        let mut more = false;

        while records.len() < plan.fetch_limit {
            let remaining = plan.fetch_limit - records.len();
            let limit = capabilities
                .max_page_size
                .map_or(remaining, |max| remaining.min(max));
            let request = FetchRequest {
                conditions: plan.pushed_conditions.clone(),
                sort: plan.pushed_sort.clone(),
                fields: plan.fetch_fields.clone(),
                limit,
                cursor: cursor.take(),
            };

            let page = self.table.fetch(session, &request).await?;
            pages += 1;
            let received = page.records.len();
            records.extend(page.records);
            match page.next_cursor {
                Some(next) if received > 0 => {
                    cursor = Some(next);
                    more = true;
                }
                _ => {
                    more = false;
                    break;
                }
            }
        }

        if plan.has_residual() && (more || records.len() > plan.fetch_limit) {
            warn!(table = self.table.name(), pages, cap = plan.fetch_limit, "scan cap reached");
            return Err(FederationError::validation(format!(
                "table '{}' has more than {} rows to evaluate locally; narrow the filter or raise pushdown.max_scan_rows",
                self.table.name(),
                plan.fetch_limit
            )));
        }

        records.truncate(plan.fetch_limit);
        debug!(table = self.table.name(), pages, rows = records.len(), "fetch complete");
        Ok(records)
    }
}

fn compare_records(a: &Record, b: &Record, keys: &[SortKey]) -> Ordering {
    let null = Value::Null;
    for key in keys {
        let left = a.get(&key.column).unwrap_or(&null);
        let right = b.get(&key.column).unwrap_or(&null);
        let ordering = match key.direction {
            SortDirection::Asc => left.sort_cmp(right),
            SortDirection::Desc => right.sort_cmp(left),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_uses_keys_in_order() {
        let keys = vec![
            SortKey {
                column: "a".into(),
                direction: SortDirection::Asc,
            },
            SortKey {
                column: "b".into(),
                direction: SortDirection::Desc,
            },
        ];
        let x = Record::new().with("a", 1).with("b", 1);
        let y = Record::new().with("a", 1).with("b", 2);
        let z = Record::new().with("a", 0).with("b", 0);

        let mut rows = vec![x.clone(), y.clone(), z.clone()];
        rows.sort_by(|l, r| compare_records(l, r, &keys));
        assert_eq!(rows, vec![z, y, x]);
    }

    #[test]
    fn stable_for_ties() {
        let keys = vec![SortKey {
            column: "k".into(),
            direction: SortDirection::Desc,
        }];
        let first = Record::new().with("k", 1).with("tag", "first");
        let second = Record::new().with("k", 1).with("tag", "second");
        let mut rows = vec![first.clone(), second.clone()];
        rows.sort_by(|l, r| compare_records(l, r, &keys));
        assert_eq!(rows, vec![first, second]);
    }
}
