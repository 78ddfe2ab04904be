// SPDX-License-Identifier: Apache-2.0

//! Shopify Admin REST handler
//!
//! Exposes the `products` table with filter pushdown on the parameters the
//! Admin API accepts, `fields=` projection and cursor pagination through
//! the `Link` response header.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value as JsonValue;
use tracing::debug;
use url::Url;

use quarry_core::{ComparisonOp, DataFrame, FederationError, FederationResult, HandlerResponse, Record, Value};

use crate::engine::args::ConnectionArgs;
use crate::observability::Sensitive;
use crate::pushdown::{ApiBackend, ApiHandler, ApiTable, FetchPage, FetchRequest, TableCapabilities};

pub const HANDLER_TYPE: &str = "shopify";
pub const DEFAULT_API_VERSION: &str = "2023-10";
const MAX_PAGE_SIZE: usize = 250;
const REQUEST_TIMEOUT_SECS: u64 = 30;
const TOKEN_HEADER: &str = "X-Shopify-Access-Token";

/// Columns of a product when the shop has none to probe.
const PRODUCT_COLUMNS: &[&str] = &[
    "id",
    "title",
    "body_html",
    "vendor",
    "product_type",
    "created_at",
    "handle",
    "updated_at",
    "published_at",
    "template_suffix",
    "published_scope",
    "tags",
    "status",
    "admin_graphql_api_id",
    "variants",
    "options",
    "images",
    "image",
];

pub type ShopifyHandler = ApiHandler<ShopifyBackend>;

#[derive(Clone)]
pub struct ShopifySession {
    client: Client,
    api_base: Url,
    token: Sensitive<String>,
}

impl ShopifySession {
    fn get(&self, url: Url) -> RequestBuilder {
        self.client
            .get(url)
            .header(TOKEN_HEADER, self.token.expose().as_str())
            .header("Accept", "application/json")
    }

    fn endpoint(&self, path: &str) -> FederationResult<Url> {
        self.api_base
            .join(path.trim().trim_start_matches('/'))
            .map_err(|e| FederationError::validation(format!("invalid Shopify path '{path}': {e}")))
    }
}

#[derive(Default)]
pub struct ShopifyBackend;

impl ShopifyBackend {
    pub fn new() -> Self {
        Self
    }
}

/// Accepts `my-shop.myshopify.com` or a full URL.
fn normalize_shop_url(raw: &str) -> FederationResult<Url> {
    let raw = raw.trim().trim_end_matches('/');
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    let url = Url::parse(&format!("{with_scheme}/"))
        .map_err(|e| FederationError::configuration(format!("invalid shop_url '{raw}': {e}")))?;
    if url.host_str().is_none() {
        return Err(FederationError::configuration(format!(
            "shop_url '{raw}' has no host"
        )));
    }
    Ok(url)
}

fn map_request_error(err: reqwest::Error) -> FederationError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        FederationError::connectivity(format!("Shopify request failed: {err}"))
    } else {
        FederationError::execution(format!("Shopify request failed: {err}"))
    }
}

/// Sends the request and decodes a JSON body, mapping HTTP failures.
async fn send_json(request: RequestBuilder) -> FederationResult<(JsonValue, Option<String>)> {
    let response = request.send().await.map_err(map_request_error)?;
    let status = response.status();
    let link = response
        .headers()
        .get(reqwest::header::LINK)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = format!("Shopify returned HTTP {status}: {body}");
        return Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FederationError::connectivity(message),
            _ => FederationError::execution(message),
        });
    }

    let body = response
        .json::<JsonValue>()
        .await
        .map_err(|e| FederationError::execution(format!("invalid Shopify response: {e}")))?;
    Ok((body, link))
}

fn query_value(value: &Value) -> String {
    match value {
        Value::Text(s) => s.clone(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items.iter().map(query_value).collect::<Vec<_>>().join(","),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Query parameters for one products page.
fn products_params(request: &FetchRequest) -> Vec<(String, String)> {
    let mut params = vec![("limit".to_string(), request.limit.to_string())];
    if let Some(fields) = &request.fields {
        params.push(("fields".to_string(), fields.join(",")));
    }
    if let Some(cursor) = &request.cursor {
        // follow-up pages reject any other filter
        params.push(("page_info".to_string(), cursor.clone()));
        return params;
    }
    for condition in &request.conditions {
        let key = match (condition.op, condition.column.as_str()) {
            (ComparisonOp::In, "id") => "ids",
            (ComparisonOp::Gt, "id") => "since_id",
            (ComparisonOp::Eq, column) => column,
            _ => continue,
        };
        params.push((key.to_string(), query_value(&condition.value)));
    }
    params
}

/// Extracts `page_info` from the `rel="next"` entry of a Link header.
fn next_page_info(link: &str) -> Option<String> {
    link.split(',').find_map(|part| {
        let (target, rel) = part.split_once(';')?;
        if !rel.contains("rel=\"next\"") {
            return None;
        }
        let target = target.trim().trim_start_matches('<').trim_end_matches('>');
        let url = Url::parse(target).ok()?;
        url.query_pairs()
            .find(|(key, _)| key == "page_info")
            .map(|(_, value)| value.into_owned())
    })
}

fn records_from_array(items: &[JsonValue]) -> Vec<Record> {
    items
        .iter()
        .map(|item| match item {
            JsonValue::Object(map) => Record::flatten(map),
            other => Record::new().with("value", Value::from_json(other)),
        })
        .collect()
}

/// Tabulates a native response: the first array in the body, or the body itself.
fn tabulate(body: &JsonValue) -> DataFrame {
    let records = match body {
        JsonValue::Array(items) => records_from_array(items),
        JsonValue::Object(map) => match map.values().find_map(|v| v.as_array()) {
            Some(items) => records_from_array(items),
            None => match map.values().find_map(|v| v.as_object()) {
                Some(inner) => vec![Record::flatten(inner)],
                None => vec![Record::flatten(map)],
            },
        },
        other => vec![Record::new().with("value", Value::from_json(other))],
    };

    let mut columns: Vec<String> = Vec::new();
    for record in &records {
        for key in record.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.to_string());
            }
        }
    }
    DataFrame::from_records(&columns, &records)
}

#[async_trait]
impl ApiBackend for ShopifyBackend {
    type Session = ShopifySession;

    const HANDLER_TYPE: &'static str = HANDLER_TYPE;

    fn required_args(&self) -> &'static [&'static str] {
        &["shop_url", "access_token"]
    }

    async fn open(&self, args: &ConnectionArgs) -> FederationResult<ShopifySession> {
        let shop = normalize_shop_url(&args.required_str(HANDLER_TYPE, "shop_url")?)?;
        let version = args
            .get_str("api_version")
            .unwrap_or_else(|| DEFAULT_API_VERSION.to_string());
        let api_base = shop
            .join(&format!("admin/api/{version}/"))
            .map_err(|e| FederationError::configuration(format!("invalid api_version: {e}")))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| FederationError::internal(format!("HTTP client setup failed: {e}")))?;

        Ok(ShopifySession {
            client,
            api_base,
            token: Sensitive::new(args.required_str(HANDLER_TYPE, "access_token")?),
        })
    }

    async fn ping(&self, session: &ShopifySession) -> FederationResult<()> {
        let url = session.endpoint("shop.json")?;
        send_json(session.get(url)).await.map(|_| ())
    }

    async fn native(&self, session: &ShopifySession, query: &str) -> FederationResult<HandlerResponse> {
        if query.trim().is_empty() {
            return Err(FederationError::validation("empty Shopify request path"));
        }
        let url = session.endpoint(query)?;
        debug!(path = %url.path(), "shopify native request");
        let (body, _) = send_json(session.get(url)).await?;
        Ok(HandlerResponse::table(tabulate(&body)))
    }

    fn tables(&self) -> Vec<Arc<dyn ApiTable<ShopifySession>>> {
        vec![Arc::new(ProductsTable)]
    }
}

pub struct ProductsTable;

#[async_trait]
impl ApiTable<ShopifySession> for ProductsTable {
    fn name(&self) -> &str {
        "products"
    }

    fn capabilities(&self) -> TableCapabilities {
        let eq = &[ComparisonOp::Eq];
        TableCapabilities {
            projection: true,
            max_page_size: Some(MAX_PAGE_SIZE),
            declared_columns: PRODUCT_COLUMNS.iter().map(|c| c.to_string()).collect(),
            ..TableCapabilities::default()
        }
        .filter("vendor", eq)
        .filter("product_type", eq)
        .filter("handle", eq)
        .filter("status", eq)
        .filter("title", eq)
        .filter("id", &[ComparisonOp::In, ComparisonOp::Gt])
    }

    async fn fetch(&self, session: &ShopifySession, request: &FetchRequest) -> FederationResult<FetchPage> {
        let url = session.endpoint("products.json")?;
        let params = products_params(request);
        let (body, link) = send_json(session.get(url).query(&params)).await?;

        let records = body
            .get("products")
            .and_then(JsonValue::as_array)
            .map(|items| records_from_array(items))
            .ok_or_else(|| FederationError::execution("Shopify response has no 'products' array"))?;

        Ok(FetchPage {
            records,
            next_cursor: link.as_deref().and_then(next_page_info),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::ast::{col, lit};
    use quarry_core::{Condition, SelectQuery};
    use serde_json::json;

    use crate::config::PushdownConfig;
    use crate::pushdown::PushdownPlan;

    fn product_filter(column: &str, value: impl Into<Value>) -> Condition {
        Condition::new(ComparisonOp::Eq, column, value)
    }

    #[test]
    fn shop_url_gets_scheme() {
        let url = normalize_shop_url("demo.myshopify.com").unwrap();
        assert_eq!(url.as_str(), "https://demo.myshopify.com/");
        assert!(normalize_shop_url("https://").is_err());
    }

    #[test]
    fn first_page_params_carry_filters() {
        let request = FetchRequest {
            conditions: vec![
                product_filter("vendor", "Acme"),
                Condition::new(
                    ComparisonOp::In,
                    "id",
                    Value::Array(vec![Value::Int(1), Value::Int(2)]),
                ),
                Condition::new(ComparisonOp::Gt, "id", 10),
            ],
            fields: Some(vec!["id".into(), "title".into()]),
            limit: 50,
            ..FetchRequest::default()
        };
        let params = products_params(&request);
        assert_eq!(
            params,
            vec![
                ("limit".to_string(), "50".to_string()),
                ("fields".to_string(), "id,title".to_string()),
                ("vendor".to_string(), "Acme".to_string()),
                ("ids".to_string(), "1,2".to_string()),
                ("since_id".to_string(), "10".to_string()),
            ]
        );
    }

    #[test]
    fn repeated_filters_send_each_key_once() {
        let query = SelectQuery::from_table("products").select(["id"]).filter(
            col("vendor")
                .eq(lit("a"))
                .and(col("vendor").eq(lit("b")))
                .and(col("id").gt(lit(5)))
                .and(col("id").gt(lit(7))),
        );
        let columns: Vec<String> = PRODUCT_COLUMNS.iter().map(|c| c.to_string()).collect();
        let plan =
            PushdownPlan::build(&query, &columns, &ProductsTable.capabilities(), &PushdownConfig::default()).unwrap();
        assert_eq!(plan.residual_conditions.len(), 2);

        let request = FetchRequest {
            conditions: plan.pushed_conditions.clone(),
            fields: plan.fetch_fields.clone(),
            limit: 250,
            ..FetchRequest::default()
        };
        let params = products_params(&request);
        for key in ["vendor", "since_id"] {
            assert_eq!(params.iter().filter(|(k, _)| k == key).count(), 1, "{key} in {params:?}");
        }
    }

    #[test]
    fn follow_up_pages_only_carry_cursor() {
        let request = FetchRequest {
            conditions: vec![product_filter("vendor", "Acme")],
            limit: 250,
            cursor: Some("abc".into()),
            ..FetchRequest::default()
        };
        assert_eq!(
            products_params(&request),
            vec![
                ("limit".to_string(), "250".to_string()),
                ("page_info".to_string(), "abc".to_string()),
            ]
        );
    }

    #[test]
    fn parses_next_link() {
        let link = "<https://demo.myshopify.com/admin/api/2023-10/products.json?limit=1&page_info=prev123>; rel=\"previous\", \
                    <https://demo.myshopify.com/admin/api/2023-10/products.json?limit=1&page_info=next456>; rel=\"next\"";
        assert_eq!(next_page_info(link), Some("next456".to_string()));
        assert_eq!(next_page_info("<https://x/y?page_info=p>; rel=\"previous\""), None);
    }

    #[test]
    fn tabulates_first_array() {
        let body = json!({"orders": [{"id": 1, "customer": {"email": "a@b.c"}}, {"id": 2, "note": "x"}]});
        let frame = tabulate(&body);
        assert_eq!(frame.column_names(), vec!["id", "customer.email", "note"]);
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.value(1, "customer.email"), Some(&Value::Null));
    }

    #[test]
    fn tabulates_single_object() {
        let body = json!({"shop": {"id": 9, "name": "Demo"}});
        let frame = tabulate(&body);
        assert_eq!(frame.column_names(), vec!["id", "name"]);
    }

    #[test]
    fn capabilities_cover_documented_filters() {
        let caps = ProductsTable.capabilities();
        assert!(caps.supports_condition(&product_filter("vendor", "Acme")));
        assert!(!caps.supports_condition(&Condition::new(ComparisonOp::Lt, "id", 5)));
        assert!(caps.sortable.is_empty());
    }
}
