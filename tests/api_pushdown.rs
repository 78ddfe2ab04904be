use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use proptest::prelude::*;

use quarry_lib::config::PushdownConfig;
use quarry_lib::engine::{ConnectionArgs, ConnectionState, Handler};
use quarry_lib::pushdown::{ApiBackend, ApiHandler, ApiTable, FetchPage, FetchRequest, TableCapabilities};
use quarry_lib::quarry_core::ast::{col, lit, Expr, SelectQuery, SortDirection};
use quarry_lib::quarry_core::{
    ComparisonOp, Condition, DataFrame, FederationError, FederationResult, HandlerResponse, Record, Value,
};

/// In-memory REST-style table that records every fetch it serves.
struct ProductsApi {
    rows: Vec<Record>,
    page_size: usize,
    requests: Arc<Mutex<Vec<FetchRequest>>>,
}

#[async_trait]
impl ApiTable<Session> for ProductsApi {
    fn name(&self) -> &str {
        "products"
    }

    fn capabilities(&self) -> TableCapabilities {
        TableCapabilities {
            projection: true,
            max_page_size: Some(self.page_size),
            declared_columns: ["id", "location", "sqft", "price", "vendor"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            ..TableCapabilities::default()
        }
        .filter("price", &[ComparisonOp::Gt, ComparisonOp::Lt])
        .filter("vendor", &[ComparisonOp::Eq, ComparisonOp::In])
    }

    async fn fetch(&self, _session: &Session, request: &FetchRequest) -> FederationResult<FetchPage> {
        self.requests.lock().unwrap().push(request.clone());

        let mut matching = Vec::new();
        for row in &self.rows {
            let mut keep = true;
            for condition in &request.conditions {
                keep &= condition.matches(row)?;
            }
            if keep {
                matching.push(row.clone());
            }
        }

        let offset: usize = request.cursor.as_deref().map_or(0, |c| c.parse().unwrap());
        let end = (offset + request.limit.min(self.page_size)).min(matching.len());
        let records = matching[offset.min(end)..end]
            .iter()
            .map(|row| match &request.fields {
                Some(fields) => fields.iter().fold(Record::new(), |record, field| {
                    record.with(field.as_str(), row.get(field).cloned().unwrap_or(Value::Null))
                }),
                None => row.clone(),
            })
            .collect();

        Ok(FetchPage {
            records,
            next_cursor: (end < matching.len()).then(|| end.to_string()),
        })
    }
}

#[derive(Clone)]
struct Session;

struct MockBackend {
    rows: Vec<Record>,
    page_size: usize,
    opened: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<FetchRequest>>>,
}

#[async_trait]
impl ApiBackend for MockBackend {
    type Session = Session;

    const HANDLER_TYPE: &'static str = "mock";

    fn required_args(&self) -> &'static [&'static str] {
        &["api_key"]
    }

    async fn open(&self, _args: &ConnectionArgs) -> FederationResult<Session> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Session)
    }

    async fn ping(&self, _session: &Session) -> FederationResult<()> {
        Ok(())
    }

    async fn native(&self, _session: &Session, query: &str) -> FederationResult<HandlerResponse> {
        Err(FederationError::execution(format!("cannot run '{query}'")))
    }

    fn tables(&self) -> Vec<Arc<dyn ApiTable<Session>>> {
        vec![Arc::new(ProductsApi {
            rows: self.rows.clone(),
            page_size: self.page_size,
            requests: Arc::clone(&self.requests),
        })]
    }
}

struct Fixture {
    handler: ApiHandler<MockBackend>,
    opened: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<FetchRequest>>>,
}

impl Fixture {
    fn new(rows: Vec<Record>, page_size: usize) -> Self {
        Self::with_config(rows, page_size, PushdownConfig::default())
    }

    fn with_config(rows: Vec<Record>, page_size: usize, config: PushdownConfig) -> Self {
        let opened = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let backend = MockBackend {
            rows,
            page_size,
            opened: Arc::clone(&opened),
            requests: Arc::clone(&requests),
        };
        let handler = ApiHandler::new(
            "store",
            backend,
            ConnectionArgs::new().with("api_key", "k"),
            config,
        );
        Self {
            handler,
            opened,
            requests,
        }
    }

    fn query_requests(&self) -> Vec<FetchRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| **r != FetchRequest::probe())
            .cloned()
            .collect()
    }

    fn probes(&self) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| **r == FetchRequest::probe())
            .count()
    }

    async fn select(&self, query: &SelectQuery) -> DataFrame {
        self.handler
            .query(query)
            .await
            .unwrap()
            .into_frame()
            .expect("table response")
    }
}

fn product(id: i64, location: &str, sqft: i64, price: i64, vendor: &str) -> Record {
    Record::new()
        .with("id", id)
        .with("location", location)
        .with("sqft", sqft)
        .with("price", price)
        .with("vendor", vendor)
}

fn catalogue() -> Vec<Record> {
    vec![
        product(1, "downtown", 80, 250, "acme"),
        product(2, "harbour", 120, 90, "acme"),
        product(3, "uptown", 150, 300, "globex"),
        product(4, "suburb", 200, 180, "initech"),
        product(5, "midtown", 95, 120, "globex"),
        product(6, "riverside", 60, 500, "acme"),
    ]
}

#[tokio::test]
async fn example_query_pushes_filter_and_sorts_locally() {
    let fixture = Fixture::new(catalogue(), 2);
    let query = SelectQuery::from_table("products")
        .select(["location", "sqft"])
        .filter(col("price").gt(lit(100)))
        .order_by("sqft", SortDirection::Desc)
        .limit(3);

    let frame = fixture.select(&query).await;
    assert_eq!(frame.column_names(), vec!["location", "sqft"]);
    let locations: Vec<&Value> = (0..frame.len()).map(|i| frame.value(i, "location").unwrap()).collect();
    assert_eq!(
        locations,
        vec![
            &Value::Text("suburb".into()),
            &Value::Text("uptown".into()),
            &Value::Text("midtown".into()),
        ]
    );

    let requests = fixture.query_requests();
    assert!(!requests.is_empty());
    for request in &requests {
        assert_eq!(request.conditions, vec![Condition::new(ComparisonOp::Gt, "price", 100)]);
        assert!(request.sort.is_empty());
        assert_eq!(request.fields, Some(vec!["location".to_string(), "sqft".to_string()]));
    }
    // five rows match the pushed filter; pages of two
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[1].cursor.as_deref(), Some("2"));
}

#[tokio::test]
async fn limit_is_pushed_when_nothing_is_residual() {
    let fixture = Fixture::new(catalogue(), 10);
    let query = SelectQuery::from_table("products")
        .filter(col("vendor").eq(lit("acme")))
        .limit(2);

    let frame = fixture.select(&query).await;
    assert_eq!(frame.len(), 2);
    let requests = fixture.query_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].limit, 2);
}

#[tokio::test]
async fn scan_cap_with_pages_left_is_an_error() {
    let rows: Vec<Record> = (1..=10).map(|id| product(id, "x", 100, 100, "acme")).collect();
    let capped = PushdownConfig {
        max_scan_rows: 4,
        ..PushdownConfig::default()
    };
    let query = SelectQuery::from_table("products")
        .select(["id"])
        .order_by("id", SortDirection::Desc)
        .limit(1);

    let fixture = Fixture::with_config(rows.clone(), 2, capped);
    let err = fixture.handler.query(&query).await.unwrap_err();
    assert!(matches!(err, FederationError::Validation { .. }));
    assert!(err.to_string().contains("max_scan_rows"));

    let fixture = Fixture::with_config(rows, 2, PushdownConfig::default());
    let frame = fixture.select(&query).await;
    assert_eq!(frame.value(0, "id"), Some(&Value::Int(10)));
}

#[tokio::test]
async fn scan_cap_is_fine_when_table_fits() {
    let rows: Vec<Record> = (1..=4).map(|id| product(id, "x", 100, 100, "acme")).collect();
    let capped = PushdownConfig {
        max_scan_rows: 4,
        ..PushdownConfig::default()
    };
    let fixture = Fixture::with_config(rows, 2, capped);
    let query = SelectQuery::from_table("products")
        .select(["id"])
        .order_by("id", SortDirection::Desc)
        .limit(1);
    let frame = fixture.select(&query).await;
    assert_eq!(frame.value(0, "id"), Some(&Value::Int(4)));
}

#[tokio::test]
async fn zero_matches_keep_projected_columns() {
    let fixture = Fixture::new(catalogue(), 10);
    let query = SelectQuery::from_table("products")
        .select(["location", "sqft"])
        .filter(col("vendor").eq(lit("nobody")));

    let frame = fixture.select(&query).await;
    assert!(frame.is_empty());
    assert_eq!(frame.column_names(), vec!["location", "sqft"]);
}

#[tokio::test]
async fn empty_table_uses_declared_columns() {
    let fixture = Fixture::new(Vec::new(), 10);
    let frame = fixture.select(&SelectQuery::from_table("products")).await;
    assert!(frame.is_empty());
    assert_eq!(frame.column_names(), vec!["id", "location", "sqft", "price", "vendor"]);
}

#[tokio::test]
async fn unknown_column_fails_before_any_data_fetch() {
    let fixture = Fixture::new(catalogue(), 10);
    let query = SelectQuery::from_table("products").select(["colour"]);

    let err = fixture.handler.query(&query).await.unwrap_err();
    assert_eq!(err, FederationError::unknown_column("colour"));
    assert!(fixture.query_requests().is_empty());
}

#[tokio::test]
async fn or_is_rejected_without_io() {
    let fixture = Fixture::new(catalogue(), 10);
    let query = SelectQuery::from_table("products")
        .filter(col("price").gt(lit(100)).or(col("vendor").eq(lit("acme"))));

    let err = fixture.handler.query(&query).await.unwrap_err();
    assert!(matches!(err, FederationError::UnsupportedQuery { .. }));
    assert_eq!(fixture.opened.load(Ordering::SeqCst), 0);
    assert!(fixture.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_table_is_validation_error() {
    let fixture = Fixture::new(catalogue(), 10);
    let err = fixture
        .handler
        .query(&SelectQuery::from_table("orders"))
        .await
        .unwrap_err();
    assert!(matches!(err, FederationError::Validation { .. }));
}

#[tokio::test]
async fn connect_is_idempotent() {
    let fixture = Fixture::new(catalogue(), 10);
    assert_eq!(fixture.handler.connect().await.unwrap(), ConnectionState::Connected);
    assert_eq!(fixture.handler.connect().await.unwrap(), ConnectionState::Connected);
    assert_eq!(fixture.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_credentials_are_named() {
    let handler = ApiHandler::new(
        "store",
        MockBackend {
            rows: Vec::new(),
            page_size: 10,
            opened: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        },
        ConnectionArgs::new(),
        PushdownConfig::default(),
    );
    let err = handler.connect().await.unwrap_err();
    assert_eq!(err, FederationError::missing_fields("mock", &["api_key"]));
}

#[tokio::test]
async fn column_cache_follows_connection() {
    let fixture = Fixture::new(catalogue(), 10);
    fixture.select(&SelectQuery::from_table("products")).await;
    fixture.select(&SelectQuery::from_table("products").select(["id"])).await;
    assert_eq!(fixture.probes(), 1);

    fixture.handler.disconnect().await;
    fixture.select(&SelectQuery::from_table("products")).await;
    assert_eq!(fixture.probes(), 2);
    assert_eq!(fixture.opened.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn introspection_lists_tables_and_columns() {
    let fixture = Fixture::new(catalogue(), 10);
    let tables = fixture.handler.get_tables().await.unwrap().into_frame().unwrap();
    assert_eq!(tables.column_names(), vec!["table_name"]);
    assert_eq!(tables.value(0, "table_name"), Some(&Value::Text("products".into())));

    let columns = fixture.handler.get_columns("products").await.unwrap().into_frame().unwrap();
    assert_eq!(columns.column_names(), vec!["column_name", "data_type"]);
    assert_eq!(columns.len(), 5);
}

#[tokio::test]
async fn native_failure_is_error_response() {
    let fixture = Fixture::new(catalogue(), 10);
    let response = fixture.handler.native_query("GET /nowhere").await.unwrap();
    assert!(response.is_error());
    assert!(response.error_message().unwrap().contains("/nowhere"));
    assert_eq!(fixture.handler.connection_state().await, ConnectionState::Connected);
}

// --- pushdown equivalence -------------------------------------------------

#[derive(Debug, Clone)]
enum Pred {
    Price(ComparisonOp, i64),
    Sqft(ComparisonOp, i64),
    VendorEq(String),
    VendorNotEq(String),
    VendorIn(Vec<String>),
    VendorLike(String),
}

const VENDORS: &[&str] = &["acme", "globex", "initech"];

fn numeric_op() -> impl Strategy<Value = ComparisonOp> {
    prop_oneof![
        Just(ComparisonOp::Eq),
        Just(ComparisonOp::NotEq),
        Just(ComparisonOp::Lt),
        Just(ComparisonOp::LtEq),
        Just(ComparisonOp::Gt),
        Just(ComparisonOp::GtEq),
    ]
}

fn vendor() -> impl Strategy<Value = String> {
    prop::sample::select(VENDORS).prop_map(str::to_string)
}

fn pred() -> impl Strategy<Value = Pred> {
    prop_oneof![
        (numeric_op(), 0i64..500).prop_map(|(op, v)| Pred::Price(op, v)),
        (numeric_op(), 0i64..300).prop_map(|(op, v)| Pred::Sqft(op, v)),
        vendor().prop_map(Pred::VendorEq),
        vendor().prop_map(Pred::VendorNotEq),
        prop::collection::vec(vendor(), 1..3).prop_map(Pred::VendorIn),
        prop_oneof![Just("a%"), Just("%e%"), Just("_lobex"), Just("%h")]
            .prop_map(|p| Pred::VendorLike(p.to_string())),
    ]
}

fn numeric_expr(column: &str, op: ComparisonOp, value: i64) -> Expr {
    let (left, right) = (col(column), lit(value));
    match op {
        ComparisonOp::Eq => left.eq(right),
        ComparisonOp::NotEq => left.not_eq(right),
        ComparisonOp::Lt => left.lt(right),
        ComparisonOp::LtEq => left.lt_eq(right),
        ComparisonOp::Gt => left.gt(right),
        _ => left.gt_eq(right),
    }
}

impl Pred {
    fn expr(&self) -> Expr {
        match self {
            Pred::Price(op, v) => numeric_expr("price", *op, *v),
            Pred::Sqft(op, v) => numeric_expr("sqft", *op, *v),
            Pred::VendorEq(v) => col("vendor").eq(lit(v.as_str())),
            Pred::VendorNotEq(v) => col("vendor").not_eq(lit(v.as_str())),
            Pred::VendorIn(vs) => col("vendor").in_list(vs.iter().map(|v| lit(v.as_str())).collect()),
            Pred::VendorLike(p) => col("vendor").like(lit(p.as_str())),
        }
    }

    /// Direct evaluation of the predicate, independent of the crate's evaluator.
    fn holds(&self, price: i64, sqft: i64, vendor: &str) -> bool {
        fn cmp(op: ComparisonOp, actual: i64, expected: i64) -> bool {
            match op {
                ComparisonOp::Eq => actual == expected,
                ComparisonOp::NotEq => actual != expected,
                ComparisonOp::Lt => actual < expected,
                ComparisonOp::LtEq => actual <= expected,
                ComparisonOp::Gt => actual > expected,
                _ => actual >= expected,
            }
        }
        match self {
            Pred::Price(op, v) => cmp(*op, price, *v),
            Pred::Sqft(op, v) => cmp(*op, sqft, *v),
            Pred::VendorEq(v) => vendor == v,
            Pred::VendorNotEq(v) => vendor != v,
            Pred::VendorIn(vs) => vs.iter().any(|v| v == vendor),
            Pred::VendorLike(p) => match p.as_str() {
                "a%" => vendor.starts_with('a'),
                "%e%" => vendor.contains('e'),
                "_lobex" => vendor.len() == 6 && vendor.ends_with("lobex"),
                _ => vendor.ends_with('h'),
            },
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn pushdown_matches_local_evaluation(
        rows in prop::collection::vec((0i64..500, 0i64..300, vendor()), 0..25),
        preds in prop::collection::vec(pred(), 1..4),
        page_size in 1usize..6,
    ) {
        let records: Vec<Record> = rows
            .iter()
            .enumerate()
            .map(|(i, (price, sqft, vendor))| product(i as i64, "x", *sqft, *price, vendor))
            .collect();
        let expected: Vec<i64> = rows
            .iter()
            .enumerate()
            .filter(|(_, (price, sqft, vendor))| preds.iter().all(|p| p.holds(*price, *sqft, vendor)))
            .map(|(i, _)| i as i64)
            .collect();

        let predicate = preds
            .iter()
            .map(Pred::expr)
            .reduce(Expr::and)
            .unwrap();
        let query = SelectQuery::from_table("products")
            .select(["id"])
            .filter(predicate)
            .order_by("id", SortDirection::Asc)
            .limit(1_000);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let frame = runtime.block_on(async {
            let fixture = Fixture::new(records, page_size);
            fixture.select(&query).await
        });

        let actual: Vec<i64> = (0..frame.len())
            .map(|i| match frame.value(i, "id") {
                Some(Value::Int(id)) => *id,
                other => panic!("unexpected id {other:?}"),
            })
            .collect();
        prop_assert_eq!(actual, expected);
    }
}
