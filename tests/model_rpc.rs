use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Notify;
use tokio::time::Instant;

use quarry_lib::config::{RpcConfig, TransportMode};
use quarry_lib::model_rpc::{
    ActionEnvelope, ActionName, ActionServer, BackoffPolicy, ClusteredTransport, CompanyScoped, Kwargs,
    LocalTransport, ModelController, ModelInterface, ModelRpcClient, ModelTransport, ResultEnvelope,
    TransportKind,
};
use quarry_lib::quarry_core::{FederationError, FederationResult};

/// Model backend stand-in: answers ping, echoes predictions and records
/// fire-and-forget work.
#[derive(Default)]
struct FakeModels {
    learned: AtomicUsize,
    learned_signal: Notify,
}

#[async_trait]
impl ModelController for FakeModels {
    async fn execute(&self, action: ActionName, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<JsonValue> {
        match action {
            ActionName::Ping => Ok(json!(true)),
            ActionName::Predict => {
                let delay = kwargs.get("delay_ms").and_then(JsonValue::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(json!({ "model": args.first().cloned(), "company_id": kwargs.get("company_id").cloned() }))
            }
            ActionName::Learn => {
                self.learned.fetch_add(1, Ordering::SeqCst);
                self.learned_signal.notify_one();
                Ok(JsonValue::Null)
            }
            ActionName::GetModels => Ok(json!(["house_prices"])),
            ActionName::GetModelData => Err(FederationError::execution("model not found")),
            _ => Ok(JsonValue::Null),
        }
    }
}

/// Transport that never reaches anything.
struct Unreachable {
    attempts: AtomicUsize,
}

#[async_trait]
impl ModelTransport for Unreachable {
    fn kind(&self) -> TransportKind {
        TransportKind::Clustered
    }

    async fn round_trip(&self, _request: &ActionEnvelope) -> FederationResult<ResultEnvelope> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(FederationError::connectivity("connection refused"))
    }
}

/// Transport that accepts requests and never answers.
struct Silent {
    attempts: AtomicUsize,
}

#[async_trait]
impl ModelTransport for Silent {
    fn kind(&self) -> TransportKind {
        TransportKind::Clustered
    }

    async fn round_trip(&self, _request: &ActionEnvelope) -> FederationResult<ResultEnvelope> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

fn kwargs(pairs: &[(&str, JsonValue)]) -> Kwargs {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

async fn local_client(models: Arc<FakeModels>) -> ModelRpcClient {
    ModelRpcClient::connect(
        Arc::new(LocalTransport::new(models)),
        &BackoffPolicy::fixed(3, Duration::from_millis(10)),
        Duration::from_secs(5),
        None,
    )
    .await
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn retry_is_bounded_and_follows_schedule() {
    let transport = Arc::new(Unreachable {
        attempts: AtomicUsize::new(0),
    });
    let policy = BackoffPolicy::fixed(10, Duration::from_secs(3));

    let start = Instant::now();
    let err = ModelRpcClient::connect(transport.clone(), &policy, Duration::from_secs(1), None)
        .await
        .unwrap_err();

    assert_eq!(transport.attempts.load(Ordering::SeqCst), 10);
    assert_eq!(start.elapsed(), Duration::from_secs(27));
    assert!(matches!(err, FederationError::BackendUnavailable { attempts: 10, .. }));
    assert!(err.to_string().contains("connection refused"));
}

#[tokio::test(start_paused = true)]
async fn exponential_schedule_is_honoured() {
    let transport = Arc::new(Unreachable {
        attempts: AtomicUsize::new(0),
    });
    let policy = BackoffPolicy {
        max_attempts: 4,
        base_delay: Duration::from_secs(1),
        multiplier: 2.0,
        max_delay: Duration::from_secs(60),
    };

    let start = Instant::now();
    ModelRpcClient::connect(transport.clone(), &policy, Duration::from_secs(1), None)
        .await
        .unwrap_err();
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 4);
    assert_eq!(start.elapsed(), Duration::from_secs(1 + 2 + 4));
}

#[tokio::test(start_paused = true)]
async fn deadline_stops_retries_early() {
    let transport = Arc::new(Unreachable {
        attempts: AtomicUsize::new(0),
    });
    let policy = BackoffPolicy::fixed(10, Duration::from_secs(3));
    let deadline = Instant::now() + Duration::from_secs(7);

    let err = ModelRpcClient::connect(transport.clone(), &policy, Duration::from_secs(1), Some(deadline))
        .await
        .unwrap_err();
    // attempts at 0s, 3s and 6s; the next one would start after the deadline
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
    assert!(matches!(err, FederationError::BackendUnavailable { attempts: 3, .. }));
}

#[tokio::test(start_paused = true)]
async fn deadline_caps_a_hanging_attempt() {
    let transport = Arc::new(Silent {
        attempts: AtomicUsize::new(0),
    });
    let policy = BackoffPolicy::fixed(10, Duration::from_secs(3));
    let start = Instant::now();
    let deadline = start + Duration::from_secs(1);

    let err = ModelRpcClient::connect(transport.clone(), &policy, Duration::from_secs(30), Some(deadline))
        .await
        .unwrap_err();
    assert_eq!(start.elapsed(), Duration::from_secs(1));
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
    assert!(matches!(err, FederationError::BackendUnavailable { attempts: 1, .. }));
}

#[tokio::test]
async fn local_transport_dispatches_actions() {
    let models = Arc::new(FakeModels::default());
    let client = local_client(models.clone()).await;
    assert_eq!(client.transport_kind(), TransportKind::Local);

    let prediction = client.predict(vec![json!("house_prices")], Kwargs::new()).await.unwrap();
    assert_eq!(prediction["model"], json!("house_prices"));

    assert_eq!(client.get_models(vec![], Kwargs::new()).await.unwrap(), json!(["house_prices"]));

    client.learn(vec![json!("house_prices")], Kwargs::new()).await.unwrap();
    models.learned_signal.notified().await;
    assert_eq!(models.learned.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn backend_failures_keep_their_kind() {
    let client = local_client(Arc::new(FakeModels::default())).await;
    let err = client.get_model_data(vec![json!("missing")], Kwargs::new()).await.unwrap_err();
    assert_eq!(err, FederationError::execution("model not found"));
}

#[tokio::test]
async fn unknown_action_is_named() {
    let client = local_client(Arc::new(FakeModels::default())).await;
    let err = client
        .invoke_named("retrain", vec![], Kwargs::new(), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert_eq!(err, FederationError::unknown_action("retrain"));
}

#[tokio::test]
async fn company_scope_reaches_backend() {
    let client = local_client(Arc::new(FakeModels::default())).await;
    let scoped = CompanyScoped::new(client, Some(11));
    let prediction = scoped.predict(vec![json!("m")], Kwargs::new()).await.unwrap();
    assert_eq!(prediction["company_id"], json!(11));
}

async fn spawn_server(models: Arc<FakeModels>) -> String {
    let server = ActionServer::bind("127.0.0.1:0", models).await.unwrap();
    let address = server.local_addr().unwrap().to_string();
    tokio::spawn(server.serve());
    address
}

#[tokio::test]
async fn clustered_round_trip() {
    let models = Arc::new(FakeModels::default());
    let address = spawn_server(models.clone()).await;

    let config = RpcConfig {
        transport: TransportMode::Auto,
        cluster_address: Some(address),
        base_delay_ms: 10,
        ..RpcConfig::default()
    };
    let client = ModelRpcClient::from_config(&config, None, None).await.unwrap();
    assert_eq!(client.transport_kind(), TransportKind::Clustered);

    let prediction = client.predict(vec![json!("house_prices")], Kwargs::new()).await.unwrap();
    assert_eq!(prediction["model"], json!("house_prices"));

    client.learn(vec![json!("house_prices")], Kwargs::new()).await.unwrap();
    models.learned_signal.notified().await;
    assert_eq!(models.learned.load(Ordering::SeqCst), 1);

    let err = client
        .invoke_named("retrain", vec![], Kwargs::new(), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(err, FederationError::unknown_action("retrain"));
}

#[tokio::test]
async fn concurrent_calls_are_matched_by_id() {
    let address = spawn_server(Arc::new(FakeModels::default())).await;
    let client = Arc::new(
        ModelRpcClient::connect(
            Arc::new(ClusteredTransport::new(address)),
            &BackoffPolicy::fixed(3, Duration::from_millis(10)),
            Duration::from_secs(5),
            None,
        )
        .await
        .unwrap(),
    );

    // the slow call finishes last; each caller must still get its own answer
    let calls: Vec<_> = [(0, "slow", 200), (1, "fast", 0), (2, "medium", 50)]
        .into_iter()
        .map(|(i, model, delay)| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let value = client
                    .predict(vec![json!(model)], kwargs(&[("delay_ms", json!(delay))]))
                    .await
                    .unwrap();
                (i, value["model"].clone())
            })
        })
        .collect();

    for call in calls {
        let (i, model) = call.await.unwrap();
        let expected = ["slow", "fast", "medium"][i];
        assert_eq!(model, json!(expected));
    }
}

#[tokio::test]
async fn timed_out_call_does_not_poison_the_next() {
    let address = spawn_server(Arc::new(FakeModels::default())).await;
    let client = ModelRpcClient::connect(
        Arc::new(ClusteredTransport::new(address)),
        &BackoffPolicy::fixed(3, Duration::from_millis(10)),
        Duration::from_secs(5),
        None,
    )
    .await
    .unwrap();

    let err = client
        .invoke_within(
            Duration::from_millis(50),
            ActionName::Predict,
            vec![json!("stale")],
            kwargs(&[("delay_ms", json!(300))]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FederationError::Timeout { timeout_ms: 50 }));

    // wait for the late response to arrive and be discarded
    tokio::time::sleep(Duration::from_millis(400)).await;

    let fresh = client.predict(vec![json!("fresh")], Kwargs::new()).await.unwrap();
    assert_eq!(fresh["model"], json!("fresh"));
}

#[tokio::test]
async fn unreachable_cluster_exhausts_attempts() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let err = ModelRpcClient::connect(
        Arc::new(ClusteredTransport::new(address)),
        &BackoffPolicy::fixed(2, Duration::from_millis(5)),
        Duration::from_secs(1),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, FederationError::BackendUnavailable { attempts: 2, .. }));
}
