use async_trait::async_trait;
use doppler_gateway::{
    pipeline::{Batch, BatchPolicy, ConsumerExit, Pipeline, PipelineResult, RawEvent, SourceRetryPolicy},
    query::{AggregateQuery, QueryResult, TimeSeriesStore},
    routes::router,
    source::{ChannelSource, ChannelSourceHandle},
    state::{GatewayState, PipelineState},
    storage::{BatchStore, PersistenceSink, RetryPolicy, StoreError, StoreResult},
    subscribers::{ConnectionRegistry, RegistryConfig, SlowConsumerPolicy, SubscriberConfig},
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Records (sequence, size, reason) of every written batch
#[derive(Default)]
struct MemoryStore {
    fail: bool,
    written: Mutex<Vec<(u64, usize, String)>>,
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn write_batch(&self, batch: &Batch) -> StoreResult<()> {
        if self.fail {
            return Err(StoreError::Rejected("relation is read-only".to_string()));
        }
        self.written.lock().push((
            batch.sequence(),
            batch.len(),
            batch.reason().as_str().to_string(),
        ));
        Ok(())
    }
}

struct StubQuery;

#[async_trait]
impl TimeSeriesStore for StubQuery {
    async fn aggregate(&self, query: &AggregateQuery) -> QueryResult<Value> {
        Ok(json!({ "results": [{ "statement_id": 0, "query": query.to_influxql() }] }))
    }
}

struct Harness {
    addr: SocketAddr,
    shutdown: CancellationToken,
    events: ChannelSourceHandle,
    state: Arc<PipelineState>,
    pipeline: JoinHandle<PipelineResult<ConsumerExit>>,
}

impl Harness {
    async fn start(max_batch_size: usize, registry: RegistryConfig, store: Arc<MemoryStore>) -> Self {
        Self::start_with(max_batch_size, registry, store, SubscriberConfig::default()).await
    }

    async fn start_with(
        max_batch_size: usize,
        registry: RegistryConfig,
        store: Arc<MemoryStore>,
        subscribers: SubscriberConfig,
    ) -> Self {
        let policy = BatchPolicy {
            max_batch_size,
            min_batch_size: 1,
            batch_interval: Duration::from_secs(60),
            truncate_size: 1,
        };
        let retry = RetryPolicy {
            max_retries: 0,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(10),
        };

        let shutdown = CancellationToken::new();
        let pipeline = Pipeline::new(
            policy,
            PersistenceSink::new(store, retry),
            ConnectionRegistry::new(registry),
            SourceRetryPolicy::default(),
            shutdown.clone(),
        )
        .unwrap();
        let state = pipeline.state();
        let gateway = GatewayState::new(
            pipeline.state(),
            Arc::new(StubQuery),
            subscribers,
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(gateway);
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
        });

        let (source, events) = ChannelSource::new("integration", 256);
        let pipeline = tokio::spawn(pipeline.run(Box::new(source)));

        Self {
            addr,
            shutdown,
            events,
            state,
            pipeline,
        }
    }

    async fn connect(&self, query: &str) -> Client {
        let url = format!("ws://{}/receive/ws{}", self.addr, query);
        let (client, _) = connect_async(url).await.unwrap();
        client
    }

    async fn publish(&self, offsets: std::ops::Range<i64>) {
        for offset in offsets {
            let payload = format!("{{\"n\":{}}}", offset).into_bytes();
            self.events
                .send(RawEvent::new("positions", 0, offset, payload))
                .await
                .unwrap();
        }
    }

    /// Publish events with large JSON string payloads
    async fn publish_large(&self, offsets: std::ops::Range<i64>, size: usize) {
        let payload = format!("\"{}\"", "x".repeat(size)).into_bytes();
        for offset in offsets {
            self.events
                .send(RawEvent::new("positions", 0, offset, payload.clone()))
                .await
                .unwrap();
        }
    }

    /// Poll until the predicate holds over the pipeline state
    async fn wait_for(&self, what: &str, check: impl Fn(&PipelineState) -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(20), async {
            while !check(&self.state) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {}", what);
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let response = reqwest::get(format!("http://{}{}", self.addr, path))
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }
}

async fn send_json(client: &mut Client, msg: Value) {
    client.send(Message::Text(msg.to_string().into())).await.unwrap();
}

/// Next JSON text frame, skipping control frames
async fn next_json(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .unwrap();

        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn test_subscriber_receives_full_batch() {
    let store = Arc::new(MemoryStore::default());
    let harness = Harness::start(3, RegistryConfig::default(), store.clone()).await;

    let mut client = harness.connect("").await;
    let connected = next_json(&mut client).await;
    assert_eq!(connected["type"], "connected");
    assert_eq!(connected["view"], "full");

    harness.publish(0..3).await;

    let batch = next_json(&mut client).await;
    assert_eq!(batch["type"], "batch");
    assert_eq!(batch["sequence"], 0);
    assert_eq!(batch["reason"], "full");
    assert_eq!(batch["count"], 3);
    let offsets: Vec<i64> = batch["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["offset"].as_i64().unwrap())
        .collect();
    assert_eq!(offsets, vec![0, 1, 2]);
    assert_eq!(batch["events"][2]["payload"]["n"], 2);

    // Persisted before it was broadcast
    assert_eq!(store.written.lock().as_slice(), &[(0, 3, "full".to_string())]);

    harness.shutdown.cancel();
    harness.pipeline.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_summary_view_is_truncated() {
    let store = Arc::new(MemoryStore::default());
    let harness = Harness::start(4, RegistryConfig::default(), store).await;

    let mut client = harness.connect("?view=summary").await;
    assert_eq!(next_json(&mut client).await["view"], "summary");

    harness.publish(0..4).await;

    let summary = next_json(&mut client).await;
    assert_eq!(summary["type"], "summary");
    assert_eq!(summary["count"], 4);
    assert_eq!(summary["events"].as_array().unwrap().len(), 1);
    assert_eq!(summary["events"][0]["offset"], 0);

    harness.shutdown.cancel();
    harness.pipeline.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_flushes_final_batch() {
    let store = Arc::new(MemoryStore::default());
    let harness = Harness::start(100, RegistryConfig::default(), store.clone()).await;

    let mut client = harness.connect("").await;
    assert_eq!(next_json(&mut client).await["type"], "connected");

    harness.publish(0..2).await;
    while harness.state.aggregator.pending().await < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    harness.shutdown.cancel();
    let exit = harness.pipeline.await.unwrap().unwrap();
    assert_eq!(exit.events_consumed, 2);
    assert_eq!(exit.final_batch, Some(0));
    assert_eq!(store.written.lock().as_slice(), &[(0, 2, "shutdown".to_string())]);

    let batch = next_json(&mut client).await;
    assert_eq!(batch["reason"], "shutdown");
    assert_eq!(batch["count"], 2);

    let closed = tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}

#[tokio::test]
async fn test_write_failure_is_broadcast_and_recorded() {
    let store = Arc::new(MemoryStore {
        fail: true,
        ..Default::default()
    });
    let harness = Harness::start(3, RegistryConfig::default(), store).await;

    let mut client = harness.connect("").await;
    assert_eq!(next_json(&mut client).await["type"], "connected");

    harness.publish(10..13).await;
    let batch = next_json(&mut client).await;
    assert_eq!(batch["type"], "batch");
    assert_eq!(batch["count"], 3);

    let (status, stats) = harness.get("/stats").await;
    assert_eq!(status, 200);
    assert_eq!(stats["write_failures"], 1);
    assert_eq!(stats["batches_persisted"], 0);
    let failure = &stats["recent_write_failures"][0];
    assert_eq!(failure["event_count"], 3);
    assert_eq!(failure["first_offset"], 10);
    assert_eq!(failure["last_offset"], 12);

    harness.shutdown.cancel();
    harness.pipeline.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_subscriber_limit() {
    let registry = RegistryConfig {
        max_subscribers: 1,
        ..Default::default()
    };
    let harness = Harness::start(10, registry, Arc::new(MemoryStore::default())).await;

    let mut first = harness.connect("").await;
    assert_eq!(next_json(&mut first).await["type"], "connected");

    let mut second = harness.connect("").await;
    let rejected = next_json(&mut second).await;
    assert_eq!(rejected["type"], "error");
    assert_eq!(rejected["code"], "SERVER_FULL");

    harness.shutdown.cancel();
    harness.pipeline.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_health_and_aggregate_endpoints() {
    let harness = Harness::start(10, RegistryConfig::default(), Arc::new(MemoryStore::default())).await;

    let (status, health) = harness.get("/health").await;
    assert_eq!(status, 200);
    assert!(health["status"] == "starting" || health["status"] == "running");
    assert_eq!(health["subscribers"], 0);

    let (status, body) = harness
        .get("/receive/ajax?measurement=positions&field=speed&aggregate=max")
        .await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("start"));

    let (status, body) = harness
        .get(
            "/receive/ajax?measurement=positions&field=speed&aggregate=max\
             &start=2024-05-01T00:00:00Z&end=2024-05-01T01:00:00Z&interval=1m&tag.vehicle=bus-7",
        )
        .await;
    assert_eq!(status, 200);
    let query = body["results"][0]["query"].as_str().unwrap();
    assert!(query.starts_with("SELECT MAX(\"speed\")"));
    assert!(query.contains("\"vehicle\" = 'bus-7'"));

    harness.shutdown.cancel();
    harness.pipeline.await.unwrap().unwrap();
}

/// Enough data to fill the socket buffers of a client that stops reading
const STALL_EVENTS: i64 = 160;
const STALL_PAYLOAD: usize = 256 * 1024;

fn stall_config() -> SubscriberConfig {
    SubscriberConfig {
        buffer: 1,
        send_timeout: Duration::from_secs(60),
    }
}

#[tokio::test]
async fn test_slow_subscriber_is_evicted() {
    let harness = Harness::start_with(
        1,
        RegistryConfig::default(),
        Arc::new(MemoryStore::default()),
        stall_config(),
    )
    .await;

    let mut client = harness.connect("").await;
    assert_eq!(next_json(&mut client).await["type"], "connected");
    assert_eq!(harness.state.registry.connection_count(), 1);

    // Stop reading until the registry has dropped us
    harness.publish_large(0..STALL_EVENTS, STALL_PAYLOAD).await;
    harness
        .wait_for("eviction", |state| state.registry.connection_count() == 0)
        .await;
    assert_eq!(harness.state.stats.snapshot().subscribers_evicted, 1);

    let mut evicted = None;
    let close = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => {
                    let msg: Value = serde_json::from_str(text.as_str()).unwrap();
                    if msg["type"] == "evicted" {
                        evicted = Some(msg);
                    }
                }
                Some(Ok(Message::Close(frame))) => break frame,
                Some(Ok(_)) => continue,
                other => panic!("connection ended without a close frame: {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for the close frame");

    assert!(evicted.is_some());
    let frame = close.expect("close frame without a code");
    assert_eq!(u16::from(frame.code), 1013);

    harness.shutdown.cancel();
    harness.pipeline.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_skip_policy_keeps_slow_subscriber() {
    let registry = RegistryConfig {
        slow_consumer_policy: SlowConsumerPolicy::Skip,
        ..Default::default()
    };
    let harness = Harness::start_with(1, registry, Arc::new(MemoryStore::default()), stall_config()).await;

    let mut client = harness.connect("").await;
    assert_eq!(next_json(&mut client).await["type"], "connected");

    harness.publish_large(0..STALL_EVENTS, STALL_PAYLOAD).await;
    harness
        .wait_for("every batch to be broadcast", |state| {
            let stats = state.stats.snapshot();
            stats.deliveries + stats.deliveries_skipped == STALL_EVENTS as u64
        })
        .await;

    let stats = harness.state.stats.snapshot();
    assert!(stats.deliveries_skipped > 0);
    assert_eq!(stats.subscribers_evicted, 0);
    assert_eq!(harness.state.registry.connection_count(), 1);

    // Resume reading; what arrives is a gapped but ordered sequence
    send_json(&mut client, json!({ "type": "heartbeat" })).await;
    let mut sequences = Vec::new();
    loop {
        let msg = next_json(&mut client).await;
        match msg["type"].as_str() {
            Some("batch") => sequences.push(msg["sequence"].as_u64().unwrap()),
            Some("ack") => break,
            other => panic!("unexpected message: {:?}", other),
        }
    }
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    assert!((sequences.len() as u64) < STALL_EVENTS as u64);

    harness.shutdown.cancel();
    harness.pipeline.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_heartbeat_is_acknowledged() {
    let harness = Harness::start(10, RegistryConfig::default(), Arc::new(MemoryStore::default())).await;

    let mut client = harness.connect("").await;
    assert_eq!(next_json(&mut client).await["type"], "connected");

    send_json(&mut client, json!({ "type": "heartbeat" })).await;
    assert_eq!(next_json(&mut client).await["type"], "ack");

    harness.shutdown.cancel();
    harness.pipeline.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_set_view_switches_projection() {
    let harness = Harness::start(3, RegistryConfig::default(), Arc::new(MemoryStore::default())).await;

    let mut client = harness.connect("").await;
    assert_eq!(next_json(&mut client).await["view"], "full");

    send_json(&mut client, json!({ "type": "set_view", "view": "summary" })).await;
    assert_eq!(next_json(&mut client).await["type"], "ack");

    harness.publish(0..3).await;
    let summary = next_json(&mut client).await;
    assert_eq!(summary["type"], "summary");
    assert_eq!(summary["count"], 3);
    assert_eq!(summary["events"].as_array().unwrap().len(), 1);

    harness.shutdown.cancel();
    harness.pipeline.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_malformed_message_gets_parse_error() {
    let harness = Harness::start(10, RegistryConfig::default(), Arc::new(MemoryStore::default())).await;

    let mut client = harness.connect("").await;
    assert_eq!(next_json(&mut client).await["type"], "connected");

    client
        .send(Message::Text("not json".to_string().into()))
        .await
        .unwrap();
    let error = next_json(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "PARSE_ERROR");

    // Still connected afterwards
    send_json(&mut client, json!({ "type": "heartbeat" })).await;
    assert_eq!(next_json(&mut client).await["type"], "ack");
    assert_eq!(harness.state.registry.connection_count(), 1);

    harness.shutdown.cancel();
    harness.pipeline.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_disconnect_unregisters_subscriber() {
    let harness = Harness::start(10, RegistryConfig::default(), Arc::new(MemoryStore::default())).await;

    let mut client = harness.connect("").await;
    assert_eq!(next_json(&mut client).await["type"], "connected");
    assert_eq!(harness.state.registry.connection_count(), 1);

    send_json(&mut client, json!({ "type": "disconnect" })).await;
    harness
        .wait_for("unregister", |state| state.registry.connection_count() == 0)
        .await;

    harness.shutdown.cancel();
    harness.pipeline.await.unwrap().unwrap();
}
