//! Reusable test helpers for integration tests.
//!
//! ## Test Servers
//!
//! Use [`spawn_test_server()`] to run any axum router on a random port.
//! [`spawn_registry()`] serves `/v1/routes` from mutable state and
//! [`spawn_capture()`] records every request it receives.
//!
//! ## Fakes
//!
//! [`StaticLaneStore`] stands in for the `lane_routing` table and
//! [`FakeBroker`] for an AMQP server.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use axum::routing::get;
use axum::Router;
use futures::channel::mpsc;
use futures::StreamExt;
use http_body_util::BodyExt;
use lane_common::RouteType;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower::ServiceExt;

use lane_server::api::{create_router, AppState};
use lane_server::broker::topology::{ExchangeSpec, QueueSpec};
use lane_server::broker::transport::{DeliveryStream, Headers};
use lane_server::broker::{
    BrokerChannel, BrokerConnector, BrokerError, BrokerSession, Delivery, OutboundMessage,
};
use lane_server::config::Config;
use lane_server::lane::{LaneBindingStore, LaneResolver, LaneStoreError};
use lane_server::routing::{ServiceInfo, ServiceRouter, Topology};
use lane_server::webhooks::{BotConfig, BotRegistry, EventForwarder, ForwardTarget};

// ============================================================================
// Test Server
// ============================================================================

/// A running test server bound to a random port.
pub struct TestServer {
    /// Server address (127.0.0.1:PORT).
    pub addr: SocketAddr,
    /// Base URL for HTTP requests (e.g., `http://127.0.0.1:12345`).
    pub url: String,
    /// Handle to the server task for cleanup.
    _handle: JoinHandle<()>,
}

impl TestServer {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

/// Spawn a real HTTP server on a random port.
pub async fn spawn_test_server(router: Router) -> TestServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().expect("Failed to get local addr");
    let url = format!("http://{addr}");

    let handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .await
            .expect("Test server failed");
    });

    TestServer {
        addr,
        url,
        _handle: handle,
    }
}

/// HTTP client that resolves the given host names to loopback.
///
/// The URL port is kept, so a routed service whose registry port is a test
/// server's port lands on that server under its lane host name.
pub fn loopback_client(hosts: &[&str]) -> reqwest::Client {
    let loopback: SocketAddr = "127.0.0.1:0".parse().expect("valid loopback addr");
    hosts
        .iter()
        .fold(reqwest::Client::builder(), |builder, host| builder.resolve(host, loopback))
        .build()
        .expect("Failed to build test HTTP client")
}

/// Poll `check` until it holds, advancing time in small steps.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

/// Collect a response body and parse it as JSON.
pub async fn body_to_json(response: Response<Body>) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("Failed to collect response body")
        .to_bytes();
    serde_json::from_slice(&bytes).unwrap_or_else(|e| {
        let preview = String::from_utf8_lossy(&bytes);
        panic!("Failed to parse response as JSON: {e}\nBody: {preview}")
    })
}

// ============================================================================
// Registry stub
// ============================================================================

#[derive(Clone)]
struct RegistryState {
    response: Arc<Mutex<(StatusCode, Value)>>,
    hits: Arc<AtomicUsize>,
}

/// A registry serving `GET /v1/routes` from mutable state.
pub struct RegistryStub {
    pub server: TestServer,
    state: RegistryState,
}

impl RegistryStub {
    /// Serve `routes` with 200 from now on.
    pub fn set_routes(&self, routes: Value) {
        *self.state.response.lock().unwrap() = (StatusCode::OK, routes);
    }

    /// Answer every poll with `status` from now on.
    pub fn set_status(&self, status: StatusCode) {
        self.state.response.lock().unwrap().0 = status;
    }

    /// Number of polls served.
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }
}

async fn serve_routes(State(state): State<RegistryState>) -> (StatusCode, axum::Json<Value>) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let (status, body) = state.response.lock().unwrap().clone();
    (status, axum::Json(body))
}

pub async fn spawn_registry(routes: Value) -> RegistryStub {
    let state = RegistryState {
        response: Arc::new(Mutex::new((StatusCode::OK, routes))),
        hits: Arc::new(AtomicUsize::new(0)),
    };
    let router = Router::new()
        .route("/v1/routes", get(serve_routes))
        .with_state(state.clone());

    RegistryStub {
        server: spawn_test_server(router).await,
        state,
    }
}

// ============================================================================
// Capture server
// ============================================================================

/// One request seen by a [`CaptureServer`].
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("captured body is JSON")
    }
}

#[derive(Clone)]
struct CaptureState {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    status: StatusCode,
    body: &'static str,
}

/// A server recording every request and answering with a fixed response.
pub struct CaptureServer {
    pub server: TestServer,
    state: CaptureState,
}

impl CaptureServer {
    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }
}

async fn capture(
    State(state): State<CaptureState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    state.requests.lock().unwrap().push(CapturedRequest {
        method,
        path: uri.path().to_string(),
        headers,
        body,
    });
    (state.status, state.body)
}

pub async fn spawn_capture(status: StatusCode, body: &'static str) -> CaptureServer {
    let state = CaptureState {
        requests: Arc::new(Mutex::new(Vec::new())),
        status,
        body,
    };
    let router = Router::new().fallback(capture).with_state(state.clone());

    CaptureServer {
        server: spawn_test_server(router).await,
        state,
    }
}

// ============================================================================
// Lane store
// ============================================================================

/// In-memory lane bindings.
#[derive(Default)]
pub struct StaticLaneStore {
    bindings: Mutex<HashMap<(RouteType, String), String>>,
    queries: AtomicUsize,
}

impl StaticLaneStore {
    pub fn with_binding(route_type: RouteType, route_key: &str, lane: &str) -> Self {
        let store = Self::default();
        store.bind(route_type, route_key, lane);
        store
    }

    pub fn bind(&self, route_type: RouteType, route_key: &str, lane: &str) {
        self.bindings
            .lock()
            .unwrap()
            .insert((route_type, route_key.to_string()), lane.to_string());
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LaneBindingStore for StaticLaneStore {
    async fn find_active_lane(
        &self,
        route_type: RouteType,
        route_key: &str,
    ) -> Result<Option<String>, LaneStoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .bindings
            .lock()
            .unwrap()
            .get(&(route_type, route_key.to_string()))
            .cloned())
    }
}

// ============================================================================
// Test App
// ============================================================================

/// Topology with one service deployed in the given lanes.
pub fn topology(service: &str, lanes: &[&str], port: u16) -> Topology {
    let mut topology = Topology::new();
    topology.insert(
        service.to_string(),
        ServiceInfo {
            lanes: lanes.iter().map(|l| (*l).to_string()).collect(),
            port,
        },
    );
    topology
}

/// A webhook bot for tests.
pub fn http_bot(name: &str, token: Option<&str>) -> BotConfig {
    BotConfig {
        bot_name: name.to_string(),
        app_id: format!("cli_{name}"),
        verification_token: token.map(str::to_string),
        init_type: "http".to_string(),
        is_dev: false,
    }
}

/// The full axum router over in-memory dependencies.
pub struct TestApp {
    pub router: Router,
    pub forwarder: EventForwarder,
    pub config: Config,
}

impl TestApp {
    /// Build an app whose forward target `lark-server` is `target`, deployed
    /// in `lanes`.
    pub fn new(store: Arc<StaticLaneStore>, bots: Vec<BotConfig>, target: &TestServer, lanes: &[&str]) -> Self {
        let config = Config::default_for_test();

        let hosts: Vec<String> = std::iter::once("lark-server".to_string())
            .chain(lanes.iter().map(|l| format!("lark-server-{l}")))
            .collect();
        let host_refs: Vec<&str> = hosts.iter().map(String::as_str).collect();
        let router = ServiceRouter::with_topology(
            topology("lark-server", lanes, target.port()),
            loopback_client(&host_refs),
        );

        let resolver = Arc::new(LaneResolver::new(store));
        let forwarder = EventForwarder::new(
            Arc::clone(&resolver),
            router.clone(),
            config.inner_http_secret.clone(),
            ForwardTarget::default(),
        );

        let state = AppState::new(
            config.clone(),
            router,
            resolver,
            forwarder.clone(),
            BotRegistry::new(bots),
        );

        Self {
            router: create_router(state),
            forwarder,
            config,
        }
    }

    /// Build an HTTP request with the given method and URI.
    pub fn request(method: Method, uri: &str) -> axum::http::request::Builder {
        Request::builder().method(method).uri(uri)
    }

    /// POST a JSON body through the router.
    pub async fn post_json(&self, uri: &str, body: &Value) -> Response<Body> {
        let request = Self::request(Method::POST, uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("valid request");
        self.oneshot(request).await
    }

    /// Send a request through the router via `tower::ServiceExt::oneshot`.
    pub async fn oneshot(&self, request: Request<Body>) -> Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("oneshot request failed")
    }
}

// ============================================================================
// Fake broker
// ============================================================================

/// Operations observed by [`FakeBroker`].
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerOp {
    Prefetch(u16),
    DeclareExchange(String),
    DeclareQueue(QueueSpec),
    Bind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Publish {
        exchange: String,
        routing_key: String,
        message: OutboundMessage,
    },
    Consume(String),
    Ack(u64),
    Nack { tag: u64, requeue: bool },
    Close,
}

#[derive(Default)]
struct FakeState {
    ops: Mutex<Vec<BrokerOp>>,
    connect_attempts: Mutex<Vec<tokio::time::Instant>>,
    failing_connects: AtomicUsize,
    sessions: Mutex<Vec<oneshot::Sender<String>>>,
    consumers: Mutex<HashMap<String, mpsc::UnboundedSender<Result<Delivery, BrokerError>>>>,
    next_tag: AtomicU64,
}

/// In-memory stand-in for an AMQP server.
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<FakeState>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation applied so far.
    pub fn ops(&self) -> Vec<BrokerOp> {
        self.state.ops.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.state.ops.lock().unwrap().clear();
    }

    /// Times at which `connect` was called, failed attempts included.
    pub fn connect_attempts(&self) -> Vec<tokio::time::Instant> {
        self.state.connect_attempts.lock().unwrap().clone()
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: usize) {
        self.state.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Drop every open connection as if the server went away.
    pub fn drop_connections(&self) {
        let sessions: Vec<_> = self.state.sessions.lock().unwrap().drain(..).collect();
        for closed in sessions {
            let _ = closed.send("connection reset by peer".to_string());
        }
        self.state.consumers.lock().unwrap().clear();
    }

    /// Push a message to the current consumer of `queue`. Returns its tag.
    pub fn deliver(&self, queue: &str, body: &Value) -> u64 {
        let tag = self.state.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let delivery = Delivery::new(
            tag,
            queue,
            queue,
            false,
            Headers::new(),
            serde_json::to_vec(body).expect("serializable body"),
        );
        self.state
            .consumers
            .lock()
            .unwrap()
            .get(queue)
            .expect("no consumer for queue")
            .unbounded_send(Ok(delivery))
            .expect("consumer stream closed");
        tag
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.state.consumers.lock().unwrap().contains_key(queue)
    }

    fn record(&self, op: BrokerOp) {
        self.state.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl BrokerConnector for FakeBroker {
    async fn connect(&self, _url: &str) -> Result<BrokerSession, BrokerError> {
        self.state
            .connect_attempts
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());

        let failing = self.state.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.state.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(BrokerError::Transport("connection refused".into()));
        }

        let (tx, rx) = oneshot::channel();
        self.state.sessions.lock().unwrap().push(tx);
        Ok(BrokerSession {
            channel: Arc::new(FakeChannel {
                broker: self.clone(),
            }),
            closed: rx,
        })
    }
}

struct FakeChannel {
    broker: FakeBroker,
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.broker.record(BrokerOp::Prefetch(count));
        Ok(())
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.broker.record(BrokerOp::DeclareExchange(spec.name.clone()));
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.broker.record(BrokerOp::DeclareQueue(spec.clone()));
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.broker.record(BrokerOp::Bind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: OutboundMessage) -> Result<(), BrokerError> {
        self.broker.record(BrokerOp::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message,
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let (tx, rx) = mpsc::unbounded();
        self.broker
            .state
            .consumers
            .lock()
            .unwrap()
            .insert(queue.to_string(), tx);
        self.broker.record(BrokerOp::Consume(queue.to_string()));
        Ok(rx.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.broker.record(BrokerOp::Ack(delivery_tag));
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.broker.record(BrokerOp::Nack {
            tag: delivery_tag,
            requeue,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.record(BrokerOp::Close);
        Ok(())
    }
}
