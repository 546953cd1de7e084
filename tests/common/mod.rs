//! Shared fixtures and scenarios for distributed mediator integration tests.
//!
//! Every scenario takes a connector, so the same checks run against the
//! in-memory channel broker and against RabbitMQ. Each node gets its own
//! exchange and queue prefix, so scenarios never see each other's traffic on a
//! shared broker.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use mediatx::bus::{Broker, Connector, QueueSpec, TransportError};
use mediatx::{
    DistributedMediator, EventGateway, EventHandler, HandlerError, Mediator, MediatorError,
    Request, RequestHandler, Routable, RouteResolver, Transport, TransportConfig,
};

/// Upper bound for anything that should happen promptly.
pub const PROMPT: Duration = Duration::from_secs(5);

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub value: String,
}

impl Request for Ping {
    type Response = Pong;
}

impl Routable for Ping {
    const ROUTE_KEY: &'static str = "tests.ping";
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Reset;

impl Request for Reset {
    type Response = ();
}

impl Routable for Reset {
    const ROUTE_KEY: &'static str = "tests.reset";
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub id: String,
}

mediatx::distributed_event!(OrderPlaced, "tests.order-placed");

// ============================================================================
// Handlers
// ============================================================================

/// Replies with a fixed value.
pub struct Answer(pub &'static str);

#[async_trait]
impl RequestHandler<Ping> for Answer {
    async fn handle(&self, _request: Ping) -> Result<Pong, HandlerError> {
        Ok(Pong {
            value: self.0.to_string(),
        })
    }
}

/// Echoes the request value back.
pub struct Echo;

#[async_trait]
impl RequestHandler<Ping> for Echo {
    async fn handle(&self, request: Ping) -> Result<Pong, HandlerError> {
        Ok(Pong {
            value: request.value,
        })
    }
}

pub struct OutOfStock;

#[async_trait]
impl RequestHandler<Ping> for OutOfStock {
    async fn handle(&self, _request: Ping) -> Result<Pong, HandlerError> {
        Err("item is out of stock".into())
    }
}

pub struct Resetter(pub Arc<AtomicUsize>);

#[async_trait]
impl RequestHandler<Reset> for Resetter {
    async fn handle(&self, _request: Reset) -> Result<(), HandlerError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct OrderCounter(pub Arc<AtomicUsize>);

#[async_trait]
impl EventHandler<OrderPlaced> for OrderCounter {
    async fn handle(&self, _event: &OrderPlaced) -> Result<(), HandlerError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// Transport settings unique to one scenario.
pub fn scenario_config() -> TransportConfig {
    let id = uuid::Uuid::new_v4().simple().to_string();
    TransportConfig {
        exchange: format!("mediatx.test.{}", id),
        queue_prefix: format!("mediatx-test-{}", id),
        ..Default::default()
    }
}

/// One simulated process.
pub struct Node {
    pub transport: Arc<Transport>,
    pub mediator: Arc<Mediator>,
    pub adapter: Arc<DistributedMediator>,
}

impl Node {
    pub async fn start(
        connector: Arc<dyn Connector>,
        config: TransportConfig,
        mediator: Mediator,
    ) -> Self {
        let transport = Arc::new(Transport::new(connector, config, RouteResolver::new()));
        transport.connect().await.expect("Failed to connect");
        let mediator = Arc::new(mediator);
        let adapter = Arc::new(DistributedMediator::new(
            mediator.clone(),
            EventGateway::new(transport.clone()),
        ));
        Self {
            transport,
            mediator,
            adapter,
        }
    }
}

fn ping(value: &str) -> Ping {
    Ping {
        value: value.to_string(),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(PROMPT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Condition not reached in time");
}

// ============================================================================
// Scenarios
// ============================================================================

/// A remote handler's reply completes the call.
pub async fn scenario_a_dispatch_gets_reply(connector: Arc<dyn Connector>) {
    let config = scenario_config();
    let server = Node::start(
        connector.clone(),
        config.clone(),
        Mediator::builder().request_handler::<Ping, _>(Answer("ok")).build(),
    )
    .await;
    server
        .transport
        .serve::<Ping>(server.mediator.clone())
        .await
        .unwrap();
    let client = Node::start(connector, config, Mediator::builder().build()).await;

    let response = tokio::time::timeout(
        PROMPT,
        client.transport.dispatch(ping(""), &CancellationToken::new()),
    )
    .await
    .expect("Dispatch timed out")
    .unwrap();

    assert!(!response.is_error());
    assert_eq!(response.result.unwrap().value, "ok");
    assert_eq!(client.transport.pending_calls(), 0);

    client.transport.dispose().await;
    server.transport.dispose().await;
}

/// Cancelling a call nobody answers completes it promptly as `Cancelled`.
pub async fn scenario_b_cancelled_dispatch(connector: Arc<dyn Connector>) {
    let config = scenario_config();
    let client = Node::start(connector.clone(), config.clone(), Mediator::builder().build()).await;

    // A bound queue without a consumer: the request is accepted, never answered.
    let silent = connector.open().await.unwrap();
    let queue = format!("{}.rpc.{}", config.queue_prefix, Ping::ROUTE_KEY);
    silent.declare_exchange(&config.exchange).await.unwrap();
    silent
        .declare_queue(&QueueSpec::private(&queue))
        .await
        .unwrap();
    silent
        .bind_queue(&queue, &config.exchange, Ping::ROUTE_KEY)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
    }

    let started = Instant::now();
    let result = client.transport.dispatch(ping("hello"), &cancel).await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(MediatorError::Cancelled)));
    assert!(
        elapsed < Duration::from_millis(100),
        "Cancellation took {:?}",
        elapsed
    );
    assert_eq!(client.transport.pending_calls(), 0);

    let _ = silent.close().await;
    client.transport.dispose().await;
}

/// Fire-and-forget with nobody bound succeeds for the caller.
pub async fn scenario_c_unbound_notify(connector: Arc<dyn Connector>) {
    let node = Node::start(connector, scenario_config(), Mediator::builder().build()).await;

    node.transport
        .notify(&OrderPlaced {
            id: "o-1".to_string(),
        })
        .await
        .unwrap();

    node.transport.dispose().await;
}

/// One publish runs each subscribed process's handlers exactly once.
pub async fn loop_prevention(connector: Arc<dyn Connector>) {
    let config = scenario_config();
    let (origin_count, peer_count) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));

    let origin = Node::start(
        connector.clone(),
        config.clone(),
        Mediator::builder()
            .event_handler::<OrderPlaced, _>(OrderCounter(origin_count.clone()))
            .build(),
    )
    .await;
    let peer = Node::start(
        connector,
        config,
        Mediator::builder()
            .event_handler::<OrderPlaced, _>(OrderCounter(peer_count.clone()))
            .build(),
    )
    .await;
    origin.adapter.subscribe::<OrderPlaced>().await.unwrap();
    peer.adapter.subscribe::<OrderPlaced>().await.unwrap();

    origin
        .adapter
        .publish(&OrderPlaced {
            id: "o-1".to_string(),
        })
        .await
        .unwrap();

    wait_until(|| {
        origin_count.load(Ordering::SeqCst) >= 1 && peer_count.load(Ordering::SeqCst) >= 1
    })
    .await;
    // Give any re-publication a chance to show up.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(origin_count.load(Ordering::SeqCst), 1);
    assert_eq!(peer_count.load(Ordering::SeqCst), 1);

    origin.transport.dispose().await;
    peer.transport.dispose().await;
}

/// A remote call returns what a local send of the same request returns.
pub async fn round_trip_matches_local_send(connector: Arc<dyn Connector>) {
    let config = scenario_config();
    let server = Node::start(
        connector.clone(),
        config.clone(),
        Mediator::builder().request_handler::<Ping, _>(Echo).build(),
    )
    .await;
    server
        .transport
        .serve::<Ping>(server.mediator.clone())
        .await
        .unwrap();
    let client = Node::start(connector, config, Mediator::builder().build()).await;

    for value in ["", "plain", "ünïcödé", "{\"nested\": true}"] {
        let local = server.mediator.send(ping(value)).await.unwrap();
        let remote = client
            .transport
            .call(ping(value), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(remote, local);
    }

    client.transport.dispose().await;
    server.transport.dispose().await;
}

/// Unit responses survive the round trip.
pub async fn unit_request_round_trip(connector: Arc<dyn Connector>) {
    let config = scenario_config();
    let resets = Arc::new(AtomicUsize::new(0));
    let server = Node::start(
        connector.clone(),
        config.clone(),
        Mediator::builder()
            .request_handler::<Reset, _>(Resetter(resets.clone()))
            .build(),
    )
    .await;
    server
        .transport
        .serve::<Reset>(server.mediator.clone())
        .await
        .unwrap();
    let client = Node::start(connector, config, Mediator::builder().build()).await;

    client
        .transport
        .call(Reset, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resets.load(Ordering::SeqCst), 1);

    client.transport.dispose().await;
    server.transport.dispose().await;
}

/// A failing remote handler surfaces as `RemoteHandler` with its message.
pub async fn remote_failure_is_remote_handler(connector: Arc<dyn Connector>) {
    let config = scenario_config();
    let server = Node::start(
        connector.clone(),
        config.clone(),
        Mediator::builder().request_handler::<Ping, _>(OutOfStock).build(),
    )
    .await;
    server
        .transport
        .serve::<Ping>(server.mediator.clone())
        .await
        .unwrap();
    let client = Node::start(connector, config, Mediator::builder().build()).await;

    let response = client
        .transport
        .dispatch(ping("widget"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(response.is_error());

    match response.into_result() {
        Err(MediatorError::RemoteHandler { message, kind }) => {
            assert_eq!(message, "item is out of stock");
            assert_eq!(kind.as_deref(), Some("handler"));
        }
        other => panic!("Expected RemoteHandler, got {:?}", other),
    }

    client.transport.dispose().await;
    server.transport.dispose().await;
}

/// A server without a local handler answers with a configuration error.
pub async fn missing_remote_handler(connector: Arc<dyn Connector>) {
    let config = scenario_config();
    let server = Node::start(connector.clone(), config.clone(), Mediator::builder().build()).await;
    server
        .transport
        .serve::<Ping>(server.mediator.clone())
        .await
        .unwrap();
    let client = Node::start(connector, config, Mediator::builder().build()).await;

    match client.transport.call(ping("x"), &CancellationToken::new()).await {
        Err(MediatorError::RemoteHandler { kind, .. }) => {
            assert_eq!(kind.as_deref(), Some("no_handler"))
        }
        other => panic!("Expected RemoteHandler, got {:?}", other),
    }

    client.transport.dispose().await;
    server.transport.dispose().await;
}

/// A request nobody serves fails as unroutable instead of hanging.
pub async fn unroutable_dispatch(connector: Arc<dyn Connector>) {
    let client = Node::start(connector, scenario_config(), Mediator::builder().build()).await;

    let result = tokio::time::timeout(
        PROMPT,
        client.transport.call(ping("anyone?"), &CancellationToken::new()),
    )
    .await
    .expect("Unroutable dispatch hung");

    match result {
        Err(MediatorError::Transport(TransportError::Unroutable { route })) => {
            assert_eq!(route, "tests.ping")
        }
        other => panic!("Expected Unroutable, got {:?}", other),
    }
    assert_eq!(client.transport.pending_calls(), 0);

    client.transport.dispose().await;
}

/// Once the only server is gone its request queue goes too, so a new call
/// fails as unroutable instead of waiting for a reply.
pub async fn dispatch_after_server_disposed(connector: Arc<dyn Connector>) {
    let config = scenario_config();
    let server = Node::start(
        connector.clone(),
        config.clone(),
        Mediator::builder().request_handler::<Ping, _>(Answer("ok")).build(),
    )
    .await;
    server
        .transport
        .serve::<Ping>(server.mediator.clone())
        .await
        .unwrap();
    server.transport.dispose().await;

    let client = Node::start(connector, config, Mediator::builder().build()).await;
    let result = tokio::time::timeout(
        PROMPT,
        client.transport.call(ping("still there?"), &CancellationToken::new()),
    )
    .await
    .expect("Dispatch to a disposed server hung");

    match result {
        Err(MediatorError::Transport(TransportError::Unroutable { route })) => {
            assert_eq!(route, "tests.ping")
        }
        other => panic!("Expected Unroutable, got {:?}", other),
    }
    assert_eq!(client.transport.pending_calls(), 0);

    client.transport.dispose().await;
}
