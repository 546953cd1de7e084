use super::*;
use std::time::Duration;

use futures::StreamExt;

use crate::bus::{Broker, ChannelBroker, ChannelHub, DEFAULT_EXCHANGE};

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    value: String,
}

impl Request for Ping {
    type Response = String;
}

impl Routable for Ping {
    const ROUTE_KEY: &'static str = "tests.ping";
}

fn transport(hub: &ChannelHub) -> Transport {
    Transport::new(
        Arc::new(hub.connector()),
        TransportConfig::default(),
        RouteResolver::new(),
    )
}

fn ping() -> Ping {
    Ping {
        value: "hello".to_string(),
    }
}

/// Bind a request queue nobody answers, so dispatched calls stay pending.
async fn silent_server(hub: &ChannelHub, transport: &Transport) -> ChannelBroker {
    let broker = hub.open_broker().await;
    broker
        .declare_queue(&QueueSpec::shared("silent"))
        .await
        .unwrap();
    broker
        .bind_queue("silent", &transport.config().exchange, Ping::ROUTE_KEY)
        .await
        .unwrap();
    broker
}

async fn wait_for_pending(transport: &Transport, expected: usize) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while transport.pending_calls() != expected {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("Timed out waiting for pending calls");
}

#[test]
fn test_reply_queue_name_carries_prefix_and_pid() {
    let hub = ChannelHub::new();
    let first = transport(&hub);
    let second = transport(&hub);

    let prefix = format!("mediatx.{}.", std::process::id());
    assert!(first.reply_queue().starts_with(&prefix));
    assert_ne!(first.reply_queue(), second.reply_queue());
}

#[test]
fn test_default_config() {
    let config = TransportConfig::default();
    assert_eq!(config.exchange, "mediatx.events");
    assert_eq!(config.queue_prefix, "mediatx");
    assert!(!config.serializer.pretty);
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let hub = ChannelHub::new();
    let transport = transport(&hub);

    transport.connect().await.unwrap();
    transport.connect().await.unwrap();

    assert!(hub.has_queue(transport.reply_queue()).await);
}

#[tokio::test]
async fn test_connect_after_dispose_fails_closed() {
    let hub = ChannelHub::new();
    let transport = transport(&hub);
    transport.connect().await.unwrap();

    transport.dispose().await;

    assert!(!hub.has_queue(transport.reply_queue()).await);
    assert!(matches!(
        transport.connect().await,
        Err(TransportError::Closed)
    ));
}

#[tokio::test]
async fn test_dispose_fails_outstanding_calls() {
    let hub = ChannelHub::new();
    let transport = Arc::new(transport(&hub));
    transport.connect().await.unwrap();
    let _server = silent_server(&hub, &transport).await;

    let call = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.call(ping(), &CancellationToken::new()).await })
    };
    wait_for_pending(&transport, 1).await;

    transport.dispose().await;

    let result = call.await.unwrap();
    assert!(matches!(
        result,
        Err(MediatorError::Transport(TransportError::Closed))
    ));
    assert_eq!(transport.pending_calls(), 0);
}

#[tokio::test]
async fn test_late_reply_after_cancel_is_dropped() {
    let hub = ChannelHub::new();
    let transport = transport(&hub);
    transport.connect().await.unwrap();
    let server = silent_server(&hub, &transport).await;
    let mut requests = server.consume("silent", "test", true).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = transport.call(ping(), &cancel).await;
    assert!(matches!(result, Err(MediatorError::Cancelled)));
    assert_eq!(transport.pending_calls(), 0);

    // The request still reached the server, which answers too late.
    let request = requests.next().await.unwrap();
    let late = transport
        .codec()
        .encode(&ResponseMessage::ok("late".to_string()))
        .unwrap();
    server
        .publish(OutboundMessage {
            exchange: DEFAULT_EXCHANGE.to_string(),
            routing_key: request.reply_to.unwrap(),
            correlation_id: request.correlation_id,
            payload: late,
            ..Default::default()
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.pending_calls(), 0);
}

#[tokio::test]
async fn test_request_properties_on_the_wire() {
    let hub = ChannelHub::new();
    let transport = Arc::new(transport(&hub));
    transport.connect().await.unwrap();
    let server = silent_server(&hub, &transport).await;
    let mut requests = server.consume("silent", "test", true).await.unwrap();

    let call = {
        let transport = transport.clone();
        tokio::spawn(async move { transport.call(ping(), &CancellationToken::new()).await })
    };

    let request = requests.next().await.unwrap();
    assert_eq!(request.routing_key, "tests.ping");
    assert_eq!(request.reply_to.as_deref(), Some(transport.reply_queue()));
    assert!(request.correlation_id.is_some());
    assert_eq!(request.payload, br#"{"value":"hello"}"#);

    transport.dispose().await;
    assert!(call.await.unwrap().is_err());
}
