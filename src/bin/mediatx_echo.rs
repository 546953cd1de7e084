//! mediatx-echo: demo node
//!
//! Serves an `Echo` request over the broker and subscribes to `Announced`
//! events. On startup it announces itself and calls `Echo` once through the
//! broker; afterwards it answers other nodes until Ctrl-C.
//!
//! ## Configuration
//! - MEDIATX_CONFIG: Path to a YAML config file (optional)
//! - MEDIATX__MESSAGING__TYPE: `amqp` or `channel` (default: channel)
//! - MEDIATX_LOG: Log filter (default: info)

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use mediatx::bus::init_connector;
use mediatx::config::Config;
use mediatx::utils::bootstrap::init_tracing;
use mediatx::{
    DistributedMediator, EventGateway, EventHandler, HandlerError, Mediator, Request,
    RequestHandler, Routable, RouteResolver, Transport,
};

#[derive(Debug, Serialize, Deserialize)]
struct Echo {
    text: String,
}

impl Request for Echo {
    type Response = String;
}

impl Routable for Echo {
    const ROUTE_KEY: &'static str = "mediatx.echo";
}

#[derive(Debug, Serialize, Deserialize)]
struct Announced {
    node: String,
}

mediatx::distributed_event!(Announced, "mediatx.announced");

struct EchoHandler {
    node: String,
}

#[async_trait]
impl RequestHandler<Echo> for EchoHandler {
    async fn handle(&self, request: Echo) -> Result<String, HandlerError> {
        Ok(format!("{} (from {})", request.text, self.node))
    }
}

struct AnnouncementLogger;

#[async_trait]
impl EventHandler<Announced> for AnnouncementLogger {
    async fn handle(&self, event: &Announced) -> Result<(), HandlerError> {
        info!(node = %event.node, "Node announced");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let connector = init_connector(&config.messaging)?;
    let transport = Arc::new(Transport::new(
        connector,
        config.transport.clone(),
        RouteResolver::from_config(&config.routing),
    ));
    transport.connect().await?;
    let node = transport.reply_queue().to_string();

    let mediator = Arc::new(
        Mediator::builder()
            .request_handler::<Echo, _>(EchoHandler { node: node.clone() })
            .event_handler::<Announced, _>(AnnouncementLogger)
            .build(),
    );
    let adapter = Arc::new(DistributedMediator::new(
        mediator.clone(),
        EventGateway::new(transport.clone()),
    ));

    transport.serve::<Echo>(mediator).await?;
    adapter.subscribe::<Announced>().await?;

    adapter.publish(&Announced { node: node.clone() }).await?;

    let reply = transport
        .call(
            Echo {
                text: "hello".to_string(),
            },
            &CancellationToken::new(),
        )
        .await?;
    info!(reply = %reply, "Echo round trip complete");

    info!(node = %node, "mediatx-echo started");
    tokio::signal::ctrl_c().await?;

    transport.dispose().await;
    Ok(())
}
