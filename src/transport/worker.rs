//! Single owner of the broker channel.
//!
//! The channel is not safe for concurrent writers, so one task owns it and
//! every operation reaches it as a `WorkItem` over an mpsc queue. Callers hold
//! a cheap, cloneable `WorkerHandle`.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::bus::{
    Broker, Deliveries, OutboundMessage, PublishConfirm, QueueSpec, Result, TransportError,
};

/// Queued operations before callers start waiting on the worker.
const WORK_QUEUE_CAPACITY: usize = 1024;

type Reply<T> = oneshot::Sender<Result<T>>;

enum WorkItem {
    DeclareExchange {
        exchange: String,
        reply: Reply<()>,
    },
    DeclareQueue {
        spec: QueueSpec,
        reply: Reply<()>,
    },
    Bind {
        queue: String,
        exchange: String,
        routing_key: String,
        reply: Reply<()>,
    },
    Consume {
        queue: String,
        consumer_tag: String,
        no_ack: bool,
        reply: Reply<Deliveries>,
    },
    Publish {
        message: OutboundMessage,
        reply: Reply<PublishConfirm>,
    },
    Close {
        reply: Reply<()>,
    },
}

/// Handle to the worker task.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    sender: mpsc::Sender<WorkItem>,
}

impl WorkerHandle {
    /// Spawn a worker that takes ownership of `broker`.
    pub(crate) fn spawn(broker: Box<dyn Broker>) -> Self {
        let (sender, receiver) = mpsc::channel(WORK_QUEUE_CAPACITY);
        tokio::spawn(run(broker, receiver));
        Self { sender }
    }

    async fn request<T>(&self, item: impl FnOnce(Reply<T>) -> WorkItem) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(item(reply))
            .await
            .map_err(|_| TransportError::Closed)?;
        response.await.map_err(|_| TransportError::Closed)?
    }

    pub(crate) async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        let exchange = exchange.to_string();
        self.request(|reply| WorkItem::DeclareExchange { exchange, reply })
            .await
    }

    pub(crate) async fn declare_queue(&self, spec: QueueSpec) -> Result<()> {
        self.request(|reply| WorkItem::DeclareQueue { spec, reply })
            .await
    }

    pub(crate) async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<()> {
        let (queue, exchange, routing_key) =
            (queue.to_string(), exchange.to_string(), routing_key.to_string());
        self.request(|reply| WorkItem::Bind {
            queue,
            exchange,
            routing_key,
            reply,
        })
        .await
    }

    pub(crate) async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<Deliveries> {
        let (queue, consumer_tag) = (queue.to_string(), consumer_tag.to_string());
        self.request(|reply| WorkItem::Consume {
            queue,
            consumer_tag,
            no_ack,
            reply,
        })
        .await
    }

    pub(crate) async fn publish(&self, message: OutboundMessage) -> Result<PublishConfirm> {
        self.request(|reply| WorkItem::Publish { message, reply })
            .await
    }

    /// Close the channel and stop the worker.
    pub(crate) async fn close(&self) -> Result<()> {
        self.request(|reply| WorkItem::Close { reply }).await
    }
}

async fn run(broker: Box<dyn Broker>, mut receiver: mpsc::Receiver<WorkItem>) {
    let mut closed = false;

    while let Some(item) = receiver.recv().await {
        match item {
            WorkItem::DeclareExchange { exchange, reply } => {
                let _ = reply.send(broker.declare_exchange(&exchange).await);
            }
            WorkItem::DeclareQueue { spec, reply } => {
                let _ = reply.send(broker.declare_queue(&spec).await);
            }
            WorkItem::Bind {
                queue,
                exchange,
                routing_key,
                reply,
            } => {
                let _ = reply.send(broker.bind_queue(&queue, &exchange, &routing_key).await);
            }
            WorkItem::Consume {
                queue,
                consumer_tag,
                no_ack,
                reply,
            } => {
                let _ = reply.send(broker.consume(&queue, &consumer_tag, no_ack).await);
            }
            WorkItem::Publish { message, reply } => {
                let _ = reply.send(broker.publish(message).await);
            }
            WorkItem::Close { reply } => {
                // Shutdown must not be blocked by a failing broker.
                if let Err(e) = broker.close().await {
                    warn!(error = %e, "Failed to close broker channel");
                }
                closed = true;
                let _ = reply.send(Ok(()));
                break;
            }
        }
    }

    if !closed {
        // Every handle was dropped without an explicit close.
        if let Err(e) = broker.close().await {
            warn!(error = %e, "Failed to close broker channel");
        }
    }
    debug!("Broker worker stopped");
}
