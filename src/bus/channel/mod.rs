//! In-memory topic broker for standalone mode.
//!
//! A `ChannelHub` plays the role of the broker server: it owns exchanges,
//! queues and bindings. Each `ChannelConnector::open` yields a `ChannelBroker`,
//! the equivalent of one connection plus channel. Several transports sharing a
//! hub behave like several processes sharing a RabbitMQ instance, which makes
//! the hub suitable for local development and tests without external
//! dependencies.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use super::{
    topic_matches, Acker, Broker, Connector, Deliveries, Delivery, OutboundMessage,
    PublishConfirm, PublishOutcome, QueueSpec, Result, TransportError, DEFAULT_EXCHANGE,
};

type ConnectionId = u64;

struct Consumer {
    connection: ConnectionId,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    /// Declaring connection, for exclusive queues.
    owner: Option<ConnectionId>,
    auto_delete: bool,
    /// Set once the queue has had a consumer.
    consumed: bool,
    consumers: Vec<Consumer>,
    /// Round-robin cursor over `consumers`.
    next: usize,
    /// Messages that arrived while nobody was consuming.
    backlog: VecDeque<Delivery>,
}

impl QueueState {
    fn new(owner: Option<ConnectionId>, auto_delete: bool) -> Self {
        Self {
            owner,
            auto_delete,
            consumed: false,
            consumers: Vec::new(),
            next: 0,
            backlog: VecDeque::new(),
        }
    }

    /// Hand a delivery to the next live consumer, or park it in the backlog.
    fn enqueue(&mut self, mut delivery: Delivery) {
        while !self.consumers.is_empty() {
            let index = self.next % self.consumers.len();
            match self.consumers[index].sender.send(delivery) {
                Ok(()) => {
                    self.next = index + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    // Consumer stream was dropped.
                    self.consumers.remove(index);
                    delivery = returned;
                }
            }
        }
        self.backlog.push_back(delivery);
    }

    /// Auto-delete queue whose last consumer is gone.
    fn abandoned(&self) -> bool {
        self.auto_delete && self.consumed && self.consumers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    pattern: String,
    queue: String,
}

#[derive(Default)]
struct HubState {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    next_connection: ConnectionId,
}

impl HubState {
    fn queue_for(&mut self, connection: ConnectionId, name: &str) -> Result<&mut QueueState> {
        let queue = self
            .queues
            .get_mut(name)
            .ok_or_else(|| TransportError::Channel(format!("Queue '{}' not found", name)))?;
        if queue.owner.is_some_and(|owner| owner != connection) {
            return Err(TransportError::Channel(format!(
                "Queue '{}' is exclusive to another connection",
                name
            )));
        }
        Ok(queue)
    }

    /// Drop consumers whose streams are gone, then delete abandoned
    /// auto-delete queues together with their bindings.
    fn reap_abandoned(&mut self) -> usize {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| !c.sender.is_closed());
        }
        let abandoned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.abandoned())
            .map(|(name, _)| name.clone())
            .collect();
        for name in &abandoned {
            self.queues.remove(name);
            debug!(queue = %name, "Deleted auto-delete queue");
        }
        self.bindings.retain(|b| !abandoned.contains(&b.queue));
        abandoned.len()
    }

    /// Queues a message published to `exchange` with `routing_key` lands in.
    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange == DEFAULT_EXCHANGE {
            return self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect();
        }

        let mut targets: Vec<String> = Vec::new();
        for binding in &self.bindings {
            if binding.exchange == exchange
                && topic_matches(&binding.pattern, routing_key)
                && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }
        targets
    }
}

/// Shared in-memory broker.
#[derive(Clone, Default)]
pub struct ChannelHub {
    state: Arc<Mutex<HubState>>,
}

impl ChannelHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector that opens connections against this hub.
    pub fn connector(&self) -> ChannelConnector {
        ChannelConnector { hub: self.clone() }
    }

    /// Open a connection directly.
    pub async fn open_broker(&self) -> ChannelBroker {
        let id = {
            let mut state = self.state.lock().await;
            state.next_connection += 1;
            state.next_connection
        };
        debug!(connection = id, "Opened channel broker connection");
        ChannelBroker {
            hub: self.clone(),
            id,
            closed: Arc::new(Mutex::new(false)),
        }
    }

    /// Number of messages waiting in a queue with no consumer.
    pub async fn backlog_len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.backlog.len())
            .unwrap_or(0)
    }

    /// Whether a queue is currently declared.
    pub async fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().await.queues.contains_key(queue)
    }
}

/// Opens `ChannelBroker` connections on a hub.
#[derive(Clone)]
pub struct ChannelConnector {
    hub: ChannelHub,
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn open(&self) -> Result<Box<dyn Broker>> {
        Ok(Box::new(self.hub.open_broker().await))
    }
}

/// One connection to a `ChannelHub`.
pub struct ChannelBroker {
    hub: ChannelHub,
    id: ConnectionId,
    closed: Arc<Mutex<bool>>,
}

impl ChannelBroker {
    async fn ensure_open(&self) -> Result<()> {
        if *self.closed.lock().await {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for ChannelBroker {
    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_open().await?;
        self.hub
            .state
            .lock()
            .await
            .exchanges
            .insert(exchange.to_string());
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.ensure_open().await?;
        let mut state = self.hub.state.lock().await;
        if state.queues.contains_key(&spec.name) {
            // Redeclaring is idempotent for the owner and for shared queues.
            state.queue_for(self.id, &spec.name)?;
            return Ok(());
        }
        let owner = spec.exclusive.then_some(self.id);
        state
            .queues
            .insert(spec.name.clone(), QueueState::new(owner, spec.auto_delete));
        debug!(queue = %spec.name, exclusive = spec.exclusive, "Declared queue");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open().await?;
        let mut state = self.hub.state.lock().await;
        if !state.exchanges.contains(exchange) {
            return Err(TransportError::Channel(format!(
                "Exchange '{}' not found",
                exchange
            )));
        }
        state.queue_for(self.id, queue)?;

        let binding = Binding {
            exchange: exchange.to_string(),
            pattern: routing_key.to_string(),
            queue: queue.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, _no_ack: bool) -> Result<Deliveries> {
        self.ensure_open().await?;
        let mut state = self.hub.state.lock().await;
        let queue_state = state
            .queue_for(self.id, queue)
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        for delivery in queue_state.backlog.drain(..) {
            // Receiver is alive in this scope.
            let _ = sender.send(delivery);
        }
        queue_state.consumed = true;
        queue_state.consumers.push(Consumer {
            connection: self.id,
            sender,
        });

        debug!(queue = %queue, consumer_tag = %consumer_tag, "Started consumer");
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<PublishConfirm> {
        self.ensure_open().await?;
        let mut state = self.hub.state.lock().await;

        if message.exchange != DEFAULT_EXCHANGE && !state.exchanges.contains(&message.exchange) {
            return Err(TransportError::Publish(format!(
                "Exchange '{}' not found",
                message.exchange
            )));
        }

        state.reap_abandoned();
        let targets = state.route(&message.exchange, &message.routing_key);
        let outcome = if targets.is_empty() && message.mandatory {
            PublishOutcome::Returned
        } else {
            PublishOutcome::Accepted
        };

        for name in &targets {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.enqueue(Delivery {
                    routing_key: message.routing_key.clone(),
                    correlation_id: message.correlation_id.clone(),
                    reply_to: message.reply_to.clone(),
                    payload: message.payload.clone(),
                    acker: Acker::None,
                });
            }
        }

        debug!(
            exchange = %message.exchange,
            routing_key = %message.routing_key,
            queues = targets.len(),
            "Published message to channel hub"
        );

        Ok(Box::pin(futures::future::ready(Ok(outcome))))
    }

    async fn close(&self) -> Result<()> {
        {
            let mut closed = self.closed.lock().await;
            if *closed {
                return Ok(());
            }
            *closed = true;
        }

        let mut state = self.hub.state.lock().await;
        let id = self.id;

        // Exclusive queues die with their connection; dropping the consumer
        // senders ends the matching delivery streams.
        let owned: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &owned {
            state.queues.remove(name);
        }
        state.bindings.retain(|b| !owned.contains(&b.queue));

        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.connection != id);
        }
        let deleted = state.reap_abandoned();

        info!(
            connection = id,
            queues_removed = owned.len() + deleted,
            "Closed channel broker connection"
        );
        Ok(())
    }
}
