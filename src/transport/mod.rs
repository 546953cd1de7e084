//! Broker transport.
//!
//! Owns one broker channel (through a single worker task), the topic exchange,
//! a private reply queue and the pending-call map. Requests travel as
//! correlated RPC; events travel fire-and-forget.
//!
//! Topology:
//! - Topic exchange (`transport.exchange`), routing key = resolved route key
//! - Reply queue `{prefix}.{pid}.{ticks}`: exclusive, auto-delete
//! - Event queue `{reply-queue}.events`: exclusive, auto-delete, one binding per
//!   subscribed event route
//! - Request queue `{prefix}.rpc.{route}`: shared by every process serving the
//!   route, auto-deleted once the last server stops consuming

mod consumers;
mod envelope;
mod pending;
mod worker;

pub use envelope::{ErrorDescriptor, ResponseMessage};
pub use pending::{CallOutcome, PendingCalls};

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bus::{Connector, OutboundMessage, PublishOutcome, QueueSpec, Result, TransportError};
use crate::codec::{JsonCodec, SerializerOptions};
use crate::distributed::{DistributedEvent, DistributedMediator};
use crate::mediator::{self, Mediator, MediatorError, Request};
use crate::routing::{Routable, RouteResolver};

use consumers::{EventRoute, InboundEvent, RequestServer};
use pending::PendingGuard;
use worker::WorkerHandle;

const REPLY_CONSUMER_TAG: &str = "mediatx-replies";
const EVENT_CONSUMER_TAG: &str = "mediatx-events";

/// Transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Topic exchange shared by every process.
    pub exchange: String,
    /// Prefix for reply and request queue names.
    pub queue_prefix: String,
    pub serializer: SerializerOptions,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            exchange: "mediatx.events".to_string(),
            queue_prefix: "mediatx".to_string(),
            serializer: SerializerOptions::default(),
        }
    }
}

/// Microseconds since the Unix epoch, strictly increasing within the process.
fn creation_ticks() -> i64 {
    static LAST: AtomicI64 = AtomicI64::new(0);
    let now = chrono::Utc::now().timestamp_micros();
    match LAST.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
        Some(now.max(last + 1))
    }) {
        Ok(last) | Err(last) => now.max(last + 1),
    }
}

/// Broker-backed request/response and event transport.
pub struct Transport {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    resolver: RouteResolver,
    codec: JsonCodec,
    pending: PendingCalls,
    reply_queue: String,
    event_queue: String,
    worker: OnceCell<WorkerHandle>,
    events_started: OnceCell<()>,
    event_routes: Arc<DashMap<String, Arc<dyn InboundEvent>>>,
    shutdown: CancellationToken,
}

impl Transport {
    /// Create a transport. Nothing touches the broker until [`connect`].
    ///
    /// [`connect`]: Transport::connect
    pub fn new(
        connector: Arc<dyn Connector>,
        config: TransportConfig,
        resolver: RouteResolver,
    ) -> Self {
        let reply_queue = format!(
            "{}.{}.{}",
            config.queue_prefix,
            std::process::id(),
            creation_ticks()
        );
        let event_queue = format!("{}.events", reply_queue);
        Self {
            connector,
            codec: JsonCodec::new(config.serializer.clone()),
            config,
            resolver,
            pending: PendingCalls::new(),
            reply_queue,
            event_queue,
            worker: OnceCell::new(),
            events_started: OnceCell::new(),
            event_routes: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn codec(&self) -> &JsonCodec {
        &self.codec
    }

    pub fn resolver(&self) -> &RouteResolver {
        &self.resolver
    }

    /// Name of this process's reply queue.
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Number of outstanding calls.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Open the channel, declare the exchange and reply queue, and start the
    /// reply consumer. Calling it again is a no-op.
    ///
    /// Not retried; an unreachable broker fails with
    /// `TransportError::Connection`.
    pub async fn connect(&self) -> Result<()> {
        self.worker().await.map(|_| ())
    }

    async fn worker(&self) -> Result<&WorkerHandle> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.worker.get_or_try_init(|| self.open()).await
    }

    async fn open(&self) -> Result<WorkerHandle> {
        let broker = self.connector.open().await?;
        let worker = WorkerHandle::spawn(broker);

        if let Err(e) = self.declare_reply_topology(&worker).await {
            let _ = worker.close().await;
            return Err(e);
        }

        info!(
            exchange = %self.config.exchange,
            reply_queue = %self.reply_queue,
            "Transport connected"
        );
        Ok(worker)
    }

    async fn declare_reply_topology(&self, worker: &WorkerHandle) -> Result<()> {
        worker.declare_exchange(&self.config.exchange).await?;
        worker
            .declare_queue(QueueSpec::private(&self.reply_queue))
            .await?;
        let deliveries = worker
            .consume(&self.reply_queue, REPLY_CONSUMER_TAG, true)
            .await?;
        tokio::spawn(consumers::run_replies(
            deliveries,
            self.pending.clone(),
            self.shutdown.clone(),
        ));
        Ok(())
    }

    /// Send a request to the one remote process serving its route and wait
    /// for the reply envelope.
    ///
    /// Resolves on the first of: the reply arriving, the broker returning the
    /// request as unroutable (`TransportError::Unroutable`), or `cancel`
    /// firing (`MediatorError::Cancelled`). Cancellation only drops local
    /// bookkeeping; the remote side may still process the request.
    #[instrument(skip_all, fields(request = R::ROUTE_KEY))]
    pub async fn dispatch<R>(
        &self,
        request: R,
        cancel: &CancellationToken,
    ) -> mediator::Result<ResponseMessage<R::Response>>
    where
        R: Request + Routable + Serialize,
        R::Response: DeserializeOwned,
    {
        let worker = self.worker().await?;
        let route = self.resolver.route_key::<R>();
        let payload = self.codec.encode(&request)?;

        let (correlation_id, mut receiver) = self.pending.register();
        let _guard = PendingGuard::new(&self.pending, &correlation_id);

        let confirm = worker
            .publish(OutboundMessage {
                exchange: self.config.exchange.clone(),
                routing_key: route.clone(),
                correlation_id: Some(correlation_id.clone()),
                reply_to: Some(self.reply_queue.clone()),
                mandatory: true,
                payload,
            })
            .await?;
        debug!(route = %route, correlation_id = %correlation_id, "Dispatched request");

        {
            let pending = self.pending.clone();
            let id = correlation_id.clone();
            tokio::spawn(async move {
                let failure = match confirm.await {
                    Ok(PublishOutcome::Accepted) => return,
                    Ok(PublishOutcome::Returned) => TransportError::Unroutable { route },
                    Err(e) => e,
                };
                if pending.resolve(&id, Err(failure)) {
                    debug!(correlation_id = %id, "Call failed at publish");
                }
            });
        }

        let outcome = tokio::select! {
            biased;
            outcome = &mut receiver => Some(outcome),
            _ = cancel.cancelled() => None,
            _ = self.shutdown.cancelled() => {
                return Err(TransportError::Closed.into());
            }
        };

        let outcome = match outcome {
            Some(outcome) => outcome,
            None if self.pending.cancel(&correlation_id) => {
                debug!(correlation_id = %correlation_id, "Call cancelled");
                return Err(MediatorError::Cancelled);
            }
            // The reply resolved the call before cancellation could remove it.
            None => receiver.await,
        };

        let payload = outcome.map_err(|_| TransportError::Closed)??;
        Ok(self.codec.decode(&payload)?)
    }

    /// [`dispatch`](Transport::dispatch), surfacing a remote failure as
    /// `MediatorError::RemoteHandler`.
    pub async fn call<R>(&self, request: R, cancel: &CancellationToken) -> mediator::Result<R::Response>
    where
        R: Request + Routable + Serialize,
        R::Response: DeserializeOwned,
    {
        self.dispatch(request, cancel).await?.into_result()
    }

    /// Publish an event to every subscribed process without waiting for
    /// delivery.
    pub async fn notify<E: DistributedEvent>(&self, event: &E) -> mediator::Result<()> {
        let payload = self.codec.encode(event)?;
        self.notify_encoded(E::ROUTE_KEY, payload).await?;
        Ok(())
    }

    /// Publish an already encoded event under its route tag.
    ///
    /// An event no queue is bound for is dropped by the broker; the caller is
    /// not told.
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub async fn notify_encoded(&self, tag: &str, payload: Vec<u8>) -> Result<()> {
        let worker = self.worker().await?;
        let route = self.resolver.resolve(tag);

        // Fire-and-forget: the confirm is dropped unawaited.
        let _confirm = worker
            .publish(OutboundMessage {
                exchange: self.config.exchange.clone(),
                routing_key: route.clone(),
                payload,
                ..Default::default()
            })
            .await?;

        debug!(route = %route, "Published event");
        Ok(())
    }

    /// Serve `R` from this process: consume its request queue, dispatch each
    /// request to `mediator` and reply to the caller.
    pub async fn serve<R>(&self, mediator: Arc<Mediator>) -> Result<()>
    where
        R: Request + Routable + DeserializeOwned,
        R::Response: Serialize,
    {
        let worker = self.worker().await?;
        if !mediator.has_request_handler::<R>() {
            warn!(
                request = R::ROUTE_KEY,
                "Serving request without exactly one local handler"
            );
        }

        let route = self.resolver.route_key::<R>();
        let queue = format!("{}.rpc.{}", self.config.queue_prefix, route);
        worker.declare_queue(QueueSpec::shared(&queue)).await?;
        worker
            .bind_queue(&queue, &self.config.exchange, &route)
            .await?;
        let deliveries = worker
            .consume(&queue, &format!("mediatx-rpc-{}", route), false)
            .await?;

        let server = Arc::new(RequestServer::new(
            mediator,
            worker.clone(),
            self.codec.clone(),
        ));
        tokio::spawn(consumers::run_requests::<R>(
            deliveries,
            server,
            self.shutdown.clone(),
        ));

        info!(queue = %queue, route = %route, "Serving requests");
        Ok(())
    }

    /// Route inbound `E` events to `adapter`, which runs local handlers
    /// without re-publishing.
    pub async fn subscribe<E: DistributedEvent>(
        &self,
        adapter: &Arc<DistributedMediator>,
    ) -> Result<()> {
        let worker = self.worker().await?;
        self.events_started
            .get_or_try_init(|| async {
                worker
                    .declare_queue(QueueSpec::private(&self.event_queue))
                    .await?;
                let deliveries = worker
                    .consume(&self.event_queue, EVENT_CONSUMER_TAG, false)
                    .await?;
                tokio::spawn(consumers::run_events(
                    deliveries,
                    self.event_routes.clone(),
                    self.shutdown.clone(),
                ));
                Ok::<_, TransportError>(())
            })
            .await?;

        let route = self.resolver.route_key::<E>();
        let handler: Arc<dyn InboundEvent> =
            Arc::new(EventRoute::<E>::new(Arc::downgrade(adapter), self.codec.clone()));
        self.event_routes.insert(route.clone(), handler);
        worker
            .bind_queue(&self.event_queue, &self.config.exchange, &route)
            .await?;

        info!(queue = %self.event_queue, route = %route, "Subscribed to event");
        Ok(())
    }

    /// Shut down: stop consumers, fail outstanding calls with
    /// `TransportError::Closed`, close the channel and connection.
    ///
    /// Close failures are logged, never returned.
    pub async fn dispose(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.event_routes.clear();

        let failed = self.pending.fail_all(TransportError::Closed);
        if let Some(worker) = self.worker.get() {
            if let Err(e) = worker.close().await {
                warn!(error = %e, "Failed to close transport");
            }
        }

        info!(failed_calls = failed, "Transport disposed");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests;
