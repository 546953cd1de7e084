//! Consumer loops for the reply, request and event queues.
//!
//! Each loop runs on its own task until its delivery stream ends or the
//! transport shuts down.

use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::envelope::{ErrorDescriptor, ResponseMessage};
use super::pending::PendingCalls;
use super::worker::WorkerHandle;
use crate::bus::{Deliveries, Delivery, OutboundMessage, TransportError, DEFAULT_EXCHANGE};
use crate::codec::JsonCodec;
use crate::distributed::{DistributedEvent, DistributedMediator};
use crate::mediator::{self, Mediator, MediatorError, Request};

/// Next delivery, or `None` once the stream ends or shutdown fires.
async fn next_delivery(deliveries: &mut Deliveries, shutdown: &CancellationToken) -> Option<Delivery> {
    tokio::select! {
        _ = shutdown.cancelled() => None,
        delivery = deliveries.next() => delivery,
    }
}

// ============================================================================
// Replies
// ============================================================================

pub(super) async fn run_replies(
    mut deliveries: Deliveries,
    pending: PendingCalls,
    shutdown: CancellationToken,
) {
    while let Some(delivery) = next_delivery(&mut deliveries, &shutdown).await {
        let Delivery {
            correlation_id,
            payload,
            ..
        } = delivery;

        match correlation_id {
            None => debug!("Dropping reply without correlation id"),
            Some(id) => {
                if !pending.resolve(&id, Ok(payload)) {
                    // Late reply after cancellation, or a duplicate.
                    debug!(correlation_id = %id, "Dropping reply for unknown call");
                }
            }
        }
    }
    debug!("Reply consumer stopped");
}

// ============================================================================
// Requests
// ============================================================================

/// Answers requests served by this process.
pub(super) struct RequestServer {
    mediator: Arc<Mediator>,
    worker: WorkerHandle,
    codec: JsonCodec,
}

impl RequestServer {
    pub(super) fn new(mediator: Arc<Mediator>, worker: WorkerHandle, codec: JsonCodec) -> Self {
        Self {
            mediator,
            worker,
            codec,
        }
    }

    async fn handle<R>(self: Arc<Self>, delivery: Delivery)
    where
        R: Request + DeserializeOwned,
        R::Response: Serialize,
    {
        let (Some(reply_to), Some(correlation_id)) =
            (delivery.reply_to.clone(), delivery.correlation_id.clone())
        else {
            warn!(
                routing_key = %delivery.routing_key,
                "Rejecting request without reply_to or correlation id"
            );
            delivery.reject().await;
            return;
        };

        let request: R = match self.codec.decode(&delivery.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    routing_key = %delivery.routing_key,
                    error = %e,
                    "Rejecting undecodable request"
                );
                delivery.reject().await;
                return;
            }
        };

        let outcome = self.mediator.send(request).await;
        if let Err(e) = &outcome {
            warn!(routing_key = %delivery.routing_key, error = %e, "Request failed");
        }

        let payload = match self.encode_response(outcome) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to encode response");
                delivery.reject().await;
                return;
            }
        };

        let reply = OutboundMessage {
            exchange: DEFAULT_EXCHANGE.to_string(),
            routing_key: reply_to,
            correlation_id: Some(correlation_id.clone()),
            payload,
            ..Default::default()
        };
        match self.worker.publish(reply).await {
            Ok(_confirm) => debug!(correlation_id = %correlation_id, "Sent reply"),
            Err(e) => error!(correlation_id = %correlation_id, error = %e, "Failed to send reply"),
        }

        delivery.ack().await;
    }

    /// Encode the reply envelope. A result that fails to encode is replaced by
    /// a codec error descriptor.
    fn encode_response<T: Serialize>(
        &self,
        outcome: mediator::Result<T>,
    ) -> serde_json::Result<Vec<u8>> {
        let message = match outcome {
            Ok(result) => ResponseMessage::ok(result),
            Err(e) => ResponseMessage::err(ErrorDescriptor::from_error(&e)),
        };
        match self.codec.encode(&message) {
            Ok(payload) => Ok(payload),
            Err(e) => self.codec.encode(&ResponseMessage::<()>::err(
                ErrorDescriptor::from_error(&MediatorError::Codec(e)),
            )),
        }
    }
}

pub(super) async fn run_requests<R>(
    mut deliveries: Deliveries,
    server: Arc<RequestServer>,
    shutdown: CancellationToken,
) where
    R: Request + DeserializeOwned,
    R::Response: Serialize,
{
    while let Some(delivery) = next_delivery(&mut deliveries, &shutdown).await {
        tokio::spawn(server.clone().handle::<R>(delivery));
    }
    debug!("Request consumer stopped");
}

// ============================================================================
// Events
// ============================================================================

/// Decodes one event type and hands it to the adapter.
#[async_trait]
pub(super) trait InboundEvent: Send + Sync {
    async fn deliver(&self, payload: &[u8]) -> mediator::Result<()>;
}

pub(super) struct EventRoute<E> {
    adapter: Weak<DistributedMediator>,
    codec: JsonCodec,
    _event: PhantomData<fn() -> E>,
}

impl<E> EventRoute<E> {
    pub(super) fn new(adapter: Weak<DistributedMediator>, codec: JsonCodec) -> Self {
        Self {
            adapter,
            codec,
            _event: PhantomData,
        }
    }
}

#[async_trait]
impl<E: DistributedEvent> InboundEvent for EventRoute<E> {
    async fn deliver(&self, payload: &[u8]) -> mediator::Result<()> {
        let event: E = self.codec.decode(payload)?;
        match self.adapter.upgrade() {
            Some(adapter) => adapter.deliver(&event).await,
            None => Err(TransportError::Closed.into()),
        }
    }
}

async fn deliver_event(route: Arc<dyn InboundEvent>, mut delivery: Delivery) {
    let payload = std::mem::take(&mut delivery.payload);
    match route.deliver(&payload).await {
        Ok(()) => delivery.ack().await,
        Err(MediatorError::Codec(e)) => {
            warn!(
                routing_key = %delivery.routing_key,
                error = %e,
                "Rejecting undecodable event"
            );
            delivery.reject().await;
        }
        Err(e) => {
            // Handler failures stay local; the delivery is still consumed.
            warn!(routing_key = %delivery.routing_key, error = %e, "Event handling failed");
            delivery.ack().await;
        }
    }
}

pub(super) async fn run_events(
    mut deliveries: Deliveries,
    routes: Arc<DashMap<String, Arc<dyn InboundEvent>>>,
    shutdown: CancellationToken,
) {
    while let Some(delivery) = next_delivery(&mut deliveries, &shutdown).await {
        let route = routes
            .get(&delivery.routing_key)
            .map(|entry| Arc::clone(entry.value()));
        match route {
            Some(route) => {
                debug!(routing_key = %delivery.routing_key, "Received event");
                tokio::spawn(deliver_event(route, delivery));
            }
            None => {
                debug!(routing_key = %delivery.routing_key, "No subscription for event");
                delivery.reject().await;
            }
        }
    }
    debug!("Event consumer stopped");
}
