//! Distributed events and loop prevention.
//!
//! A [`DistributedEvent`] published through the [`DistributedMediator`] does
//! not run local handlers at the publish site. It goes to the broker through
//! the [`EventGateway`] instead, and every subscribed process (the origin
//! included) receives it back and runs its local handlers exactly once.
//!
//! Whether a publish propagates is decided by a [`Propagation`] value passed
//! with the call, so concurrent inbound deliveries never share state.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::codec::JsonCodec;
use crate::mediator::{Event, Mediator, Request, Result};
use crate::routing::Routable;
use crate::transport::Transport;

/// Object-safe view of a distributed event.
pub trait RemoteEvent: Send + Sync {
    /// Route tag of the event type.
    fn route_tag(&self) -> &'static str;

    fn encode(&self, codec: &JsonCodec) -> serde_json::Result<Vec<u8>>;
}

/// An event fanned out to every subscribed process.
///
/// Implement with [`distributed_event!`](crate::distributed_event) so that
/// `Event::as_distributed` reports the event as distributed.
pub trait DistributedEvent: Event + Routable + Serialize + DeserializeOwned {}

impl<T: DistributedEvent> RemoteEvent for T {
    fn route_tag(&self) -> &'static str {
        T::ROUTE_KEY
    }

    fn encode(&self, codec: &JsonCodec) -> serde_json::Result<Vec<u8>> {
        codec.encode(self)
    }
}

/// Mark a type as a distributed event with the given route tag.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct OrderPlaced { id: String }
///
/// mediatx::distributed_event!(OrderPlaced, "orders.order-placed");
/// ```
#[macro_export]
macro_rules! distributed_event {
    ($event:ty, $route:expr) => {
        impl $crate::routing::Routable for $event {
            const ROUTE_KEY: &'static str = $route;
        }

        impl $crate::mediator::Event for $event {
            fn as_distributed(
                &self,
            ) -> ::std::option::Option<&dyn $crate::distributed::RemoteEvent> {
                ::std::option::Option::Some(self)
            }
        }

        impl $crate::distributed::DistributedEvent for $event {}
    };
}

// ============================================================================
// Gateway
// ============================================================================

/// Pushes distributed events onto the transport.
#[derive(Clone)]
pub struct EventGateway {
    transport: Arc<Transport>,
}

impl EventGateway {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Serialize `event` and publish it fire-and-forget.
    #[instrument(skip_all, fields(route = event.route_tag()))]
    pub async fn send_remote_notification(&self, event: &dyn RemoteEvent) -> Result<()> {
        let payload = event.encode(self.transport.codec())?;
        self.transport
            .notify_encoded(event.route_tag(), payload)
            .await?;
        Ok(())
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Whether a publish may leave the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Propagation {
    /// Distributed events go to the broker instead of local handlers.
    #[default]
    Propagating,
    /// Local handlers run; nothing is re-published. Used for events that
    /// arrived from the broker.
    Suppressed,
}

/// Mediator whose publish path routes distributed events through the broker.
pub struct DistributedMediator {
    mediator: Arc<Mediator>,
    gateway: EventGateway,
}

impl DistributedMediator {
    pub fn new(mediator: Arc<Mediator>, gateway: EventGateway) -> Self {
        Self { mediator, gateway }
    }

    pub fn mediator(&self) -> &Arc<Mediator> {
        &self.mediator
    }

    pub fn gateway(&self) -> &EventGateway {
        &self.gateway
    }

    /// Send a request to the local handler.
    pub async fn send<R: Request>(&self, request: R) -> Result<R::Response> {
        self.mediator.send(request).await
    }

    /// Publish from application code.
    pub async fn publish<E: Event>(&self, event: &E) -> Result<()> {
        self.publish_with(event, Propagation::Propagating).await
    }

    /// Publish with an explicit propagation context.
    ///
    /// Plain events always run local handlers. A distributed event runs
    /// local handlers only when `Suppressed`; when `Propagating` it is handed
    /// to the gateway and local handlers run once it comes back.
    pub async fn publish_with<E: Event>(&self, event: &E, propagation: Propagation) -> Result<()> {
        match (propagation, event.as_distributed()) {
            (Propagation::Propagating, Some(remote)) => {
                debug!(route = remote.route_tag(), "Rerouting event through broker");
                self.gateway.send_remote_notification(remote).await
            }
            _ => self.mediator.publish(event).await,
        }
    }

    /// Handle an event received from the broker.
    pub async fn deliver<E: Event>(&self, event: &E) -> Result<()> {
        self.publish_with(event, Propagation::Suppressed).await
    }

    /// Receive `E` from the broker.
    pub async fn subscribe<E: DistributedEvent>(self: &Arc<Self>) -> Result<()> {
        self.gateway.transport().subscribe::<E>(self).await?;
        Ok(())
    }
}
