//! Local dispatch core.
//!
//! In-process mediator: a request goes to exactly one registered handler, an
//! event fans out to every registered handler. Handlers are registered once
//! through [`MediatorBuilder`]; the built [`Mediator`] is immutable and can be
//! shared freely behind an `Arc`.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::bus::TransportError;
use crate::distributed::RemoteEvent;

// ============================================================================
// Errors
// ============================================================================

/// Error type returned by handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for mediator operations.
pub type Result<T> = std::result::Result<T, MediatorError>;

/// Errors surfaced by local and distributed dispatch.
#[derive(Debug, thiserror::Error)]
pub enum MediatorError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Call was cancelled")]
    Cancelled,

    #[error("Remote handler failed: {message}")]
    RemoteHandler {
        message: String,
        /// Failure category reported by the remote side.
        kind: Option<String>,
    },

    #[error("No handler registered for request {request}")]
    NoHandlerFound { request: &'static str },

    #[error("{count} handlers registered for request {request}, expected exactly one")]
    AmbiguousHandler { request: &'static str, count: usize },

    #[error("Handler for {request} failed: {source}")]
    Handler {
        request: &'static str,
        #[source]
        source: HandlerError,
    },

    #[error("{} handler(s) failed for event {event}", .failures.len())]
    Publish {
        event: &'static str,
        failures: Vec<HandlerError>,
    },

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl MediatorError {
    /// Short category name, carried in remote error descriptors.
    pub fn kind(&self) -> &'static str {
        match self {
            MediatorError::Transport(_) => "transport",
            MediatorError::Cancelled => "cancelled",
            MediatorError::RemoteHandler { .. } => "remote_handler",
            MediatorError::NoHandlerFound { .. } => "no_handler",
            MediatorError::AmbiguousHandler { .. } => "ambiguous_handler",
            MediatorError::Handler { .. } => "handler",
            MediatorError::Publish { .. } => "publish",
            MediatorError::Codec(_) => "codec",
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// A command or query with exactly one handler.
///
/// Commands without a result use `type Response = ()`.
pub trait Request: Send + 'static {
    type Response: Send + 'static;
}

/// Handles one request type.
#[async_trait]
pub trait RequestHandler<R: Request>: Send + Sync + 'static {
    async fn handle(&self, request: R) -> std::result::Result<R::Response, HandlerError>;
}

/// A notification with zero or more handlers.
pub trait Event: Send + Sync + 'static {
    /// Cross-process view of this event, when it is a distributed event.
    ///
    /// Implemented by `distributed_event!`; plain events keep the default.
    fn as_distributed(&self) -> Option<&dyn RemoteEvent> {
        None
    }
}

/// Handles one event type.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    async fn handle(&self, event: &E) -> std::result::Result<(), HandlerError>;
}

// ============================================================================
// Mediator
// ============================================================================

/// Handlers keyed by the request/event type they serve. Each entry holds an
/// `Arc<dyn RequestHandler<R>>` or `Arc<dyn EventHandler<E>>` for that type.
type Registry = HashMap<TypeId, Vec<Box<dyn Any + Send + Sync>>>;

/// Registers handlers and builds a [`Mediator`].
#[derive(Default)]
pub struct MediatorBuilder {
    requests: Registry,
    events: Registry,
}

impl MediatorBuilder {
    /// Register a handler for `R`.
    ///
    /// Registering a second handler for the same request is allowed here and
    /// reported as `AmbiguousHandler` at send time.
    pub fn request_handler<R, H>(mut self, handler: H) -> Self
    where
        R: Request,
        H: RequestHandler<R>,
    {
        let handler: Arc<dyn RequestHandler<R>> = Arc::new(handler);
        self.requests
            .entry(TypeId::of::<R>())
            .or_default()
            .push(Box::new(handler));
        info!(request = type_name::<R>(), "Registered request handler");
        self
    }

    /// Register a handler for `E`.
    pub fn event_handler<E, H>(mut self, handler: H) -> Self
    where
        E: Event,
        H: EventHandler<E>,
    {
        let handler: Arc<dyn EventHandler<E>> = Arc::new(handler);
        self.events
            .entry(TypeId::of::<E>())
            .or_default()
            .push(Box::new(handler));
        info!(event = type_name::<E>(), "Registered event handler");
        self
    }

    pub fn build(self) -> Mediator {
        Mediator {
            requests: self.requests,
            events: self.events,
        }
    }
}

/// In-process mediator.
pub struct Mediator {
    requests: Registry,
    events: Registry,
}

impl Mediator {
    pub fn builder() -> MediatorBuilder {
        MediatorBuilder::default()
    }

    fn request_handlers<R: Request>(&self) -> Vec<Arc<dyn RequestHandler<R>>> {
        self.requests
            .get(&TypeId::of::<R>())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| e.downcast_ref::<Arc<dyn RequestHandler<R>>>().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn event_handlers<E: Event>(&self) -> Vec<Arc<dyn EventHandler<E>>> {
        self.events
            .get(&TypeId::of::<E>())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| e.downcast_ref::<Arc<dyn EventHandler<E>>>().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether exactly one handler serves `R`.
    pub fn has_request_handler<R: Request>(&self) -> bool {
        self.request_handlers::<R>().len() == 1
    }

    /// Number of handlers registered for `E`.
    pub fn event_handler_count<E: Event>(&self) -> usize {
        self.event_handlers::<E>().len()
    }

    /// Send a request to its single handler.
    pub async fn send<R: Request>(&self, request: R) -> Result<R::Response> {
        let request_name = type_name::<R>();
        let handler = match self.request_handlers::<R>().as_slice() {
            [] => {
                return Err(MediatorError::NoHandlerFound {
                    request: request_name,
                })
            }
            [handler] => Arc::clone(handler),
            many => {
                return Err(MediatorError::AmbiguousHandler {
                    request: request_name,
                    count: many.len(),
                })
            }
        };

        debug!(request = request_name, "Sending request");
        handler
            .handle(request)
            .await
            .map_err(|source| MediatorError::Handler {
                request: request_name,
                source,
            })
    }

    /// Publish an event to every handler.
    ///
    /// A failing handler does not stop its siblings; all failures are
    /// returned together once every handler has run.
    pub async fn publish<E: Event>(&self, event: &E) -> Result<()> {
        let event_name = type_name::<E>();
        let handlers = self.event_handlers::<E>();
        debug!(event = event_name, handlers = handlers.len(), "Publishing event");

        let mut failures = Vec::new();
        for handler in handlers {
            if let Err(e) = handler.handle(event).await {
                warn!(event = event_name, error = %e, "Event handler failed");
                failures.push(e);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(MediatorError::Publish {
                event: event_name,
                failures,
            })
        }
    }
}
