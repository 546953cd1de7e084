//! MediatX - distributed mediator
//!
//! An in-process mediator (single-handler requests, multi-handler events)
//! extended with a broker transport: selected requests become correlated RPC
//! calls and selected events fan out to every subscribed process.

pub mod bus;
pub mod codec;
pub mod config;
pub mod distributed;
pub mod mediator;
pub mod routing;
pub mod transport;
pub mod utils;

pub use distributed::{DistributedEvent, DistributedMediator, EventGateway, Propagation};
pub use mediator::{Event, EventHandler, HandlerError, Mediator, MediatorError, Request, RequestHandler};
pub use routing::{Routable, RouteResolver};
pub use transport::{ResponseMessage, Transport, TransportConfig};
