//! Events, transport envelopes and the message routing core.
//!
//! - [`Event`]: the domain fact and its JSON wire form
//! - [`Message`]: the transport envelope published on the bus
//! - [`Publisher`] / [`Subscriber`]: topic-based pub/sub with per-delivery ack/nack
//! - [`Router`]: binds handlers to subscriptions and owns the consume lifecycle

pub mod bus;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod message;
pub mod middleware;
pub mod plugin;
pub mod router;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use bus::{Acknowledger, BusError, Delivery, Publisher, Subscriber, Subscription};
pub use event::Event;
pub use handler::{ForwardEventHandler, Handler, HandlerError, HandlerResult};
pub use in_memory_bus::{InMemoryBus, InMemoryBusConfig};
pub use message::Message;
pub use middleware::{InstrumentHandler, Middleware, Recoverer};
pub use plugin::{RouterPlugin, SignalsHandler};
pub use router::{Router, RouterConfig, RouterError, RouterHandle, RouterState};
