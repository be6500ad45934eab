//! Messagebus - client-side message dispatch core
//!
//! Typed messages are encoded onto broker properties and bodies, broadcast
//! through a proxy exchange, and consumed by a per-consumer event loop that
//! acknowledges each delivery, decodes it and runs it through a POST handler
//! pipeline.
//!
//! - [`message`]: message types, header and body codecs
//! - [`handler`]: PRE/POST handler pipeline and built-in handlers
//! - [`receive`]: the consumer event loop
//! - [`broadcast`]: the send path
//! - [`broker`]: transport seam, in-memory broker, AMQP adapter (`amqp` feature)

pub mod broadcast;
pub mod broker;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod message;
pub mod receive;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use broadcast::{
    AddressResolver, Broadcaster, CarrierContext, ClientState, StateCheck, StaticAddressResolver,
};
pub use context::{CarryType, MessageContext};
pub use error::{BusError, Result};
pub use handler::{HandlerChain, HandlerFlow, HandlerPipeline, MessageHandler, Stage};
pub use message::{Message, MessageBody, MessageHeader, MessageType};
pub use receive::{LoopState, ReceiveEventLoop};
