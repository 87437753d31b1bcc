//! # dualipc - dual-channel messaging endpoints
//!
//! An endpoint multiplexes two unreliable channels between an *initiator*
//! and a *responder*: a notify channel for fire-and-forget messages and an
//! invoke channel for request/reply. Endpoints are usable the moment they are
//! created; anything sent before the channels are bound is buffered and
//! replayed in order.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dualipc::{EndpointRegistry, LocalBus, Role, Result};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let bus = LocalBus::new();
//!     let server = EndpointRegistry::new(Arc::new(bus.responder()), Role::Responder);
//!     let (_, provider) = bus.connect();
//!     let client = EndpointRegistry::new(Arc::new(provider), Role::Initiator);
//!
//!     let math = server.get_or_create("math")?;
//!     math.set_reply_handler(|_caller, args| async move {
//!         let sum: i64 = args.iter().filter_map(|v| v.as_i64()).sum();
//!         Ok(vec![json!(sum)])
//!     });
//!
//!     // Sent before the channels exist, delivered once they do.
//!     let calc = client.get_or_create("math")?;
//!     let pending = calc.invoke(vec![json!(2), json!(2)]);
//!     bus.declare("math");
//!
//!     let reply = pending.await?;
//!     assert_eq!(reply.into_result()?, vec![json!(4)]);
//!     Ok(())
//! }
//! ```
//!
//! ## Transports
//!
//! - [`LocalBus`] connects endpoints within one process
//! - [`IpmbProvider`] connects processes over an ipmb bus

pub mod config;
pub mod correlation;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod pending;
pub mod registry;
pub mod transport;
pub mod transport_ipmb;


#[cfg(test)]
mod error_tests;

// Re-exports
pub use config::{EndpointConfig, EndpointConfigBuilder, IpmbConfig};
pub use dispatcher::{Dispatcher, Subscription};
pub use endpoint::{Endpoint, HandlerFailure, ReplyHandler, Role};
pub use error::{Error, Result};
pub use message::{Args, CorrelationId, Notification, PeerId, Reply};
pub use registry::EndpointRegistry;
pub use transport::{Channel, ChannelPair, ChannelProvider, LocalBus, LocalProvider};
pub use transport_ipmb::IpmbProvider;

// Re-export commonly used dependencies
pub use async_trait::async_trait;
pub use serde_json::{json, Value};
