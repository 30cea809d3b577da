//! evolving-node: a TCP RPC and service-discovery node.
//!
//! Clients hold a persistent connection and exchange framed command
//! messages (see [`codec`]). Each inbound message is routed by the
//! [`dispatcher::Dispatcher`] to the handler registered for its command.
//!
//! Built-in commands:
//! - `alive`: liveness check
//! - `register`: add or update a service descriptor
//! - `discover`: list the services registered under a name
//! - `keepalive`: echo
//!
//! Every other command gets an `unknown command` reply once
//! [`handlers::install`] has run. When a client disconnects, all remaining
//! clients receive a `connection_closed` notice carrying its address.

pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod registry;
pub mod server;

pub use codec::Message;
pub use connection::Connection;
pub use dispatcher::{Dispatcher, Handler, HandlerContext};
pub use error::{NodeError, Result};
pub use registry::{Registry, ServiceDescriptor};
pub use server::Server;
