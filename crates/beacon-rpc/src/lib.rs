//! Named-queue request/response RPC for beacon.
//!
//! The gateway sends an HTTP-shaped envelope to a service's queue and awaits
//! the reply on a per-call reply queue; backend services run an [`RpcServer`]
//! that consumes their queue and dispatches on the message pattern. Payloads
//! are opaque JSON; the transport never inspects business data.

mod client;
mod envelope;
mod error;
mod server;

pub use client::RpcClient;
pub use envelope::{RpcRequest, RpcResponse};
pub use error::RpcError;
pub use server::{MessageHandler, RpcServer};
