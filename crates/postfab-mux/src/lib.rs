//! Bidirectional call multiplexer.
//!
//! Turns one duplex frame stream between two peers into a symmetric RPC
//! fabric: either side registers handlers for the services it hosts and,
//! concurrently, invokes services the peer has registered, with responses
//! correlated to requests by tag.
//!
//! Both the agent and the client dial *out* to the relay, then expose
//! callable services to it over the same stream; the multiplexer is what
//! makes that inversion work through NAT and firewalls.

pub mod error;
pub mod handler;
mod muxer;

pub use error::RpcError;
pub use handler::{unary, Handler, HandlerRegistry};
pub use muxer::{CallHandle, FrameStream, Muxer};
