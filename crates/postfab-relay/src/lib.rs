//! The postfab relay.
//!
//! The relay is the only process in the fabric that listens. Agents on
//! freshly provisioned hosts and operator clients both dial out to it and
//! expose callable services back over their streams; the relay wires a call
//! multiplexer onto every accepted stream, keeps the registry of who is
//! connected, and routes instructions from verified clients to the agents
//! their keys are authorized on.

pub mod agent_api;
pub mod client_api;
pub mod controller;
pub mod server;
pub mod stubs;

pub use controller::Controller;
pub use server::{Server, ServerError, ServerOptions};
