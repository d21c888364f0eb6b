//! `postfab` protocol definitions
//!
//! Generated protobuf code for the postfab wire protocol:
//!
//! - The `Relay` service with its two duplex stream kinds (agent, client)
//! - The `Frame` envelope multiplexed calls travel in
//! - Announcement, filter, key-exchange and instruction payloads

/// Postfab v1 wire definitions.
#[allow(
    clippy::derive_partial_eq_without_eq,
    clippy::pedantic,
    clippy::nursery
)]
pub mod v1 {
    tonic::include_proto!("postfab.v1");
}

// Re-export v1 as the default wire version for convenience
pub use v1::*;

/// Named constants for the method strings shared across the stream protocol.
pub mod methods;

mod announce;

pub use announce::AnnouncementError;
