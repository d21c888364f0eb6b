//! Operator-side SDK.
//!
//! A [`Client`] dials the relay, proves control of its SSH key through the
//! relay-driven key exchange, and subscribes to announcements from agents
//! whose hosts trust that key. Matching announcements invoke the watch
//! callback with a [`ControlContext`] that can dispatch commands and
//! scripts to the announcing agent.

mod client;
mod context;
mod kex_state;
mod session;

pub use client::{Client, ClientConfig, SdkError};
pub use context::{ControlContext, NotifyCallback};
