//! Named constants for the method strings used across the stream protocol.
//!
//! Both peers of a stream dispatch frames by these strings, so they live
//! next to the message definitions rather than being duplicated in the
//! relay, agent and sdk crates.

// ---------------------------------------------------------------------------
// AgentAPI — served by the relay on agent streams
// ---------------------------------------------------------------------------

/// `AgentAPI/Announce`
pub const METHOD_ANNOUNCE: &str = "AgentAPI/Announce";

// ---------------------------------------------------------------------------
// Instruction — served by the agent
// ---------------------------------------------------------------------------

/// `Instruction/Command`
pub const METHOD_COMMAND: &str = "Instruction/Command";

/// `Instruction/Script`
pub const METHOD_SCRIPT: &str = "Instruction/Script";

// ---------------------------------------------------------------------------
// ClientAPI — served by the relay on client streams
// ---------------------------------------------------------------------------

/// `ClientAPI/Connect`
pub const METHOD_CONNECT: &str = "ClientAPI/Connect";

/// `ClientAPI/Watch`
pub const METHOD_WATCH: &str = "ClientAPI/Watch";

/// `ClientAPI/RunCommand`
pub const METHOD_RUN_COMMAND: &str = "ClientAPI/RunCommand";

/// `ClientAPI/RunScript`
pub const METHOD_RUN_SCRIPT: &str = "ClientAPI/RunScript";

// ---------------------------------------------------------------------------
// KeyExchange — served by the client SDK
// ---------------------------------------------------------------------------

/// `KeyExchange/ExchangeKeys`
pub const METHOD_EXCHANGE_KEYS: &str = "KeyExchange/ExchangeKeys";

/// `KeyExchange/Sign`
pub const METHOD_SIGN: &str = "KeyExchange/Sign";

// ---------------------------------------------------------------------------
// Watch — served by the client SDK
// ---------------------------------------------------------------------------

/// `Watch/Notify`
pub const METHOD_NOTIFY: &str = "Watch/Notify";
