//! Typed stubs for the reverse direction of an accepted stream.
//!
//! Once a multiplexer is serving, the relay uses these thin wrappers to
//! invoke the services the connecting peer registered on its side: the
//! `Instruction` service hosted by agents, and the `Watch` and
//! `KeyExchange` services hosted by clients.

use postfab_mux::{CallHandle, RpcError};
use postfab_proto::methods;
use postfab_proto::v1::{
    Announcement, CommandRequest, CommandResponse, Empty, KexRequest, KexResponse, ScriptRequest,
    ScriptResponse, SignRequest, SignResponse,
};

/// Stub for the `Instruction` service an agent serves.
#[derive(Clone, Debug)]
pub struct InstructionClient {
    handle: CallHandle,
}

impl InstructionClient {
    pub fn new(handle: CallHandle) -> Self {
        Self { handle }
    }

    pub async fn command(&self, req: &CommandRequest) -> Result<CommandResponse, RpcError> {
        self.handle.call_unary(methods::METHOD_COMMAND, req).await
    }

    pub async fn script(&self, req: &ScriptRequest) -> Result<ScriptResponse, RpcError> {
        self.handle.call_unary(methods::METHOD_SCRIPT, req).await
    }
}

/// Stub for the `Watch` service a client serves.
#[derive(Clone)]
pub struct WatchClient {
    handle: CallHandle,
}

impl WatchClient {
    pub fn new(handle: CallHandle) -> Self {
        Self { handle }
    }

    pub async fn notify(&self, announcement: &Announcement) -> Result<Empty, RpcError> {
        self.handle
            .call_unary(methods::METHOD_NOTIFY, announcement)
            .await
    }
}

/// Stub for the `KeyExchange` service a client serves.
#[derive(Clone)]
pub struct KeyExchangeClient {
    handle: CallHandle,
}

impl KeyExchangeClient {
    pub fn new(handle: CallHandle) -> Self {
        Self { handle }
    }

    pub async fn exchange_keys(&self, req: &KexRequest) -> Result<KexResponse, RpcError> {
        self.handle
            .call_unary(methods::METHOD_EXCHANGE_KEYS, req)
            .await
    }

    pub async fn sign(&self, req: &SignRequest) -> Result<SignResponse, RpcError> {
        self.handle.call_unary(methods::METHOD_SIGN, req).await
    }
}
