//! The context handed to watch callbacks.

use std::sync::Arc;

use futures::future::BoxFuture;

use postfab_mux::{CallHandle, RpcError};
use postfab_proto::methods::{
    METHOD_CONNECT, METHOD_RUN_COMMAND, METHOD_RUN_SCRIPT, METHOD_WATCH,
};
use postfab_proto::v1::{
    Announcement, Command, CommandRequest, CommandResponse, ConnectionRequest,
    ConnectionResponse, Empty, InstructionMeta, Script, ScriptRequest, ScriptResponse,
    WatchRequest,
};

/// Callback invoked for every announcement a watch matches. Each invocation
/// runs in its own task.
pub type NotifyCallback =
    Arc<dyn Fn(ControlContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// Stub for the `ClientAPI` service the relay serves on client streams.
#[derive(Clone)]
pub(crate) struct ClientApiClient {
    handle: CallHandle,
}

impl ClientApiClient {
    pub fn new(handle: CallHandle) -> Self {
        Self { handle }
    }

    pub async fn connect(&self, req: &ConnectionRequest) -> Result<ConnectionResponse, RpcError> {
        self.handle.call_unary(METHOD_CONNECT, req).await
    }

    pub async fn watch(&self, req: &WatchRequest) -> Result<Empty, RpcError> {
        self.handle.call_unary(METHOD_WATCH, req).await
    }

    pub async fn run_command(&self, req: &CommandRequest) -> Result<CommandResponse, RpcError> {
        self.handle.call_unary(METHOD_RUN_COMMAND, req).await
    }

    pub async fn run_script(&self, req: &ScriptRequest) -> Result<ScriptResponse, RpcError> {
        self.handle.call_unary(METHOD_RUN_SCRIPT, req).await
    }
}

/// One matched announcement plus the means to act on it: instructions
/// dispatched here are routed to the announcing agent.
#[derive(Clone)]
pub struct ControlContext {
    announcement: Arc<Announcement>,
    api: ClientApiClient,
}

impl ControlContext {
    pub(crate) fn new(announcement: Arc<Announcement>, api: ClientApiClient) -> Self {
        Self { announcement, api }
    }

    pub fn announcement(&self) -> &Announcement {
        &self.announcement
    }

    pub async fn run_command(&self, command: Command) -> Result<CommandResponse, RpcError> {
        self.api
            .run_command(&CommandRequest {
                meta: Some(self.meta()?),
                command: Some(command),
            })
            .await
    }

    pub async fn run_script(&self, script: Script) -> Result<ScriptResponse, RpcError> {
        self.api
            .run_script(&ScriptRequest {
                meta: Some(self.meta()?),
                script: Some(script),
            })
            .await
    }

    fn meta(&self) -> Result<InstructionMeta, RpcError> {
        let fingerprint = self
            .announcement
            .fingerprint()
            .map_err(|e| RpcError::invalid_argument(e.to_string()))?;
        Ok(InstructionMeta {
            peer_fingerprint: fingerprint,
        })
    }
}
