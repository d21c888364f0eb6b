//! The `Instruction` service the agent hosts on its stream.

use std::sync::Arc;

use tracing::info;

use postfab_mux::{unary, FrameStream, Muxer, RpcError};
use postfab_proto::methods::{METHOD_COMMAND, METHOD_SCRIPT};
use postfab_proto::v1::{CommandRequest, CommandResponse, ScriptRequest, ScriptResponse};

use crate::exec;
use crate::timer::SharedTimer;

pub struct InstructionService {
    timer: SharedTimer,
}

impl InstructionService {
    pub fn new(timer: SharedTimer) -> Arc<Self> {
        Arc::new(Self { timer })
    }

    pub fn register<S: FrameStream>(self: &Arc<Self>, mux: &mut Muxer<S>) {
        let svc = Arc::clone(self);
        mux.register(
            METHOD_COMMAND,
            unary(move |req: CommandRequest| {
                let svc = Arc::clone(&svc);
                async move { svc.command(req).await }
            }),
        );
        let svc = Arc::clone(self);
        mux.register(
            METHOD_SCRIPT,
            unary(move |req: ScriptRequest| {
                let svc = Arc::clone(&svc);
                async move { svc.script(req).await }
            }),
        );
    }

    async fn command(&self, req: CommandRequest) -> Result<CommandResponse, RpcError> {
        let command = req
            .command
            .ok_or_else(|| RpcError::invalid_argument("missing command"))?;
        info!(command = %command.command, "executing command");

        // Keep the idle timer from firing underneath a running instruction.
        let _hold = self.timer.block();
        exec::run_command(&command)
            .await
            .map_err(|e| RpcError::internal(e.to_string()))
    }

    async fn script(&self, req: ScriptRequest) -> Result<ScriptResponse, RpcError> {
        let script = req
            .script
            .ok_or_else(|| RpcError::invalid_argument("missing script"))?;
        info!(interpreter = %script.interpreter, "executing script");

        let _hold = self.timer.block();
        exec::run_script(&script)
            .await
            .map_err(|e| RpcError::internal(e.to_string()))
    }
}
