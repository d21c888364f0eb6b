//! The `AgentAPI` service the relay registers on every agent stream.

use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;

use postfab_mux::{unary, CallHandle, FrameStream, Muxer, RpcError};
use postfab_proto::methods::METHOD_ANNOUNCE;
use postfab_proto::v1::{Announcement, AnnouncementResponse};

use crate::controller::Controller;
use crate::stubs::InstructionClient;

pub struct AgentApi {
    controller: Arc<Controller>,
    ctx: CancellationToken,
    // Filled in by the stream task between serve() and the ready signal.
    instructions: OnceLock<InstructionClient>,
    announced: Mutex<Option<oneshot::Sender<()>>>,
}

impl AgentApi {
    /// Returns the service plus a receiver that fires once an announcement
    /// has been accepted.
    pub fn new(
        controller: Arc<Controller>,
        ctx: CancellationToken,
    ) -> (Arc<Self>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                controller,
                ctx,
                instructions: OnceLock::new(),
                announced: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Wire the reverse-direction instruction stub. Must happen before the
    /// multiplexer's ready signal is released.
    pub fn init_clients(&self, handle: CallHandle) {
        let _ = self.instructions.set(InstructionClient::new(handle));
    }

    pub fn register<S: FrameStream>(self: &Arc<Self>, mux: &mut Muxer<S>) {
        let api = Arc::clone(self);
        mux.register(
            METHOD_ANNOUNCE,
            unary(move |announcement: Announcement| {
                let api = Arc::clone(&api);
                async move { api.announce(announcement).await }
            }),
        );
    }

    async fn announce(&self, announcement: Announcement) -> Result<AnnouncementResponse, RpcError> {
        info!("announcement received");

        let instructions = self
            .instructions
            .get()
            .ok_or_else(|| RpcError::internal("stream not fully wired"))?
            .clone();

        self.controller
            .agent_connected(self.ctx.clone(), announcement, instructions)
            .await?;

        if let Some(tx) = self
            .announced
            .lock()
            .expect("announced signal poisoned")
            .take()
        {
            let _ = tx.send(());
        }

        Ok(AnnouncementResponse {
            accept: true,
            message: "announcement accepted".into(),
        })
    }
}
