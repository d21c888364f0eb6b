//! Stream acceptance and per-stream service wiring.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tonic::transport::{Identity, ServerTlsConfig};
use tonic::{Request, Response, Status, Streaming};

use postfab_mux::{FrameStream, Muxer};
use postfab_proto::v1::relay_server::{Relay, RelayServer};
use postfab_proto::v1::Frame;

use crate::agent_api::AgentApi;
use crate::client_api::ClientApi;
use crate::controller::Controller;

/// How long an agent stream may stay silent before the relay gives up on
/// ever receiving an announcement.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-stream frame channel depth.
const STREAM_BUFFER: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("serving certificate and key are required unless running insecure")]
    MissingServingCerts,

    #[error("failed to read TLS material: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_address: SocketAddr,
    pub serving_cert: Option<PathBuf>,
    pub serving_key: Option<PathBuf>,
    pub insecure: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_address: ([0, 0, 0, 0], 9292).into(),
            serving_cert: None,
            serving_key: None,
            insecure: false,
        }
    }
}

/// The relay server: accepts agent and client streams and wires a
/// multiplexer session onto each.
pub struct Server {
    options: ServerOptions,
    controller: Arc<Controller>,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options,
            controller: Arc::new(Controller::new()),
        }
    }

    pub fn controller(&self) -> Arc<Controller> {
        Arc::clone(&self.controller)
    }

    /// Listen on the configured address and serve until the task is
    /// dropped or the transport fails.
    pub async fn serve(self) -> Result<(), ServerError> {
        let listener = tokio::net::TcpListener::bind(self.options.listen_address).await?;
        self.serve_with_listener(listener).await
    }

    /// Serve on an already-bound listener (lets callers pick port 0 and
    /// read back the assigned address).
    pub async fn serve_with_listener(
        self,
        listener: tokio::net::TcpListener,
    ) -> Result<(), ServerError> {
        let mut builder = tonic::transport::Server::builder();

        if self.options.insecure {
            warn!("POSTFAB RELAY IS RUNNING IN INSECURE MODE - DO NOT USE IN PRODUCTION");
        } else {
            let (cert_path, key_path) = match (&self.options.serving_cert, &self.options.serving_key)
            {
                (Some(cert), Some(key)) => (cert, key),
                _ => return Err(ServerError::MissingServingCerts),
            };
            let cert = std::fs::read_to_string(cert_path)?;
            let key = std::fs::read_to_string(key_path)?;
            let identity = Identity::from_pem(cert, key);
            builder = builder.tls_config(ServerTlsConfig::new().identity(identity))?;
            info!(
                cert = %cert_path.display(),
                key = %key_path.display(),
                "TLS enabled"
            );
        }

        info!(addr = %listener.local_addr()?, "listening");
        let service = RelayService {
            controller: self.controller,
        };
        builder
            .add_service(RelayServer::new(service))
            .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
            .await?;
        Ok(())
    }
}

type DuplexStream = Pin<Box<dyn Stream<Item = Result<Frame, Status>> + Send>>;

struct RelayService {
    controller: Arc<Controller>,
}

#[tonic::async_trait]
impl Relay for RelayService {
    type AgentStreamStream = DuplexStream;
    type ClientStreamStream = DuplexStream;

    async fn agent_stream(
        &self,
        request: Request<Streaming<Frame>>,
    ) -> Result<Response<Self::AgentStreamStream>, Status> {
        let inbound = request.into_inner();
        let (out_tx, out_rx) = mpsc::channel::<Result<Frame, Status>>(STREAM_BUFFER);
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(STREAM_BUFFER);

        let ctx = CancellationToken::new();
        tokio::spawn(forward_frames(frame_rx, out_tx.clone(), ctx.clone()));
        tokio::spawn(run_agent_stream(
            Arc::clone(&self.controller),
            inbound,
            frame_tx,
            out_tx,
            ctx,
        ));

        Ok(Response::new(Box::pin(ReceiverStream::new(out_rx))))
    }

    async fn client_stream(
        &self,
        request: Request<Streaming<Frame>>,
    ) -> Result<Response<Self::ClientStreamStream>, Status> {
        let inbound = request.into_inner();
        let (out_tx, out_rx) = mpsc::channel::<Result<Frame, Status>>(STREAM_BUFFER);
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(STREAM_BUFFER);

        let ctx = CancellationToken::new();
        tokio::spawn(forward_frames(frame_rx, out_tx.clone(), ctx.clone()));
        tokio::spawn(run_client_stream(
            Arc::clone(&self.controller),
            inbound,
            frame_tx,
            ctx,
        ));

        Ok(Response::new(Box::pin(ReceiverStream::new(out_rx))))
    }
}

/// Grace period between a session being cut and its stream closing, so a
/// rejection response dispatched just before the cut still reaches the peer.
const FLUSH_GRACE: Duration = Duration::from_millis(100);

/// Pump multiplexer frames into the gRPC response stream until the session
/// context ends, then drain what was already dispatched and close.
async fn forward_frames(
    mut frame_rx: mpsc::Receiver<Frame>,
    out_tx: mpsc::Sender<Result<Frame, Status>>,
    ctx: CancellationToken,
) {
    loop {
        tokio::select! {
            () = ctx.cancelled() => {
                tokio::time::sleep(FLUSH_GRACE).await;
                while let Ok(frame) = frame_rx.try_recv() {
                    if out_tx.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
                break;
            }
            frame = frame_rx.recv() => match frame {
                Some(frame) => {
                    if out_tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

/// Drive one accepted agent stream: serve `AgentAPI`, wire the reverse
/// instruction stub, then wait for the announcement that enrolls the agent.
/// An agent that stays silent is cut off.
async fn run_agent_stream<S: FrameStream>(
    controller: Arc<Controller>,
    inbound: S,
    frame_tx: mpsc::Sender<Frame>,
    out_tx: mpsc::Sender<Result<Frame, Status>>,
    ctx: CancellationToken,
) {
    info!("agent stream opened");
    let mut mux = Muxer::new(inbound, frame_tx);
    let (agent_api, mut announced_rx) = AgentApi::new(controller, ctx.clone());
    agent_api.register(&mut mux);

    let (ready_tx, ready_rx) = oneshot::channel();
    let (handle, mut err_rx) = mux.serve(ready_rx);
    agent_api.init_clients(handle);
    let _ = ready_tx.send(());

    tokio::select! {
        announced = &mut announced_rx => {
            if announced.is_err() {
                ctx.cancel();
                return;
            }
        }
        _ = tokio::time::sleep(ANNOUNCE_TIMEOUT) => {
            warn!("agent sent no announcement, dropping stream");
            let _ = out_tx
                .send(Err(Status::deadline_exceeded("no announcement received")))
                .await;
            ctx.cancel();
            return;
        }
        reason = &mut err_rx => {
            debug!(?reason, "agent stream ended before announcing");
            ctx.cancel();
            return;
        }
    }

    // Enrolled; hold the session open until the stream ends.
    let reason = err_rx.await;
    debug!(?reason, "agent stream closed");
    ctx.cancel();
}

/// Drive one accepted client stream: serve `ClientAPI` and the handshake it
/// performs, until the stream ends or verification cuts the session.
async fn run_client_stream<S: FrameStream>(
    controller: Arc<Controller>,
    inbound: S,
    frame_tx: mpsc::Sender<Frame>,
    ctx: CancellationToken,
) {
    info!("client stream opened");
    let mut mux = Muxer::new(inbound, frame_tx);
    let client_api = ClientApi::new(controller, ctx.clone());
    client_api.register(&mut mux);

    let (ready_tx, ready_rx) = oneshot::channel();
    let (handle, err_rx) = mux.serve(ready_rx);
    client_api.init_clients(handle);
    let _ = ready_tx.send(());

    tokio::select! {
        reason = err_rx => {
            debug!(?reason, "client stream closed");
        }
        () = ctx.cancelled() => {
            debug!("client session cut");
        }
    }
    ctx.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn silent_agent_is_cut_off_with_deadline_exceeded() {
        let controller = Arc::new(Controller::new());
        let (out_tx, mut out_rx) = mpsc::channel::<Result<Frame, Status>>(16);
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(16);
        // Held open: the agent connects but never sends anything.
        let (_in_tx, in_rx) = mpsc::channel::<Frame>(16);

        let ctx = CancellationToken::new();
        tokio::spawn(forward_frames(frame_rx, out_tx.clone(), ctx.clone()));
        tokio::spawn(run_agent_stream(
            controller,
            ReceiverStream::new(in_rx).map(Ok),
            frame_tx,
            out_tx,
            ctx.clone(),
        ));

        let item = out_rx.recv().await.expect("expected a stream item");
        let status = item.expect_err("expected the stream to fail");
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);
        ctx.cancelled().await;
    }
}
