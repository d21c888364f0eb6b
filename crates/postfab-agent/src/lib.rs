//! The postfab agent.
//!
//! A short-lived process launched on a freshly provisioned host. It dials
//! out to the relay, announces the host's identity and trust set, serves
//! the `Instruction` service over the same stream, and exits after a
//! period with no instructions.

pub mod exec;
pub mod host;
pub mod service;
pub mod timer;

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Certificate, ClientTlsConfig, Endpoint};
use tracing::{error, info, warn};

use postfab_mux::{CallHandle, Muxer, RpcError};
use postfab_proto::methods::METHOD_ANNOUNCE;
use postfab_proto::v1::relay_client::RelayClient;
use postfab_proto::v1::{Announcement, AnnouncementResponse, Frame};

use host::{HostError, HostInfo};
use service::InstructionService;
use timer::SharedTimer;

/// Per-stream frame channel depth.
const STREAM_BUFFER: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to gather host info: {0}")]
    Host(#[from] HostError),

    #[error("invalid relay address: {0}")]
    InvalidAddress(String),

    #[error("failed to read CA certificate: {0}")]
    CaCert(std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("announce failed: {0}")]
    Announce(RpcError),

    #[error("relay stream ended: {0}")]
    StreamClosed(RpcError),
}

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub relay_address: String,
    pub ca_cert: Option<PathBuf>,
    pub insecure: bool,
    pub timeout: Duration,
    pub extra_authorized_keys: Vec<String>,
}

impl AgentOptions {
    pub fn new(relay_address: impl Into<String>) -> Self {
        Self {
            relay_address: relay_address.into(),
            ca_cert: None,
            insecure: false,
            timeout: Duration::from_secs(60),
            extra_authorized_keys: Vec::new(),
        }
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert = Some(path.into());
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_extra_authorized_keys(
        mut self,
        keys: impl IntoIterator<Item = String>,
    ) -> Self {
        self.extra_authorized_keys.extend(keys);
        self
    }
}

pub struct Agent {
    options: AgentOptions,
    host_info: Option<HostInfo>,
}

impl Agent {
    pub fn new(options: AgentOptions) -> Self {
        Self {
            options,
            host_info: None,
        }
    }

    /// Use a prepared host description instead of introspecting the live
    /// host. Intended for embedders and test environments.
    pub fn with_host_info(mut self, host_info: HostInfo) -> Self {
        self.host_info = Some(host_info);
        self
    }

    /// Connect, announce, then serve instructions until either the idle
    /// timer fires (clean exit) or the stream dies.
    pub async fn run(self) -> Result<(), AgentError> {
        // Introspection reads /etc and waits on an ssh subprocess, so keep
        // it off the executor threads.
        let prepared = self.host_info;
        let extra_keys = self.options.extra_authorized_keys.clone();
        let host_info = tokio::task::spawn_blocking(move || -> Result<HostInfo, HostError> {
            let mut info = match prepared {
                Some(info) => info,
                None => HostInfo::gather()?,
            };
            info.authorized_keys
                .extend(host::extra_authorized_keys(&extra_keys)?);
            Ok(info)
        })
        .await
        .map_err(|e| HostError::Io(std::io::Error::other(e)))??;

        let announcement = Announcement {
            uname: Some(host_info.uname),
            network: Some(host_info.network),
            preferred_host_public_key: host_info.preferred_host_public_key,
            authorized_keys: host_info.authorized_keys,
        };

        info!(address = %self.options.relay_address, "connecting to relay");
        let channel = endpoint(
            &self.options.relay_address,
            self.options.insecure,
            self.options.ca_cert.as_deref(),
        )?
        .connect()
        .await?;
        info!("connected");

        let mut relay = RelayClient::new(channel);
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(STREAM_BUFFER);
        let inbound = relay
            .agent_stream(ReceiverStream::new(frame_rx))
            .await
            .map_err(|e| AgentError::Announce(RpcError::unavailable(e.to_string())))?
            .into_inner();

        let timer = SharedTimer::new(self.options.timeout);
        let mut mux = Muxer::new(inbound, frame_tx);
        let instruction_service = InstructionService::new(timer.clone());
        instruction_service.register(&mut mux);

        let (ready_tx, ready_rx) = oneshot::channel();
        let (handle, mut err_rx) = mux.serve(ready_rx);
        let _ = ready_tx.send(());

        info!("announcing to relay");
        let api = AgentApiClient::new(handle);
        let response = api
            .announce(&announcement)
            .await
            .map_err(AgentError::Announce)?;
        if response.accept {
            info!("accepted by relay");
            if !response.message.is_empty() {
                info!("[RELAY]: {}", response.message);
            }
        } else {
            error!("rejected by relay");
            if !response.message.is_empty() {
                error!("[RELAY]: {}", response.message);
            }
            return Ok(());
        }

        info!("serving instructions");
        tokio::select! {
            () = timer.expired() => {
                info!(timeout = ?self.options.timeout, "no instructions received, exiting");
                Ok(())
            }
            reason = &mut err_rx => {
                let reason = reason.unwrap_or_else(|_| RpcError::stream_terminated());
                Err(AgentError::StreamClosed(reason))
            }
        }
    }
}

/// Stub for the `AgentAPI` service the relay registers on agent streams.
struct AgentApiClient {
    handle: CallHandle,
}

impl AgentApiClient {
    fn new(handle: CallHandle) -> Self {
        Self { handle }
    }

    async fn announce(
        &self,
        announcement: &Announcement,
    ) -> Result<AnnouncementResponse, RpcError> {
        self.handle
            .call_unary(METHOD_ANNOUNCE, announcement)
            .await
    }
}

/// Build the relay endpoint: TLS with the system trust store by default, a
/// custom CA when provided, or plaintext when explicitly configured.
fn endpoint(
    address: &str,
    insecure: bool,
    ca_cert: Option<&std::path::Path>,
) -> Result<Endpoint, AgentError> {
    if insecure {
        warn!("POSTFAB AGENT IS RUNNING IN INSECURE MODE - DO NOT USE IN PRODUCTION");
        return Endpoint::from_shared(format!("http://{address}"))
            .map_err(|e| AgentError::InvalidAddress(e.to_string()));
    }

    let tls = match ca_cert {
        Some(path) => {
            info!(ca_cert = %path.display(), "using CA cert");
            let pem = std::fs::read_to_string(path).map_err(AgentError::CaCert)?;
            ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem))
        }
        None => ClientTlsConfig::new().with_native_roots(),
    };
    Endpoint::from_shared(format!("https://{address}"))
        .map_err(|e| AgentError::InvalidAddress(e.to_string()))?
        .tls_config(tls)
        .map_err(AgentError::Transport)
}
