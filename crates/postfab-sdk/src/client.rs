//! Relay connection and watch registration.

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use ssh_key::PrivateKey;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Certificate, ClientTlsConfig, Endpoint};
use tracing::{info, warn};

use postfab_crypto::keys::marshal_public_key;
use postfab_crypto::KeyError;
use postfab_mux::{Muxer, RpcError};
use postfab_proto::v1::relay_client::RelayClient;
use postfab_proto::v1::{BasicFilter, ConnectionRequest, Frame, WatchRequest};

use crate::context::{ClientApiClient, ControlContext};
use crate::session::Session;
use crate::NotifyCallback;

/// Per-stream frame channel depth.
const STREAM_BUFFER: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    #[error("invalid relay address: {0}")]
    InvalidAddress(String),

    #[error("failed to read CA certificate: {0}")]
    CaCert(std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("invalid client key: {0}")]
    Key(#[from] KeyError),

    #[error("{0}")]
    Rpc(RpcError),

    #[error("not connected to a relay")]
    NotConnected,
}

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Relay address (`host:port`).
    pub address: String,
    /// Dial the relay without TLS. Testing only.
    pub insecure: bool,
    /// CA certificate path when the relay serves a self-signed certificate.
    pub ca_cert: Option<PathBuf>,
    /// SSH keypair the relay verifies and uses to match this client against
    /// announcing hosts' trust sets.
    pub key: Arc<PrivateKey>,
}

/// A connection to the relay on behalf of one operator key.
pub struct Client {
    conf: ClientConfig,
    callbacks: Arc<Mutex<Vec<NotifyCallback>>>,
    api: OnceLock<ClientApiClient>,
}

impl Client {
    pub fn new(conf: ClientConfig) -> Self {
        Self {
            conf,
            callbacks: Arc::new(Mutex::new(Vec::new())),
            api: OnceLock::new(),
        }
    }

    /// Dial the relay, host the `Watch` and `KeyExchange` services on our
    /// side of the stream, and complete the relay-driven handshake.
    pub async fn connect(&self) -> Result<(), SdkError> {
        let channel = self.endpoint()?.connect().await?;
        let mut relay = RelayClient::new(channel);

        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(STREAM_BUFFER);
        let inbound = relay
            .client_stream(ReceiverStream::new(frame_rx))
            .await
            .map_err(|e| SdkError::Rpc(RpcError::unavailable(e.to_string())))?
            .into_inner();

        let key_wire = marshal_public_key(self.conf.key.public_key())?;
        let session = Session::new(
            Arc::clone(&self.conf.key),
            key_wire.clone(),
            Arc::clone(&self.callbacks),
        );

        let mut mux = Muxer::new(inbound, frame_tx);
        session.register(&mut mux);

        let (ready_tx, ready_rx) = oneshot::channel();
        let (handle, _closed) = mux.serve(ready_rx);
        let api = ClientApiClient::new(handle);
        session.init_clients(api.clone());
        let _ = ready_tx.send(());

        info!(address = %self.conf.address, "connecting to relay");
        api.connect(&ConnectionRequest {
            public_client_key: key_wire,
        })
        .await
        .map_err(SdkError::Rpc)?;
        info!("connected and verified");

        let _ = self.api.set(api);
        Ok(())
    }

    /// Subscribe to announcements the filter matches. The callback runs in
    /// a fresh task per matching announcement, both for agents enrolling
    /// later and for agents already enrolled at the time of the call.
    pub async fn watch<F, Fut>(&self, filter: BasicFilter, callback: F) -> Result<(), SdkError>
    where
        F: Fn(ControlContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let api = self.api.get().ok_or(SdkError::NotConnected)?.clone();

        // Registered before the request: a late-join notification can race
        // the watch response. Rolled back if the relay rejects the watch.
        let callback: NotifyCallback =
            Arc::new(move |context: ControlContext| Box::pin(callback(context)));
        self.callbacks
            .lock()
            .expect("callbacks poisoned")
            .push(Arc::clone(&callback));

        let result = api
            .watch(&WatchRequest {
                filter: Some(filter),
            })
            .await;
        if let Err(e) = result {
            let mut callbacks = self.callbacks.lock().expect("callbacks poisoned");
            if let Some(pos) = callbacks.iter().position(|c| Arc::ptr_eq(c, &callback)) {
                callbacks.remove(pos);
            }
            return Err(SdkError::Rpc(e));
        }
        Ok(())
    }

    fn endpoint(&self) -> Result<Endpoint, SdkError> {
        if self.conf.insecure {
            warn!("connecting to relay without TLS - testing only");
            return Endpoint::from_shared(format!("http://{}", self.conf.address))
                .map_err(|e| SdkError::InvalidAddress(e.to_string()));
        }

        let tls = match &self.conf.ca_cert {
            Some(path) => {
                let pem = std::fs::read_to_string(path).map_err(SdkError::CaCert)?;
                ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem))
            }
            None => ClientTlsConfig::new().with_native_roots(),
        };
        Endpoint::from_shared(format!("https://{}", self.conf.address))
            .map_err(|e| SdkError::InvalidAddress(e.to_string()))?
            .tls_config(tls)
            .map_err(SdkError::Transport)
    }
}
