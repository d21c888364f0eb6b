//! The services a client hosts on its side of the stream: the key-exchange
//! responder the relay drives during `Connect`, and the watch notification
//! sink.

use std::sync::{Arc, Mutex, OnceLock};

use ssh_key::PrivateKey;
use tracing::debug;

use postfab_mux::{unary, FrameStream, Muxer, RpcError};
use postfab_proto::methods::{METHOD_EXCHANGE_KEYS, METHOD_NOTIFY, METHOD_SIGN};
use postfab_proto::v1::{
    Announcement, Empty, KexRequest, KexResponse, SignRequest, SignResponse,
};

use crate::context::{ClientApiClient, ControlContext};
use crate::kex_state::KeyExchangeState;
use crate::NotifyCallback;

pub(crate) struct Session {
    key: Arc<PrivateKey>,
    /// The client key bytes exactly as sent in the connection request.
    key_wire: Vec<u8>,
    kex_state: KeyExchangeState,
    callbacks: Arc<Mutex<Vec<NotifyCallback>>>,
    // Filled in between serve() and the ready signal.
    api: OnceLock<ClientApiClient>,
}

impl Session {
    pub fn new(
        key: Arc<PrivateKey>,
        key_wire: Vec<u8>,
        callbacks: Arc<Mutex<Vec<NotifyCallback>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            key_wire,
            kex_state: KeyExchangeState::default(),
            callbacks,
            api: OnceLock::new(),
        })
    }

    pub fn init_clients(&self, api: ClientApiClient) {
        let _ = self.api.set(api);
    }

    pub fn register<S: FrameStream>(self: &Arc<Self>, mux: &mut Muxer<S>) {
        let session = Arc::clone(self);
        mux.register(
            METHOD_EXCHANGE_KEYS,
            unary(move |req: KexRequest| {
                let session = Arc::clone(&session);
                async move { session.exchange_keys(req) }
            }),
        );
        let session = Arc::clone(self);
        mux.register(
            METHOD_SIGN,
            unary(move |req: SignRequest| {
                let session = Arc::clone(&session);
                async move { session.sign(req) }
            }),
        );
        let session = Arc::clone(self);
        mux.register(
            METHOD_NOTIFY,
            unary(move |announcement: Announcement| {
                let session = Arc::clone(&session);
                async move { session.notify(announcement) }
            }),
        );
    }

    fn exchange_keys(&self, req: KexRequest) -> Result<KexResponse, RpcError> {
        debug!("relay initiated key exchange");
        let client_ephemeral = self
            .kex_state
            .complete(req.server_ephemeral_public_key)?;
        Ok(KexResponse {
            client_ephemeral_public_key: client_ephemeral,
        })
    }

    fn sign(&self, req: SignRequest) -> Result<SignResponse, RpcError> {
        debug!("signing handshake transcript");
        let signature = self.kex_state.sign(&self.key, &self.key_wire, req.nonce)?;
        Ok(SignResponse { signature })
    }

    fn notify(&self, announcement: Announcement) -> Result<Empty, RpcError> {
        let Some(api) = self.api.get() else {
            return Err(RpcError::internal("stream not fully wired"));
        };
        let announcement = Arc::new(announcement);
        let callbacks = self.callbacks.lock().expect("callbacks poisoned").clone();
        debug!(count = callbacks.len(), "dispatching announcement");
        for callback in callbacks {
            let context = ControlContext::new(Arc::clone(&announcement), api.clone());
            tokio::spawn(callback(context));
        }
        Ok(Empty {})
    }
}
