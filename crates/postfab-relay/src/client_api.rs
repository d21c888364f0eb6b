//! The `ClientAPI` service the relay registers on every client stream,
//! including the mutual authentication handshake it drives against the
//! connecting client before any instruction dispatch is enabled.

use std::sync::{Arc, OnceLock};

use ssh_key::PublicKey;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use postfab_crypto::kex::{generate_nonce, EphemeralKeyPair, Transcript};
use postfab_crypto::keys::parse_authorized_key;
use postfab_mux::{unary, CallHandle, FrameStream, Muxer, RpcError};
use postfab_proto::methods::{
    METHOD_CONNECT, METHOD_RUN_COMMAND, METHOD_RUN_SCRIPT, METHOD_WATCH,
};
use postfab_proto::v1::{
    CommandRequest, CommandResponse, ConnectionRequest, ConnectionResponse, Empty, ErrorCode,
    KexRequest, ScriptRequest, ScriptResponse, SignRequest, WatchRequest,
};

use crate::controller::Controller;
use crate::stubs::{KeyExchangeClient, WatchClient};

struct ReverseClients {
    watch: WatchClient,
    kex: KeyExchangeClient,
}

pub struct ClientApi {
    controller: Arc<Controller>,
    ctx: CancellationToken,
    // Filled in by the stream task between serve() and the ready signal.
    clients: OnceLock<ReverseClients>,
    verified: Mutex<Option<PublicKey>>,
}

impl ClientApi {
    pub fn new(controller: Arc<Controller>, ctx: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            controller,
            ctx,
            clients: OnceLock::new(),
            verified: Mutex::new(None),
        })
    }

    /// Wire the reverse-direction stubs. Must happen before the
    /// multiplexer's ready signal is released.
    pub fn init_clients(&self, handle: CallHandle) {
        let _ = self.clients.set(ReverseClients {
            watch: WatchClient::new(handle.clone()),
            kex: KeyExchangeClient::new(handle),
        });
    }

    pub fn register<S: FrameStream>(self: &Arc<Self>, mux: &mut Muxer<S>) {
        let api = Arc::clone(self);
        mux.register(
            METHOD_CONNECT,
            unary(move |req: ConnectionRequest| {
                let api = Arc::clone(&api);
                async move { api.connect(req).await }
            }),
        );
        let api = Arc::clone(self);
        mux.register(
            METHOD_WATCH,
            unary(move |req: WatchRequest| {
                let api = Arc::clone(&api);
                async move { api.watch(req).await }
            }),
        );
        let api = Arc::clone(self);
        mux.register(
            METHOD_RUN_COMMAND,
            unary(move |req: CommandRequest| {
                let api = Arc::clone(&api);
                async move { api.run_command(req).await }
            }),
        );
        let api = Arc::clone(self);
        mux.register(
            METHOD_RUN_SCRIPT,
            unary(move |req: ScriptRequest| {
                let api = Arc::clone(&api);
                async move { api.run_script(req).await }
            }),
        );
    }

    fn reverse_clients(&self) -> Result<&ReverseClients, RpcError> {
        self.clients
            .get()
            .ok_or_else(|| RpcError::internal("stream not fully wired"))
    }

    async fn connect(&self, req: ConnectionRequest) -> Result<ConnectionResponse, RpcError> {
        // Held across the handshake so concurrent Connect calls on the same
        // stream cannot interleave.
        let mut verified = self.verified.lock().await;
        if verified.is_some() {
            return Err(RpcError::failed_precondition("already connected"));
        }

        let parsed = parse_authorized_key(&req.public_client_key)
            .map_err(|e| RpcError::invalid_argument(e.to_string()))?;

        if let Err(err) = self
            .verify_client_public_key(&parsed.key, &req.public_client_key)
            .await
        {
            warn!(code = ?err.code(), "client verification failed");
            if matches!(
                err.code(),
                ErrorCode::PermissionDenied | ErrorCode::Aborted | ErrorCode::Internal
            ) {
                self.ctx.cancel();
            }
            return Err(err);
        }

        info!("client key verified");
        *verified = Some(parsed.key.clone());
        self.controller
            .client_connected(self.ctx.clone(), parsed.key)
            .await;
        Ok(ConnectionResponse {})
    }

    /// Prove the client controls the private half of the key it declared,
    /// without it ever transmitting the private key or the shared secret.
    async fn verify_client_public_key(
        &self,
        client_key: &PublicKey,
        client_key_wire: &[u8],
    ) -> Result<(), RpcError> {
        let kex = self.reverse_clients()?.kex.clone();

        let server_pair = EphemeralKeyPair::generate();
        let server_public = server_pair.public_bytes().to_vec();

        let resp = kex
            .exchange_keys(&KexRequest {
                server_ephemeral_public_key: server_public.clone(),
            })
            .await
            .map_err(|e| RpcError::aborted(format!("key exchange failed: {e}")))?;

        let client_ephemeral = resp.client_ephemeral_public_key;
        if client_ephemeral.len() != 32 {
            return Err(RpcError::invalid_argument(
                "key exchange failed: client sent invalid ephemeral public key",
            ));
        }

        let shared = server_pair
            .shared_secret(&client_ephemeral)
            .map_err(|_| RpcError::permission_denied("key validation failed"))?;

        let nonce = generate_nonce()
            .map_err(|_| RpcError::internal("internal server error"))?;

        let signed = kex
            .sign(&SignRequest {
                nonce: nonce.to_vec(),
            })
            .await
            .map_err(|e| RpcError::aborted(format!("key exchange failed: {e}")))?;

        // Reconstruct the transcript from the byte sequences this side sent
        // and received, never from re-encoded forms.
        let transcript = Transcript {
            nonce: nonce.to_vec(),
            server_ephemeral: server_public,
            client_ephemeral,
            client_key: client_key_wire.to_vec(),
            shared_secret: shared.to_vec(),
        };
        transcript
            .verify(client_key, &signed.signature)
            .map_err(|_| RpcError::permission_denied("key validation failed"))
    }

    async fn watch(&self, req: WatchRequest) -> Result<Empty, RpcError> {
        let key = self.require_verified().await?;
        let watch_client = self.reverse_clients()?.watch.clone();

        let mut rx = self.controller.watch(&key, req).await?;
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = ctx.cancelled() => break,
                    announcement = rx.recv() => match announcement {
                        Some(announcement) => {
                            if let Err(e) = watch_client.notify(&announcement).await {
                                warn!(error = %e, "notify failed");
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        Ok(Empty {})
    }

    async fn run_command(&self, req: CommandRequest) -> Result<CommandResponse, RpcError> {
        self.require_verified().await?;
        let fingerprint = peer_fingerprint(req.meta.as_ref().map(|m| m.peer_fingerprint.as_str()))?;
        let instructions = self
            .controller
            .lookup(fingerprint)
            .await
            .map_err(|_| RpcError::not_found("peer not found"))?;
        instructions.command(&req).await
    }

    async fn run_script(&self, req: ScriptRequest) -> Result<ScriptResponse, RpcError> {
        self.require_verified().await?;
        let fingerprint = peer_fingerprint(req.meta.as_ref().map(|m| m.peer_fingerprint.as_str()))?;
        let instructions = self
            .controller
            .lookup(fingerprint)
            .await
            .map_err(|_| RpcError::not_found("peer not found"))?;
        instructions.script(&req).await
    }

    async fn require_verified(&self) -> Result<PublicKey, RpcError> {
        self.verified
            .lock()
            .await
            .clone()
            .ok_or_else(|| RpcError::failed_precondition("not connected"))
    }
}

fn peer_fingerprint(meta: Option<&str>) -> Result<&str, RpcError> {
    match meta {
        Some(fingerprint) if !fingerprint.is_empty() => Ok(fingerprint),
        _ => Err(RpcError::invalid_argument("missing peer fingerprint")),
    }
}
