//! Registry of active agents, clients and watches.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ssh_key::PublicKey;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use postfab_crypto::fingerprint_sha256;
use postfab_mux::RpcError;
use postfab_proto::v1::{Announcement, WatchRequest};

use crate::stubs::InstructionClient;

/// Capacity of each watch notification channel.
const WATCH_BUFFER: usize = 256;

struct ActiveAgent {
    announcement: Arc<Announcement>,
    instructions: InstructionClient,
    /// Guards teardown against a later registration under the same
    /// fingerprint: only the entry's own teardown may remove it.
    generation: u64,
}

struct ActiveWatch {
    tx: mpsc::Sender<Arc<Announcement>>,
    request: WatchRequest,
}

#[derive(Default)]
struct State {
    agents: HashMap<String, ActiveAgent>,
    clients: HashMap<String, PublicKey>,
    watches: HashMap<String, ActiveWatch>,
    generation: u64,
}

/// The relay's single piece of shared mutable state.
///
/// One mutex guards all three maps; every operation holds it for its entire
/// duration, including channel sends during fan-out. That is viable because
/// each watch channel is buffered and its forwarder is expected to drain it.
#[derive(Default)]
pub struct Controller {
    state: Arc<Mutex<State>>,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enroll an agent under its announcement fingerprint and notify every
    /// watch whose owning key the announcement authorizes and whose filter
    /// matches. The entry is removed when `ctx` is cancelled.
    pub async fn agent_connected(
        &self,
        ctx: CancellationToken,
        announcement: Announcement,
        instructions: InstructionClient,
    ) -> Result<(), RpcError> {
        let fingerprint = announcement
            .fingerprint()
            .map_err(|e| RpcError::invalid_argument(e.to_string()))?;
        let announcement = Arc::new(announcement);
        info!(fingerprint = %fingerprint, "agent connected");

        let mut state = self.state.lock().await;
        state.generation += 1;
        let generation = state.generation;
        state.agents.insert(
            fingerprint.clone(),
            ActiveAgent {
                announcement: Arc::clone(&announcement),
                instructions,
                generation,
            },
        );

        let mut notified = HashSet::new();
        for authorized_key in &announcement.authorized_keys {
            if !notified.insert(authorized_key.fingerprint.as_str()) {
                continue;
            }
            if let Some(watch) = state.watches.get(&authorized_key.fingerprint) {
                if filter_accepts(&announcement, &watch.request) {
                    debug!(watcher = %authorized_key.fingerprint, "notifying watch");
                    let _ = watch.tx.send(Arc::clone(&announcement)).await;
                } else {
                    debug!(watcher = %authorized_key.fingerprint, "filtered out");
                }
            }
        }
        drop(state);

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            ctx.cancelled().await;
            let mut state = state.lock().await;
            if state
                .agents
                .get(&fingerprint)
                .is_some_and(|a| a.generation == generation)
            {
                debug!(fingerprint = %fingerprint, "agent removed");
                state.agents.remove(&fingerprint);
            }
        });
        Ok(())
    }

    /// Enroll a verified client key. The client entry and any watch it owns
    /// are removed when `ctx` is cancelled.
    pub async fn client_connected(&self, ctx: CancellationToken, client_key: PublicKey) {
        let fingerprint = fingerprint_sha256(&client_key);
        info!(fingerprint = %fingerprint, "client connected");
        self.state
            .lock()
            .await
            .clients
            .insert(fingerprint.clone(), client_key);

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            ctx.cancelled().await;
            let mut state = state.lock().await;
            state.watches.remove(&fingerprint);
            state.clients.remove(&fingerprint);
            debug!(fingerprint = %fingerprint, "client removed");
        });
    }

    /// Create the client's watch and synchronously replay every already
    /// enrolled agent whose announcement the filter accepts, so a caller
    /// observing success cannot have missed an earlier enrolment.
    pub async fn watch(
        &self,
        client_key: &PublicKey,
        request: WatchRequest,
    ) -> Result<mpsc::Receiver<Arc<Announcement>>, RpcError> {
        let fingerprint = fingerprint_sha256(client_key);
        info!(fingerprint = %fingerprint, "watch requested");

        let mut state = self.state.lock().await;
        if !state.clients.contains_key(&fingerprint) {
            return Err(RpcError::permission_denied("key is not authorized"));
        }
        if state.watches.contains_key(&fingerprint) {
            return Err(RpcError::already_exists("already watching"));
        }

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        // Late join: enqueue existing agents now; everything afterwards
        // arrives through agent_connected.
        for agent in state.agents.values() {
            if filter_accepts(&agent.announcement, &request) {
                debug!(fingerprint = %fingerprint, "replaying enrolled agent");
                let _ = tx.send(Arc::clone(&agent.announcement)).await;
            }
        }
        state.watches.insert(fingerprint, ActiveWatch { tx, request });
        Ok(rx)
    }

    /// Resolve an enrolled agent's instruction stub by fingerprint.
    pub async fn lookup(&self, fingerprint: &str) -> Result<InstructionClient, RpcError> {
        self.state
            .lock()
            .await
            .agents
            .get(fingerprint)
            .map(|a| a.instructions.clone())
            .ok_or_else(|| RpcError::not_found("not found"))
    }

    pub async fn agent_count(&self) -> usize {
        self.state.lock().await.agents.len()
    }

    pub async fn client_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    pub async fn watch_count(&self) -> usize {
        self.state.lock().await.watches.len()
    }
}

/// Both the live fan-out path and the late-join replay decide matches here.
fn filter_accepts(announcement: &Announcement, request: &WatchRequest) -> bool {
    match &request.filter {
        Some(filter) => announcement.filter_accepts(filter),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postfab_mux::{unary, Muxer};
    use postfab_proto::v1::{
        AuthorizedKey, BasicFilter, CommandRequest, CommandResponse, Frame, Operator,
    };
    use rand::rngs::OsRng;
    use ssh_key::{Algorithm, HashAlg, PrivateKey};
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio_stream::wrappers::ReceiverStream;
    use tokio_stream::StreamExt;

    fn client_key() -> PublicKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    /// An instruction stub backed by an in-memory peer that echoes command
    /// arguments to stdout, one space-separated line.
    fn echo_instruction_client() -> InstructionClient {
        let (caller_tx, caller_rx) = mpsc::channel::<Frame>(64);
        let (agent_tx, agent_rx) = mpsc::channel::<Frame>(64);

        let caller = Muxer::new(ReceiverStream::new(agent_rx).map(Ok), caller_tx);
        let mut agent = Muxer::new(ReceiverStream::new(caller_rx).map(Ok), agent_tx);
        agent.register(
            postfab_proto::methods::METHOD_COMMAND,
            unary(|req: CommandRequest| async move {
                let command = req.command.unwrap_or_default();
                Ok(CommandResponse {
                    stdout: format!("{}\n", command.args.join(" ")),
                    stderr: String::new(),
                    exit_code: 0,
                })
            }),
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        let _ = agent.serve(ready_rx);
        ready_tx.send(()).unwrap();

        let (ready_tx, ready_rx) = oneshot::channel();
        let (handle, _err) = caller.serve(ready_rx);
        ready_tx.send(()).unwrap();
        InstructionClient::new(handle)
    }

    fn announcement_for(key: &PublicKey) -> Announcement {
        let host_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        Announcement {
            uname: None,
            network: None,
            preferred_host_public_key: host_key.public_key().to_openssh().unwrap().into_bytes(),
            authorized_keys: vec![AuthorizedKey {
                user: "user".into(),
                key_type: "ssh-ed25519".into(),
                fingerprint: key.fingerprint(HashAlg::Sha256).to_string(),
                comment: String::new(),
                options: Vec::new(),
            }],
        }
    }

    fn watch_for(key: &PublicKey) -> WatchRequest {
        WatchRequest {
            filter: Some(BasicFilter {
                operator: Operator::Or as i32,
                has_authorized_key: Some(key.fingerprint(HashAlg::Sha256).to_string()),
                has_ip_address: None,
                has_hostname: None,
            }),
        }
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn new_controller_is_empty() {
        let c = Controller::new();
        assert_eq!(c.agent_count().await, 0);
        assert_eq!(c.client_count().await, 0);
        assert_eq!(c.watch_count().await, 0);
    }

    #[tokio::test]
    async fn client_connect_and_teardown() {
        let c = Controller::new();
        let key = client_key();
        let ctx = CancellationToken::new();

        c.client_connected(ctx.clone(), key.clone()).await;
        assert_eq!(c.client_count().await, 1);
        c.watch(&key, watch_for(&key)).await.unwrap();
        assert_eq!(c.watch_count().await, 1);

        ctx.cancel();
        eventually(|| async { c.client_count().await == 0 && c.watch_count().await == 0 }).await;
    }

    #[tokio::test]
    async fn matching_agent_notifies_watch_exactly_once() {
        let c = Controller::new();
        let key = client_key();
        let client_ctx = CancellationToken::new();
        c.client_connected(client_ctx.clone(), key.clone()).await;
        let mut rx = c.watch(&key, watch_for(&key)).await.unwrap();

        let agent_ctx = CancellationToken::new();
        let announcement = announcement_for(&key);
        let expected_fp = announcement.fingerprint().unwrap();
        c.agent_connected(agent_ctx, announcement, echo_instruction_client())
            .await
            .unwrap();

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.fingerprint().unwrap(), expected_fp);

        // Exactly once: nothing else is pending.
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn delivered_handle_reaches_the_agent() {
        let c = Controller::new();
        let key = client_key();
        c.client_connected(CancellationToken::new(), key.clone())
            .await;
        let mut rx = c.watch(&key, watch_for(&key)).await.unwrap();

        let announcement = announcement_for(&key);
        c.agent_connected(
            CancellationToken::new(),
            announcement,
            echo_instruction_client(),
        )
        .await
        .unwrap();

        let delivered = rx.recv().await.unwrap();
        let instructions = c.lookup(&delivered.fingerprint().unwrap()).await.unwrap();
        let response = instructions
            .command(&CommandRequest {
                meta: None,
                command: Some(postfab_proto::v1::Command {
                    command: "echo".into(),
                    args: vec!["hello".into(), "world".into()],
                    env: Vec::new(),
                }),
            })
            .await
            .unwrap();
        assert_eq!(response.stdout, "hello world\n");
        assert_eq!(response.exit_code, 0);
    }

    #[tokio::test]
    async fn watch_requires_registered_client() {
        let c = Controller::new();
        let key = client_key();
        let err = c.watch(&key, watch_for(&key)).await.unwrap_err();
        assert_eq!(
            err.code(),
            postfab_proto::v1::ErrorCode::PermissionDenied
        );
    }

    #[tokio::test]
    async fn second_watch_is_rejected_and_first_keeps_working() {
        let c = Controller::new();
        let key = client_key();
        c.client_connected(CancellationToken::new(), key.clone())
            .await;
        let mut rx = c.watch(&key, watch_for(&key)).await.unwrap();

        let err = c.watch(&key, watch_for(&key)).await.unwrap_err();
        assert_eq!(err.code(), postfab_proto::v1::ErrorCode::AlreadyExists);

        c.agent_connected(
            CancellationToken::new(),
            announcement_for(&key),
            echo_instruction_client(),
        )
        .await
        .unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn late_join_replays_existing_agents() {
        let c = Controller::new();
        let key = client_key();

        let announcement = announcement_for(&key);
        let expected_fp = announcement.fingerprint().unwrap();
        c.agent_connected(
            CancellationToken::new(),
            announcement,
            echo_instruction_client(),
        )
        .await
        .unwrap();

        c.client_connected(CancellationToken::new(), key.clone())
            .await;
        let mut rx = c.watch(&key, watch_for(&key)).await.unwrap();
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.fingerprint().unwrap(), expected_fp);
    }

    #[tokio::test]
    async fn mismatched_filter_is_not_notified() {
        let c = Controller::new();
        let key = client_key();
        let other = client_key();
        c.client_connected(CancellationToken::new(), key.clone())
            .await;
        // Watch for a fingerprint the announcement does not authorize.
        let mut rx = c.watch(&key, watch_for(&other)).await.unwrap();

        c.agent_connected(
            CancellationToken::new(),
            announcement_for(&key),
            echo_instruction_client(),
        )
        .await
        .unwrap();

        assert!(
            tokio::time::timeout(Duration::from_millis(200), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn agent_teardown_restores_registry_state() {
        let c = Controller::new();
        let key = client_key();
        let ctx = CancellationToken::new();
        let announcement = announcement_for(&key);
        let fp = announcement.fingerprint().unwrap();

        c.agent_connected(ctx.clone(), announcement, echo_instruction_client())
            .await
            .unwrap();
        assert!(c.lookup(&fp).await.is_ok());

        ctx.cancel();
        eventually(|| async { c.agent_count().await == 0 }).await;
        let err = c.lookup(&fp).await.unwrap_err();
        assert_eq!(err.code(), postfab_proto::v1::ErrorCode::NotFound);

        // Cancelling again is a no-op on registry state.
        ctx.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(c.agent_count().await, 0);
    }

    #[tokio::test]
    async fn displaced_agent_teardown_keeps_replacement() {
        let c = Controller::new();
        let key = client_key();
        let announcement = announcement_for(&key);
        let fp = announcement.fingerprint().unwrap();

        let first_ctx = CancellationToken::new();
        c.agent_connected(
            first_ctx.clone(),
            announcement.clone(),
            echo_instruction_client(),
        )
        .await
        .unwrap();

        // Same fingerprint registers again; last write wins.
        c.agent_connected(
            CancellationToken::new(),
            announcement,
            echo_instruction_client(),
        )
        .await
        .unwrap();

        first_ctx.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(c.lookup(&fp).await.is_ok());
        assert_eq!(c.agent_count().await, 1);
    }

    #[tokio::test]
    async fn rejects_announcement_with_bad_host_key() {
        let c = Controller::new();
        let mut announcement = announcement_for(&client_key());
        announcement.preferred_host_public_key = b"garbage".to_vec();
        let err = c
            .agent_connected(
                CancellationToken::new(),
                announcement,
                echo_instruction_client(),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err.code(),
            postfab_proto::v1::ErrorCode::InvalidArgument
        );
        assert_eq!(c.agent_count().await, 0);
    }
}
