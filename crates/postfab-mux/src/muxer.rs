//! The frame-level call multiplexer.
//!
//! One `Muxer` is constructed per duplex stream, on each peer. It owns a
//! registry of local handlers and a table of in-flight outbound calls.
//! Requests are dispatched concurrently; responses are matched against the
//! local in-flight table by tag, so the tag spaces of the two peers never
//! need to be coordinated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::{Stream, StreamExt};
use prost::Message;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use postfab_proto::v1::{ErrorCode, Frame, FrameKind, FrameStatus};

use crate::error::RpcError;
use crate::handler::{Handler, HandlerRegistry};

/// The inbound half of a duplex frame stream: a tonic `Streaming<Frame>` on
/// real connections, any channel-backed stream in tests.
pub trait FrameStream:
    Stream<Item = Result<Frame, tonic::Status>> + Send + Unpin + 'static
{
}

impl<T> FrameStream for T where
    T: Stream<Item = Result<Frame, tonic::Status>> + Send + Unpin + 'static
{
}

struct InFlight {
    waiters: HashMap<u64, oneshot::Sender<Result<Vec<u8>, RpcError>>>,
    closed: bool,
}

impl std::fmt::Debug for InFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlight")
            .field("waiters", &self.waiters.len())
            .field("closed", &self.closed)
            .finish()
    }
}

/// Handle for invoking services the peer has registered on its side of the
/// stream. Cheap to clone; all clones share one tag sequence and in-flight
/// table.
#[derive(Clone, Debug)]
pub struct CallHandle {
    next_tag: Arc<AtomicU64>,
    in_flight: Arc<Mutex<InFlight>>,
    outbound: mpsc::Sender<Frame>,
}

impl CallHandle {
    /// Invoke a peer method with a raw payload, waiting for the correlated
    /// response. Exactly one of a response or a stream-termination error is
    /// observed per call.
    pub async fn call(&self, method: &str, payload: Vec<u8>) -> Result<Vec<u8>, RpcError> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut in_flight = self.in_flight.lock().expect("in-flight table poisoned");
            if in_flight.closed {
                return Err(RpcError::stream_terminated());
            }
            in_flight.waiters.insert(tag, tx);
        }

        let frame = Frame {
            tag,
            kind: FrameKind::Request as i32,
            method: method.to_owned(),
            payload,
            status: None,
        };
        if self.outbound.send(frame).await.is_err() {
            self.in_flight
                .lock()
                .expect("in-flight table poisoned")
                .waiters
                .remove(&tag);
            return Err(RpcError::stream_terminated());
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::stream_terminated()),
        }
    }

    /// Invoke a peer method with typed request and response messages.
    pub async fn call_unary<Req, Resp>(&self, method: &str, req: &Req) -> Result<Resp, RpcError>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let payload = self.call(method, req.encode_to_vec()).await?;
        Resp::decode(payload.as_slice())
            .map_err(|e| RpcError::internal(format!("decode error: {e}")))
    }
}

/// One side of a bidirectional call fabric over a duplex frame stream.
pub struct Muxer<S> {
    inbound: S,
    outbound: mpsc::Sender<Frame>,
    registry: HandlerRegistry,
}

impl<S: FrameStream> Muxer<S> {
    pub fn new(inbound: S, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            inbound,
            outbound,
            registry: HandlerRegistry::default(),
        }
    }

    /// Register a handler for a `"Service/Method"` string. All registration
    /// must happen before [`Muxer::serve`].
    pub fn register(&mut self, method: &'static str, handler: Handler) {
        self.registry.insert(method, handler);
    }

    /// Start driving the stream.
    ///
    /// No frame is processed until `ready` resolves, which gives the owner a
    /// window to wire reverse-direction stubs from the returned handle before
    /// any traffic flows. The second return value fires exactly once, with
    /// the reason the stream ended.
    pub fn serve(
        self,
        ready: oneshot::Receiver<()>,
    ) -> (CallHandle, oneshot::Receiver<RpcError>) {
        let in_flight = Arc::new(Mutex::new(InFlight {
            waiters: HashMap::new(),
            closed: false,
        }));
        let handle = CallHandle {
            next_tag: Arc::new(AtomicU64::new(1)),
            in_flight: Arc::clone(&in_flight),
            outbound: self.outbound.clone(),
        };
        let (err_tx, err_rx) = oneshot::channel();

        tokio::spawn(drive(
            self.inbound,
            self.outbound,
            self.registry,
            in_flight,
            ready,
            err_tx,
        ));

        (handle, err_rx)
    }
}

async fn drive<S>(
    mut inbound: S,
    outbound: mpsc::Sender<Frame>,
    registry: HandlerRegistry,
    in_flight: Arc<Mutex<InFlight>>,
    ready: oneshot::Receiver<()>,
    err_tx: oneshot::Sender<RpcError>,
) where
    S: FrameStream,
{
    let cancel = CancellationToken::new();

    let reason = if ready.await.is_err() {
        RpcError::aborted("stream abandoned before ready")
    } else {
        recv_loop(&mut inbound, &outbound, &registry, &in_flight, &cancel).await
    };

    // Stream is over: stop handler tasks, then fail every in-flight call.
    cancel.cancel();
    let waiters = {
        let mut in_flight = in_flight.lock().expect("in-flight table poisoned");
        in_flight.closed = true;
        std::mem::take(&mut in_flight.waiters)
    };
    for (_, waiter) in waiters {
        let _ = waiter.send(Err(RpcError::stream_terminated()));
    }
    let _ = err_tx.send(reason);
}

async fn recv_loop<S>(
    inbound: &mut S,
    outbound: &mpsc::Sender<Frame>,
    registry: &HandlerRegistry,
    in_flight: &Arc<Mutex<InFlight>>,
    cancel: &CancellationToken,
) -> RpcError
where
    S: FrameStream,
{
    loop {
        match inbound.next().await {
            Some(Ok(frame)) => match FrameKind::try_from(frame.kind) {
                Ok(FrameKind::Request) => {
                    dispatch_request(frame, outbound, registry, cancel).await;
                }
                Ok(FrameKind::Response) => {
                    complete_call(frame, in_flight);
                }
                _ => {
                    warn!(tag = frame.tag, kind = frame.kind, "malformed frame kind");
                    return RpcError::internal("malformed frame");
                }
            },
            Some(Err(status)) => {
                return RpcError::unavailable(format!("stream error: {status}"));
            }
            None => {
                return RpcError::stream_terminated();
            }
        }
    }
}

async fn dispatch_request(
    frame: Frame,
    outbound: &mpsc::Sender<Frame>,
    registry: &HandlerRegistry,
    cancel: &CancellationToken,
) {
    let Frame {
        tag,
        method,
        payload,
        ..
    } = frame;

    let Some(handler) = registry.get(&method) else {
        debug!(%method, tag, "no handler registered");
        let frame = response_frame(
            tag,
            method.clone(),
            Err(RpcError::unimplemented(format!("unknown method {method}"))),
        );
        let _ = outbound.send(frame).await;
        return;
    };

    let fut = handler(payload);
    let outbound = outbound.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let result = tokio::select! {
            () = cancel.cancelled() => return,
            result = fut => result,
        };
        let _ = outbound.send(response_frame(tag, method, result)).await;
    });
}

fn complete_call(frame: Frame, in_flight: &Arc<Mutex<InFlight>>) {
    let waiter = in_flight
        .lock()
        .expect("in-flight table poisoned")
        .waiters
        .remove(&frame.tag);
    let Some(waiter) = waiter else {
        // Not ours; responses are only matched against the local table.
        debug!(tag = frame.tag, "response for unknown tag");
        return;
    };
    let result = match frame.status {
        Some(status) if status.code != ErrorCode::Ok as i32 => Err(RpcError::from(status)),
        _ => Ok(frame.payload),
    };
    let _ = waiter.send(result);
}

fn response_frame(tag: u64, method: String, result: Result<Vec<u8>, RpcError>) -> Frame {
    match result {
        Ok(payload) => Frame {
            tag,
            kind: FrameKind::Response as i32,
            method,
            payload,
            status: Some(FrameStatus {
                code: ErrorCode::Ok as i32,
                message: String::new(),
            }),
        },
        Err(err) => Frame {
            tag,
            kind: FrameKind::Response as i32,
            method,
            payload: Vec::new(),
            status: Some(err.into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::unary;
    use postfab_proto::methods::METHOD_SIGN;
    use postfab_proto::v1::{SignRequest, SignResponse};
    use std::time::Duration;
    use tokio_stream::wrappers::ReceiverStream;

    /// Two muxers wired back-to-back through in-memory channels, standing in
    /// for the two ends of one duplex stream.
    fn muxer_pair() -> (Muxer<impl FrameStream>, Muxer<impl FrameStream>) {
        let (left_tx, left_rx) = mpsc::channel::<Frame>(64);
        let (right_tx, right_rx) = mpsc::channel::<Frame>(64);
        (
            Muxer::new(ReceiverStream::new(right_rx).map(Ok), left_tx),
            Muxer::new(ReceiverStream::new(left_rx).map(Ok), right_tx),
        )
    }

    fn serve_now<S: FrameStream>(mux: Muxer<S>) -> (CallHandle, oneshot::Receiver<RpcError>) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let out = mux.serve(ready_rx);
        ready_tx.send(()).unwrap();
        out
    }

    fn echo_handler() -> Handler {
        unary(|req: SignRequest| async move {
            Ok(SignResponse {
                signature: req.nonce,
            })
        })
    }

    #[tokio::test]
    async fn call_round_trip() {
        let (mut server, client) = muxer_pair();
        server.register(METHOD_SIGN, echo_handler());
        let _server = serve_now(server);
        let (handle, _err) = serve_now(client);

        let resp: SignResponse = handle
            .call_unary(
                METHOD_SIGN,
                &SignRequest {
                    nonce: vec![7, 8, 9],
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.signature, vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn concurrent_calls_correlate_by_tag() {
        let (mut server, client) = muxer_pair();
        // Slow down the first request so its response arrives after the
        // second one; correlation must still hold.
        server.register(
            METHOD_SIGN,
            unary(|req: SignRequest| async move {
                if req.nonce == [1] {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Ok(SignResponse {
                    signature: req.nonce,
                })
            }),
        );
        let _server = serve_now(server);
        let (handle, _err) = serve_now(client);

        let slow = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .call_unary::<_, SignResponse>(METHOD_SIGN, &SignRequest { nonce: vec![1] })
                    .await
            })
        };
        let fast = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .call_unary::<_, SignResponse>(METHOD_SIGN, &SignRequest { nonce: vec![2] })
                    .await
            })
        };

        assert_eq!(slow.await.unwrap().unwrap().signature, vec![1]);
        assert_eq!(fast.await.unwrap().unwrap().signature, vec![2]);
    }

    #[tokio::test]
    async fn both_sides_can_initiate_calls() {
        let (mut left, mut right) = muxer_pair();
        left.register(METHOD_SIGN, echo_handler());
        right.register(METHOD_SIGN, echo_handler());
        let (left_handle, _left_err) = serve_now(left);
        let (right_handle, _right_err) = serve_now(right);

        let from_left: SignResponse = left_handle
            .call_unary(METHOD_SIGN, &SignRequest { nonce: vec![1] })
            .await
            .unwrap();
        let from_right: SignResponse = right_handle
            .call_unary(METHOD_SIGN, &SignRequest { nonce: vec![2] })
            .await
            .unwrap();
        assert_eq!(from_left.signature, vec![1]);
        assert_eq!(from_right.signature, vec![2]);
    }

    #[tokio::test]
    async fn unknown_method_is_unimplemented() {
        let (server, client) = muxer_pair();
        let _server = serve_now(server);
        let (handle, _err) = serve_now(client);

        let err = handle
            .call_unary::<_, SignResponse>("Nope/Missing", &SignRequest { nonce: vec![] })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unimplemented);
    }

    #[tokio::test]
    async fn handler_error_propagates_code_and_message() {
        let (mut server, client) = muxer_pair();
        server.register(
            METHOD_SIGN,
            unary(|_req: SignRequest| async move {
                Err::<SignResponse, _>(RpcError::permission_denied("key validation failed"))
            }),
        );
        let _server = serve_now(server);
        let (handle, _err) = serve_now(client);

        let err = handle
            .call_unary::<_, SignResponse>(METHOD_SIGN, &SignRequest { nonce: vec![] })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PermissionDenied);
        assert_eq!(err.message(), "key validation failed");
    }

    #[tokio::test]
    async fn stream_end_fails_in_flight_calls() {
        // A peer that accepts frames but never answers, so the call stays
        // in flight until we cut the inbound side.
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(64);
        let (in_tx, in_rx) = mpsc::channel::<Frame>(64);
        let (handle, mut err_rx) =
            serve_now(Muxer::new(ReceiverStream::new(in_rx).map(Ok), out_tx));

        let pending_call = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .call_unary::<_, SignResponse>(METHOD_SIGN, &SignRequest { nonce: vec![] })
                    .await
            })
        };
        // The request frame reaches the peer, which never responds.
        let sent = out_rx.recv().await.unwrap();
        assert_eq!(sent.kind, FrameKind::Request as i32);
        assert!(!pending_call.is_finished());

        // Cut the stream; the in-flight call observes termination.
        drop(in_tx);
        let err = pending_call.await.unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);

        let reason = (&mut err_rx).await.unwrap();
        assert_eq!(reason.code(), ErrorCode::Unavailable);

        // Calls after termination fail immediately.
        let err = handle.call(METHOD_SIGN, vec![]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn no_dispatch_before_ready() {
        let (mut server, client) = muxer_pair();
        server.register(METHOD_SIGN, echo_handler());
        let (ready_tx, ready_rx) = oneshot::channel();
        let _server = server.serve(ready_rx);
        let (handle, _err) = serve_now(client);

        let call = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .call_unary::<_, SignResponse>(METHOD_SIGN, &SignRequest { nonce: vec![5] })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!call.is_finished());

        ready_tx.send(()).unwrap();
        assert_eq!(call.await.unwrap().unwrap().signature, vec![5]);
    }
}
