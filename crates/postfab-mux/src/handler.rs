//! Handler registry and typed handler adapters.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use prost::Message;

use crate::error::RpcError;

/// A byte-level request handler. Receives the request payload and produces
/// the response payload or a status-coded rejection.
pub type Handler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, RpcError>> + Send + Sync>;

/// Registry mapping a `"Service/Method"` string to its handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Handler>,
}

impl HandlerRegistry {
    pub fn insert(&mut self, method: &'static str, handler: Handler) {
        self.handlers.insert(method, handler);
    }

    pub fn get(&self, method: &str) -> Option<&Handler> {
        self.handlers.get(method)
    }
}

/// Adapt a typed async function into a byte-level [`Handler`].
///
/// Decodes the request payload as `Req`, invokes `f`, and encodes the
/// response. A payload that fails to decode rejects the call with
/// `InvalidArgument` without invoking `f`.
pub fn unary<Req, Resp, F, Fut>(f: F) -> Handler
where
    Req: Message + Default,
    Resp: Message,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |payload: Vec<u8>| {
        let f = Arc::clone(&f);
        Box::pin(async move {
            let req = Req::decode(payload.as_slice())
                .map_err(|e| RpcError::invalid_argument(format!("decode error: {e}")))?;
            let resp = f(req).await?;
            Ok(resp.encode_to_vec())
        })
    })
}
