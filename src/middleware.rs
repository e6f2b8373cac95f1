//! Middleware chain for inbound requests.
//!
//! Middlewares run for inbound SIGNAL, REQUEST, and STREAMING frames that
//! match no pending response. Each middleware receives the request, a
//! handle to the connection it arrived on, and a [`Next`] continuation;
//! awaiting `next.run(..)` advances the chain, dropping it terminates
//! dispatch.
//!
//! # Example
//!
//! ```ignore
//! use iotwire::{Engine, Method};
//!
//! let engine = Engine::new();
//! engine.use_middleware(|req, conn, next| async move {
//!     if req.method == Method::Request {
//!         let _ = conn.response(req.reply().with_body(b"ok".as_ref())).await;
//!     } else {
//!         next.run(req, conn).await;
//!     }
//! });
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::connection::Connection;
use crate::protocol::Request;

/// Boxed future, the return type of dynamically dispatched hooks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A middleware stage.
///
/// Implemented automatically for async closures of the shape
/// `Fn(Request, Connection, Next) -> impl Future<Output = ()>`.
pub trait Middleware: Send + Sync + 'static {
    /// Handle an inbound request; await `next.run(..)` to continue.
    fn handle(&self, request: Request, conn: Connection, next: Next) -> BoxFuture<'static, ()>;
}

impl<F, Fut> Middleware for F
where
    F: Fn(Request, Connection, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, request: Request, conn: Connection, next: Next) -> BoxFuture<'static, ()> {
        Box::pin(self(request, conn, next))
    }
}

/// Continuation into the rest of the middleware chain.
pub struct Next {
    chain: Arc<Vec<Arc<dyn Middleware>>>,
    index: usize,
}

impl Next {
    pub(crate) fn new(chain: Arc<Vec<Arc<dyn Middleware>>>) -> Self {
        Self { chain, index: 0 }
    }

    /// Run the next middleware, if any.
    pub async fn run(self, request: Request, conn: Connection) {
        if let Some(stage) = self.chain.get(self.index).cloned() {
            let next = Next {
                chain: self.chain,
                index: self.index + 1,
            };
            stage.handle(request, conn, next).await;
        }
    }
}

/// Dispatch a completed inbound request through the chain.
///
/// Spawned so a middleware that itself awaits a peer round trip cannot
/// stall the connection's read loop.
pub(crate) fn dispatch(chain: Arc<Vec<Arc<dyn Middleware>>>, request: Request, conn: Connection) {
    if chain.is_empty() {
        tracing::debug!(method = ?request.method, "no middleware registered, dropping request");
        return;
    }
    tokio::spawn(Next::new(chain).run(request, conn));
}
