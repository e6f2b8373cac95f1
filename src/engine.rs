//! Protocol engine: configuration, listening, and middleware registration.
//!
//! The [`Engine`] owns the connection registry and the middleware chain.
//! [`Engine::listen`] takes any bidirectional byte stream (TCP, TLS, or an
//! in-memory duplex in tests — transports are the host's concern), splits
//! it, spawns the read loop, and returns the [`Connection`] handle used for
//! the send operations.
//!
//! # Example
//!
//! ```ignore
//! use iotwire::{Engine, Method, Request};
//!
//! let engine = Engine::new();
//! engine.use_middleware(|req, conn, _next| async move {
//!     if req.method == Method::Request {
//!         let _ = conn.response(req.reply().with_body(req.body.clone())).await;
//!     }
//! });
//!
//! let stream = tokio::net::TcpStream::connect("device:5530").await?;
//! let peer = stream.peer_addr()?;
//! let conn = engine.listen(stream, peer);
//! conn.request(Request::new(Method::Request).with_path("/st"), None).await?;
//! ```

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, info, warn};

use crate::connection::keep_alive;
use crate::connection::state::{ConnState, Connection, ConnectionInner};
use crate::connection::ConnectionRegistry;
use crate::middleware::Middleware;
use crate::protocol::{DEFAULT_ALIVE_INTERVAL, DEFAULT_BUFFER_SIZE, DEFAULT_RESPONSE_TIMEOUT};

/// Per-engine configuration, copied into every connection at listen time.
#[derive(Debug, Clone)]
pub struct Config {
    /// Keep-alive probe interval. Zero disables keep-alive.
    pub alive_interval: Duration,
    /// Initial buffer size, until the peer negotiates another.
    pub buffer_size: usize,
    /// Timeout applied to the keep-alive probe's pending response.
    pub response_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alive_interval: DEFAULT_ALIVE_INTERVAL,
            buffer_size: DEFAULT_BUFFER_SIZE,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

/// State shared between the engine handle and its connections.
pub(crate) struct EngineShared {
    pub registry: ConnectionRegistry,
    middlewares: StdMutex<Arc<Vec<Arc<dyn Middleware>>>>,
    pub config: Config,
}

impl EngineShared {
    /// Snapshot of the middleware chain for one dispatch.
    pub fn middleware_chain(&self) -> Arc<Vec<Arc<dyn Middleware>>> {
        self.middlewares.lock().expect("middlewares poisoned").clone()
    }
}

/// The protocol engine.
///
/// Cheap to clone; clones share the registry and middleware chain.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Engine with default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Engine with explicit configuration.
    pub fn with_config(config: Config) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                registry: ConnectionRegistry::new(),
                middlewares: StdMutex::new(Arc::new(Vec::new())),
                config,
            }),
        }
    }

    /// Append a middleware to the chain.
    ///
    /// Middlewares run in registration order for inbound SIGNAL, REQUEST,
    /// and STREAMING frames with no matching pending response.
    pub fn use_middleware<M: Middleware>(&self, middleware: M) {
        let mut chain = self
            .shared
            .middlewares
            .lock()
            .expect("middlewares poisoned");
        let mut next = (**chain).clone();
        next.push(Arc::new(middleware));
        *chain = Arc::new(next);
    }

    /// The registry of live connections.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.shared.registry
    }

    /// Take ownership of a byte stream and run the protocol over it.
    ///
    /// Initializes the per-connection state, registers the connection under
    /// its peer address, spawns the read loop, and schedules the first
    /// keep-alive probe. Must be called within a tokio runtime.
    pub fn listen<S>(&self, stream: S, peer: SocketAddr) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);

        let inner = Arc::new(ConnectionInner {
            peer,
            writer: tokio::sync::Mutex::new(Box::new(write_half)),
            state: StdMutex::new(ConnState::new(self.shared.config.buffer_size)),
            engine: Arc::downgrade(&self.shared),
            config: self.shared.config.clone(),
            closed: AtomicBool::new(false),
        });
        let conn = Connection::from_inner(inner.clone());

        self.shared.registry.register(conn.clone());

        let read_conn = conn.clone();
        let task = tokio::spawn(read_loop(read_half, read_conn));
        inner
            .state
            .lock()
            .expect("state poisoned")
            .read_task = Some(task);

        keep_alive::reset(&inner);
        info!(%peer, "connection listening");
        conn
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Read bytes until the stream ends, feeding the connection's parser.
async fn read_loop<R>(mut reader: R, conn: Connection)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!(peer = %conn.peer(), "stream ended");
                break;
            }
            Ok(n) => conn.handle_data(&buf[..n]).await,
            Err(err) => {
                warn!(peer = %conn.peer(), error = %err, "read failed");
                break;
            }
        }
        if conn.is_closed() {
            break;
        }
    }

    conn.destroy().await;
}
