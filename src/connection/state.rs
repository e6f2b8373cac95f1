//! Per-connection protocol state and the inbound engine.
//!
//! One [`Connection`] exists per accepted byte stream. It owns the
//! in-flight table, the multipart reassembly table, the remainder buffer,
//! the negotiated buffer size, the keep-alive handle, and the write half of
//! the stream behind an async mutex. All parse state is mutated from the
//! connection's read loop; timers take the state lock briefly and never
//! hold it across an await.
//!
//! Inbound routing: ALIVE_REQUEST is answered inline and never reaches
//! middleware; ALIVE_RESPONSE and BUFFER_SIZE_RESPONSE resolve their
//! positional pending slots; RESPONSE resolves the ID-keyed table;
//! complete SIGNAL/REQUEST/STREAMING frames with no matching pending entry
//! go to the middleware chain. Unexpected responses are dropped silently.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{Config, EngineShared};
use crate::error::{IotError, Result};
use crate::middleware::{self, BoxFuture};
use crate::protocol::codec::{self, Parse};
use crate::protocol::{effective_buffer_size, Method, Request, MULTIPART_TIMEOUT};
use crate::writer::{self, BoxedWriter};

use super::keep_alive;
use super::pending::{PendingEntry, PendingTable, ResponseDescriptor};
use super::reassembly::{ReassemblyEntry, ReassemblyTable};

/// Hook invoked once when the connection is destroyed.
pub type DisconnectHook = Box<dyn FnOnce(Connection) -> BoxFuture<'static, ()> + Send>;

/// Handle to a live connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    pub peer: SocketAddr,
    pub writer: Mutex<BoxedWriter>,
    pub state: StdMutex<ConnState>,
    pub engine: Weak<EngineShared>,
    pub config: Config,
    pub closed: AtomicBool,
}

/// Parse position within the inbound stream.
#[derive(Clone, Copy)]
pub(crate) enum ReadState {
    /// Expecting a frame prefix.
    Head,
    /// Consuming body bytes of the current fragment for `key`.
    Body { key: u16, fragment_remaining: usize },
}

pub(crate) struct ConnState {
    pub buffer_size: usize,
    pub remainder: BytesMut,
    pub read_state: ReadState,
    pub pending: PendingTable,
    pub reassembly: ReassemblyTable,
    /// Positional slot for the single in-flight ALIVE_REQUEST.
    pub alive_slot: Option<PendingEntry>,
    /// Positional FIFO for in-flight BUFFER_SIZE_REQUESTs.
    pub buffer_size_slot: VecDeque<PendingEntry>,
    pub alive_timer: Option<JoinHandle<()>>,
    pub read_task: Option<JoinHandle<()>>,
    pub on_disconnect: Option<DisconnectHook>,
    next_token: u64,
}

impl ConnState {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            remainder: BytesMut::new(),
            read_state: ReadState::Head,
            pending: PendingTable::default(),
            reassembly: ReassemblyTable::default(),
            alive_slot: None,
            buffer_size_slot: VecDeque::new(),
            alive_timer: None,
            read_task: None,
            on_disconnect: None,
            next_token: 0,
        }
    }

    pub fn take_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }
}

/// Which pending store an entry lives in.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PendingSlot {
    Table(u16),
    Alive,
    BufferSize,
}

impl Connection {
    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    /// Peer address of this connection.
    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Currently negotiated buffer size.
    pub fn buffer_size(&self) -> usize {
        self.inner.state.lock().expect("state poisoned").buffer_size
    }

    /// Whether the connection has been destroyed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Install a hook run once when the connection is destroyed.
    pub fn on_disconnect<F, Fut>(&self, hook: F)
    where
        F: FnOnce(Connection) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut state = self.inner.state.lock().expect("state poisoned");
        state.on_disconnect = Some(Box::new(move |conn| Box::pin(hook(conn))));
    }

    /// Send a one-shot SIGNAL. No response is expected.
    pub async fn signal(&self, request: Request) -> Result<Request> {
        self.send(request, Method::Signal, None).await
    }

    /// Send a REQUEST, optionally parking a response descriptor.
    pub async fn request(
        &self,
        request: Request,
        descriptor: Option<ResponseDescriptor>,
    ) -> Result<Request> {
        self.send(request, Method::Request, descriptor).await
    }

    /// Send a RESPONSE. The ID must be copied from the inbound request,
    /// most conveniently via [`Request::reply`].
    pub async fn response(&self, request: Request) -> Result<Request> {
        self.send(request, Method::Response, None).await
    }

    /// Send a STREAMING request (body up to ~4 GiB).
    pub async fn streaming(
        &self,
        request: Request,
        descriptor: Option<ResponseDescriptor>,
    ) -> Result<Request> {
        self.send(request, Method::Streaming, descriptor).await
    }

    /// Send the two-byte ALIVE_REQUEST probe.
    pub async fn alive_request(&self, descriptor: Option<ResponseDescriptor>) -> Result<Request> {
        self.send(Request::new(Method::AliveRequest), Method::AliveRequest, descriptor)
            .await
    }

    /// Send the two-byte ALIVE_RESPONSE.
    pub async fn alive_response(&self) -> Result<Request> {
        self.send(Request::new(Method::AliveResponse), Method::AliveResponse, None)
            .await
    }

    /// Negotiate the peer's buffer size. Zero restores the default.
    ///
    /// This connection's own outbound fragmentation switches to the new
    /// size only once the echoing response arrives, after the caller's
    /// `on_response` hook has run.
    pub async fn buffer_size_request(
        &self,
        size: u32,
        descriptor: Option<ResponseDescriptor>,
    ) -> Result<Request> {
        let user = descriptor.unwrap_or_default();
        let timeout = user.timeout;
        let mut user_response = user.on_response;
        let weak = Arc::downgrade(&self.inner);

        let mut composed = ResponseDescriptor::new().timeout(timeout);
        composed.on_timeout = user.on_timeout;
        composed.on_response = Some(Box::new(move |request: Request| {
            let weak = weak.clone();
            let user_fut = user_response.as_mut().map(|hook| hook(request.clone()));
            Box::pin(async move {
                if let Some(fut) = user_fut {
                    fut.await;
                }
                let Some(inner) = weak.upgrade() else { return };
                match <[u8; 4]>::try_from(&request.body[..]) {
                    Ok(raw) => {
                        let size = effective_buffer_size(u32::from_be_bytes(raw));
                        inner.state.lock().expect("state poisoned").buffer_size = size;
                        debug!(peer = %inner.peer, size, "buffer size updated from response");
                    }
                    Err(_) => warn!(peer = %inner.peer, "buffer-size response body malformed"),
                }
            })
        }));

        let request =
            Request::new(Method::BufferSizeRequest).with_body(size.to_be_bytes().to_vec());
        self.send(request, Method::BufferSizeRequest, Some(composed))
            .await
    }

    /// Echo a BUFFER_SIZE_REQUEST's body back to the peer.
    pub async fn buffer_size_response(&self, request: &Request) -> Result<Request> {
        let echo = Request::new(Method::BufferSizeResponse).with_body(request.body.clone());
        self.send(echo, Method::BufferSizeResponse, None).await
    }

    /// Destroy the connection: cancel every timer, shut the stream down,
    /// drop the registry entry, and run the disconnect hook. Idempotent.
    pub async fn destroy(&self) {
        destroy(&self.inner).await;
    }

    /// Common send path: set the method, allocate an ID when needed, park
    /// the pending entry, encode, and write under the write mutex.
    async fn send(
        &self,
        mut request: Request,
        method: Method,
        descriptor: Option<ResponseDescriptor>,
    ) -> Result<Request> {
        if self.is_closed() {
            return Err(IotError::ConnectionClosed);
        }

        request.method = method;
        request.peer = Some(self.inner.peer);
        if method.is_bare() {
            request.id = None;
            request.path = None;
            request.headers.clear();
            if matches!(method, Method::AliveRequest | Method::AliveResponse) {
                request.body = Bytes::new();
            }
        }

        let mut armed: Option<(PendingSlot, u64)> = None;
        let buffer_size = {
            let mut state = self.inner.state.lock().expect("state poisoned");
            if method.allocates_id() && request.id.is_none() {
                request.id = Some(state.pending.allocate_id());
            }
            if let Some(descriptor) = descriptor {
                let slot = match method {
                    Method::Request | Method::Streaming => {
                        // allocates_id guarantees the ID is set by now
                        match request.id {
                            Some(id) => PendingSlot::Table(id),
                            None => return Err(IotError::Protocol("missing request id".into())),
                        }
                    }
                    Method::AliveRequest => PendingSlot::Alive,
                    Method::BufferSizeRequest => PendingSlot::BufferSize,
                    _ => {
                        return Err(IotError::Protocol(format!(
                            "{method:?} cannot take a response descriptor"
                        )))
                    }
                };
                let token = state.take_token();
                let timeout = descriptor.timeout;
                let mut entry = PendingEntry::new(token, descriptor, request.clone());
                entry.timer = Some(arm_pending_timer(&self.inner, slot, token, timeout));
                match slot {
                    PendingSlot::Table(id) => state.pending.insert(id, entry),
                    PendingSlot::Alive => state.alive_slot = Some(entry),
                    PendingSlot::BufferSize => state.buffer_size_slot.push_back(entry),
                }
                armed = Some((slot, token));
            }
            state.buffer_size
        };

        let encoded = match codec::encode(&request, buffer_size) {
            Ok(frame) => frame,
            Err(err) => {
                rollback_pending(&self.inner, armed);
                return Err(err);
            }
        };

        match writer::write_frame(&self.inner.writer, &encoded, buffer_size).await {
            Ok(parts) => {
                request.parts = parts;
                request.body_length = request.body.len();
                request.total_body_length = request.body.len() as u64;
                keep_alive::reset(&self.inner);
                Ok(request)
            }
            Err(err) => {
                rollback_pending(&self.inner, armed);
                Err(err)
            }
        }
    }

    /// Feed inbound bytes through the parser. Called from the read loop.
    pub(crate) async fn handle_data(&self, data: &[u8]) {
        handle_data(&self.inner, data).await;
    }
}

/// Remove a pending entry parked by a send whose write failed.
fn rollback_pending(inner: &Arc<ConnectionInner>, armed: Option<(PendingSlot, u64)>) {
    let Some((slot, token)) = armed else { return };
    let mut state = inner.state.lock().expect("state poisoned");
    match slot {
        PendingSlot::Table(id) => {
            state.pending.remove_if_token(id, token);
        }
        PendingSlot::Alive => {
            if state.alive_slot.as_ref().map(|e| e.token) == Some(token) {
                state.alive_slot = None;
            }
        }
        PendingSlot::BufferSize => {
            if let Some(pos) = state.buffer_size_slot.iter().position(|e| e.token == token) {
                state.buffer_size_slot.remove(pos);
            }
        }
    }
}

/// Arm the response timer for a parked pending entry.
pub(crate) fn arm_pending_timer(
    inner: &Arc<ConnectionInner>,
    slot: PendingSlot,
    token: u64,
    timeout: Duration,
) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let Some(inner) = weak.upgrade() else { return };
        let entry = {
            let mut state = inner.state.lock().expect("state poisoned");
            match slot {
                PendingSlot::Table(id) => state.pending.remove_if_token(id, token),
                PendingSlot::Alive => {
                    if state.alive_slot.as_ref().map(|e| e.token) == Some(token) {
                        state.alive_slot.take()
                    } else {
                        None
                    }
                }
                PendingSlot::BufferSize => {
                    match state.buffer_size_slot.iter().position(|e| e.token == token) {
                        Some(pos) => state.buffer_size_slot.remove(pos),
                        None => None,
                    }
                }
            }
        };
        if let Some(mut entry) = entry {
            debug!(peer = %inner.peer, ?slot, "pending response timed out");
            let snapshot = entry.snapshot.clone();
            if let Some(hook) = entry.descriptor.on_timeout.take() {
                hook(snapshot).await;
            }
        }
    })
}

/// Arm the inactivity timer for a reassembly entry.
fn arm_reassembly_timer(inner: &Arc<ConnectionInner>, key: u16, token: u64) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        tokio::time::sleep(MULTIPART_TIMEOUT).await;
        let Some(inner) = weak.upgrade() else { return };
        let removed = {
            let mut state = inner.state.lock().expect("state poisoned");
            state.reassembly.remove_if_token(key, token)
        };
        if removed.is_some() {
            debug!(peer = %inner.peer, key, "multipart reassembly timed out, discarding");
        }
    })
}

/// One step of the parse loop. Returns an event to route, if any, and
/// whether parsing can continue.
enum Step {
    Continue(Option<(Request, bool)>),
    Stop,
}

fn advance(inner: &Arc<ConnectionInner>, state: &mut ConnState, buf: &mut BytesMut) -> Step {
    match state.read_state {
        ReadState::Head => {
            if buf.is_empty() {
                return Step::Stop;
            }
            match codec::parse(buf, state.buffer_size) {
                Parse::NeedMore => {
                    state.remainder = std::mem::take(buf);
                    Step::Stop
                }
                Parse::Violation(reason) => {
                    warn!(peer = %inner.peer, reason, "protocol violation, dropping frame");
                    buf.clear();
                    Step::Stop
                }
                Parse::Head(head) => {
                    let _ = buf.split_to(head.head_len);
                    let key = head.id.unwrap_or(0);

                    // A stale record with a different total belongs to a
                    // reassembly that was silently dropped; start fresh.
                    let stale = state
                        .reassembly
                        .get(key)
                        .map(|entry| entry.total != head.declared_len)
                        .unwrap_or(false);
                    if stale {
                        debug!(peer = %inner.peer, key, "declared length changed, restarting reassembly");
                        state.reassembly.remove(key);
                    }

                    let received = state
                        .reassembly
                        .get(key)
                        .map(|e| e.received())
                        .unwrap_or(0);
                    let overall_remaining = head.declared_len.saturating_sub(received);

                    if overall_remaining == 0 {
                        let mut request = head.into_request(Bytes::new(), 1);
                        request.peer = Some(inner.peer);
                        return Step::Continue(Some((request, true)));
                    }

                    // What the sender could pack after the prefix; the last
                    // fragment carries only the leftover.
                    let capacity = state.buffer_size.saturating_sub(head.head_len).max(1);
                    let fragment_len = overall_remaining.min(capacity as u64) as usize;

                    if state.reassembly.get(key).is_none() {
                        let token = state.take_token();
                        let mut entry = ReassemblyEntry::new(token, head);
                        entry.timer = Some(arm_reassembly_timer(inner, key, token));
                        state.reassembly.insert(key, entry);
                    }
                    state.read_state = ReadState::Body {
                        key,
                        fragment_remaining: fragment_len,
                    };
                    Step::Continue(None)
                }
            }
        }
        ReadState::Body {
            key,
            fragment_remaining,
        } => {
            if buf.is_empty() {
                return Step::Stop;
            }
            let take = fragment_remaining.min(buf.len());
            let chunk = buf.split_to(take);
            if let Some(entry) = state.reassembly.get_mut(key) {
                entry.body.extend_from_slice(&chunk);
            }
            // else: the entry timed out mid-fragment; the bytes are consumed
            // so the stream stays in sync, but nothing accumulates.

            if take < fragment_remaining {
                state.read_state = ReadState::Body {
                    key,
                    fragment_remaining: fragment_remaining - take,
                };
                return Step::Stop;
            }

            state.read_state = ReadState::Head;
            let fragment_done = match state.reassembly.get_mut(key) {
                Some(entry) => {
                    entry.parts += 1;
                    Some(entry.is_complete())
                }
                None => None,
            };
            let event = match fragment_done {
                Some(true) => {
                    let mut entry = state
                        .reassembly
                        .remove(key)
                        .expect("entry checked above");
                    let parts = entry.parts;
                    let body = std::mem::take(&mut entry.body).freeze();
                    let mut request = entry.head.clone().into_request(body, parts);
                    request.peer = Some(inner.peer);
                    Some((request, true))
                }
                Some(false) => {
                    // Partial progress only matters to a pending response;
                    // middleware sees nothing until the frame completes.
                    let wants_partial = state.pending.contains(key);
                    let entry = state
                        .reassembly
                        .get_mut(key)
                        .expect("entry checked above");
                    let token = entry.token;
                    entry.cancel_timer();
                    entry.timer = Some(arm_reassembly_timer(inner, key, token));
                    if wants_partial {
                        let mut request = entry
                            .head
                            .clone()
                            .into_request(entry.partial_body(), entry.parts);
                        request.peer = Some(inner.peer);
                        Some((request, false))
                    } else {
                        None
                    }
                }
                None => None,
            };
            Step::Continue(event)
        }
    }
}

pub(crate) async fn handle_data(inner: &Arc<ConnectionInner>, data: &[u8]) {
    if inner.closed.load(Ordering::SeqCst) {
        return;
    }

    let mut buf = {
        let mut state = inner.state.lock().expect("state poisoned");
        let mut buf = std::mem::take(&mut state.remainder);
        buf.extend_from_slice(data);
        buf
    };

    loop {
        let step = {
            let mut state = inner.state.lock().expect("state poisoned");
            advance(inner, &mut state, &mut buf)
        };
        match step {
            Step::Continue(Some((request, complete))) => route(inner, request, complete).await,
            Step::Continue(None) => {}
            Step::Stop => break,
        }
    }

    keep_alive::reset(inner);
}

/// Route one parsed frame (or fragment) to its consumer.
async fn route(inner: &Arc<ConnectionInner>, request: Request, complete: bool) {
    match request.method {
        Method::AliveRequest => {
            let conn = Connection::from_inner(inner.clone());
            if let Err(err) = conn.alive_response().await {
                warn!(peer = %inner.peer, error = %err, "failed to answer alive request");
            }
        }
        Method::AliveResponse => {
            resolve_pending(inner, PendingSlot::Alive, request, complete).await;
        }
        Method::BufferSizeRequest => {
            let raw = match <[u8; 4]>::try_from(&request.body[..]) {
                Ok(raw) => u32::from_be_bytes(raw),
                Err(_) => {
                    warn!(peer = %inner.peer, "buffer-size request body malformed");
                    return;
                }
            };
            let size = effective_buffer_size(raw);
            {
                let mut state = inner.state.lock().expect("state poisoned");
                state.buffer_size = size;
            }
            debug!(peer = %inner.peer, size, "buffer size updated from request");
            let conn = Connection::from_inner(inner.clone());
            if let Err(err) = conn.buffer_size_response(&request).await {
                warn!(peer = %inner.peer, error = %err, "failed to echo buffer-size response");
            }
        }
        Method::BufferSizeResponse => {
            resolve_pending(inner, PendingSlot::BufferSize, request, complete).await;
        }
        Method::Response => match request.id {
            Some(id) => resolve_pending(inner, PendingSlot::Table(id), request, complete).await,
            None => debug!(peer = %inner.peer, "response without id, dropping"),
        },
        Method::Signal | Method::Request | Method::Streaming => {
            let pending_match = request
                .id
                .map(|id| {
                    inner
                        .state
                        .lock()
                        .expect("state poisoned")
                        .pending
                        .contains(id)
                })
                .unwrap_or(false);
            if pending_match {
                let id = request.id.expect("checked above");
                resolve_pending(inner, PendingSlot::Table(id), request, complete).await;
            } else if complete {
                if let Some(engine) = inner.engine.upgrade() {
                    let chain = engine.middleware_chain();
                    middleware::dispatch(chain, request, Connection::from_inner(inner.clone()));
                }
            }
        }
    }
}

/// Resolve a pending entry with an inbound fragment.
///
/// A final fragment consumes the entry; a partial one restarts its timer
/// and puts it back.
async fn resolve_pending(
    inner: &Arc<ConnectionInner>,
    slot: PendingSlot,
    request: Request,
    complete: bool,
) {
    let entry = {
        let mut state = inner.state.lock().expect("state poisoned");
        match slot {
            PendingSlot::Table(id) => state.pending.remove(id),
            PendingSlot::Alive => state.alive_slot.take(),
            PendingSlot::BufferSize => state.buffer_size_slot.pop_front(),
        }
    };
    let Some(mut entry) = entry else {
        debug!(peer = %inner.peer, method = ?request.method, "no pending entry, dropping");
        return;
    };
    entry.cancel_timer();

    if complete {
        if let Some(mut hook) = entry.descriptor.on_response.take() {
            hook(request).await;
        }
        // Entry dropped: the timeout hook can never fire now.
    } else {
        if let Some(hook) = entry.descriptor.on_response.as_mut() {
            hook(request).await;
        }
        let timeout = entry.descriptor.timeout;
        let token = entry.token;
        entry.timer = Some(arm_pending_timer(inner, slot, token, timeout));
        let mut state = inner.state.lock().expect("state poisoned");
        match slot {
            PendingSlot::Table(id) => state.pending.insert(id, entry),
            PendingSlot::Alive => state.alive_slot = Some(entry),
            PendingSlot::BufferSize => state.buffer_size_slot.push_front(entry),
        }
    }
}

/// Tear the connection down. Idempotent; safe to call from any task,
/// including the connection's own read loop.
pub(crate) async fn destroy(inner: &Arc<ConnectionInner>) {
    if inner.closed.swap(true, Ordering::SeqCst) {
        return;
    }

    let (pending, alive_slot, buffer_slots, reassembly, alive_timer, read_task, hook) = {
        let mut state = inner.state.lock().expect("state poisoned");
        (
            state.pending.drain(),
            state.alive_slot.take(),
            state.buffer_size_slot.drain(..).collect::<Vec<_>>(),
            state.reassembly.drain(),
            state.alive_timer.take(),
            state.read_task.take(),
            state.on_disconnect.take(),
        )
    };
    // Entry drops abort their timers.
    drop(pending);
    drop(alive_slot);
    drop(buffer_slots);
    drop(reassembly);
    if let Some(timer) = alive_timer {
        timer.abort();
    }

    {
        let mut writer = inner.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            debug!(peer = %inner.peer, error = %err, "stream shutdown failed");
        }
    }

    if let Some(engine) = inner.engine.upgrade() {
        engine.registry.remove(&inner.peer);
    }

    info!(peer = %inner.peer, "connection destroyed");

    if let Some(hook) = hook {
        hook(Connection::from_inner(inner.clone())).await;
    }

    // Last: when called from the read loop, this aborts the current task.
    if let Some(task) = read_task {
        task.abort();
    }
}
