//! Keep-alive controller.
//!
//! Each connection schedules an ALIVE_REQUEST probe at its configured
//! interval. Any activity — a successful inbound parse or a completed
//! outbound write — pushes the probe back. When the probe itself goes
//! unanswered past the response timeout, the connection is destroyed and
//! the disconnect hook runs.
//!
//! Inbound ALIVE_REQUESTs are answered inline by the routing layer and only
//! reset this timer; they never traverse middleware.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::warn;

use super::pending::ResponseDescriptor;
use super::state::{self, Connection, ConnectionInner};

/// Restart the keep-alive timer. Called on every inbound parse and every
/// completed outbound write; also schedules the first probe at listen time.
pub(crate) fn reset(inner: &Arc<ConnectionInner>) {
    if inner.closed.load(Ordering::SeqCst) {
        return;
    }
    let interval = inner.config.alive_interval;

    let mut state = inner.state.lock().expect("state poisoned");
    if let Some(timer) = state.alive_timer.take() {
        timer.abort();
    }
    if interval.is_zero() {
        return;
    }

    let weak = Arc::downgrade(inner);
    state.alive_timer = Some(tokio::spawn(async move {
        tokio::time::sleep(interval).await;
        if let Some(inner) = weak.upgrade() {
            probe(inner).await;
        }
    }));
}

/// Send one ALIVE_REQUEST whose timeout tears the connection down.
async fn probe(inner: Arc<ConnectionInner>) {
    if inner.closed.load(Ordering::SeqCst) {
        return;
    }

    let weak = Arc::downgrade(&inner);
    let descriptor = ResponseDescriptor::new()
        .timeout(inner.config.response_timeout)
        .on_timeout(move |_request| async move {
            if let Some(inner) = weak.upgrade() {
                warn!(peer = %inner.peer, "keep-alive timed out, destroying connection");
                state::destroy(&inner).await;
            }
        });

    let conn = Connection::from_inner(inner.clone());
    if let Err(err) = conn.alive_request(Some(descriptor)).await {
        warn!(peer = %inner.peer, error = %err, "keep-alive probe failed, destroying connection");
        state::destroy(&inner).await;
    }
}
