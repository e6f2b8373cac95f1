//! In-flight request/response table.
//!
//! Each REQUEST or STREAMING sent with a [`ResponseDescriptor`] parks an
//! entry here, keyed by its wire ID. Inbound fragments matching the ID feed
//! `on_response`; the timer firing first feeds `on_timeout`. Exactly one of
//! the two outcomes happens per entry.
//!
//! ALIVE and BUFFER_SIZE exchanges carry no wire ID and are matched
//! positionally; their entries live in dedicated slots on the connection
//! state rather than in this table.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;

use crate::middleware::BoxFuture;
use crate::protocol::{Request, DEFAULT_RESPONSE_TIMEOUT};

/// Hook invoked with each (possibly partial) response fragment.
pub type ResponseHook = Box<dyn FnMut(Request) -> BoxFuture<'static, ()> + Send>;

/// Hook invoked once if the response timer expires first.
pub type TimeoutHook = Box<dyn FnOnce(Request) -> BoxFuture<'static, ()> + Send>;

/// Caller-supplied expectations for a response.
pub struct ResponseDescriptor {
    pub(crate) on_response: Option<ResponseHook>,
    pub(crate) on_timeout: Option<TimeoutHook>,
    pub(crate) timeout: Duration,
}

impl ResponseDescriptor {
    /// A descriptor with the default 1000 ms timeout and no hooks.
    pub fn new() -> Self {
        Self {
            on_response: None,
            on_timeout: None,
            timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Set the hook run for every matching response fragment.
    ///
    /// The request handed to the hook carries the body accumulated so far;
    /// check [`Request::is_complete`] to tell the final fragment apart.
    pub fn on_response<F, Fut>(mut self, mut hook: F) -> Self
    where
        F: FnMut(Request) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_response = Some(Box::new(move |req| Box::pin(hook(req))));
        self
    }

    /// Set the hook run once when the response timer expires.
    pub fn on_timeout<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce(Request) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_timeout = Some(Box::new(move |req| Box::pin(hook(req))));
        self
    }

    /// Override the response timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ResponseDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

/// One parked expectation, either in the ID table or a positional slot.
pub(crate) struct PendingEntry {
    /// Guards against a timer firing for a recycled slot or ID.
    pub token: u64,
    pub descriptor: ResponseDescriptor,
    /// Snapshot of the request that opened this entry.
    pub snapshot: Request,
    pub timer: Option<JoinHandle<()>>,
}

impl PendingEntry {
    pub fn new(token: u64, descriptor: ResponseDescriptor, snapshot: Request) -> Self {
        Self {
            token,
            descriptor,
            snapshot,
            timer: None,
        }
    }

    /// Abort the armed timer, if any.
    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

/// ID-keyed in-flight table with pseudo-random ID allocation.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: HashMap<u16, PendingEntry>,
}

impl PendingTable {
    /// Allocate an unused ID in 1..=9999.
    ///
    /// Zero is never produced; collisions with in-flight IDs retry.
    pub fn allocate_id(&self) -> u16 {
        let mut rng = rand::thread_rng();
        loop {
            let id = rng.gen_range(1..=9999u16);
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn insert(&mut self, id: u16, entry: PendingEntry) {
        self.entries.insert(id, entry);
    }

    pub fn remove(&mut self, id: u16) -> Option<PendingEntry> {
        self.entries.remove(&id)
    }

    /// Remove the entry only if its token still matches.
    pub fn remove_if_token(&mut self, id: u16, token: u64) -> Option<PendingEntry> {
        match self.entries.get(&id) {
            Some(entry) if entry.token == token => self.entries.remove(&id),
            _ => None,
        }
    }

    pub fn contains(&self, id: u16) -> bool {
        self.entries.contains_key(&id)
    }

    /// Drain every entry, cancelling timers via drop.
    pub fn drain(&mut self) -> Vec<PendingEntry> {
        self.entries.drain().map(|(_, e)| e).collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
