//! Multipart reassembly table.
//!
//! A logical frame whose body exceeds the negotiated buffer size arrives as
//! several fragments, each re-carrying the full prefix through BODY_LEN.
//! This table accumulates body bytes per request ID until the declared
//! total is reached. An entry that sees no fragment for the inactivity
//! window is discarded silently; later bytes for that ID start a fresh
//! reassembly. Frames without a wire ID reassemble under the zero slot
//! (ID-carrying methods never use ID zero).

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tokio::task::JoinHandle;

use crate::protocol::codec::ParsedHead;

/// Accumulation state for one in-progress multipart frame.
pub(crate) struct ReassemblyEntry {
    /// Guards against a stale inactivity timer firing for a reused ID.
    pub token: u64,
    /// Fragments fully consumed so far.
    pub parts: u32,
    /// Declared total body length from the first fragment.
    pub total: u64,
    /// Frame head from the first fragment.
    pub head: ParsedHead,
    /// Body bytes accumulated so far.
    pub body: BytesMut,
    pub timer: Option<JoinHandle<()>>,
}

impl ReassemblyEntry {
    pub fn new(token: u64, head: ParsedHead) -> Self {
        let total = head.declared_len;
        Self {
            token,
            parts: 0,
            total,
            head,
            body: BytesMut::with_capacity(total.min(64 * 1024) as usize),
            timer: None,
        }
    }

    /// Body bytes received so far.
    #[inline]
    pub fn received(&self) -> u64 {
        self.body.len() as u64
    }

    /// Whether every declared byte has arrived.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.received() >= self.total
    }

    /// Copy of the body accumulated so far, for partial-progress callbacks.
    pub fn partial_body(&self) -> Bytes {
        Bytes::copy_from_slice(&self.body)
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for ReassemblyEntry {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

/// ID-keyed reassembly table. An entry exists for an ID iff
/// `received < total`.
#[derive(Default)]
pub(crate) struct ReassemblyTable {
    entries: HashMap<u16, ReassemblyEntry>,
}

impl ReassemblyTable {
    pub fn get(&self, key: u16) -> Option<&ReassemblyEntry> {
        self.entries.get(&key)
    }

    pub fn get_mut(&mut self, key: u16) -> Option<&mut ReassemblyEntry> {
        self.entries.get_mut(&key)
    }

    pub fn insert(&mut self, key: u16, entry: ReassemblyEntry) {
        self.entries.insert(key, entry);
    }

    pub fn remove(&mut self, key: u16) -> Option<ReassemblyEntry> {
        self.entries.remove(&key)
    }

    /// Remove the entry only if its token still matches.
    pub fn remove_if_token(&mut self, key: u16, token: u64) -> Option<ReassemblyEntry> {
        match self.entries.get(&key) {
            Some(entry) if entry.token == token => self.entries.remove(&key),
            _ => None,
        }
    }

    /// Drain every entry, cancelling timers via drop.
    pub fn drain(&mut self) -> Vec<ReassemblyEntry> {
        self.entries.drain().map(|(_, e)| e).collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Method, Request};
    use crate::protocol::codec::{encode, parse, Parse};
    use crate::protocol::DEFAULT_BUFFER_SIZE;

    fn head_for(total: usize) -> ParsedHead {
        let req = Request::new(Method::Streaming)
            .with_id(7)
            .with_body(vec![0xAB; total]);
        let bytes = encode(&req, DEFAULT_BUFFER_SIZE).unwrap().to_bytes();
        match parse(&bytes, DEFAULT_BUFFER_SIZE) {
            Parse::Head(head) => head,
            other => panic!("expected head, got {other:?}"),
        }
    }

    #[test]
    fn test_entry_accumulates_until_total() {
        let mut entry = ReassemblyEntry::new(1, head_for(10));
        assert_eq!(entry.total, 10);
        assert!(!entry.is_complete());

        entry.body.extend_from_slice(&[0xAB; 6]);
        entry.parts += 1;
        assert_eq!(entry.received(), 6);
        assert!(!entry.is_complete());

        entry.body.extend_from_slice(&[0xAB; 4]);
        entry.parts += 1;
        assert!(entry.is_complete());
        assert_eq!(entry.parts, 2);
    }

    #[test]
    fn test_partial_body_is_a_copy() {
        let mut entry = ReassemblyEntry::new(1, head_for(4));
        entry.body.extend_from_slice(b"ab");
        let partial = entry.partial_body();
        entry.body.extend_from_slice(b"cd");
        assert_eq!(&partial[..], b"ab");
        assert_eq!(&entry.body[..], b"abcd");
    }

    #[test]
    fn test_remove_if_token() {
        let mut table = ReassemblyTable::default();
        table.insert(5, ReassemblyEntry::new(9, head_for(10)));

        assert!(table.remove_if_token(5, 8).is_none());
        assert_eq!(table.len(), 1);
        assert!(table.remove_if_token(5, 9).is_some());
        assert_eq!(table.len(), 0);
    }
}
