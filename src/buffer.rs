//! Buffer primitives: opaque byte containers plus the vectored-send
//! aggregator a socket uses to coalesce queued sends.
//!
//! The aggregator works directly against `std::io::IoSlice` so it can feed
//! `socket2::Socket::send_vectored` without an intermediate copy.
use std::io::IoSlice;

/// An owned, contiguous byte payload queued for sending.
///
/// Collapses the raw-bytes vs. owned-string split into one owned buffer, since
/// `Vec<u8>` already covers both cases in Rust.
#[derive(Debug, Clone)]
pub struct Payload(Vec<u8>);

impl Payload {
    /// The zero-length form exists purely as a convenience for C-string-style
    /// callers; binary payloads must always pass an explicit length via
    /// `From<Vec<u8>>`/`From<&[u8]>` rather than relying on `strlen`.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// Destination for one payload in a UDP aggregator. `None` means "use the
/// socket's connected peer", mirroring `bindPeerAddr`'s zero-address `send`.
pub type Destination = Option<std::net::SocketAddr>;

/// Outcome of one payload's delivery, handed to its completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// All of the payload's bytes were handed to the kernel.
    Sent,
    /// The aggregator was torn down (socket closed, error) before this
    /// payload finished sending.
    Dropped,
}

/// Callback invoked exactly once per payload, when it either finishes sending
/// or is dropped.
pub type CompletionCallback = Box<dyn FnOnce(SendOutcome) + Send>;

struct Entry {
    payload: Payload,
    destination: Destination,
    on_complete: Option<CompletionCallback>,
}

/// Vectored-send aggregator: batches payloads queued on a socket and tracks
/// how much of the logical byte stream has been handed to the kernel.
///
/// Invariant: `entries[offset..]` describes exactly the unsent suffix of the
/// logical stream, and `remaining` equals the sum of those entries' lengths.
/// `re_offset` is the only way this invariant is advanced, and it must never
/// let `offset` run past `entries.len()` or complete an entry one byte early.
pub struct BufferSendMsg {
    entries: Vec<Entry>,
    offset: usize,
    consumed_in_head: usize,
    remaining: usize,
}

impl BufferSendMsg {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            offset: 0,
            consumed_in_head: 0,
            remaining: 0,
        }
    }

    /// Drain a waiting list of `(payload, destination, callback)` triples into
    /// a fresh aggregator, as a socket does when it flushes its queued sends.
    pub fn from_waiting(
        waiting: Vec<(Payload, Destination, Option<CompletionCallback>)>,
    ) -> Self {
        let remaining = waiting.iter().map(|(p, _, _)| p.len()).sum();
        let entries = waiting
            .into_iter()
            .map(|(payload, destination, on_complete)| Entry {
                payload,
                destination,
                on_complete,
            })
            .collect();
        Self {
            entries,
            offset: 0,
            consumed_in_head: 0,
            remaining,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.offset >= self.entries.len()
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// `IoSlice`s describing exactly the unsent suffix, for a vectored write.
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.entries[self.offset..]
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let bytes = entry.payload.as_slice();
                if i == 0 {
                    IoSlice::new(&bytes[self.consumed_in_head..])
                } else {
                    IoSlice::new(bytes)
                }
            })
            .collect()
    }

    /// The destination recorded for the head (not-yet-fully-sent) entry, used
    /// by UDP sends that address each payload individually.
    pub fn head_destination(&self) -> Destination {
        self.entries.get(self.offset).and_then(|e| e.destination)
    }

    /// Advance the aggregator's offset after the kernel has accepted `n`
    /// bytes. Fires each payload's completion callback exactly once, the
    /// moment its bytes are fully accounted for.
    ///
    /// A payload whose remaining length exactly equals the unconsumed suffix
    /// of `n` completes within this same call, rather than being left one
    /// byte short until the next invocation.
    pub fn re_offset(&mut self, n: usize) {
        assert!(n <= self.remaining, "acked more bytes than were pending");

        let mut left = n;
        while left > 0 && self.offset < self.entries.len() {
            let entry_len = self.entries[self.offset].payload.len() - self.consumed_in_head;
            if left < entry_len {
                self.consumed_in_head += left;
                self.remaining -= left;
                left = 0;
            } else {
                left -= entry_len;
                self.remaining -= entry_len;
                self.consumed_in_head = 0;
                if let Some(cb) = self.entries[self.offset].on_complete.take() {
                    cb(SendOutcome::Sent);
                }
                self.offset += 1;
            }
        }
    }
}

impl Default for BufferSendMsg {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BufferSendMsg {
    fn drop(&mut self) {
        for entry in self.entries.drain(self.offset..) {
            if let Some(cb) = entry.on_complete {
                cb(SendOutcome::Dropped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn waiting(payloads: &[&[u8]]) -> Vec<(Payload, Destination, Option<CompletionCallback>)> {
        payloads
            .iter()
            .map(|p| (Payload::from(*p), None, None))
            .collect()
    }

    #[test]
    fn re_offset_splits_within_one_entry() {
        let mut agg = BufferSendMsg::from_waiting(waiting(&[b"hello world"]));
        assert_eq!(agg.remaining(), 11);
        agg.re_offset(5);
        assert_eq!(agg.remaining(), 6);
        assert_eq!(agg.io_slices()[0].as_ref(), b" world");
    }

    #[test]
    fn re_offset_completes_entry_exactly_at_boundary() {
        let done = Arc::new(Mutex::new(false));
        let done2 = done.clone();
        let mut waiting = waiting(&[b"abc", b"def"]);
        waiting[0].2 = Some(Box::new(move |outcome| {
            assert_eq!(outcome, SendOutcome::Sent);
            *done2.lock().unwrap() = true;
        }));
        let mut agg = BufferSendMsg::from_waiting(waiting);

        agg.re_offset(3);

        assert!(*done.lock().unwrap());
        assert_eq!(agg.remaining(), 3);
        assert_eq!(agg.io_slices().len(), 1);
    }

    #[test]
    fn re_offset_across_multiple_entries() {
        let mut agg = BufferSendMsg::from_waiting(waiting(&[b"ab", b"cd", b"ef"]));
        agg.re_offset(5);
        assert_eq!(agg.remaining(), 1);
        assert_eq!(agg.io_slices()[0].as_ref(), b"f");
        assert!(!agg.is_empty());
        agg.re_offset(1);
        assert!(agg.is_empty());
    }

    #[test]
    fn dropped_entries_report_failure() {
        let done = Arc::new(Mutex::new(None));
        let done2 = done.clone();
        let mut waiting = waiting(&[b"xyz"]);
        waiting[0].2 = Some(Box::new(move |outcome| {
            *done2.lock().unwrap() = Some(outcome);
        }));
        drop(BufferSendMsg::from_waiting(waiting));
        assert_eq!(*done.lock().unwrap(), Some(SendOutcome::Dropped));
    }

    #[test]
    fn reoffset_matches_fresh_aggregator_from_suffix() {
        // re_offset(n) after a partial send must look the same, externally,
        // as building a fresh aggregator from the unsent suffix.
        let mut a = BufferSendMsg::from_waiting(waiting(&[b"abcdef", b"ghi"]));
        a.re_offset(4);
        let b = BufferSendMsg::from_waiting(waiting(&[b"ef", b"ghi"]));

        let a_bytes: Vec<u8> = a.io_slices().iter().flat_map(|s| s.to_vec()).collect();
        let b_bytes: Vec<u8> = b.io_slices().iter().flat_map(|s| s.to_vec()).collect();
        assert_eq!(a_bytes, b_bytes);
        assert_eq!(a.remaining(), b.remaining());
    }
}
