//! Anti-replay protection for handshake frames
//!
//! A handshake frame is valid at most once: seeing the same 64 bytes again
//! within the eviction period means someone recorded the original exchange
//! and is replaying it. The cache is shared by every pipeline and bounded
//! both by total byte footprint and by entry age.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::handshake::{HandshakeFrame, FRAME_LEN};

/// Bytes accounted per cached frame
const ENTRY_BYTES: usize = FRAME_LEN;

/// Outcome of [`ReplayCache::observe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// First sighting within the eviction period; the frame is now cached
    Fresh,
    /// The identical frame is already cached
    Replay,
}

/// Bounded, time-decaying set of recently seen handshake frames.
///
/// `observe` is an atomic check-and-insert: of two concurrent observes of
/// the same frame, at most one sees [`Freshness::Fresh`].
#[derive(Debug)]
pub struct ReplayCache {
    inner: Mutex<Inner>,
    max_entries: usize,
    ttl: Duration,
}

#[derive(Debug)]
struct Inner {
    seen: HashSet<[u8; FRAME_LEN]>,
    order: VecDeque<(Instant, [u8; FRAME_LEN])>,
}

impl ReplayCache {
    /// Create a cache holding at most `max_bytes` worth of frames, each for
    /// at most `ttl`
    pub fn new(max_bytes: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                seen: HashSet::new(),
                order: VecDeque::new(),
            }),
            max_entries: (max_bytes / ENTRY_BYTES).max(1),
            ttl,
        }
    }

    /// Check-and-insert. Returns [`Freshness::Replay`] iff the identical
    /// frame is currently cached; otherwise caches it and returns
    /// [`Freshness::Fresh`].
    pub fn observe(&self, frame: &HandshakeFrame) -> Freshness {
        self.observe_at(frame, Instant::now())
    }

    fn observe_at(&self, frame: &HandshakeFrame, now: Instant) -> Freshness {
        let mut inner = self.inner.lock();

        // Expired entries must never report a replay.
        while let Some(&(inserted, key)) = inner.order.front() {
            if now.duration_since(inserted) < self.ttl {
                break;
            }
            inner.seen.remove(&key);
            inner.order.pop_front();
        }

        let key = *frame.as_bytes();
        if inner.seen.contains(&key) {
            return Freshness::Replay;
        }

        // Oldest-first eviction keeps the footprint within one entry of the
        // configured cap.
        while inner.order.len() >= self.max_entries {
            if let Some((_, oldest)) = inner.order.pop_front() {
                inner.seen.remove(&oldest);
            }
        }

        inner.seen.insert(key);
        inner.order.push_back((now, key));
        Freshness::Fresh
    }

    /// Number of frames currently cached
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
