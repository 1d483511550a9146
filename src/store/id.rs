//! Message id generation
//!
//! Every stored message is stamped with a 64-bit id that is unique across
//! up to 1024 brokers sharing a persistence backend, and sorts by creation
//! time. Layout:
//!
//! ```text
//! | 63 .. 54 | 53 .. 23                     | 22 .. 0              |
//! | node id  | seconds since epoch (31 bit) | nanos >> 7 (≈119 ns) |
//! ```
//!
//! The epoch is 2020-01-01T00:00:00Z; the 31-bit seconds field rolls over
//! around 2088, which is documented and not handled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Unix timestamp of 2020-01-01T00:00:00Z
const ID_EPOCH: u64 = 1_577_836_800;

const SECONDS_MASK: u64 = 0x7FFF_FFFF;
const SUBSEC_BITS: u32 = 23;
const NODE_SHIFT: u32 = 54;

/// Strictly monotonic message id generator.
///
/// Ids never repeat and never decrease within a broker instance, even when
/// the clock stands still or steps backwards: a tie or regression is bumped
/// to `last + 1`.
#[derive(Debug)]
pub struct MessageIdGenerator {
    /// Node id pre-shifted into the top 10 bits
    node_shifted: u64,
    /// Last id issued (or seeded from restore)
    last: AtomicU64,
}

impl MessageIdGenerator {
    /// Create a generator for the given node id.
    ///
    /// `node_id` must be at most 1023; configuration validation enforces
    /// this before a generator is built.
    pub fn new(node_id: u16) -> Self {
        debug_assert!(node_id <= 1023);
        Self {
            node_shifted: u64::from(node_id) << NODE_SHIFT,
            last: AtomicU64::new(0),
        }
    }

    /// Raise the monotonicity floor to `last_id`.
    ///
    /// Called after restore with the maximum id found in the persistence
    /// backend, so ids stay monotonic across restarts.
    pub fn seed(&self, last_id: u64) {
        self.last.fetch_max(last_id, Ordering::Relaxed);
    }

    /// Issue the next message id from the current wall clock.
    pub fn next(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.next_at(now.as_secs(), now.subsec_nanos())
    }

    /// Issue the next id as of the given wall-clock instant.
    pub fn next_at(&self, unix_secs: u64, nanos: u32) -> u64 {
        let secs = (unix_secs.saturating_sub(ID_EPOCH)) & SECONDS_MASK;
        // High 23 bits of the 30-bit nanosecond field
        let subsec = (u64::from(nanos) >> 7) & ((1 << SUBSEC_BITS) - 1);
        let candidate = self.node_shifted | (secs << SUBSEC_BITS) | subsec;

        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let id = if candidate > last { candidate } else { last + 1 };
            match self
                .last
                .compare_exchange(last, id, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return id,
                Err(observed) => last = observed,
            }
        }
    }

    /// The most recently issued (or seeded) id.
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Relaxed)
    }
}
