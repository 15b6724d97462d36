//! Patching Epoch
//!
//! A single counter, bumped before every disarm that a thread may only trust
//! after executing a fence. Threads cache the epoch they last fenced at next
//! to their disarmed guard value; the fast path compares the pair, so a stale
//! epoch (not a stale guard) is what sends a thread to the slow path for its
//! one-time fence.
//!
//! The counter starts at zero when the process starts and is never reset.
//! It is 64 bits wide so monotonicity holds for the lifetime of any process.

use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

lazy_static::lazy_static! {
    static ref GLOBAL_EPOCH: Arc<PatchingEpoch> = Arc::new(PatchingEpoch::new());
}

/// Process-wide patching epoch
///
/// Padded to its own cache line: every disarm writes it and every slow path
/// reads it.
#[derive(Debug)]
pub struct PatchingEpoch {
    value: CachePadded<AtomicU64>,
}

impl PatchingEpoch {
    /// Create a counter at epoch zero
    pub fn new() -> Self {
        Self {
            value: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// The process-wide epoch shared by every service built with defaults
    pub fn global() -> Arc<PatchingEpoch> {
        Arc::clone(&GLOBAL_EPOCH)
    }

    /// Current epoch
    ///
    /// Acquire pairs with the release increment so a thread that observes
    /// epoch `e` also observes everything published before the bump to `e`.
    #[inline(always)]
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Advance the epoch and return the new value
    ///
    /// Must happen before the guard store it protects; the guard store uses
    /// release ordering, so the bump is visible to anyone who acquires the
    /// new guard.
    #[inline]
    pub fn advance(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Address of the counter, embedded by emitted barriers that load the
    /// low word of the epoch directly
    pub fn address(&self) -> usize {
        self.value.as_ptr() as usize
    }
}

impl Default for PatchingEpoch {
    fn default() -> Self {
        Self::new()
    }
}
