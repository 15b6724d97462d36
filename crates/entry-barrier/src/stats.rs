//! Entry Barrier Statistics
//!
//! Counters for barrier activity, used for:
//! - Checking that disarms amortize (slow path rate stays low)
//! - Spotting contention on masked guard updates
//! - Auditing deoptimizations
//!
//! All counters are relaxed atomics; a snapshot is a consistent-enough view
//! for monitoring, not a linearizable one.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the barrier counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntryBarrierStats {
    /// Entries that passed the fast-path check
    pub fast_path_passes: u64,
    /// Entries that trapped into the slow path
    pub slow_path_entries: u64,
    /// Guards set to the armed sentinel
    pub arms: u64,
    /// Guards set to a disarmed phase
    pub disarms: u64,
    /// Disarms skipped because the guard already held the phase
    pub redundant_disarms: u64,
    /// Methods made not entrant
    pub not_entrant: u64,
    /// Failed compare-and-swap attempts in masked updates
    pub masked_cas_retries: u64,
    /// Patching epoch increments
    pub epoch_bumps: u64,
    /// Phase advances through global arming
    pub global_arms: u64,
    /// Activations redirected to the resolution stub
    pub deoptimizations: u64,
    /// Guard updates ignored because the method is not entrant
    pub sticky_rejections: u64,
}

impl EntryBarrierStats {
    /// Fast-path pass rate as a percentage, 100 when nothing ran yet
    pub fn fast_path_rate(&self) -> f64 {
        let total = self.fast_path_passes + self.slow_path_entries;
        if total == 0 {
            100.0
        } else {
            (self.fast_path_passes as f64 / total as f64) * 100.0
        }
    }

    /// Print stats for debugging
    pub fn print(&self) {
        println!("Entry Barrier Statistics:");
        println!(
            "  Entries: {} fast, {} slow ({:.2}% fast)",
            self.fast_path_passes,
            self.slow_path_entries,
            self.fast_path_rate()
        );
        println!(
            "  Arms: {}, disarms: {} ({} redundant), global arms: {}",
            self.arms, self.disarms, self.redundant_disarms, self.global_arms
        );
        println!("  Epoch bumps: {}", self.epoch_bumps);
        println!("  Masked CAS retries: {}", self.masked_cas_retries);
        println!(
            "  Not entrant: {}, sticky rejections: {}, deoptimizations: {}",
            self.not_entrant, self.sticky_rejections, self.deoptimizations
        );
    }
}

/// Thread-safe counter set behind [`EntryBarrierStats`]
///
/// When disabled every `record_*` call is a no-op.
#[derive(Debug)]
pub struct AtomicEntryBarrierStats {
    enabled: bool,
    fast_path_passes: AtomicU64,
    slow_path_entries: AtomicU64,
    arms: AtomicU64,
    disarms: AtomicU64,
    redundant_disarms: AtomicU64,
    not_entrant: AtomicU64,
    masked_cas_retries: AtomicU64,
    epoch_bumps: AtomicU64,
    global_arms: AtomicU64,
    deoptimizations: AtomicU64,
    sticky_rejections: AtomicU64,
}

macro_rules! recorder {
    ($(#[$doc:meta])* $name:ident, $field:ident) => {
        $(#[$doc])*
        #[inline]
        pub fn $name(&self) {
            if self.enabled {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        }
    };
}

impl AtomicEntryBarrierStats {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            fast_path_passes: AtomicU64::new(0),
            slow_path_entries: AtomicU64::new(0),
            arms: AtomicU64::new(0),
            disarms: AtomicU64::new(0),
            redundant_disarms: AtomicU64::new(0),
            not_entrant: AtomicU64::new(0),
            masked_cas_retries: AtomicU64::new(0),
            epoch_bumps: AtomicU64::new(0),
            global_arms: AtomicU64::new(0),
            deoptimizations: AtomicU64::new(0),
            sticky_rejections: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    recorder!(record_fast_path, fast_path_passes);
    recorder!(record_slow_path, slow_path_entries);
    recorder!(record_arm, arms);
    recorder!(record_disarm, disarms);
    recorder!(
        /// Disarm that found the phase already in place
        record_redundant_disarm,
        redundant_disarms
    );
    recorder!(record_not_entrant, not_entrant);
    recorder!(record_epoch_bump, epoch_bumps);
    recorder!(record_global_arm, global_arms);
    recorder!(record_deoptimization, deoptimizations);
    recorder!(record_sticky_rejection, sticky_rejections);

    /// Record failed CAS attempts of one masked update
    #[inline]
    pub fn record_cas_retries(&self, retries: u32) {
        if self.enabled && retries > 0 {
            self.masked_cas_retries
                .fetch_add(u64::from(retries), Ordering::Relaxed);
        }
    }

    /// Get current stats snapshot
    pub fn snapshot(&self) -> EntryBarrierStats {
        EntryBarrierStats {
            fast_path_passes: self.fast_path_passes.load(Ordering::Relaxed),
            slow_path_entries: self.slow_path_entries.load(Ordering::Relaxed),
            arms: self.arms.load(Ordering::Relaxed),
            disarms: self.disarms.load(Ordering::Relaxed),
            redundant_disarms: self.redundant_disarms.load(Ordering::Relaxed),
            not_entrant: self.not_entrant.load(Ordering::Relaxed),
            masked_cas_retries: self.masked_cas_retries.load(Ordering::Relaxed),
            epoch_bumps: self.epoch_bumps.load(Ordering::Relaxed),
            global_arms: self.global_arms.load(Ordering::Relaxed),
            deoptimizations: self.deoptimizations.load(Ordering::Relaxed),
            sticky_rejections: self.sticky_rejections.load(Ordering::Relaxed),
        }
    }

    /// Reset all stats to zero
    pub fn reset(&self) {
        for counter in [
            &self.fast_path_passes,
            &self.slow_path_entries,
            &self.arms,
            &self.disarms,
            &self.redundant_disarms,
            &self.not_entrant,
            &self.masked_cas_retries,
            &self.epoch_bumps,
            &self.global_arms,
            &self.deoptimizations,
            &self.sticky_rejections,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for AtomicEntryBarrierStats {
    fn default() -> Self {
        Self::new(true)
    }
}
