//! Barrier State Service - arm, disarm and the not-entrant trap
//!
//! [`BarrierStateService`] is the collector-facing façade. It owns the
//! current phase (the guard value that means "disarmed"), the threads that
//! trust it, and the patching epoch, and it drives the codec for every guard
//! change.
//!
//! Guard transitions:
//!
//! ```text
//!            arm()                 arm_all() (phase advances)
//!   ┌──────────────────┐        ┌──────────────────────────┐
//!   ▼                  │        ▼                          │
//! ARMED ──disarm()──▶ DISARMED(phase) ─────────────────────┘
//!   │                  │
//!   └──make_not_entrant()──▶ NOT_ENTRANT (terminal)
//! ```
//!
//! Guard updates for one method are serialized by a service-wide lock so
//! the sticky check and the store are atomic with respect to
//! [`BarrierStateService::make_not_entrant`]. Masked updates do not take the
//! lock; the codec's CAS loop refuses to touch a not-entrant guard.

use crate::code::CompiledMethod;
use crate::codec::{host_codec, ArchBarrierCodec, BarrierSite, PatchOutcome, PatchingType};
use crate::config::BarrierConfig;
use crate::epoch::PatchingEpoch;
use crate::error::Result;
use crate::guard::{is_sticky, next_phase, ALL_BITS, ARMED, INITIAL_PHASE, NOT_ENTRANT};
use crate::logging::{log_event, BarrierEvent};
use crate::stats::{AtomicEntryBarrierStats, EntryBarrierStats};
use crate::sync::load_load_fence;
use crate::thread::{ThreadBarrierState, ThreadRegistry};
use crate::fatal_on_err;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Outcome of the inline entry check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDecision {
    /// Guard matched the thread's trusted value, run the body
    Pass,
    /// Guard mismatch, call the entry barrier stub
    SlowPath,
}

/// Collector-facing entry barrier service
pub struct BarrierStateService {
    codec: Arc<dyn ArchBarrierCodec>,
    epoch: Arc<PatchingEpoch>,
    config: BarrierConfig,
    /// Guard value meaning "disarmed" in the current phase
    phase: AtomicU32,
    threads: ThreadRegistry,
    patch_lock: Mutex<()>,
    stats: AtomicEntryBarrierStats,
}

impl BarrierStateService {
    /// Create a service for the host instruction set and the process epoch
    pub fn new(config: BarrierConfig) -> Result<Self> {
        config.validate()?;
        let codec = host_codec(config.patching_type)?;
        Self::with_codec(config, codec, PatchingEpoch::global())
    }

    /// Create a service around an explicit codec and epoch
    ///
    /// A codec whose patching strategy differs from an explicit
    /// `config.patching_type` is rejected.
    pub fn with_codec(
        config: BarrierConfig,
        codec: Arc<dyn ArchBarrierCodec>,
        epoch: Arc<PatchingEpoch>,
    ) -> Result<Self> {
        config.validate()?;
        if let Some(requested) = config.patching_type {
            if requested != codec.patching_type() {
                return Err(crate::error::BarrierError::UnsupportedPatching {
                    arch: codec.arch().name(),
                    patching: requested.name(),
                });
            }
        }

        log::debug!(
            "entry barrier service: {} codec, {} patching",
            codec.arch().name(),
            codec.patching_type()
        );

        Ok(Self {
            stats: AtomicEntryBarrierStats::new(config.stats_enabled),
            codec,
            epoch,
            config,
            phase: AtomicU32::new(INITIAL_PHASE),
            threads: ThreadRegistry::new(),
            patch_lock: Mutex::new(()),
        })
    }

    pub fn codec(&self) -> &Arc<dyn ArchBarrierCodec> {
        &self.codec
    }

    pub fn patching_type(&self) -> PatchingType {
        self.codec.patching_type()
    }

    pub fn epoch(&self) -> &Arc<PatchingEpoch> {
        &self.epoch
    }

    pub fn config(&self) -> &BarrierConfig {
        &self.config
    }

    /// Snapshot of the barrier counters
    pub fn stats(&self) -> EntryBarrierStats {
        self.stats.snapshot()
    }

    pub(crate) fn counters(&self) -> &AtomicEntryBarrierStats {
        &self.stats
    }

    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    /// Attach a thread trusting the current phase
    pub fn attach_thread(&self) -> Arc<ThreadBarrierState> {
        self.threads.attach(self.disarmed_guard_value())
    }

    pub fn detach_thread(&self, thread: &ThreadBarrierState) -> bool {
        self.threads.detach(thread)
    }

    /// Guard value that means "disarmed" in the current phase
    #[inline]
    pub fn disarmed_guard_value(&self) -> u32 {
        self.phase.load(Ordering::Acquire)
    }

    /// Check if `cm` was emitted with an entry barrier
    pub fn supports_entry_barrier(&self, cm: &CompiledMethod) -> bool {
        cm.kind().has_entry_barrier()
    }

    /// Locate the barrier of `cm`, verifying it when configured to
    ///
    /// Location and verification failures are encoding defects and abort.
    pub fn barrier_site(&self, cm: &CompiledMethod) -> BarrierSite {
        let site = fatal_on_err!(
            self.codec.locate(cm),
            format!("locating entry barrier of {}", cm.name())
        );

        if self.config.verify_barriers {
            if let Err(err) = self.codec.check_barrier(cm.region(), &site) {
                log_event(BarrierEvent::VerificationFailed {
                    method: cm.id(),
                    address: site.instruction,
                    message: err.to_string(),
                });
                fatal_on_err!(
                    Err::<(), _>(err),
                    format!("verifying entry barrier of {}", cm.name())
                );
            }
        }

        site
    }

    /// Check the barrier bytes of `cm` against the codec template
    ///
    /// Unlike [`Self::barrier_site`] a mismatch is returned, for on-demand
    /// cross-checks of externally compiled units.
    pub fn verify(&self, cm: &CompiledMethod) -> Result<()> {
        if !self.supports_entry_barrier(cm) {
            return Ok(());
        }
        self.codec.verify(cm)
    }

    /// Current guard word of `cm`
    ///
    /// Methods without a barrier always report the disarmed value.
    pub fn guard_value(&self, cm: &CompiledMethod) -> u32 {
        if !self.supports_entry_barrier(cm) {
            return self.disarmed_guard_value();
        }
        let site = self.barrier_site(cm);
        fatal_on_err!(
            self.codec.load_guard(cm.region(), &site),
            "loading guard word"
        )
    }

    /// Check if entering `cm` with the current phase would trap
    pub fn is_armed(&self, cm: &CompiledMethod) -> bool {
        self.guard_value(cm) != self.disarmed_guard_value()
    }

    /// Check if `cm` is permanently trapped
    pub fn is_not_entrant(&self, cm: &CompiledMethod) -> bool {
        self.supports_entry_barrier(cm) && is_sticky(self.guard_value(cm))
    }

    /// Write the bits of `value` selected by `mask` into the guard of `cm`
    ///
    /// An all-ones mask replaces the whole word unless the method is already
    /// not entrant. Partial masks run a lock-free CAS loop that preserves
    /// the unselected bits and never modifies a not-entrant guard.
    pub fn set_guard_value(&self, cm: &CompiledMethod, value: u32, mask: u32) -> PatchOutcome {
        if !self.supports_entry_barrier(cm) {
            let current = self.disarmed_guard_value();
            return PatchOutcome {
                previous: current,
                current,
                retries: 0,
            };
        }
        let site = self.barrier_site(cm);

        if mask == ALL_BITS {
            let _guard = self.patch_lock.lock();
            let current = self.load(cm, &site);
            if is_sticky(current) || current == value {
                if is_sticky(current) && value != current {
                    self.stats.record_sticky_rejection();
                }
                return PatchOutcome {
                    previous: current,
                    current,
                    retries: 0,
                };
            }
            let outcome = self.patch(cm, &site, value, ALL_BITS);
            self.note_lost_race(&outcome);
            return outcome;
        }

        let outcome = self.patch(cm, &site, value, mask);
        self.stats.record_cas_retries(outcome.retries);
        if !outcome.changed() && is_sticky(outcome.previous) {
            self.stats.record_sticky_rejection();
        }
        outcome
    }

    /// Make every thread take the slow path on its next entry into `cm`
    pub fn arm(&self, cm: &CompiledMethod) {
        if !self.supports_entry_barrier(cm) {
            return;
        }
        let site = self.barrier_site(cm);

        let _guard = self.patch_lock.lock();
        let current = self.load(cm, &site);
        if is_sticky(current) {
            self.stats.record_sticky_rejection();
            return;
        }
        if current == ARMED {
            return;
        }

        let outcome = self.patch(cm, &site, ARMED, ALL_BITS);
        if !self.note_lost_race(&outcome) {
            return;
        }
        self.stats.record_arm();
        self.trace(BarrierEvent::Armed { method: cm.id() });
    }

    /// Let threads that trust the current phase enter `cm` again
    pub fn disarm(&self, cm: &CompiledMethod) {
        self.guard_with(cm, self.disarmed_guard_value());
    }

    /// Set the guard of `cm` to `value`, unless it is not entrant
    ///
    /// Writing the current phase is a disarm. Under a strategy that requires
    /// it, the patching epoch is advanced before the guard store so every
    /// thread that acquires the new guard also sees the new epoch.
    pub fn guard_with(&self, cm: &CompiledMethod, value: u32) {
        debug_assert!(
            !is_sticky(value),
            "guard value {:#x} carries the not-entrant bit",
            value
        );
        if !self.supports_entry_barrier(cm) {
            return;
        }
        let site = self.barrier_site(cm);
        let phase = self.disarmed_guard_value();

        let _guard = self.patch_lock.lock();
        let current = self.load(cm, &site);
        if is_sticky(current) {
            self.stats.record_sticky_rejection();
            return;
        }
        if current == value {
            if value == phase {
                self.stats.record_redundant_disarm();
            }
            return;
        }

        if value == phase && self.patching_type().requires_epoch() {
            let epoch = self.epoch.advance();
            self.stats.record_epoch_bump();
            self.trace(BarrierEvent::EpochAdvanced { epoch });
        }

        let outcome = self.patch(cm, &site, value, ALL_BITS);
        if !self.note_lost_race(&outcome) {
            return;
        }
        if value == ARMED {
            self.stats.record_arm();
            self.trace(BarrierEvent::Armed { method: cm.id() });
        } else {
            self.stats.record_disarm();
            self.trace(BarrierEvent::Disarmed {
                method: cm.id(),
                value,
                epoch: self.epoch.current(),
            });
        }
    }

    /// Permanently trap `cm`
    ///
    /// Returns false if `cm` has no barrier or was already not entrant.
    pub fn make_not_entrant(&self, cm: &CompiledMethod) -> bool {
        if !self.supports_entry_barrier(cm) {
            return false;
        }
        let site = self.barrier_site(cm);

        let _guard = self.patch_lock.lock();
        if is_sticky(self.load(cm, &site)) {
            return false;
        }

        let outcome = self.patch(cm, &site, NOT_ENTRANT, ALL_BITS);
        if !outcome.changed() {
            // A masked writer set the bit first
            return false;
        }
        self.stats.record_not_entrant();
        self.trace(BarrierEvent::NotEntrant { method: cm.id() });
        true
    }

    /// Arm every method at once by advancing the phase
    ///
    /// No code is patched: methods keep their old phase in the guard and
    /// every attached thread now trusts the new one. Returns the new phase.
    pub fn arm_all(&self) -> u32 {
        let _guard = self.patch_lock.lock();
        let phase = next_phase(self.phase.load(Ordering::Relaxed));
        self.phase.store(phase, Ordering::Release);
        self.threads.for_each(|thread| thread.set_disarmed_value(phase));

        self.stats.record_global_arm();
        self.trace(BarrierEvent::ArmedAll {
            phase,
            threads: self.threads.len(),
        });
        phase
    }

    /// Model of the inline check emitted at the entry of `cm`
    ///
    /// Acquire-loads the guard and compares it with what `thread` trusts.
    /// Under concurrent instruction patching the thread's epoch must also
    /// be current, so a thread that has not fenced since the last disarm
    /// traps once.
    pub fn entry_check(&self, cm: &CompiledMethod, thread: &ThreadBarrierState) -> EntryDecision {
        if !self.supports_entry_barrier(cm) {
            return EntryDecision::Pass;
        }
        let site = self.barrier_site(cm);
        let guard = self.load_acquire(cm, &site);

        let pass = match self.patching_type() {
            PatchingType::ConcInstructionAndData => {
                (guard, self.epoch.current()) == thread.trusted_pair()
            }
            PatchingType::ConcData => {
                let pass = guard == thread.disarmed_value();
                if pass {
                    load_load_fence();
                }
                pass
            }
            PatchingType::StwInstructionAndData => guard == thread.disarmed_value(),
        };

        if pass {
            self.stats.record_fast_path();
            EntryDecision::Pass
        } else {
            EntryDecision::SlowPath
        }
    }

    /// Record `event` in the global logger when tracing is on
    pub(crate) fn trace(&self, event: BarrierEvent) {
        if self.config.trace_events {
            log_event(event);
        }
    }

    fn load(&self, cm: &CompiledMethod, site: &BarrierSite) -> u32 {
        fatal_on_err!(
            cm.region().load_relaxed(site.guard),
            "loading guard word"
        )
    }

    fn load_acquire(&self, cm: &CompiledMethod, site: &BarrierSite) -> u32 {
        fatal_on_err!(
            self.codec.load_guard(cm.region(), site),
            "loading guard word"
        )
    }

    /// Returns true if a full-word patch was applied; a guard that turned
    /// not entrant under it is counted as a rejection
    fn note_lost_race(&self, outcome: &PatchOutcome) -> bool {
        if outcome.changed() {
            return true;
        }
        if is_sticky(outcome.previous) {
            self.stats.record_sticky_rejection();
        }
        false
    }

    fn patch(&self, cm: &CompiledMethod, site: &BarrierSite, value: u32, mask: u32) -> PatchOutcome {
        let outcome = fatal_on_err!(
            self.codec.patch(cm.region(), site, value, mask),
            format!("patching entry barrier of {}", cm.name())
        );
        log::trace!(
            "guard of {} at {:#x}: {:#x} -> {:#x}",
            cm.name(),
            site.guard,
            outcome.previous,
            outcome.current
        );
        outcome
    }
}

impl std::fmt::Debug for BarrierStateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarrierStateService")
            .field("arch", &self.codec.arch())
            .field("patching", &self.codec.patching_type())
            .field("phase", &self.disarmed_guard_value())
            .field("epoch", &self.epoch.current())
            .field("threads", &self.threads.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{Backend, CodeBuffer, CodeCache, MethodKind};
    use crate::codec::{codec_for, Arch, EmitContext};

    fn service(patching: PatchingType) -> BarrierStateService {
        let config = BarrierConfig {
            verify_barriers: true,
            ..Default::default()
        };
        BarrierStateService::with_codec(
            config,
            codec_for(Arch::X86_64, Some(patching)),
            Arc::new(PatchingEpoch::new()),
        )
        .unwrap()
    }

    fn method(
        service: &BarrierStateService,
        cache: &CodeCache,
        kind: MethodKind,
    ) -> Arc<CompiledMethod> {
        let ctx = EmitContext::new(service.epoch(), 0x1000);
        let mut buf = CodeBuffer::new(Backend::Fast).with_kind(kind);
        let stub = service.codec().emit_entry_barrier(&mut buf, &ctx).unwrap();
        assert!(stub.is_none());
        buf.emit_u8(0xc3);
        cache.install("state", &buf).unwrap()
    }

    #[test]
    fn test_new_method_is_armed() {
        let service = service(PatchingType::ConcInstructionAndData);
        let cache = CodeCache::new(4096).unwrap();
        let cm = method(&service, &cache, MethodKind::Normal);

        assert_eq!(service.guard_value(&cm), ARMED);
        assert!(service.is_armed(&cm));
        assert!(!service.is_not_entrant(&cm));
    }

    #[test]
    fn test_disarm_bumps_epoch_once() {
        let service = service(PatchingType::ConcInstructionAndData);
        let cache = CodeCache::new(4096).unwrap();
        let cm = method(&service, &cache, MethodKind::Normal);

        service.disarm(&cm);
        assert!(!service.is_armed(&cm));
        assert_eq!(service.epoch().current(), 1);

        service.disarm(&cm);
        assert_eq!(service.epoch().current(), 1);
        let stats = service.stats();
        assert_eq!(stats.disarms, 1);
        assert_eq!(stats.redundant_disarms, 1);
        assert_eq!(stats.epoch_bumps, 1);
    }

    #[test]
    fn test_conc_data_disarm_keeps_epoch() {
        let service = service(PatchingType::ConcData);
        let cache = CodeCache::new(4096).unwrap();
        let cm = method(&service, &cache, MethodKind::Normal);

        service.disarm(&cm);
        assert_eq!(service.epoch().current(), 0);
    }

    #[test]
    fn test_not_entrant_is_terminal() {
        let service = service(PatchingType::ConcInstructionAndData);
        let cache = CodeCache::new(4096).unwrap();
        let cm = method(&service, &cache, MethodKind::Normal);

        service.disarm(&cm);
        assert!(service.make_not_entrant(&cm));
        assert!(!service.make_not_entrant(&cm));

        service.disarm(&cm);
        service.arm(&cm);
        service.set_guard_value(&cm, 3, ALL_BITS);
        assert_eq!(service.guard_value(&cm), NOT_ENTRANT);
        assert!(service.is_armed(&cm));
        assert_eq!(service.stats().sticky_rejections, 3);
    }

    #[test]
    fn test_intrinsics_have_no_barrier() {
        let service = service(PatchingType::ConcInstructionAndData);
        let cache = CodeCache::new(4096).unwrap();
        let cm = method(&service, &cache, MethodKind::MethodHandleIntrinsic);

        assert!(!service.supports_entry_barrier(&cm));
        assert!(!service.is_armed(&cm));
        assert!(!service.make_not_entrant(&cm));
        assert_eq!(service.guard_value(&cm), service.disarmed_guard_value());
    }

    #[test]
    fn test_arm_all_publishes_phase() {
        let service = service(PatchingType::ConcData);
        let cache = CodeCache::new(4096).unwrap();
        let cm = method(&service, &cache, MethodKind::Normal);
        let thread = service.attach_thread();

        service.disarm(&cm);
        assert_eq!(service.entry_check(&cm, &thread), EntryDecision::Pass);

        let phase = service.arm_all();
        assert_eq!(phase, INITIAL_PHASE + 1);
        assert_eq!(thread.disarmed_value(), phase);
        assert!(service.is_armed(&cm));
        assert_eq!(service.entry_check(&cm, &thread), EntryDecision::SlowPath);
    }

    #[test]
    fn test_stale_epoch_traps() {
        let service = service(PatchingType::ConcInstructionAndData);
        let cache = CodeCache::new(4096).unwrap();
        let cm = method(&service, &cache, MethodKind::Normal);
        let thread = service.attach_thread();

        service.disarm(&cm);
        assert_eq!(service.entry_check(&cm, &thread), EntryDecision::SlowPath);

        thread.observe_epoch(service.epoch().current());
        assert_eq!(service.entry_check(&cm, &thread), EntryDecision::Pass);
    }

    #[test]
    fn test_mismatched_patching_type_rejected() {
        let config = BarrierConfig {
            patching_type: Some(PatchingType::ConcData),
            ..Default::default()
        };
        let result = BarrierStateService::with_codec(
            config,
            codec_for(Arch::AArch64, Some(PatchingType::StwInstructionAndData)),
            Arc::new(PatchingEpoch::new()),
        );
        assert!(result.is_err());
    }
}
