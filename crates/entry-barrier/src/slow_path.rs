//! Slow Path - runtime side of the entry barrier stub
//!
//! A thread whose inline check failed calls the entry barrier stub, which
//! saves its frame and calls [`EntryBarrierRuntime::stub_entry_barrier`]
//! with the location of the trapped call's return address.
//!
//! Steps, in order:
//! 1. Find the method containing the return address
//! 2. Run the barrier: not-entrant methods die, armed methods go through the
//!    collector hook, which keeps them (the runtime disarms) or kills them
//! 3. If the method may run, fence once and cache the current phase and
//!    epoch in the thread so its next entry passes inline
//! 4. Otherwise rewrite the frame so the stub returns into the wrong-method
//!    resolution stub

use crate::code::{CodeCache, CompiledMethod};
use crate::deopt::Deoptimizer;
use crate::error::BarrierError;
use crate::logging::BarrierEvent;
use crate::state::BarrierStateService;
use crate::sync::cross_modify_fence;
use crate::thread::ThreadBarrierState;
use crate::{fatal_on_err, guarantee};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Collector callback for entries into armed methods
pub trait CollectorHook: Send + Sync {
    /// Re-validate `cm` before it runs
    ///
    /// Returns true if the method may run; the runtime then disarms it.
    /// Returns false if the method must not run.
    fn on_armed_entry(&self, cm: &CompiledMethod) -> bool;
}

/// Hook that keeps every method
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepAliveHook;

impl CollectorHook for KeepAliveHook {
    fn on_armed_entry(&self, _cm: &CompiledMethod) -> bool {
        true
    }
}

impl<F> CollectorHook for F
where
    F: Fn(&CompiledMethod) -> bool + Send + Sync,
{
    fn on_armed_entry(&self, cm: &CompiledMethod) -> bool {
        self(cm)
    }
}

/// What the stub does after the runtime returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StubAction {
    /// Re-enter the method body past the check
    Continue = 0,
    /// Return into the rewritten frame
    Deoptimize = 1,
}

/// Deoptimize-a-lot forces one in this many slow-path entries
const DEOPT_A_LOT_INTERVAL: u32 = 10;

/// Runtime handler behind the entry barrier stub
pub struct EntryBarrierRuntime {
    service: Arc<BarrierStateService>,
    cache: Arc<CodeCache>,
    deoptimizer: Deoptimizer,
    hook: Arc<dyn CollectorHook>,
    deopt_counter: AtomicU32,
}

impl EntryBarrierRuntime {
    /// Create a runtime that keeps every armed method
    pub fn new(service: Arc<BarrierStateService>, cache: Arc<CodeCache>) -> Self {
        let deoptimizer = Deoptimizer::new(
            service.codec().calling_convention(),
            service.config().wrong_method_stub,
        );
        Self {
            service,
            cache,
            deoptimizer,
            hook: Arc::new(KeepAliveHook),
            deopt_counter: AtomicU32::new(0),
        }
    }

    /// Replace the collector hook
    pub fn with_hook(mut self, hook: Arc<dyn CollectorHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn service(&self) -> &Arc<BarrierStateService> {
        &self.service
    }

    pub fn cache(&self) -> &Arc<CodeCache> {
        &self.cache
    }

    pub fn deoptimizer(&self) -> &Deoptimizer {
        &self.deoptimizer
    }

    /// Decide whether `cm` may run, disarming it if so
    pub fn entry_barrier(&self, cm: &CompiledMethod) -> bool {
        if !self.service.supports_entry_barrier(cm) {
            return true;
        }
        if self.service.is_not_entrant(cm) {
            return false;
        }
        if !self.service.is_armed(cm) {
            return true;
        }

        if !self.hook.on_armed_entry(cm) {
            log::debug!("collector rejected entry into {}", cm.name());
            return false;
        }
        self.service.disarm(cm);
        // The hook may have raced with make_not_entrant
        !self.service.is_not_entrant(cm)
    }

    /// Handle a trapped entry
    ///
    /// # Safety
    ///
    /// `return_slot` must point at the return address pushed by the call
    /// from a compiled method into the entry barrier stub, inside a frame
    /// laid out per the codec's calling convention. `thread` must be the
    /// calling thread's state.
    pub unsafe fn stub_entry_barrier(
        &self,
        thread: &ThreadBarrierState,
        return_slot: *mut usize,
    ) -> StubAction {
        let return_address = return_slot.read();
        let cm = fatal_on_err!(
            self.cache
                .find(return_address)
                .ok_or(BarrierError::UnknownCodeAddress {
                    address: return_address
                }),
            "entry barrier stub"
        );

        self.service.counters().record_slow_path();
        self.service.trace(BarrierEvent::SlowPathEntry {
            method: cm.id(),
            thread: thread.id(),
            guard: self.service.guard_value(&cm),
        });

        let mut may_enter = self.entry_barrier(&cm);
        if may_enter {
            // Another thread may have disarmed and patched the method; the
            // guard told us so through data, fence before running it.
            self.trust_current(thread);

            if self.service.config().deoptimize_a_lot && !cm.is_osr() {
                let count = self.deopt_counter.fetch_add(1, Ordering::Relaxed) + 1;
                if count % DEOPT_A_LOT_INTERVAL == 0 {
                    may_enter = false;
                }
            }
        }

        if may_enter {
            return StubAction::Continue;
        }

        guarantee!(
            !cm.is_osr(),
            "OSR method {} must be entrant after migration",
            cm.name()
        );
        let rewrite = self.deoptimizer.deoptimize(&cm, return_slot);
        self.service.counters().record_deoptimization();
        self.service.trace(BarrierEvent::Deoptimized {
            method: cm.id(),
            sender_sp: rewrite.sender_sp,
            resume_pc: rewrite.resume_pc,
        });
        StubAction::Deoptimize
    }

    /// Run the barrier of an OSR method from the runtime before migrating
    /// into it
    pub fn osr_entry_barrier(&self, thread: &ThreadBarrierState, cm: &CompiledMethod) -> bool {
        debug_assert!(cm.is_osr(), "{} is not an OSR method", cm.name());
        let may_enter = self.entry_barrier(cm);
        if may_enter {
            self.trust_current(thread);
        }
        may_enter
    }

    /// Fence and cache the current phase and epoch in `thread`
    fn trust_current(&self, thread: &ThreadBarrierState) {
        let epoch = self.service.epoch().current();
        cross_modify_fence();
        thread.set_disarmed_value(self.service.disarmed_guard_value());
        thread.observe_epoch(epoch);
    }
}

impl std::fmt::Debug for EntryBarrierRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryBarrierRuntime")
            .field("service", &self.service)
            .field("methods", &self.cache.len())
            .field("deoptimizer", &self.deoptimizer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{Backend, CodeBuffer};
    use crate::codec::{codec_for, Arch, EmitContext, PatchingType};
    use crate::config::BarrierConfig;
    use crate::deopt::DEOPT_COOKIE;
    use crate::epoch::PatchingEpoch;
    use crate::state::EntryDecision;

    const STUB: usize = 0x7777_0000;

    fn runtime(deoptimize_a_lot: bool) -> EntryBarrierRuntime {
        let config = BarrierConfig {
            verify_barriers: true,
            deoptimize_a_lot,
            wrong_method_stub: STUB,
            ..Default::default()
        };
        let service = BarrierStateService::with_codec(
            config,
            codec_for(Arch::X86_64, Some(PatchingType::ConcInstructionAndData)),
            Arc::new(PatchingEpoch::new()),
        )
        .unwrap();
        EntryBarrierRuntime::new(Arc::new(service), Arc::new(CodeCache::new(8192).unwrap()))
    }

    fn install(rt: &EntryBarrierRuntime, osr: bool) -> Arc<CompiledMethod> {
        let ctx = EmitContext::new(rt.service().epoch(), 0x1000);
        let mut buf = CodeBuffer::new(Backend::Fast)
            .with_osr(osr)
            .with_frame_size_words(4);
        let stub = rt.service().codec().emit_entry_barrier(&mut buf, &ctx).unwrap();
        assert!(stub.is_none());
        buf.emit_bytes(&[0x90; 8]);
        buf.emit_u8(0xc3);
        rt.cache().install("slow", &buf).unwrap()
    }

    fn trapped_stack(cm: &CompiledMethod) -> (Vec<usize>, usize) {
        let mut stack = vec![0usize; 32];
        let ra = 8;
        stack[ra - 1] = DEOPT_COOKIE;
        stack[ra] = cm.code_begin() + cm.frame_complete_offset();
        stack[ra + 3] = 0xfeed;
        stack[ra + 4] = 0xca11;
        (stack, ra)
    }

    #[test]
    fn test_armed_entry_disarms_and_refreshes_thread() {
        let rt = runtime(false);
        let cm = install(&rt, false);
        let thread = rt.service().attach_thread();
        let (mut stack, ra) = trapped_stack(&cm);

        assert_eq!(rt.service().entry_check(&cm, &thread), EntryDecision::SlowPath);
        let action = unsafe { rt.stub_entry_barrier(&thread, stack.as_mut_ptr().add(ra)) };

        assert_eq!(action, StubAction::Continue);
        assert!(!rt.service().is_armed(&cm));
        assert_eq!(thread.epoch(), rt.service().epoch().current());
        assert_eq!(rt.service().entry_check(&cm, &thread), EntryDecision::Pass);
    }

    #[test]
    fn test_not_entrant_deoptimizes() {
        let rt = runtime(false);
        let cm = install(&rt, false);
        let thread = rt.service().attach_thread();
        rt.service().make_not_entrant(&cm);
        let (mut stack, ra) = trapped_stack(&cm);

        let action = unsafe { rt.stub_entry_barrier(&thread, stack.as_mut_ptr().add(ra)) };

        assert_eq!(action, StubAction::Deoptimize);
        assert_eq!(stack[ra + 3], STUB);
        assert_eq!(rt.service().stats().deoptimizations, 1);
    }

    #[test]
    fn test_rejecting_hook_keeps_method_armed() {
        let rt = runtime(false).with_hook(Arc::new(|_: &CompiledMethod| false));
        let cm = install(&rt, false);
        assert!(!rt.entry_barrier(&cm));
        assert!(rt.service().is_armed(&cm));
    }

    #[test]
    fn test_deoptimize_a_lot_every_tenth_entry() {
        let rt = runtime(true);
        let cm = install(&rt, false);
        let thread = rt.service().attach_thread();

        let mut deopts = 0;
        for _ in 0..20 {
            let (mut stack, ra) = trapped_stack(&cm);
            let action = unsafe { rt.stub_entry_barrier(&thread, stack.as_mut_ptr().add(ra)) };
            if action == StubAction::Deoptimize {
                deopts += 1;
            }
        }
        assert_eq!(deopts, 2);
    }

    #[test]
    fn test_osr_entry_barrier() {
        let rt = runtime(true);
        let cm = install(&rt, true);
        let thread = rt.service().attach_thread();

        assert!(rt.osr_entry_barrier(&thread, &cm));
        assert!(!rt.service().is_armed(&cm));
        assert_eq!(rt.service().entry_check(&cm, &thread), EntryDecision::Pass);

        rt.service().make_not_entrant(&cm);
        assert!(!rt.osr_entry_barrier(&thread, &cm));
    }

    #[test]
    #[should_panic(expected = "entry barrier stub")]
    fn test_unknown_return_address_is_fatal() {
        let rt = runtime(false);
        let thread = rt.service().attach_thread();
        let mut slot = [0x10usize];
        unsafe { rt.stub_entry_barrier(&thread, slot.as_mut_ptr()) };
    }
}
