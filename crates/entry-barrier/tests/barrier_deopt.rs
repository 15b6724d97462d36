//! Deoptimization Tests - stack rewrites through the stub slow path
//!
//! Synthetic stacks stand in for the frames the entry barrier stub saves.

mod common;

use common::{BarrierFixture, TrappedCall, CALLER_FP, CALLER_PC, FRAME_SIZE_WORDS, WRONG_METHOD_STUB};
use entry_barrier::{
    Arch, Backend, BarrierConfig, CallingConvention, CompiledMethod, PatchingType, StubAction,
};
use std::sync::Arc;

/// Cookie layout: the stub pops the caller's rbp, reloads rsp from the
/// cookie and jumps to the wrong-method stub
#[test]
fn test_x86_64_cookie_rewrite() {
    let fixture = BarrierFixture::new();
    let service = fixture.service();
    let cm = fixture.install("x86_deopt", Backend::Optimizing);
    let thread = service.attach_thread();
    service.make_not_entrant(&cm);

    let call = fixture.trap(&thread, &cm);

    assert_eq!(call.action, Some(StubAction::Deoptimize));
    let callers_sp = call.ra + FRAME_SIZE_WORDS;
    assert_eq!(call.stack[call.ra - 2], CALLER_FP);
    assert_eq!(call.stack[call.ra - 1], call.slot_address(callers_sp));
    assert_eq!(call.stack[callers_sp - 1], WRONG_METHOD_STUB);
    assert_eq!(call.stack[callers_sp], CALLER_PC);
}

/// Frame record layout: `{sp, fp, lr, pc}` below the return slot
#[test]
fn test_frame_record_rewrite() {
    for arch in [Arch::AArch64, Arch::RiscV64] {
        let fixture = BarrierFixture::with(arch, PatchingType::ConcInstructionAndData);
        let service = fixture.service();
        assert!(matches!(
            service.codec().calling_convention(),
            CallingConvention::FrameRecord { .. }
        ));

        let cm = fixture.install("record_deopt", Backend::Fast);
        let thread = service.attach_thread();
        service.make_not_entrant(&cm);

        let call = fixture.trap(&thread, &cm);

        assert_eq!(call.action, Some(StubAction::Deoptimize), "{:?}", arch);
        let sender_sp = call.ra + 1 + FRAME_SIZE_WORDS;
        assert_eq!(call.stack[call.ra - 5], call.slot_address(sender_sp));
        assert_eq!(call.stack[call.ra - 4], CALLER_FP);
        assert_eq!(call.stack[call.ra - 3], CALLER_PC);
        assert_eq!(call.stack[call.ra - 2], WRONG_METHOD_STUB);
        // Caller's saved registers stay intact
        assert_eq!(call.stack[sender_sp - 2], CALLER_FP);
        assert_eq!(call.stack[sender_sp - 1], CALLER_PC);
    }
}

/// A hook that rejects the method sends the call to resolution without
/// making the method not entrant
#[test]
fn test_rejecting_hook_deoptimizes() {
    let fixture = BarrierFixture::new();
    let fixture = BarrierFixture {
        runtime: fixture.runtime.with_hook(Arc::new(|cm: &CompiledMethod| {
            !cm.name().starts_with("unloaded")
        })),
        arch: fixture.arch,
    };
    let service = fixture.service();
    let thread = service.attach_thread();
    let live = fixture.install("live", Backend::Fast);
    let dead = fixture.install("unloaded_class_method", Backend::Fast);

    assert_eq!(fixture.trap(&thread, &live).action, Some(StubAction::Continue));
    assert_eq!(fixture.trap(&thread, &dead).action, Some(StubAction::Deoptimize));

    assert!(!service.is_armed(&live));
    assert!(service.is_armed(&dead));
    assert!(!service.is_not_entrant(&dead));
}

/// Diagnostic mode forces one in ten entries of a live method through
/// resolution
#[test]
fn test_deoptimize_a_lot() {
    let fixture = BarrierFixture::with_config(
        Arch::X86_64,
        BarrierConfig {
            deoptimize_a_lot: true,
            verify_barriers: true,
            wrong_method_stub: WRONG_METHOD_STUB,
            ..Default::default()
        },
    );
    let cm = fixture.install("stress", Backend::Fast);
    let thread = fixture.service().attach_thread();

    let actions: Vec<_> = (0..30)
        .map(|_| fixture.trap(&thread, &cm).action)
        .collect();
    let deopts = actions
        .iter()
        .filter(|a| **a == Some(StubAction::Deoptimize))
        .count();

    assert_eq!(deopts, 3);
    assert_eq!(actions[9], Some(StubAction::Deoptimize));
    assert_eq!(fixture.service().stats().deoptimizations, 3);
}

/// OSR methods are exempt from diagnostic deoptimization
#[test]
fn test_deoptimize_a_lot_skips_osr() {
    let fixture = BarrierFixture::with_config(
        Arch::X86_64,
        BarrierConfig {
            deoptimize_a_lot: true,
            verify_barriers: true,
            wrong_method_stub: WRONG_METHOD_STUB,
            ..Default::default()
        },
    );
    let cm = fixture.install_osr("stress_osr");
    let thread = fixture.service().attach_thread();

    for _ in 0..30 {
        assert_eq!(fixture.trap(&thread, &cm).action, Some(StubAction::Continue));
    }
}

/// A return address outside every method is a defect
#[test]
#[should_panic(expected = "No compiled method contains address")]
fn test_unknown_return_address_aborts() {
    let fixture = BarrierFixture::new();
    let cm = fixture.install("elsewhere", Backend::Fast);
    let thread = fixture.service().attach_thread();

    let mut call = TrappedCall::new(Arch::X86_64, &cm);
    call.stack[call.ra] = cm.code_end() + 0x10_0000;
    let slot = call.return_slot();
    unsafe { fixture.runtime.stub_entry_barrier(&thread, slot) };
}
