//! Test Utilities for the Entry Barrier Test Suite
//!
//! Fixtures build a private service (own epoch, own code cache) so tests
//! never observe each other's epoch bumps or phase changes.

#![allow(dead_code)]

use entry_barrier::{
    codec_for, Arch, Backend, BarrierConfig, BarrierStateService, CodeBuffer, CodeCache,
    CompiledMethod, EmitContext, EntryBarrierRuntime, MethodKind, PatchingEpoch, PatchingType,
    ThreadBarrierState, DEOPT_COOKIE,
};
use std::sync::Arc;

/// Code cache size for tests (256KB)
pub const CODE_CACHE_SIZE: usize = 256 * 1024;

/// Address written by the deoptimizer in tests
pub const WRONG_METHOD_STUB: usize = 0x5eed_0000;

/// Address the emitted slow path calls
pub const ENTRY_BARRIER_STUB: usize = 0x5eed_1000;

/// Rounds per thread in race tests
pub const TEST_ITERATIONS: usize = 1000;

/// Frame size of every fixture method, in words
pub const FRAME_SIZE_WORDS: usize = 4;

/// Private barrier service, code cache and slow-path runtime
pub struct BarrierFixture {
    pub runtime: EntryBarrierRuntime,
    pub arch: Arch,
}

impl BarrierFixture {
    /// x86_64 codec with concurrent instruction patching
    pub fn new() -> Self {
        Self::with(Arch::X86_64, PatchingType::ConcInstructionAndData)
    }

    pub fn with(arch: Arch, patching: PatchingType) -> Self {
        Self::with_config(
            arch,
            BarrierConfig {
                patching_type: Some(patching),
                verify_barriers: true,
                wrong_method_stub: WRONG_METHOD_STUB,
                ..Default::default()
            },
        )
    }

    pub fn with_config(arch: Arch, config: BarrierConfig) -> Self {
        let codec = codec_for(arch, config.patching_type);
        let service = BarrierStateService::with_codec(config, codec, Arc::new(PatchingEpoch::new()))
            .expect("fixture service should build");
        let cache = CodeCache::new(CODE_CACHE_SIZE).expect("fixture code cache should map");
        Self {
            runtime: EntryBarrierRuntime::new(Arc::new(service), Arc::new(cache)),
            arch,
        }
    }

    pub fn service(&self) -> &BarrierStateService {
        self.runtime.service()
    }

    pub fn cache(&self) -> &CodeCache {
        self.runtime.cache()
    }

    /// Emit and install a method the way the code generator would
    pub fn install(&self, name: &str, backend: Backend) -> Arc<CompiledMethod> {
        self.install_with(name, CodeBuffer::new(backend))
    }

    pub fn install_kind(&self, name: &str, kind: MethodKind) -> Arc<CompiledMethod> {
        self.install_with(name, CodeBuffer::new(Backend::Fast).with_kind(kind))
    }

    pub fn install_osr(&self, name: &str) -> Arc<CompiledMethod> {
        self.install_with(name, CodeBuffer::new(Backend::Fast).with_osr(true))
    }

    fn install_with(&self, name: &str, buf: CodeBuffer) -> Arc<CompiledMethod> {
        let mut buf = buf.with_frame_size_words(FRAME_SIZE_WORDS);
        let codec = self.service().codec();
        let ctx = EmitContext::new(self.service().epoch(), ENTRY_BARRIER_STUB);

        let stub = codec
            .emit_entry_barrier(&mut buf, &ctx)
            .expect("barrier template should emit");
        // Method body
        for _ in 0..4 {
            buf.emit_u32(0);
        }
        if let Some(stub) = stub {
            codec
                .emit_entry_stub(&mut buf, stub, &ctx)
                .expect("out-of-line stub should emit");
        }
        self.cache().install(name, &buf).expect("method should install")
    }

    /// Arm every method until the current phase is `phase`
    pub fn advance_to_phase(&self, phase: u32) {
        while self.service().disarmed_guard_value() != phase {
            self.service().arm_all();
        }
    }

    /// Run the stub slow path for a trapped entry into `cm` on a synthetic
    /// stack laid out per this fixture's calling convention
    pub fn trap(&self, thread: &ThreadBarrierState, cm: &CompiledMethod) -> TrappedCall {
        let mut call = TrappedCall::new(self.arch, cm);
        let slot = call.return_slot();
        call.action = Some(unsafe { self.runtime.stub_entry_barrier(thread, slot) });
        call
    }
}

/// Synthetic stack of a call that trapped in the entry barrier
pub struct TrappedCall {
    pub stack: Vec<usize>,
    /// Index of the return-address slot
    pub ra: usize,
    pub action: Option<entry_barrier::StubAction>,
}

/// Caller frame pointer planted in synthetic stacks
pub const CALLER_FP: usize = 0xfeed_f00d;

/// Caller return address planted in synthetic stacks
pub const CALLER_PC: usize = 0xca11_e400;

impl TrappedCall {
    pub fn new(arch: Arch, cm: &CompiledMethod) -> Self {
        let mut stack = vec![0usize; 64];
        let ra = 16;
        stack[ra] = cm.code_begin() + cm.frame_complete_offset();

        match arch {
            Arch::X86_64 => {
                stack[ra - 2] = 0x0bad_0bad;
                stack[ra - 1] = DEOPT_COOKIE;
                let callers_sp = ra + FRAME_SIZE_WORDS;
                stack[callers_sp - 1] = CALLER_FP;
                stack[callers_sp] = CALLER_PC;
            }
            Arch::AArch64 | Arch::RiscV64 => {
                let sender_sp = ra + 1 + FRAME_SIZE_WORDS;
                stack[sender_sp - 2] = CALLER_FP;
                stack[sender_sp - 1] = CALLER_PC;
            }
        }

        Self {
            stack,
            ra,
            action: None,
        }
    }

    pub fn return_slot(&mut self) -> *mut usize {
        unsafe { self.stack.as_mut_ptr().add(self.ra) }
    }

    /// Address of stack slot `index`
    pub fn slot_address(&self, index: usize) -> usize {
        self.stack.as_ptr() as usize + index * std::mem::size_of::<usize>()
    }
}

/// Overwrite the first barrier instruction word of `cm`
pub fn corrupt_barrier(fixture: &BarrierFixture, cm: &CompiledMethod) {
    let site = fixture
        .service()
        .codec()
        .locate(cm)
        .expect("barrier should be locatable");
    unsafe {
        cm.region()
            .write_bytes(site.instruction, &[0xff, 0xff, 0xff, 0xff])
            .expect("barrier address should be inside the region");
    }
}

/// Every (arch, patching type) pair
pub fn all_codec_configs() -> Vec<(Arch, PatchingType)> {
    let mut configs = Vec::new();
    for arch in [Arch::X86_64, Arch::AArch64, Arch::RiscV64] {
        for patching in [
            PatchingType::StwInstructionAndData,
            PatchingType::ConcInstructionAndData,
            PatchingType::ConcData,
        ] {
            configs.push((arch, patching));
        }
    }
    configs
}
