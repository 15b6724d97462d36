//! Codec Module - Per-Architecture Barrier Encoding
//!
//! Every target instruction set emits its entry barrier differently. The
//! [`ArchBarrierCodec`] trait isolates the three things that differ:
//!
//! - **locate**: where the barrier instruction and its guard word live,
//!   relative to the method's frame-complete point or published through a
//!   relocation
//! - **verify**: whether the bytes at that address match the template the
//!   generator is contracted to emit
//! - **patch**: writing the guard word, including the masked CAS loop and
//!   any instruction-cache maintenance
//!
//! Everything above the codec (arm/disarm state machine, epochs, per-thread
//! values) is architecture independent and lives in [`crate::state`].
//!
//! Each codec also carries a reference emitter that writes its barrier
//! template into a [`CodeBuffer`]. It documents the producer contract and
//! provides fixtures for verification; the codecs are pure byte encoders so
//! every codec can be exercised on every host.

pub mod aarch64;
pub mod riscv64;
pub mod x86_64;

pub use aarch64::AArch64Codec;
pub use riscv64::RiscV64Codec;
pub use x86_64::X86_64Codec;

use crate::code::{CodeBuffer, CodeRegion, CompiledMethod};
use crate::deopt::CallingConvention;
use crate::epoch::PatchingEpoch;
use crate::error::{BarrierError, Result};
use crate::guard::{is_sticky, merge_masked};
use crate::thread::ThreadBarrierState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// How concurrently running threads observe a guard change
///
/// The strategy decides the template length (and therefore the barrier
/// offset) and whether a disarm must advance the patching epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatchingType {
    /// Guards change only while all threads are stopped
    StwInstructionAndData,
    /// Guards change concurrently and disarming may publish patched code;
    /// threads pay a cross-modify fence once per epoch
    ConcInstructionAndData,
    /// Guards change concurrently but only data is published; a load-load
    /// fence after the guard load is enough
    ConcData,
}

impl PatchingType {
    pub fn name(self) -> &'static str {
        match self {
            PatchingType::StwInstructionAndData => "stw",
            PatchingType::ConcInstructionAndData => "conc_instruction_and_data",
            PatchingType::ConcData => "conc_data",
        }
    }

    /// Check if a disarm under this strategy must advance the epoch first
    pub fn requires_epoch(self) -> bool {
        self == PatchingType::ConcInstructionAndData
    }

    /// Parse the configuration name of a strategy
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "stw" | "stw_instruction_and_data" => Some(PatchingType::StwInstructionAndData),
            "conc_instruction_and_data" => Some(PatchingType::ConcInstructionAndData),
            "conc_data" => Some(PatchingType::ConcData),
            _ => None,
        }
    }
}

impl fmt::Display for PatchingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Target instruction set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arch {
    X86_64,
    AArch64,
    RiscV64,
}

impl Arch {
    pub fn name(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::AArch64 => "aarch64",
            Arch::RiscV64 => "riscv64",
        }
    }

    /// Instruction set of the running process, if a codec exists for it
    pub fn host() -> Option<Arch> {
        if cfg!(target_arch = "x86_64") {
            Some(Arch::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Arch::AArch64)
        } else if cfg!(target_arch = "riscv64") {
            Some(Arch::RiscV64)
        } else {
            None
        }
    }
}

/// Resolved addresses of one method's barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierSite {
    /// First instruction of the barrier sequence
    pub instruction: usize,
    /// The 32-bit guard word
    pub guard: usize,
}

/// Result of a guard patch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchOutcome {
    /// Guard value before the patch
    pub previous: u32,
    /// Guard value after the patch
    pub current: u32,
    /// Failed compare-and-swap attempts
    pub retries: u32,
}

impl PatchOutcome {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Addresses a reference emitter bakes into the template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitContext {
    /// Offset of the disarmed value (and the paired epoch word after it)
    /// from the thread register
    pub thread_disarmed_offset: usize,
    /// Address of the process-wide epoch counter
    pub epoch_address: usize,
    /// Runtime stub the slow path calls
    pub entry_barrier_stub: usize,
}

impl EmitContext {
    pub fn new(epoch: &PatchingEpoch, entry_barrier_stub: usize) -> Self {
        Self {
            thread_disarmed_offset: ThreadBarrierState::disarmed_value_offset(),
            epoch_address: epoch.address(),
            entry_barrier_stub,
        }
    }
}

/// Out-of-line slow path still to be emitted after the method body
///
/// Returned by [`ArchBarrierCodec::emit_entry_barrier`] for the optimizing
/// backend, consumed by [`ArchBarrierCodec::emit_entry_stub`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "the out-of-line stub must be emitted before installation"]
pub struct EntryStub {
    /// Offset of the branch that jumps to the stub
    pub branch_at: usize,
    /// Offset the stub returns to (the frame-complete point)
    pub continuation: usize,
}

/// Locate, verify and patch entry barriers for one instruction set
pub trait ArchBarrierCodec: Send + Sync + fmt::Debug {
    fn arch(&self) -> Arch;

    fn patching_type(&self) -> PatchingType;

    /// Signed byte distance from the frame-complete point to the first
    /// barrier instruction
    ///
    /// Externally compiled units are located through their recorded
    /// `entry_patch_offset` instead; for them this reports the layout of
    /// the inline (fast backend) template they embed.
    fn entry_barrier_offset(&self, cm: &CompiledMethod) -> isize;

    /// Resolve the barrier instruction and guard word addresses
    fn locate(&self, cm: &CompiledMethod) -> Result<BarrierSite>;

    /// Compare the instruction bytes at `site` against the template
    fn check_barrier(&self, region: &CodeRegion, site: &BarrierSite) -> Result<()>;

    /// Check if the guard word is an instruction immediate
    ///
    /// Patching such a guard is followed by instruction-cache maintenance.
    fn guard_in_instruction_stream(&self) -> bool;

    /// Frame layout the deoptimizer must rewrite for this instruction set
    fn calling_convention(&self) -> CallingConvention;

    /// Emit the barrier template ending at the frame-complete point
    ///
    /// Marks the frame-complete offset in `buf`. Returns the pending
    /// out-of-line stub for the optimizing backend.
    fn emit_entry_barrier(
        &self,
        buf: &mut CodeBuffer,
        ctx: &EmitContext,
    ) -> Result<Option<EntryStub>>;

    /// Emit the out-of-line slow path for the optimizing backend
    fn emit_entry_stub(&self, buf: &mut CodeBuffer, stub: EntryStub, ctx: &EmitContext)
        -> Result<()>;

    /// Locate the barrier and check it against the template
    fn verify(&self, cm: &CompiledMethod) -> Result<()> {
        let site = self.locate(cm)?;
        self.check_barrier(cm.region(), &site)
    }

    /// Load the guard word with acquire ordering
    fn load_guard(&self, region: &CodeRegion, site: &BarrierSite) -> Result<u32> {
        region.load_acquire(site.guard)
    }

    /// Write `value` into the bits of the guard selected by `mask`
    ///
    /// Runs a compare-and-swap loop from the observed guard, so bits a
    /// concurrent writer sets in the meantime are merged rather than
    /// overwritten. The loop stops as soon as the merged value equals the
    /// observed one, or the observed guard is not entrant; an all-ones mask
    /// therefore never clears a not-entrant bit it raced with. Bits of
    /// `value` outside `mask` are a caller bug.
    fn patch(
        &self,
        region: &CodeRegion,
        site: &BarrierSite,
        value: u32,
        mask: u32,
    ) -> Result<PatchOutcome> {
        debug_assert!(
            value & !mask == 0,
            "guard value {:#x} has bits outside mask {:#x}",
            value,
            mask
        );

        let mut old = region.load_relaxed(site.guard)?;
        let mut retries = 0;
        let outcome = loop {
            let new = merge_masked(old, value, mask);
            if new == old || is_sticky(old) {
                break PatchOutcome {
                    previous: old,
                    current: old,
                    retries,
                };
            }
            match region.compare_exchange(site.guard, old, new)? {
                Ok(_) => {
                    break PatchOutcome {
                        previous: old,
                        current: new,
                        retries,
                    }
                }
                Err(actual) => {
                    old = actual;
                    retries += 1;
                }
            }
        };

        if outcome.changed() && self.guard_in_instruction_stream() {
            region.sync_icache(site.guard, 4)?;
        }

        Ok(outcome)
    }
}

/// Codec for `arch` using `patching`, or the instruction set's default
pub fn codec_for(arch: Arch, patching: Option<PatchingType>) -> Arc<dyn ArchBarrierCodec> {
    let patching = patching.unwrap_or(PatchingType::ConcInstructionAndData);
    match arch {
        Arch::X86_64 => Arc::new(X86_64Codec::new(patching)),
        Arch::AArch64 => Arc::new(AArch64Codec::new(patching)),
        Arch::RiscV64 => Arc::new(RiscV64Codec::new(patching)),
    }
}

/// Codec for the running process
pub fn host_codec(patching: Option<PatchingType>) -> Result<Arc<dyn ArchBarrierCodec>> {
    match Arch::host() {
        Some(arch) => Ok(codec_for(arch, patching)),
        None => Err(BarrierError::UnsupportedPatching {
            arch: std::env::consts::ARCH,
            patching: patching.map_or("default", PatchingType::name),
        }),
    }
}

/// Build an encoding mismatch error for `address`
pub(crate) fn mismatch(address: usize, message: impl Into<String>) -> BarrierError {
    BarrierError::EncodingMismatch {
        address,
        message: message.into(),
    }
}

/// Read a little-endian instruction word, reporting out-of-range sites as
/// encoding mismatches
pub(crate) fn read_insn(region: &CodeRegion, address: usize) -> Result<u32> {
    region
        .read_u32(address)
        .map_err(|_| mismatch(address, "barrier address outside the code region"))
}

/// Apply a signed offset to an address
pub(crate) fn offset_address(base: usize, offset: isize) -> usize {
    base.wrapping_add_signed(offset)
}
