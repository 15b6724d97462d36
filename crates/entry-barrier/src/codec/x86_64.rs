//! x86_64 Entry Barrier
//!
//! The barrier compares the thread's disarmed value with an immediate that
//! doubles as the guard word:
//!
//! ```text
//! cmp dword [r15 + disp8], imm32    41 81 7F disp8 imm32   (4-byte aligned)
//!
//! optimizing:  jne  <out-of-line stub>   0F 85 rel32        -14 from frame complete
//! fast:        je   <frame complete>     74 05              -15 from frame complete
//!              call <entry barrier stub> E8 rel32
//! ```
//!
//! Aligning the `cmp` to 4 bytes aligns the immediate, so a guard patch is a
//! single aligned 32-bit store that never straddles a cache line. Instruction
//! and data caches are coherent; the slow path's cross-modify fence is all a
//! thread needs before running patched code.

use super::{
    mismatch, offset_address, ArchBarrierCodec, Arch, BarrierSite, EmitContext, EntryStub,
    PatchingType,
};
use crate::code::{Backend, CodeBuffer, CodeRegion, CompiledMethod};
use crate::deopt::CallingConvention;
use crate::error::{BarrierError, Result};
use crate::guard::ARMED;

const CMP_PREFIX: u8 = 0x41; // REX.B: r15 base
const CMP_OPCODE: u8 = 0x81; // cmp r/m32, imm32
const CMP_MODRM: u8 = 0x7f; // [r15 + disp8], /7
const CMP_SIZE: usize = 8;
const GUARD_OFFSET: usize = 4;

const JNE_REL32: [u8; 2] = [0x0f, 0x85];
const JE_REL8: u8 = 0x74;
const CALL_REL32: u8 = 0xe8;
const JMP_REL32: u8 = 0xe9;
const NOP: u8 = 0x90;

const CALL_SIZE: usize = 5;
const JCC_REL32_SIZE: usize = 6;

#[derive(Debug, Clone)]
pub struct X86_64Codec {
    patching: PatchingType,
}

impl X86_64Codec {
    pub fn new(patching: PatchingType) -> Self {
        Self { patching }
    }
}

impl Default for X86_64Codec {
    fn default() -> Self {
        Self::new(PatchingType::ConcInstructionAndData)
    }
}

impl ArchBarrierCodec for X86_64Codec {
    fn arch(&self) -> Arch {
        Arch::X86_64
    }

    fn patching_type(&self) -> PatchingType {
        self.patching
    }

    fn entry_barrier_offset(&self, cm: &CompiledMethod) -> isize {
        if cm.produced_by_optimizing_backend() {
            -14
        } else {
            -15
        }
    }

    fn locate(&self, cm: &CompiledMethod) -> Result<BarrierSite> {
        let instruction = if cm.is_external() {
            let offset = cm
                .entry_patch_offset()
                .ok_or(BarrierError::MissingRelocation {
                    method: cm.id(),
                    kind: "entry patch offset",
                })?;
            cm.code_begin() + offset
        } else {
            offset_address(
                cm.code_begin() + cm.frame_complete_offset(),
                self.entry_barrier_offset(cm),
            )
        };

        Ok(BarrierSite {
            instruction,
            guard: instruction + GUARD_OFFSET,
        })
    }

    fn check_barrier(&self, region: &CodeRegion, site: &BarrierSite) -> Result<()> {
        if site.instruction & 0x3 != 0 {
            return Err(mismatch(site.instruction, "barrier is not properly aligned"));
        }

        let bytes = region
            .read_bytes(site.instruction, CMP_SIZE)
            .map_err(|_| mismatch(site.instruction, "barrier address outside the code region"))?;

        if bytes[0] != CMP_PREFIX {
            return Err(mismatch(
                site.instruction,
                format!("expected prefix {:#04x}, found {:#04x}", CMP_PREFIX, bytes[0]),
            ));
        }
        if bytes[1] != CMP_OPCODE {
            return Err(mismatch(
                site.instruction + 1,
                format!("expected opcode {:#04x}, found {:#04x}", CMP_OPCODE, bytes[1]),
            ));
        }
        if bytes[2] != CMP_MODRM {
            return Err(mismatch(
                site.instruction + 2,
                format!("expected modrm {:#04x}, found {:#04x}", CMP_MODRM, bytes[2]),
            ));
        }
        Ok(())
    }

    fn guard_in_instruction_stream(&self) -> bool {
        true
    }

    fn calling_convention(&self) -> CallingConvention {
        CallingConvention::x86_64()
    }

    fn emit_entry_barrier(
        &self,
        buf: &mut CodeBuffer,
        ctx: &EmitContext,
    ) -> Result<Option<EntryStub>> {
        let disp = u8::try_from(ctx.thread_disarmed_offset)
            .ok()
            .filter(|d| *d < 0x80)
            .ok_or_else(|| {
                BarrierError::Internal(format!(
                    "thread offset {} does not fit a disp8",
                    ctx.thread_disarmed_offset
                ))
            })?;

        buf.align(4, NOP);
        let start = buf.pc();
        buf.emit_bytes(&[CMP_PREFIX, CMP_OPCODE, CMP_MODRM, disp]);
        buf.emit_u32(ARMED);

        match buf.backend() {
            Backend::Optimizing => {
                let branch_at = buf.pc();
                buf.emit_bytes(&JNE_REL32);
                buf.emit_u32(0);
                buf.mark_frame_complete();
                Ok(Some(EntryStub {
                    branch_at,
                    continuation: buf.pc(),
                }))
            }
            Backend::Fast | Backend::External => {
                buf.emit_bytes(&[JE_REL8, CALL_SIZE as u8]);
                // Runtime call displacement is bound by the linker
                buf.emit_u8(CALL_REL32);
                buf.emit_u32(0);
                buf.mark_frame_complete();
                if buf.backend() == Backend::External {
                    buf.set_entry_patch_offset(start);
                }
                Ok(None)
            }
        }
    }

    fn emit_entry_stub(
        &self,
        buf: &mut CodeBuffer,
        stub: EntryStub,
        _ctx: &EmitContext,
    ) -> Result<()> {
        let entry = buf.pc();
        let rel = entry as i64 - (stub.branch_at + JCC_REL32_SIZE) as i64;
        buf.patch_u32(stub.branch_at + 2, rel as i32 as u32);

        buf.emit_u8(CALL_REL32);
        buf.emit_u32(0);

        buf.emit_u8(JMP_REL32);
        let back = stub.continuation as i64 - (buf.pc() + 4) as i64;
        buf.emit_u32(back as i32 as u32);
        Ok(())
    }
}
