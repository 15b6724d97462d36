//! AArch64 Entry Barrier
//!
//! The guard is a data word in the code section loaded with a pc-relative
//! `ldr w8, <guard>`, which is the first instruction of every template:
//!
//! ```text
//! stw:                        conc_data:              conc_instruction_and_data:
//!   ldr  w8, guard              ldr  w8, guard          ldr  w8, guard
//!   ldr  w9, [x28, #dv]         dmb  ishld              movz/movk/movk x9, &epoch
//!   cmp  w8, w9                 ldr  w9, [x28, #dv]     orr  x9, x9, x8, lsr #32
//!   b.eq skip                   cmp  w8, w9             ldr  w9, [x9]
//!                               b.eq skip               orr  x8, x8, x9, lsl #32
//!                                                       ldr  x9, [x28, #dv]
//!                                                       cmp  x8, x9
//!                                                       b.eq skip
//!
//! fast backend (inline slow path):   optimizing backend:
//!   movz/movk/movk x8, stub            b.ne <out-of-line stub>
//!   blr  x8                          skip:
//!   b    skip                          (guard lives in the stub, EntryGuard reloc)
//! guard:
//!   .word 0
//! skip:
//! ```
//!
//! In the concurrent instruction-and-data variant the `orr ..., lsr #32`
//! is an artificial data dependency ordering the guard load before the
//! epoch load; the guard and epoch are then compared as one 64-bit pair.
//!
//! The guard is patched as data: a release CAS, no instruction-cache
//! maintenance. Instruction patches done by the collector are made visible by
//! the slow path's `isb` once per epoch.

use super::{
    mismatch, offset_address, read_insn, ArchBarrierCodec, Arch, BarrierSite, EmitContext,
    EntryStub, PatchingType,
};
use crate::code::{Backend, CodeBuffer, CodeRegion, CompiledMethod, Relocation};
use crate::deopt::CallingConvention;
use crate::error::{BarrierError, Result};
use crate::guard::ARMED;

const W8: u32 = 8;
const W9: u32 = 9;
const THREAD: u32 = 28;

const DMB_ISHLD: u32 = 0xd503_39bf;
const CMP_W8_W9: u32 = 0x6b09_011f;
const CMP_X8_X9: u32 = 0xeb09_011f;
const ORR_X9_X9_X8_LSR_32: u32 = 0xaa48_8129;
const LDR_W9_X9: u32 = 0xb940_0129;
const ORR_X8_X8_X9_LSL_32: u32 = 0xaa09_8108;
const BLR_X8: u32 = 0xd63f_0100;

const COND_EQ: u32 = 0x0;
const COND_NE: u32 = 0x1;

const LDR_LITERAL_MASK: u32 = 0xff00_0000;
const LDR_LITERAL_W: u32 = 0x1800_0000;

/// Instructions in the inline slow path: 3 for the stub address, `blr`,
/// `b`, and the guard word
const INLINE_SLOW_PATH_WORDS: isize = 6;

#[derive(Debug, Clone)]
pub struct AArch64Codec {
    patching: PatchingType,
}

impl AArch64Codec {
    pub fn new(patching: PatchingType) -> Self {
        Self { patching }
    }

    /// Words from the guard load up to and including the conditional branch
    fn check_words(&self) -> isize {
        match self.patching {
            PatchingType::StwInstructionAndData => 4,
            PatchingType::ConcInstructionAndData => 10,
            PatchingType::ConcData => 5,
        }
    }

    /// Offset of the inline guard word from the first barrier instruction
    fn local_guard_offset(&self, cm: &CompiledMethod) -> usize {
        (-self.entry_barrier_offset(cm)) as usize - 4
    }

    fn emit_address(buf: &mut CodeBuffer, rd: u32, address: usize) -> Result<()> {
        if address >> 48 != 0 {
            return Err(BarrierError::Internal(format!(
                "address {:#x} does not fit in 48 bits",
                address
            )));
        }
        buf.emit_u32(insn::movz(rd, (address & 0xffff) as u32, 0));
        buf.emit_u32(insn::movk(rd, ((address >> 16) & 0xffff) as u32, 1));
        buf.emit_u32(insn::movk(rd, ((address >> 32) & 0xffff) as u32, 2));
        Ok(())
    }
}

impl Default for AArch64Codec {
    fn default() -> Self {
        Self::new(PatchingType::ConcInstructionAndData)
    }
}

impl ArchBarrierCodec for AArch64Codec {
    fn arch(&self) -> Arch {
        Arch::AArch64
    }

    fn patching_type(&self) -> PatchingType {
        self.patching
    }

    fn entry_barrier_offset(&self, cm: &CompiledMethod) -> isize {
        let slow_path = if cm.produced_by_optimizing_backend() {
            0
        } else {
            INLINE_SLOW_PATH_WORDS
        };
        -4 * (self.check_words() + slow_path)
    }

    fn locate(&self, cm: &CompiledMethod) -> Result<BarrierSite> {
        if cm.is_external() {
            let offset = cm
                .entry_patch_offset()
                .ok_or(BarrierError::MissingRelocation {
                    method: cm.id(),
                    kind: "entry patch offset",
                })?;
            let guard = cm
                .section_word_at(offset)
                .ok_or(BarrierError::MissingRelocation {
                    method: cm.id(),
                    kind: "section word",
                })?;
            return Ok(BarrierSite {
                instruction: cm.code_begin() + offset,
                guard,
            });
        }

        let instruction = offset_address(
            cm.code_begin() + cm.frame_complete_offset(),
            self.entry_barrier_offset(cm),
        );

        // The optimizing backend keeps the guard in its out-of-line stub
        let guard = if cm.produced_by_optimizing_backend() {
            cm.entry_guard_reloc()
                .ok_or(BarrierError::MissingRelocation {
                    method: cm.id(),
                    kind: "entry guard",
                })?
        } else {
            instruction + self.local_guard_offset(cm)
        };

        Ok(BarrierSite { instruction, guard })
    }

    fn check_barrier(&self, region: &CodeRegion, site: &BarrierSite) -> Result<()> {
        let inst = read_insn(region, site.instruction)?;
        if inst & LDR_LITERAL_MASK != LDR_LITERAL_W {
            return Err(mismatch(
                site.instruction,
                format!("expected ldr (literal), found {:#010x}", inst),
            ));
        }
        if insn::ldr_literal_target(site.instruction, inst) != site.guard {
            return Err(mismatch(
                site.instruction,
                format!("guard load does not reference {:#x}", site.guard),
            ));
        }
        if site.guard & 0x3 != 0 {
            return Err(mismatch(site.guard, "guard word is not 4-byte aligned"));
        }
        Ok(())
    }

    fn guard_in_instruction_stream(&self) -> bool {
        false
    }

    fn calling_convention(&self) -> CallingConvention {
        CallingConvention::aarch64()
    }

    fn emit_entry_barrier(
        &self,
        buf: &mut CodeBuffer,
        ctx: &EmitContext,
    ) -> Result<Option<EntryStub>> {
        if buf.pc() % 4 != 0 {
            return Err(BarrierError::Internal(
                "aarch64 barrier must start on an instruction boundary".to_string(),
            ));
        }
        let dv = ctx.thread_disarmed_offset as u32;
        let start = buf.pc();

        // Target is bound once the guard word has a position
        buf.emit_u32(LDR_LITERAL_W | W8);

        match self.patching {
            PatchingType::StwInstructionAndData => {
                buf.emit_u32(insn::ldr_w_imm(W9, THREAD, dv)?);
                buf.emit_u32(CMP_W8_W9);
            }
            PatchingType::ConcInstructionAndData => {
                Self::emit_address(buf, W9, ctx.epoch_address)?;
                buf.emit_u32(ORR_X9_X9_X8_LSR_32);
                buf.emit_u32(LDR_W9_X9);
                buf.emit_u32(ORR_X8_X8_X9_LSL_32);
                buf.emit_u32(insn::ldr_x_imm(W9, THREAD, dv)?);
                buf.emit_u32(CMP_X8_X9);
            }
            PatchingType::ConcData => {
                buf.emit_u32(DMB_ISHLD);
                buf.emit_u32(insn::ldr_w_imm(W9, THREAD, dv)?);
                buf.emit_u32(CMP_W8_W9);
            }
        }

        if buf.backend() == Backend::Optimizing {
            let branch_at = buf.pc();
            buf.emit_u32(insn::b_cond(COND_NE, 0, 0)?);
            buf.mark_frame_complete();
            return Ok(Some(EntryStub {
                branch_at,
                continuation: buf.pc(),
            }));
        }

        let branch_at = buf.pc();
        buf.emit_u32(0);
        Self::emit_address(buf, W8, ctx.entry_barrier_stub)?;
        buf.emit_u32(BLR_X8);
        let skip_branch = buf.pc();
        buf.emit_u32(0);
        let guard = buf.pc();
        buf.emit_u32(ARMED);
        let skip = buf.pc();

        buf.patch_u32(branch_at, insn::b_cond(COND_EQ, branch_at, skip)?);
        buf.patch_u32(skip_branch, insn::b(skip_branch, skip)?);
        buf.patch_u32(start, insn::ldr_literal_w(W8, start, guard)?);
        buf.mark_frame_complete();

        if buf.backend() == Backend::External {
            buf.set_entry_patch_offset(start);
            buf.add_relocation(Relocation::SectionWord {
                at: start,
                target: guard,
            });
        }
        Ok(None)
    }

    fn emit_entry_stub(
        &self,
        buf: &mut CodeBuffer,
        stub: EntryStub,
        ctx: &EmitContext,
    ) -> Result<()> {
        if buf.pc() % 4 != 0 {
            return Err(BarrierError::Internal(
                "aarch64 stub must start on an instruction boundary".to_string(),
            ));
        }
        let entry = buf.pc();
        buf.patch_u32(stub.branch_at, insn::b_cond(COND_NE, stub.branch_at, entry)?);

        Self::emit_address(buf, W8, ctx.entry_barrier_stub)?;
        buf.emit_u32(BLR_X8);
        let back = buf.pc();
        buf.emit_u32(insn::b(back, stub.continuation)?);

        let guard = buf.pc();
        buf.add_relocation(Relocation::EntryGuard { offset: guard });
        buf.emit_u32(ARMED);

        let ldr_at = stub.branch_at - 4 * (self.check_words() as usize - 1);
        buf.patch_u32(ldr_at, insn::ldr_literal_w(W8, ldr_at, guard)?);
        Ok(())
    }
}

/// A64 instruction encoders
mod insn {
    use crate::error::{BarrierError, Result};

    fn displacement(from: usize, to: usize, bits: u32) -> Result<u32> {
        let delta = to as i64 - from as i64;
        let words = delta / 4;
        let limit = 1i64 << (bits - 1);
        if delta % 4 != 0 || words < -limit || words >= limit {
            return Err(BarrierError::Internal(format!(
                "branch from {:#x} to {:#x} out of range",
                from, to
            )));
        }
        Ok((words as u32) & ((1 << bits) - 1))
    }

    pub fn ldr_literal_w(rt: u32, pc: usize, target: usize) -> Result<u32> {
        Ok(0x1800_0000 | displacement(pc, target, 19)? << 5 | rt)
    }

    /// Address referenced by an `ldr (literal)` at `pc`
    pub fn ldr_literal_target(pc: usize, inst: u32) -> usize {
        let imm19 = ((inst >> 5) & 0x7ffff) as i32;
        let words = (imm19 << 13) >> 13;
        pc.wrapping_add_signed(words as isize * 4)
    }

    pub fn ldr_w_imm(rt: u32, rn: u32, offset: u32) -> Result<u32> {
        if offset % 4 != 0 || offset / 4 >= 4096 {
            return Err(BarrierError::Internal(format!("bad ldr offset {}", offset)));
        }
        Ok(0xb940_0000 | (offset / 4) << 10 | rn << 5 | rt)
    }

    pub fn ldr_x_imm(rt: u32, rn: u32, offset: u32) -> Result<u32> {
        if offset % 8 != 0 || offset / 8 >= 4096 {
            return Err(BarrierError::Internal(format!("bad ldr offset {}", offset)));
        }
        Ok(0xf940_0000 | (offset / 8) << 10 | rn << 5 | rt)
    }

    pub fn movz(rd: u32, imm16: u32, hw: u32) -> u32 {
        0xd280_0000 | hw << 21 | imm16 << 5 | rd
    }

    pub fn movk(rd: u32, imm16: u32, hw: u32) -> u32 {
        0xf280_0000 | hw << 21 | imm16 << 5 | rd
    }

    pub fn b_cond(cond: u32, from: usize, to: usize) -> Result<u32> {
        Ok(0x5400_0000 | displacement(from, to, 19)? << 5 | cond)
    }

    pub fn b(from: usize, to: usize) -> Result<u32> {
        Ok(0x1400_0000 | displacement(from, to, 26)?)
    }
}
