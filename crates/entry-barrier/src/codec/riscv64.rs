//! RISC-V 64 Entry Barrier
//!
//! Same shape as AArch64: the guard is a naturally aligned data word loaded
//! pc-relatively, so every template starts with `auipc`.
//!
//! ```text
//! auipc t0, %hi(guard)            stw / conc_data:       conc_instruction_and_data:
//! lwu   t0, %lo(guard)(t0)          [fence r, r]           la   t1, epoch      (6)
//!                                   lwu  t1, dv(xthread)   srli ra, t0, 32
//!                                                          or   t1, t1, ra
//!                                                          lwu  t1, 0(t1)
//!                                                          slli t1, t1, 32
//!                                                          or   t0, t0, t1
//!                                                          ld   t1, dv(xthread)
//! fast backend:                     optimizing backend:
//!   beq  t0, t1, skip                 beq t0, t1, continuation
//!   movptr t0, stub  (5)              j   <out-of-line stub>
//!   jalr ra, %lo6(t0)               continuation:
//!   j    skip
//! guard:
//!   .word 0
//! skip:
//! ```
//!
//! Instruction counts up to and including the `beq`: 4 (stw), 15 (conc
//! instruction+data), 5 (conc data). The slow path adds 1 word (optimizing)
//! or 8 words (fast).

use super::{
    mismatch, offset_address, read_insn, ArchBarrierCodec, Arch, BarrierSite, EmitContext,
    EntryStub, PatchingType,
};
use crate::code::{Backend, CodeBuffer, CodeRegion, CompiledMethod, Relocation};
use crate::deopt::CallingConvention;
use crate::error::{BarrierError, Result};
use crate::guard::ARMED;

const RA: u32 = 1;
const T0: u32 = 5;
const T1: u32 = 6;
const XTHREAD: u32 = 23;

const FENCE_R_R: u32 = 0x0220_000f;

const OPCODE_MASK: u32 = 0x7f;
const OPCODE_AUIPC: u32 = 0x17;

#[derive(Debug, Clone)]
pub struct RiscV64Codec {
    patching: PatchingType,
}

impl RiscV64Codec {
    pub fn new(patching: PatchingType) -> Self {
        Self { patching }
    }

    fn check_words(&self) -> isize {
        match self.patching {
            PatchingType::StwInstructionAndData => 4,
            PatchingType::ConcInstructionAndData => 15,
            PatchingType::ConcData => 5,
        }
    }

    fn slow_path_words(cm: &CompiledMethod) -> isize {
        if cm.produced_by_optimizing_backend() {
            1
        } else {
            8
        }
    }
}

impl Default for RiscV64Codec {
    fn default() -> Self {
        Self::new(PatchingType::ConcInstructionAndData)
    }
}

impl ArchBarrierCodec for RiscV64Codec {
    fn arch(&self) -> Arch {
        Arch::RiscV64
    }

    fn patching_type(&self) -> PatchingType {
        self.patching
    }

    fn entry_barrier_offset(&self, cm: &CompiledMethod) -> isize {
        -4 * (self.check_words() + Self::slow_path_words(cm))
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

        let offset = self.entry_barrier_offset(cm);
        let instruction = offset_address(cm.code_begin() + cm.frame_complete_offset(), offset);
        let guard = if cm.produced_by_optimizing_backend() {
            cm.entry_guard_reloc()
                .ok_or(BarrierError::MissingRelocation {
                    method: cm.id(),
                    kind: "entry guard",
                })?
        } else {
            instruction + (-offset) as usize - 4
        };

        Ok(BarrierSite { instruction, guard })
    }

    fn check_barrier(&self, region: &CodeRegion, site: &BarrierSite) -> Result<()> {
        let auipc = read_insn(region, site.instruction)?;
        if auipc & OPCODE_MASK != OPCODE_AUIPC {
            return Err(mismatch(
                site.instruction,
                format!("expected auipc, found {:#010x}", auipc),
            ));
        }
        let lwu = read_insn(region, site.instruction + 4)?;
        if !insn::is_lwu(lwu) {
            return Err(mismatch(
                site.instruction + 4,
                format!("expected lwu, found {:#010x}", lwu),
            ));
        }
        if insn::pc_relative_target(site.instruction, auipc, lwu) != site.guard {
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
        CallingConvention::riscv64()
    }

    fn emit_entry_barrier(
        &self,
        buf: &mut CodeBuffer,
        ctx: &EmitContext,
    ) -> Result<Option<EntryStub>> {
        if buf.pc() % 4 != 0 {
            return Err(BarrierError::Internal(
                "riscv64 barrier must start on a 4-byte boundary".to_string(),
            ));
        }
        let dv = i32::try_from(ctx.thread_disarmed_offset)
            .ok()
            .filter(|d| *d < 2048)
            .ok_or_else(|| {
                BarrierError::Internal(format!(
                    "thread offset {} does not fit a 12-bit immediate",
                    ctx.thread_disarmed_offset
                ))
            })?;
        let start = buf.pc();

        // auipc/lwu pair, bound once the guard has a position
        buf.emit_u32(insn::auipc(T0, 0));
        buf.emit_u32(insn::lwu(T0, T0, 0));

        match self.patching {
            PatchingType::StwInstructionAndData => {
                buf.emit_u32(insn::lwu(T1, XTHREAD, dv));
            }
            PatchingType::ConcData => {
                buf.emit_u32(FENCE_R_R);
                buf.emit_u32(insn::lwu(T1, XTHREAD, dv));
            }
            PatchingType::ConcInstructionAndData => {
                let low = insn::emit_movptr(buf, T1, ctx.epoch_address)?;
                buf.emit_u32(insn::addi(T1, T1, low));
                buf.emit_u32(insn::srli(RA, T0, 32));
                buf.emit_u32(insn::or(T1, T1, RA));
                buf.emit_u32(insn::lwu(T1, T1, 0));
                buf.emit_u32(insn::slli(T1, T1, 32));
                buf.emit_u32(insn::or(T0, T0, T1));
                buf.emit_u32(insn::ld(T1, XTHREAD, dv));
            }
        }

        if buf.backend() == Backend::Optimizing {
            buf.emit_u32(insn::beq(T0, T1, 8)?);
            let branch_at = buf.pc();
            buf.emit_u32(insn::jal(0, 0)?);
            buf.mark_frame_complete();
            return Ok(Some(EntryStub {
                branch_at,
                continuation: buf.pc(),
            }));
        }

        let beq_at = buf.pc();
        buf.emit_u32(0);
        let low = insn::emit_movptr(buf, T0, ctx.entry_barrier_stub)?;
        buf.emit_u32(insn::jalr(RA, T0, low));
        let j_at = buf.pc();
        buf.emit_u32(0);
        let guard = buf.pc();
        buf.emit_u32(ARMED);
        let skip = buf.pc();

        buf.patch_u32(beq_at, insn::beq(T0, T1, (skip - beq_at) as i32)?);
        buf.patch_u32(j_at, insn::jal(0, (skip - j_at) as i32)?);
        insn::bind_pc_relative(buf, start, guard);
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
                "riscv64 stub must start on a 4-byte boundary".to_string(),
            ));
        }
        let entry = buf.pc();
        buf.patch_u32(stub.branch_at, insn::jal(0, (entry - stub.branch_at) as i32)?);

        let low = insn::emit_movptr(buf, T0, ctx.entry_barrier_stub)?;
        buf.emit_u32(insn::jalr(RA, T0, low));
        let back = buf.pc();
        buf.emit_u32(insn::jal(0, stub.continuation as i32 - back as i32)?);

        let guard = buf.pc();
        buf.add_relocation(Relocation::EntryGuard { offset: guard });
        buf.emit_u32(ARMED);

        // The beq before the jump is the last check word
        let start = stub.branch_at - 4 * self.check_words() as usize;
        insn::bind_pc_relative(buf, start, guard);
        Ok(())
    }
}

/// RV64I instruction encoders
mod insn {
    use crate::code::CodeBuffer;
    use crate::error::{BarrierError, Result};

    fn i_type(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        ((imm as u32) & 0xfff) << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | opcode
    }

    pub fn auipc(rd: u32, hi20: i32) -> u32 {
        (hi20 as u32) << 12 | rd << 7 | 0x17
    }

    pub fn lui(rd: u32, upper: i32) -> u32 {
        (upper as u32 & 0xffff_f000) | rd << 7 | 0x37
    }

    pub fn lwu(rd: u32, rs1: u32, imm: i32) -> u32 {
        i_type(imm, rs1, 6, rd, 0x03)
    }

    pub fn ld(rd: u32, rs1: u32, imm: i32) -> u32 {
        i_type(imm, rs1, 3, rd, 0x03)
    }

    pub fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
        i_type(imm, rs1, 0, rd, 0x13)
    }

    pub fn slli(rd: u32, rs1: u32, shamt: u32) -> u32 {
        shamt << 20 | rs1 << 15 | 1 << 12 | rd << 7 | 0x13
    }

    pub fn srli(rd: u32, rs1: u32, shamt: u32) -> u32 {
        shamt << 20 | rs1 << 15 | 5 << 12 | rd << 7 | 0x13
    }

    pub fn or(rd: u32, rs1: u32, rs2: u32) -> u32 {
        rs2 << 20 | rs1 << 15 | 6 << 12 | rd << 7 | 0x33
    }

    pub fn jalr(rd: u32, rs1: u32, imm: i32) -> u32 {
        i_type(imm, rs1, 0, rd, 0x67)
    }

    pub fn beq(rs1: u32, rs2: u32, offset: i32) -> Result<u32> {
        if offset % 2 != 0 || !(-4096..4096).contains(&offset) {
            return Err(BarrierError::Internal(format!("beq offset {} out of range", offset)));
        }
        let imm = offset as u32;
        Ok(((imm >> 12) & 1) << 31
            | ((imm >> 5) & 0x3f) << 25
            | rs2 << 20
            | rs1 << 15
            | ((imm >> 1) & 0xf) << 8
            | ((imm >> 11) & 1) << 7
            | 0x63)
    }

    pub fn jal(rd: u32, offset: i32) -> Result<u32> {
        if offset % 2 != 0 || !(-(1 << 20)..(1 << 20)).contains(&offset) {
            return Err(BarrierError::Internal(format!("jal offset {} out of range", offset)));
        }
        let imm = offset as u32;
        Ok(((imm >> 20) & 1) << 31
            | ((imm >> 1) & 0x3ff) << 21
            | ((imm >> 11) & 1) << 20
            | ((imm >> 12) & 0xff) << 12
            | rd << 7
            | 0x6f)
    }

    pub fn is_lwu(inst: u32) -> bool {
        inst & 0x7f == 0x03 && (inst >> 12) & 0x7 == 6
    }

    /// Address formed by an `auipc` at `pc` and the load that follows it
    pub fn pc_relative_target(pc: usize, auipc: u32, load: u32) -> usize {
        let hi = (auipc & 0xffff_f000) as i32 as isize;
        let lo = (load as i32 >> 20) as isize;
        pc.wrapping_add_signed(hi + lo)
    }

    /// Rewrite the auipc/lwu pair at `at` to load the word at `target`
    pub fn bind_pc_relative(buf: &mut CodeBuffer, at: usize, target: usize) {
        let offset = target as i64 - at as i64;
        let hi = ((offset + 0x800) >> 12) as i32;
        let lo = (offset - ((hi as i64) << 12)) as i32;

        let rd = (buf.read_u32(at) >> 7) & 0x1f;
        buf.patch_u32(at, auipc(rd, hi));
        let load = buf.read_u32(at + 4);
        buf.patch_u32(at + 4, (load & 0x000f_ffff) | ((lo as u32) & 0xfff) << 20);
    }

    /// Materialize a 48-bit address in five instructions
    ///
    /// Leaves the low six bits out; they are returned for the consuming
    /// `addi`/`jalr`.
    pub fn emit_movptr(buf: &mut CodeBuffer, rd: u32, address: usize) -> Result<i32> {
        if address >> 47 != 0 {
            return Err(BarrierError::Internal(format!(
                "address {:#x} does not fit in 47 bits",
                address
            )));
        }
        let imm64 = address as i64;
        let imm = imm64 >> 17;
        let lower = (imm << 52) >> 52;
        let upper = (imm - lower) as i32;

        buf.emit_u32(lui(rd, upper));
        buf.emit_u32(addi(rd, rd, lower as i32));
        buf.emit_u32(slli(rd, rd, 11));
        buf.emit_u32(addi(rd, rd, ((imm64 >> 6) & 0x7ff) as i32));
        buf.emit_u32(slli(rd, rd, 6));
        Ok((imm64 & 0x3f) as i32)
    }
}
