//! The opcode translator: one case per eBPF opcode, emitting a short
//! fixed x86-64 instruction sequence through [`crate::emit::Emitter`].
//!
//! This is the only module that knows both eBPF semantics (from
//! [`crate::isa`] and [`crate::insn`]) and x86-64 emission (from
//! [`crate::emit`]); everywhere else those two vocabularies are kept
//! apart on purpose.

use crate::emit::{Alu, Cond, Emitter, Shift};
use crate::error::JitError;
use crate::insn::Insn;
use crate::isa::{AluOp, Class, JmpOp, Mode, Size, Source};
use crate::registers::{RegisterMap, RAX, RCX, RDX};

/// Everything the translator needs to know about the call site beyond
/// the instruction stream itself.
pub struct Context {
    /// The register assignment in effect for this compile.
    pub regs: RegisterMap,
    /// Base pointer of the VM's ext-function table, indexed by the
    /// CALL instruction's immediate.
    pub ext_funcs: *const usize,
    /// Number of entries in the ext-function table, used only for a
    /// debug assertion against malformed CALL immediates.
    pub num_ext_funcs: usize,
    /// Total instruction count, used to bound-check branch targets.
    pub num_insts: usize,
}

impl Context {
    /// Build a translation context for one compile call.
    pub fn new(regs: RegisterMap, ext_funcs: *const usize, num_ext_funcs: usize, num_insts: usize) -> Self {
        Context {
            regs,
            ext_funcs,
            num_ext_funcs,
            num_insts,
        }
    }
}

/// Translate the instruction at `pc`. Returns the number of eBPF
/// instruction slots consumed (1, or 2 for a wide immediate load).
///
/// `next` is the instruction immediately following `pc` in program
/// order, if any; only LDDW consults it. `is_last` is whether `pc` is
/// the final instruction slot of the program, used to elide the
/// trailing `jmp exit` on EXIT.
pub fn translate(
    e: &mut Emitter,
    ctx: &Context,
    pc: usize,
    insn: Insn,
    next: Option<Insn>,
    is_last: bool,
) -> Result<usize, JitError> {
    let regs = ctx.regs;
    let opcode = insn.opcode();
    let class = match insn.class() {
        Some(c) => c,
        None => {
            return Err(JitError::UnknownOpcode { opcode, pc });
        }
    };

    match class {
        Class::Alu | Class::Alu64 => {
            translate_alu(e, regs, class == Class::Alu64, insn, pc)?;
            Ok(1)
        }
        Class::Jmp => translate_jmp(e, ctx, insn, pc, is_last),
        Class::Ldx => {
            translate_ldx(e, regs, insn, pc)?;
            Ok(1)
        }
        Class::St => {
            translate_st(e, regs, insn, pc)?;
            Ok(1)
        }
        Class::Stx => {
            translate_stx(e, regs, insn, pc)?;
            Ok(1)
        }
        Class::Ld => {
            if !insn.is_wide_load() {
                return Err(JitError::UnknownOpcode { opcode, pc });
            }
            translate_lddw(e, regs, insn, next, pc)
        }
    }
}

fn translate_alu(e: &mut Emitter, regs: RegisterMap, is64: bool, insn: Insn, pc: usize) -> Result<(), JitError> {
    let opcode = insn.opcode();
    let op = AluOp::decode(opcode).ok_or(JitError::UnknownOpcode { opcode, pc })?;
    let dst = regs.map(insn.dst());
    let source = Source::decode(opcode);

    match op {
        AluOp::Add | AluOp::Sub | AluOp::Or | AluOp::And | AluOp::Xor => {
            let alu = match op {
                AluOp::Add => Alu::Add,
                AluOp::Sub => Alu::Sub,
                AluOp::Or => Alu::Or,
                AluOp::And => Alu::And,
                AluOp::Xor => Alu::Xor,
                _ => unreachable!(),
            };
            match source {
                Source::Imm => e.alu_reg_imm(alu, dst, insn.imm(), is64),
                Source::Reg => e.alu_reg_reg(alu, dst, regs.map(insn.src()), is64),
            }
        }
        AluOp::Mul | AluOp::Div | AluOp::Mod => {
            translate_muldivmod(e, regs, is64, op, source, dst, insn, pc);
        }
        AluOp::Lsh | AluOp::Rsh | AluOp::Arsh => {
            let shift = match op {
                AluOp::Lsh => Shift::Left,
                AluOp::Rsh => Shift::RightLogical,
                AluOp::Arsh => Shift::RightArith,
                _ => unreachable!(),
            };
            match source {
                Source::Imm => e.shift_reg_imm(shift, dst, insn.imm() as i8, is64),
                Source::Reg => {
                    e.mov_rcx_reg(regs.map(insn.src()));
                    e.shift_reg_cl(shift, dst, is64);
                }
            }
        }
        AluOp::Neg => e.neg(dst, is64),
        AluOp::Mov => match source {
            Source::Imm => e.mov_reg_imm32(dst, insn.imm(), is64),
            Source::Reg => e.mov_reg_reg(dst, regs.map(insn.src()), is64),
        },
        AluOp::End => translate_endianness(e, source, dst, insn.imm()),
    }
    Ok(())
}

/// `rol`+mask for BE16, `bswap` (routed through rcx for r8..r15) for
/// BE32/BE64. LE is a no-op on a little-endian host.
fn translate_endianness(e: &mut Emitter, source: Source, dst: u8, width: i32) {
    if source == Source::Imm {
        return; // TO_LE: x86 is already little-endian.
    }
    match width {
        16 => {
            e.rol16_by_8(dst);
            // Clear bits 16..63: rol only touched the low 16 bits, and
            // the 32-bit AND form zero-extends the upper 32 as a side
            // effect, leaving exactly the swapped 16-bit value.
            e.alu_reg_imm(Alu::And, dst, 0xffff, false);
        }
        32 | 64 => {
            let is64 = width == 64;
            if crate::registers::needs_rex_workaround(dst) {
                e.mov_rcx_reg(dst);
                e.bswap(RCX, is64);
                e.mov_reg_reg(dst, RCX, is64);
            } else {
                e.bswap(dst, is64);
            }
        }
        _ => unreachable!("classic eBPF BE/LE widths are always 16, 32, or 64"),
    }
}

/// The multiply/divide/modulo sub-routine: save/restore rax and rdx
/// around `mul`/`div`'s implicit operands, with a division-by-zero
/// trap inlined ahead of the divide itself.
fn translate_muldivmod(
    e: &mut Emitter,
    regs: RegisterMap,
    is64: bool,
    op: AluOp,
    source: Source,
    dst: u8,
    insn: Insn,
    pc: usize,
) {
    let is_div_or_mod = matches!(op, AluOp::Div | AluOp::Mod);

    if is_div_or_mod {
        match source {
            Source::Reg => {
                let src = regs.map(insn.src());
                let trap = e.new_label();
                let after = e.new_label();
                e.test_reg_reg(src, src);
                e.jz_label(trap);
                e.jmp_label(after);
                e.place_label(trap);
                e.mov_reg_imm32(RDX, pc as i32, true);
                e.jmp_div_by_zero();
                e.place_label(after);
            }
            Source::Imm => {
                if insn.imm() == 0 {
                    // The divisor is a compile-time zero: unconditionally trap.
                    // No runtime check is needed (or possible) for an
                    // immediate, so the happy path below is unreachable
                    // and we skip straight to the trampoline.
                    e.mov_reg_imm32(RDX, pc as i32, true);
                    e.jmp_div_by_zero();
                    return;
                }
                // Nonzero immediate: the check is elided entirely, since
                // the divisor can never be zero at runtime.
            }
        }
    }

    let push_rax = dst != RAX;
    let push_rdx = dst != RDX;
    if push_rax {
        e.push(RAX);
    }
    if push_rdx {
        e.push(RDX);
    }

    match source {
        Source::Reg => e.mov_rcx_reg(regs.map(insn.src())),
        Source::Imm => e.mov_reg_imm32(RCX, insn.imm(), is64),
    }

    if dst != RAX {
        e.mov_reg_reg(RAX, dst, is64);
    }

    match op {
        AluOp::Mul => e.mul_rcx(is64),
        AluOp::Div | AluOp::Mod => {
            e.zero_rdx();
            e.div_rcx(is64);
        }
        _ => unreachable!(),
    }

    match op {
        AluOp::Mod => {
            if dst != RDX {
                e.mov_reg_reg(dst, RDX, is64);
            }
        }
        AluOp::Mul | AluOp::Div => {
            if dst != RAX {
                e.mov_reg_reg(dst, RAX, is64);
            }
        }
        _ => unreachable!(),
    }

    if push_rdx {
        e.pop(RDX);
    }
    if push_rax {
        e.pop(RAX);
    }
}

fn translate_jmp(e: &mut Emitter, ctx: &Context, insn: Insn, pc: usize, is_last: bool) -> Result<usize, JitError> {
    let regs = ctx.regs;
    let opcode = insn.opcode();
    let op = JmpOp::decode(opcode).ok_or(JitError::UnknownOpcode { opcode, pc })?;

    match op {
        JmpOp::Exit => {
            if !is_last {
                e.jmp_exit();
            }
            return Ok(1);
        }
        JmpOp::Call => {
            // The fifth argument must sit in rcx per System V, but rcx
            // is reserved; stash the value we parked in r9's slot
            // (eBPF r4) there just before the call.
            e.mov_rcx_reg(regs.map(4));
            let slot = insn.imm() as i64 * 8;
            debug_assert!(
                insn.imm() >= 0 && (insn.imm() as usize) < ctx.num_ext_funcs,
                "CALL immediate out of range; the helper registry should have rejected this"
            );
            e.mov_reg_imm64(RAX, ctx.ext_funcs as i64);
            e.load64(RAX, RAX, slot as i32);
            e.call_reg(RAX);
            // Land the result where eBPF r0 actually lives, so a
            // permuted register map still observes the return value.
            let r0 = regs.map(0);
            if r0 != RAX {
                e.mov_reg_reg(r0, RAX, true);
            }
            return Ok(1);
        }
        JmpOp::Ja => {
            let target = branch_target(pc, insn.offset(), ctx.num_insts);
            e.jmp_pc(target);
            return Ok(1);
        }
        _ => {}
    }

    let dst = regs.map(insn.dst());
    let source = Source::decode(opcode);
    let target = branch_target(pc, insn.offset(), ctx.num_insts);

    if op == JmpOp::Jset {
        match source {
            Source::Reg => e.test_reg_reg(dst, regs.map(insn.src())),
            Source::Imm => e.test_reg_imm(dst, insn.imm()),
        }
        e.jcc_pc(Cond::NotZero, target);
        return Ok(1);
    }

    match source {
        Source::Reg => e.cmp_reg_reg(dst, regs.map(insn.src())),
        Source::Imm => e.cmp_reg_imm(dst, insn.imm()),
    }
    let cond = match op {
        JmpOp::Jeq => Cond::Eq,
        JmpOp::Jne => Cond::Ne,
        JmpOp::Jgt => Cond::UGt,
        JmpOp::Jge => Cond::UGe,
        JmpOp::Jlt => Cond::ULt,
        JmpOp::Jle => Cond::ULe,
        JmpOp::Jsgt => Cond::SGt,
        JmpOp::Jsge => Cond::SGe,
        JmpOp::Jslt => Cond::SLt,
        JmpOp::Jsle => Cond::SLe,
        JmpOp::Ja | JmpOp::Jset | JmpOp::Call | JmpOp::Exit => unreachable!("handled above"),
    };
    e.jcc_pc(cond, target);
    Ok(1)
}

/// Resolve a branch's target PC: offsets are relative to the
/// instruction *after* the branch.
fn branch_target(pc: usize, offset: i16, num_insts: usize) -> usize {
    let target = pc as i64 + 1 + offset as i64;
    debug_assert!(
        target >= 0 && (target as usize) < num_insts,
        "branch target {target} out of range for a {num_insts}-instruction program; the verifier should have rejected this"
    );
    target as usize
}

fn translate_ldx(e: &mut Emitter, regs: RegisterMap, insn: Insn, pc: usize) -> Result<(), JitError> {
    let opcode = insn.opcode();
    if Mode::decode(opcode) != Some(Mode::Mem) {
        return Err(JitError::UnknownOpcode { opcode, pc });
    }
    let dst = regs.map(insn.dst());
    let base = regs.map(insn.src());
    let disp = insn.offset() as i32;
    match Size::decode(opcode) {
        Size::Byte => {
            e.zero_rcx();
            e.load_cl_mem(base, disp);
            e.mov_reg_reg(dst, RCX, true);
        }
        Size::Half => {
            e.zero_rcx();
            e.load_cx_mem(base, disp);
            e.mov_reg_reg(dst, RCX, true);
        }
        Size::Word => e.load32(dst, base, disp),
        Size::DWord => e.load64(dst, base, disp),
    }
    Ok(())
}

fn translate_st(e: &mut Emitter, regs: RegisterMap, insn: Insn, pc: usize) -> Result<(), JitError> {
    let opcode = insn.opcode();
    if Mode::decode(opcode) != Some(Mode::Mem) {
        return Err(JitError::UnknownOpcode { opcode, pc });
    }
    let base = regs.map(insn.dst());
    let disp = insn.offset() as i32;
    let imm = insn.imm();
    match Size::decode(opcode) {
        Size::Byte => e.store8_imm(base, disp, imm as i8),
        Size::Half => e.store16_imm(base, disp, imm as i16),
        Size::Word => e.store32_imm(base, disp, imm),
        Size::DWord => e.store64_imm(base, disp, imm),
    }
    Ok(())
}

fn translate_stx(e: &mut Emitter, regs: RegisterMap, insn: Insn, pc: usize) -> Result<(), JitError> {
    let opcode = insn.opcode();
    if Mode::decode(opcode) != Some(Mode::Mem) {
        return Err(JitError::UnknownOpcode { opcode, pc });
    }
    let base = regs.map(insn.dst());
    let src = regs.map(insn.src());
    let disp = insn.offset() as i32;
    match Size::decode(opcode) {
        Size::Byte => {
            e.mov_rcx_reg(src);
            e.store8_cl(base, disp);
        }
        Size::Half => e.store16_reg(base, disp, src),
        Size::Word => e.store32_reg(base, disp, src),
        Size::DWord => e.store64_reg(base, disp, src),
    }
    Ok(())
}

fn translate_lddw(
    e: &mut Emitter,
    regs: RegisterMap,
    insn: Insn,
    next: Option<Insn>,
    pc: usize,
) -> Result<usize, JitError> {
    let next = next.ok_or(JitError::TruncatedWideLoad { pc })?;
    let dst = regs.map(insn.dst());
    // The low half is zero-extended before OR-ing in the high half, not
    // sign-extended: `0x80000000` in the low word must not flip the top
    // bit of the high word.
    let low = insn.imm() as u32 as u64;
    let high = next.imm() as u32 as u64;
    let imm64 = (low | (high << 32)) as i64;
    e.mov_reg_imm64(dst, imm64);
    Ok(2)
}
