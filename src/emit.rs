//! Thin wrappers over the `dynasmrt` assembler.
//!
//! Every function here corresponds to one x86-64 instruction form (or,
//! where the assembler this crate targets cannot reliably encode a
//! form directly, to the documented workaround sequence for it). This
//! module knows nothing about eBPF; [`crate::translate`] is the only
//! caller and is the only place opcode semantics live.

use dynasmrt::{dynasm, DynamicLabel, DynasmApi, DynasmLabelApi};

use crate::registers::RCX;

/// Emits into `$e.ops`, always opening with the `.arch x64` directive
/// `dynasm!` requires on every invocation.
macro_rules! asm {
    ($e:expr; $($t:tt)*) => {
        dynasm!($e.ops; .arch x64; $($t)*)
    };
}

/// x86-64 condition codes used by the classic-eBPF jump family, after
/// the `cmp`/`test` that precedes every conditional branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    /// `je`
    Eq,
    /// `jne`
    Ne,
    /// `ja` (unsigned greater)
    UGt,
    /// `jae` (unsigned greater-or-equal)
    UGe,
    /// `jb` (unsigned less)
    ULt,
    /// `jbe` (unsigned less-or-equal)
    ULe,
    /// `jg` (signed greater)
    SGt,
    /// `jge` (signed greater-or-equal)
    SGe,
    /// `jl` (signed less)
    SLt,
    /// `jle` (signed less-or-equal)
    SLe,
    /// `jnz`, used after `test` for JSET
    NotZero,
}

/// ALU operation emitted by [`Emitter::alu_reg_reg`] / [`Emitter::alu_reg_imm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alu {
    /// `add`
    Add,
    /// `sub`
    Sub,
    /// `or`
    Or,
    /// `and`
    And,
    /// `xor`
    Xor,
}

/// Shift operation emitted by [`Emitter::shift_reg_imm`] / [`Emitter::shift_reg_cl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shift {
    /// `shl`
    Left,
    /// `shr` (logical)
    RightLogical,
    /// `sar` (arithmetic)
    RightArith,
}

/// Assembler state plus the labels a single compile uses: one dynamic
/// label per eBPF program counter, and the three named exit points.
pub struct Emitter {
    pub(crate) ops: dynasmrt::VecAssembler<dynasmrt::x64::X64Relocation>,
    pc_labels: Vec<DynamicLabel>,
    pub(crate) exit: DynamicLabel,
    pub(crate) exit2: DynamicLabel,
    pub(crate) div_by_zero: DynamicLabel,
}

impl Emitter {
    /// Allocate assembler state and one dynamic label per instruction
    /// slot, plus the three named globals.
    ///
    /// `baseaddr` is always 0: nothing this crate emits performs
    /// buffer-relative absolute addressing (the ext-function table and
    /// the division-by-zero handler are both referenced as plain
    /// 64-bit immediates), so the final page address the buffer is
    /// copied into never needs to be known at assembly time.
    pub fn new(num_insts: usize) -> Self {
        let mut ops = dynasmrt::VecAssembler::<dynasmrt::x64::X64Relocation>::new(0);
        let pc_labels = (0..num_insts).map(|_| ops.new_dynamic_label()).collect();
        let exit = ops.new_dynamic_label();
        let exit2 = ops.new_dynamic_label();
        let div_by_zero = ops.new_dynamic_label();
        Emitter {
            ops,
            pc_labels,
            exit,
            exit2,
            div_by_zero,
        }
    }

    /// The current offset of the buffer, i.e. the address the next
    /// emitted byte will land at once linked. Used to record the entry
    /// point before any instructions are emitted.
    pub fn offset(&self) -> dynasmrt::AssemblyOffset {
        self.ops.offset()
    }

    /// Declare the local label for eBPF PC `pc` at the current position.
    pub fn place_pc_label(&mut self, pc: usize) {
        let label = self.pc_labels[pc];
        asm!(self; =>label);
    }

    /// Unconditional jump to the local label for eBPF PC `pc`.
    pub fn jmp_pc(&mut self, pc: usize) {
        let label = self.pc_labels[pc];
        asm!(self; jmp =>label);
    }

    /// Conditional jump to the local label for eBPF PC `pc`.
    pub fn jcc_pc(&mut self, cond: Cond, pc: usize) {
        let label = self.pc_labels[pc];
        match cond {
            Cond::Eq => asm!(self; je =>label),
            Cond::Ne => asm!(self; jne =>label),
            Cond::UGt => asm!(self; ja =>label),
            Cond::UGe => asm!(self; jae =>label),
            Cond::ULt => asm!(self; jb =>label),
            Cond::ULe => asm!(self; jbe =>label),
            Cond::SGt => asm!(self; jg =>label),
            Cond::SGe => asm!(self; jge =>label),
            Cond::SLt => asm!(self; jl =>label),
            Cond::SLe => asm!(self; jle =>label),
            Cond::NotZero => asm!(self; jnz =>label),
        }
    }

    /// Unconditional jump to the shared `exit` label.
    pub fn jmp_exit(&mut self) {
        let label = self.exit;
        asm!(self; jmp =>label);
    }

    /// Unconditional jump to the shared `div_by_zero` trampoline, used
    /// by a per-instruction trap stub once it has loaded the PC.
    pub fn jmp_div_by_zero(&mut self) {
        let label = self.div_by_zero;
        asm!(self; jmp =>label);
    }

    /// Declare the `exit:` label at the current position.
    pub fn place_exit(&mut self) {
        let label = self.exit;
        asm!(self; =>label);
    }

    /// Declare the `exit2:` label at the current position.
    pub fn place_exit2(&mut self) {
        let label = self.exit2;
        asm!(self; =>label);
    }

    /// Declare the `div_by_zero:` label at the current position.
    pub fn place_div_by_zero(&mut self) {
        let label = self.div_by_zero;
        asm!(self; =>label);
    }

    /// Unconditional jump to the shared `exit2` label, used by the
    /// division-by-zero trampoline to return without re-deriving rax
    /// from the (possibly permuted) r0 mapping.
    pub fn jmp_exit2(&mut self) {
        let label = self.exit2;
        asm!(self; jmp =>label);
    }

    /// Allocate an ad-hoc dynamic label, scoped to a single translated
    /// instruction (the div-by-zero trap stub needs a place to land
    /// that is distinct from every PC-indexed label).
    pub fn new_label(&mut self) -> DynamicLabel {
        self.ops.new_dynamic_label()
    }

    /// Declare `label` at the current position.
    pub fn place_label(&mut self, label: DynamicLabel) {
        asm!(self; =>label);
    }

    /// Unconditional jump to an ad-hoc label.
    pub fn jmp_label(&mut self, label: DynamicLabel) {
        asm!(self; jmp =>label);
    }

    /// `je` to an ad-hoc label.
    pub fn jz_label(&mut self, label: DynamicLabel) {
        asm!(self; je =>label);
    }

    /// `push r64`
    pub fn push(&mut self, reg: u8) {
        asm!(self; push Rq(reg));
    }

    /// `pop r64`
    pub fn pop(&mut self, reg: u8) {
        asm!(self; pop Rq(reg));
    }

    /// `ret`
    pub fn ret(&mut self) {
        asm!(self; ret);
    }

    /// `mov dst, src`, 64- or 32-bit form. The 32-bit form implicitly
    /// zero-extends the upper 32 bits, matching eBPF's 32-bit ALU
    /// semantics.
    pub fn mov_reg_reg(&mut self, dst: u8, src: u8, is64: bool) {
        if is64 {
            asm!(self; mov Rq(dst), Rq(src));
        } else {
            asm!(self; mov Rd(dst), Rd(src));
        }
    }

    /// `mov dst, imm32` (sign-extended to 64 bits by the instruction
    /// itself in the 64-bit form; zero-extended upper 32 bits in the
    /// 32-bit form).
    pub fn mov_reg_imm32(&mut self, dst: u8, imm: i32, is64: bool) {
        if is64 {
            asm!(self; mov Rq(dst), DWORD imm);
        } else {
            asm!(self; mov Rd(dst), DWORD imm);
        }
    }

    /// `movabs dst, imm64`, used only by LDDW.
    pub fn mov_reg_imm64(&mut self, dst: u8, imm: i64) {
        asm!(self; mov Rq(dst), QWORD imm);
    }

    /// `op dst, src`, 64- or 32-bit form.
    pub fn alu_reg_reg(&mut self, op: Alu, dst: u8, src: u8, is64: bool) {
        match (op, is64) {
            (Alu::Add, true) => asm!(self; add Rq(dst), Rq(src)),
            (Alu::Add, false) => asm!(self; add Rd(dst), Rd(src)),
            (Alu::Sub, true) => asm!(self; sub Rq(dst), Rq(src)),
            (Alu::Sub, false) => asm!(self; sub Rd(dst), Rd(src)),
            (Alu::Or, true) => asm!(self; or Rq(dst), Rq(src)),
            (Alu::Or, false) => asm!(self; or Rd(dst), Rd(src)),
            (Alu::And, true) => asm!(self; and Rq(dst), Rq(src)),
            (Alu::And, false) => asm!(self; and Rd(dst), Rd(src)),
            (Alu::Xor, true) => asm!(self; xor Rq(dst), Rq(src)),
            (Alu::Xor, false) => asm!(self; xor Rd(dst), Rd(src)),
        }
    }

    /// `op dst, imm32`, 64- or 32-bit form.
    pub fn alu_reg_imm(&mut self, op: Alu, dst: u8, imm: i32, is64: bool) {
        match (op, is64) {
            (Alu::Add, true) => asm!(self; add Rq(dst), DWORD imm),
            (Alu::Add, false) => asm!(self; add Rd(dst), DWORD imm),
            (Alu::Sub, true) => asm!(self; sub Rq(dst), DWORD imm),
            (Alu::Sub, false) => asm!(self; sub Rd(dst), DWORD imm),
            (Alu::Or, true) => asm!(self; or Rq(dst), DWORD imm),
            (Alu::Or, false) => asm!(self; or Rd(dst), DWORD imm),
            (Alu::And, true) => asm!(self; and Rq(dst), DWORD imm),
            (Alu::And, false) => asm!(self; and Rd(dst), DWORD imm),
            (Alu::Xor, true) => asm!(self; xor Rq(dst), DWORD imm),
            (Alu::Xor, false) => asm!(self; xor Rd(dst), DWORD imm),
        }
    }

    /// `neg dst`, 64- or 32-bit form.
    pub fn neg(&mut self, dst: u8, is64: bool) {
        if is64 {
            asm!(self; neg Rq(dst));
        } else {
            asm!(self; neg Rd(dst));
        }
    }

    /// `shl/shr/sar dst, imm8`.
    pub fn shift_reg_imm(&mut self, op: Shift, dst: u8, imm: i8, is64: bool) {
        match (op, is64) {
            (Shift::Left, true) => asm!(self; shl Rq(dst), BYTE imm),
            (Shift::Left, false) => asm!(self; shl Rd(dst), BYTE imm),
            (Shift::RightLogical, true) => asm!(self; shr Rq(dst), BYTE imm),
            (Shift::RightLogical, false) => asm!(self; shr Rd(dst), BYTE imm),
            (Shift::RightArith, true) => asm!(self; sar Rq(dst), BYTE imm),
            (Shift::RightArith, false) => asm!(self; sar Rd(dst), BYTE imm),
        }
    }

    /// `shl/shr/sar dst, cl`. Caller must have already moved the shift
    /// count into rcx.
    pub fn shift_reg_cl(&mut self, op: Shift, dst: u8, is64: bool) {
        match (op, is64) {
            (Shift::Left, true) => asm!(self; shl Rq(dst), cl),
            (Shift::Left, false) => asm!(self; shl Rd(dst), cl),
            (Shift::RightLogical, true) => asm!(self; shr Rq(dst), cl),
            (Shift::RightLogical, false) => asm!(self; shr Rd(dst), cl),
            (Shift::RightArith, true) => asm!(self; sar Rq(dst), cl),
            (Shift::RightArith, false) => asm!(self; sar Rd(dst), cl),
        }
    }

    /// `cmp dst, src`, 64-bit (branches always compare full registers).
    pub fn cmp_reg_reg(&mut self, dst: u8, src: u8) {
        asm!(self; cmp Rq(dst), Rq(src));
    }

    /// `cmp dst, imm32`.
    pub fn cmp_reg_imm(&mut self, dst: u8, imm: i32) {
        asm!(self; cmp Rq(dst), DWORD imm);
    }

    /// `test dst, src`, 64-bit.
    pub fn test_reg_reg(&mut self, dst: u8, src: u8) {
        asm!(self; test Rq(dst), Rq(src));
    }

    /// `test dst, imm32`.
    pub fn test_reg_imm(&mut self, dst: u8, imm: i32) {
        asm!(self; test Rq(dst), DWORD imm);
    }

    /// `bswap dst`, 64- or 32-bit form. Not reliable for r8..r15 (see
    /// [`crate::registers::needs_rex_workaround`]); callers on that
    /// register class must route through rcx themselves using
    /// [`Emitter::mov_reg_reg`] before and after.
    pub fn bswap(&mut self, dst: u8, is64: bool) {
        if is64 {
            asm!(self; bswap Rq(dst));
        } else {
            asm!(self; bswap Rd(dst));
        }
    }

    /// `rol dst, 8` on the 16-bit form of `dst`, used for the BE16
    /// byte-swap.
    pub fn rol16_by_8(&mut self, dst: u8) {
        asm!(self; rol Rw(dst), BYTE 8);
    }

    /// `mov rcx, src`. The fixed staging register used for variable
    /// shift counts, byte-register workarounds, and the pre-call r9
    /// stash.
    pub fn mov_rcx_reg(&mut self, src: u8) {
        asm!(self; mov Rq(RCX), Rq(src));
    }

    /// `xor ecx, ecx`, zeroing rcx's full 64 bits as a side effect.
    pub fn zero_rcx(&mut self) {
        asm!(self; xor Rd(RCX), Rd(RCX));
    }

    /// `mov cl, [base + disp]`, the first half of the 8-bit
    /// zero-extending load workaround.
    pub fn load_cl_mem(&mut self, base: u8, disp: i32) {
        asm!(self; mov cl, BYTE [Rq(base) + disp]);
    }

    /// `mov cx, [base + disp]`, the first half of the 16-bit
    /// zero-extending load workaround.
    pub fn load_cx_mem(&mut self, base: u8, disp: i32) {
        asm!(self; mov cx, WORD [Rq(base) + disp]);
    }

    /// `mov dst, [base + disp]`, 32-bit form (implicitly zero-extends
    /// the upper 32 bits of `dst`).
    pub fn load32(&mut self, dst: u8, base: u8, disp: i32) {
        asm!(self; mov Rd(dst), DWORD [Rq(base) + disp]);
    }

    /// `mov dst, [base + disp]`, 64-bit form.
    pub fn load64(&mut self, dst: u8, base: u8, disp: i32) {
        asm!(self; mov Rq(dst), QWORD [Rq(base) + disp]);
    }

    /// `mov byte [base + disp], imm8`.
    pub fn store8_imm(&mut self, base: u8, disp: i32, imm: i8) {
        asm!(self; mov BYTE [Rq(base) + disp], imm);
    }

    /// `mov word [base + disp], imm16`.
    pub fn store16_imm(&mut self, base: u8, disp: i32, imm: i16) {
        asm!(self; mov WORD [Rq(base) + disp], imm);
    }

    /// `mov dword [base + disp], imm32`.
    pub fn store32_imm(&mut self, base: u8, disp: i32, imm: i32) {
        asm!(self; mov DWORD [Rq(base) + disp], imm);
    }

    /// `mov qword [base + disp], imm32` (sign-extended to 64 bits by
    /// the instruction).
    pub fn store64_imm(&mut self, base: u8, disp: i32, imm: i32) {
        asm!(self; mov QWORD [Rq(base) + disp], imm);
    }

    /// `mov byte [base + disp], cl`. Byte stores from any source
    /// register go through cl; the caller loads it first.
    pub fn store8_cl(&mut self, base: u8, disp: i32) {
        asm!(self; mov BYTE [Rq(base) + disp], cl);
    }

    /// `mov word [base + disp], src`.
    pub fn store16_reg(&mut self, base: u8, disp: i32, src: u8) {
        asm!(self; mov WORD [Rq(base) + disp], Rw(src));
    }

    /// `mov dword [base + disp], src`.
    pub fn store32_reg(&mut self, base: u8, disp: i32, src: u8) {
        asm!(self; mov DWORD [Rq(base) + disp], Rd(src));
    }

    /// `mov qword [base + disp], src`.
    pub fn store64_reg(&mut self, base: u8, disp: i32, src: u8) {
        asm!(self; mov QWORD [Rq(base) + disp], Rq(src));
    }

    /// `mul ecx`/`mul rcx`: unsigned multiply, rax:rdx(:edx) implicit.
    pub fn mul_rcx(&mut self, is64: bool) {
        if is64 {
            asm!(self; mul Rq(RCX));
        } else {
            asm!(self; mul Rd(RCX));
        }
    }

    /// `div ecx`/`div rcx`: unsigned divide, rax:rdx(:edx) implicit.
    pub fn div_rcx(&mut self, is64: bool) {
        if is64 {
            asm!(self; div Rq(RCX));
        } else {
            asm!(self; div Rd(RCX));
        }
    }

    /// `xor edx, edx`, clearing the high half of the dividend before
    /// `div` (eBPF div/mod are unsigned, so no sign extension is ever
    /// wanted here).
    pub fn zero_rdx(&mut self) {
        asm!(self; xor edx, edx);
    }

    /// `call reg`, an indirect call through a register holding a
    /// native function pointer.
    pub fn call_reg(&mut self, reg: u8) {
        asm!(self; call Rq(reg));
    }

    /// Link and encode every emitted instruction into an owned byte
    /// buffer, resolving every local and global label reference. This
    /// is the combined `dasm_link`/`dasm_encode` step; the buffer is
    /// plain RW memory, not yet mapped at its final address.
    pub fn finalize(self) -> Result<Vec<u8>, dynasmrt::DynasmError> {
        self.ops.finalize()
    }
}
