//! The compile driver: prologue, instruction walk, epilogue, the
//! division-by-zero trampoline, linking, and the mmap/encode/mprotect
//! sequence that turns a byte buffer into a callable page.

use std::ptr;

use crate::emit::{Alu, Emitter};
use crate::error::JitError;
use crate::insn::Insn;
use crate::registers::{RegisterMap, CALLEE_SAVED, RAX, RDI, RDX, RSP};
use crate::translate::{self, Context};
use crate::vm::ExtFunc;

/// Bytes reserved for the eBPF stack frame, per SPEC_FULL.md §4.4.
const STACK_SIZE: i32 = 128;

/// Compile `insts` against `ext_funcs` under `regs`, returning the
/// entry-point pointer and the mapped page's length.
///
/// Preconditions (enforced by the caller, [`crate::vm::Vm::compile`]):
/// `insts` is non-empty.
pub fn compile(insts: &[Insn], ext_funcs: &[ExtFunc], regs: RegisterMap) -> Result<(*mut u8, usize), JitError> {
    log::debug!("compiling {} eBPF instructions", insts.len());

    let mut e = Emitter::new(insts.len());
    emit_prologue(&mut e, regs);
    log::debug!("prologue emitted");

    let ctx = Context::new(regs, ext_funcs.as_ptr() as *const usize, ext_funcs.len(), insts.len());
    let mut pc = 0;
    while pc < insts.len() {
        e.place_pc_label(pc);
        let insn = insts[pc];
        let next = insts.get(pc + 1).copied();
        let is_last = pc == insts.len() - 1;
        log::trace!("PC {pc}: opcode {:#04x}", insn.opcode());
        let consumed = translate::translate(&mut e, &ctx, pc, insn, next, is_last)?;
        pc += consumed;
    }
    log::debug!("{} instructions translated", insts.len());

    emit_epilogue(&mut e, regs);
    emit_div_by_zero_trampoline(&mut e);

    let code = e.finalize().map_err(JitError::Link)?;
    log::debug!("linked to {} bytes", code.len());

    let (ptr, len) = map_executable(&code)?;
    log::debug!("page mapped read-execute at {ptr:p} ({len} bytes)");

    Ok((ptr, len))
}

fn emit_prologue(e: &mut Emitter, regs: RegisterMap) {
    for &reg in &CALLEE_SAVED {
        e.push(reg);
    }
    // The ctx argument arrives in rdi per the `extern "C" fn(u64) -> i64`
    // ABI; move it into eBPF r1's slot unless that slot already is rdi.
    if regs.map(1) != RDI {
        e.mov_reg_reg(regs.map(1), RDI, true);
    }
    e.alu_reg_imm(Alu::Sub, RSP, STACK_SIZE, true);
    // eBPF r10 is the read-only frame pointer, seeded from the stack
    // pointer after carving out the eBPF stack frame.
    e.mov_reg_reg(regs.map(10), RSP, true);
}

fn emit_epilogue(e: &mut Emitter, regs: RegisterMap) {
    e.place_exit();
    if regs.map(0) != RAX {
        e.mov_reg_reg(RAX, regs.map(0), true);
    }
    e.place_exit2();
    e.alu_reg_imm(Alu::Add, RSP, STACK_SIZE, true);
    for &reg in CALLEE_SAVED.iter().rev() {
        e.pop(reg);
    }
    e.ret();
}

fn emit_div_by_zero_trampoline(e: &mut Emitter) {
    e.place_div_by_zero();
    // The call site loaded the faulting PC into rdx; the handler takes
    // it as its first argument, which System V puts in rdi.
    e.mov_reg_reg(RDI, RDX, true);
    e.mov_reg_imm64(RAX, report_division_by_zero as usize as i64);
    e.call_reg(RAX);
    e.mov_reg_imm32(RAX, -1, true);
    e.jmp_exit2();
}

/// The one stable, program-visible diagnostic this crate emits at
/// runtime. Printed directly to stderr rather than through `log`,
/// since it is a contract compiled programs rely on, not a record a
/// log-level filter should be able to suppress.
extern "C" fn report_division_by_zero(pc: u64) {
    eprintln!("uBPF error: division by zero at PC {pc}");
}

/// Map `code` at a fresh anonymous page, rounded up to page
/// granularity, write it once, then switch the page from RW to RX.
/// The page is never simultaneously writable and executable.
fn map_executable(code: &[u8]) -> Result<(*mut u8, usize), JitError> {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    let len = code.len().div_ceil(page_size) * page_size;

    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(JitError::Mmap { len, source: std::io::Error::last_os_error() });
    }
    let ptr = ptr as *mut u8;

    unsafe {
        ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
    }

    let rc = unsafe { libc::mprotect(ptr as *mut libc::c_void, len, libc::PROT_READ | libc::PROT_EXEC) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        unsafe {
            libc::munmap(ptr as *mut libc::c_void, len);
        }
        return Err(JitError::Protect(err));
    }

    Ok((ptr, len))
}
