//! The VM container: the owned instruction stream, the ext-function
//! table, and (once compiled) the executable page and its entry point.
//!
//! Everything outside this module that would normally surround a JIT
//! -- the loader, the verifier, the interpreter, the helper-function
//! registry -- is an external collaborator this crate never
//! implements. `Vm` only holds what the compile driver needs: a
//! validated instruction array and a read-only table of helper
//! pointers indexed by an immediate.

use crate::error::JitError;
use crate::insn::Insn;
use crate::jit;
use crate::registers::RegisterMap;

/// A native helper function callable from compiled eBPF code via the
/// `CALL` instruction, taking up to five 64-bit arguments (eBPF
/// r1..r5) and returning a 64-bit result (eBPF r0).
pub type ExtFunc = unsafe extern "C" fn(u64, u64, u64, u64, u64) -> u64;

/// The executable page produced by a successful compile, plus its
/// length. `Drop` unmaps it; there is no other way to release one.
struct JitProgram {
    ptr: *mut u8,
    len: usize,
}

// The page is read-execute only after compile finishes; invoking the
// compiled function from multiple threads is explicitly supported by
// the spec's concurrency model (no shared mutable state).
unsafe impl Send for JitProgram {}
unsafe impl Sync for JitProgram {}

impl Drop for JitProgram {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` are exactly the pair returned by the mmap
        // call that produced this page; see `jit::map_executable`.
        unsafe {
            let rc = libc::munmap(self.ptr as *mut libc::c_void, self.len);
            debug_assert_eq!(rc, 0, "munmap of the JIT page failed");
        }
    }
}

/// An eBPF program plus its helper-function table, compiled lazily via
/// [`Vm::compile`] into a directly-callable native function.
pub struct Vm {
    insts: Vec<Insn>,
    ext_funcs: Vec<ExtFunc>,
    jitted: Option<JitProgram>,
}

impl Vm {
    /// Build a VM over an already-validated instruction stream. The
    /// loader and verifier are external collaborators: by the time a
    /// `Vm` exists, `insts` is assumed to be well-formed.
    pub fn new(insts: Vec<Insn>) -> Self {
        Vm {
            insts,
            ext_funcs: Vec::new(),
            jitted: None,
        }
    }

    /// Register a helper function at the given index, as referenced by
    /// a `CALL` instruction's immediate operand. Grows the table with
    /// a null-returning stub if `idx` is past the current length.
    pub fn register_ext_func(&mut self, idx: usize, f: ExtFunc) {
        if idx >= self.ext_funcs.len() {
            self.ext_funcs.resize(idx + 1, unreachable_ext_func as ExtFunc);
        }
        self.ext_funcs[idx] = f;
    }

    /// The instruction stream, as handed to the compile driver.
    pub fn insts(&self) -> &[Insn] {
        &self.insts
    }

    /// `true` once [`Vm::compile`] has succeeded for this VM.
    pub fn is_jitted(&self) -> bool {
        self.jitted.is_some()
    }

    /// The size in bytes of the mapped executable page, once jitted.
    pub fn jitted_size(&self) -> Option<usize> {
        self.jitted.as_ref().map(|p| p.len)
    }

    /// Compile `self.insts` into native code under the given register
    /// assignment. Idempotent: if this VM is already jitted, returns
    /// immediately without re-emitting code, regardless of `regs`
    /// (the entry point from the original compile is reused verbatim).
    pub fn compile(&mut self, regs: RegisterMap) -> Result<(), JitError> {
        if self.jitted.is_some() {
            return Ok(());
        }
        if self.insts.is_empty() {
            return Err(JitError::EmptyProgram);
        }
        let (ptr, len) = jit::compile(&self.insts, &self.ext_funcs, regs)?;
        self.jitted = Some(JitProgram { ptr, len });
        Ok(())
    }

    /// Call the compiled function with `ctx` in eBPF r1, returning
    /// eBPF r0.
    ///
    /// # Panics
    ///
    /// Panics if this VM has not been successfully compiled.
    ///
    /// # Safety
    ///
    /// The caller must ensure every `ExtFunc` registered on this VM
    /// remains valid and that `ctx` is whatever the compiled program
    /// expects to receive as its single argument.
    pub unsafe fn execute(&self, ctx: u64) -> i64 {
        let program = self.jitted.as_ref().expect("Vm::execute called before a successful compile");
        let entry: unsafe extern "C" fn(u64) -> i64 = std::mem::transmute(program.ptr);
        entry(ctx)
    }
}

/// Placeholder used to pad `ext_funcs` when `register_ext_func` is
/// called with a sparse index; calling it is a bug in the caller (a
/// CALL immediate with no registered helper), never something the
/// translator itself can reach for verifier-validated input.
unsafe extern "C" fn unreachable_ext_func(_: u64, _: u64, _: u64, _: u64, _: u64) -> u64 {
    unreachable!("called an unregistered eBPF helper slot")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_vm_is_not_jitted() {
        let vm = Vm::new(vec![Insn::new(0x95, 0, 0, 0, 0)]);
        assert!(!vm.is_jitted());
        assert_eq!(vm.jitted_size(), None);
    }

    #[test]
    fn ext_func_table_pads_sparse_registrations() {
        unsafe extern "C" fn helper(a: u64, _: u64, _: u64, _: u64, _: u64) -> u64 {
            a + 1
        }
        let mut vm = Vm::new(vec![Insn::new(0x95, 0, 0, 0, 0)]);
        vm.register_ext_func(2, helper);
        assert_eq!(vm.ext_funcs.len(), 3);
    }
}
