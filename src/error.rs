//! Compile-time error type.
//!
//! Every failure mode the compile driver can hit (see SPEC_FULL.md §7)
//! gets its own variant carrying enough context to reproduce the
//! failure without re-running the compile. There is exactly one
//! *runtime* error defined by this crate -- division by zero -- and it
//! is not represented here at all: it never reaches Rust, it is a
//! trampoline baked into the compiled code (see [`crate::jit`]).

use thiserror::Error;

/// Failure returned by [`crate::vm::Vm::compile`].
#[derive(Debug, Error)]
pub enum JitError {
    /// The program handed to `compile` had zero instructions.
    #[error("cannot compile an empty program")]
    EmptyProgram,

    /// An opcode byte didn't match any case the translator knows about.
    ///
    /// This should be unreachable for verifier-validated input; it
    /// exists so a malformed program fails loudly instead of emitting
    /// garbage code.
    #[error("unknown opcode {opcode:#04x} at PC {pc}")]
    UnknownOpcode {
        /// The unrecognized opcode byte.
        opcode: u8,
        /// The eBPF program counter at which it was found.
        pc: usize,
    },

    /// An LDDW occupied the last slot of the program, so there was no
    /// second instruction to supply the upper half of the immediate.
    #[error("wide load (LDDW) at PC {pc} has no following instruction")]
    TruncatedWideLoad {
        /// The PC of the LDDW instruction.
        pc: usize,
    },

    /// `VecAssembler::finalize` couldn't resolve every label reference.
    #[error("assembler failed to link: {0}")]
    Link(#[source] dynasmrt::DynasmError),

    /// The anonymous RW mapping for the JIT page could not be created.
    #[error("failed to mmap {len} bytes for the JIT page: {source}")]
    Mmap {
        /// Requested page length in bytes.
        len: usize,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// `mprotect` could not switch the JIT page from RW to RX.
    #[error("failed to mprotect the JIT page read-execute: {0}")]
    Protect(#[source] std::io::Error),
}
