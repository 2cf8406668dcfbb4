//! Just-in-time compiler translating eBPF bytecode into x86-64 machine code.
//!
//! The crate is organized the way a small code generator usually is: an
//! ISA model describing how opcode bytes decode (`isa`), a register map
//! fixing the eBPF-to-x86-64 assignment (`registers`), a thin emitter
//! over the `dynasmrt` assembler (`emit`), the opcode translator that is
//! the bulk of the logic (`translate`), and a compile driver that links,
//! maps, and protects the resulting page (`jit`).
//!
//! THE CORE of this crate is the translator and the compile driver; the
//! eBPF loader, verifier, interpreter, and helper-function registry are
//! all external collaborators this crate never implements. Callers hand
//! us an already-validated instruction array and a table of helper
//! function pointers; we hand back an executable page.

#![warn(missing_docs)]

pub mod error;
pub mod insn;
pub mod isa;
pub mod registers;
pub mod vm;

mod emit;
mod jit;
mod translate;

pub use error::JitError;
pub use insn::Insn;
pub use registers::RegisterMap;
pub use vm::{ExtFunc, Vm};
