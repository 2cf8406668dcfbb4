//! x86-64 register numbers and the eBPF-to-x86-64 register map.
//!
//! The numbering below is the ordinary x86-64 encoding (the order
//! `rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8..r15` that every
//! assembler and disassembler uses), not an arbitrary internal
//! enumeration.

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

/// `rax`
pub const RAX: u8 = 0;
/// `rcx` -- never present in a [`RegisterMap`]; reserved for variable
/// shift counts, byte-register access, and pre-call staging.
pub const RCX: u8 = 1;
/// `rdx`
pub const RDX: u8 = 2;
/// `rbx`
pub const RBX: u8 = 3;
/// `rsp` -- never present in a [`RegisterMap`]; reserved by the ABI.
pub const RSP: u8 = 4;
/// `rbp`
pub const RBP: u8 = 5;
/// `rsi`
pub const RSI: u8 = 6;
/// `rdi`
pub const RDI: u8 = 7;
/// `r8`
pub const R8: u8 = 8;
/// `r9`
pub const R9: u8 = 9;
/// `r10` -- caller-saved scratch, never present in a [`RegisterMap`].
pub const R10: u8 = 10;
/// `r11` -- caller-saved scratch, never present in a [`RegisterMap`].
pub const R11: u8 = 11;
/// `r12` -- excluded from the map; the assembler this crate was ported
/// from cannot reliably encode some forms against r12 (it collides
/// with the SIB-required encoding of rsp). A port on a different
/// assembler backend may lift this restriction, but would then need to
/// revisit the bswap/movzx workarounds below as well.
pub const R12: u8 = 12;
/// `r13`
pub const R13: u8 = 13;
/// `r14`
pub const R14: u8 = 14;
/// `r15`
pub const R15: u8 = 15;

/// The five callee-save registers this crate's prologue/epilogue save
/// and restore, in push order (LIFO: the epilogue pops them in the
/// reverse of this order).
pub const CALLEE_SAVED: [u8; 5] = [RBP, RBX, R13, R14, R15];

/// `true` for registers whose encoding requires a REX prefix (r8..r15)
/// and for which `bswap`/low-byte forms are unreliable in the
/// assembler this crate targets; see [`crate::emit`].
pub fn needs_rex_workaround(reg: u8) -> bool {
    reg >= 8
}

/// The eBPF-to-x86-64 register assignment used by [`crate::translate`].
///
/// This is a per-compile value, not process-wide state: the historical
/// implementation this crate is modeled on kept a single mutable
/// global table that `set_register_offset` permuted in place for
/// testing, which made two concurrent compiles with different mappings
/// impossible and made the mapping an invisible dependency of every
/// translator function. Here it is simply a value threaded through
/// [`crate::vm::Vm::compile`]; [`RegisterMap::rotated`] and
/// [`RegisterMap::shuffled`] return new permuted instances rather than
/// mutating one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap([u8; 11]);

/// The register assignment documented in SPEC_FULL.md §3.
const DEFAULT: [u8; 11] = [
    RAX, // eBPF r0: return value
    RDI, // eBPF r1: arg1 / context
    RSI, // eBPF r2
    RDX, // eBPF r3
    R9,  // eBPF r4
    R8,  // eBPF r5
    RBX, // eBPF r6 (callee-saved)
    R13, // eBPF r7 (callee-saved)
    R14, // eBPF r8 (callee-saved)
    R15, // eBPF r9 (callee-saved)
    RBP, // eBPF r10: read-only frame pointer
];

impl Default for RegisterMap {
    fn default() -> Self {
        RegisterMap(DEFAULT)
    }
}

impl RegisterMap {
    /// Map an eBPF register index (0..=10) to its x86-64 register
    /// number.
    ///
    /// # Panics
    ///
    /// Panics (via a debug assertion) if `ebpf_reg` is out of range.
    /// The verifier is responsible for rejecting instructions naming an
    /// out-of-range register before they ever reach this crate, so an
    /// out-of-range index here indicates a bug in the caller, not a
    /// condition the translator should recover from.
    pub fn map(self, ebpf_reg: u8) -> u8 {
        debug_assert!(
            (ebpf_reg as usize) < self.0.len(),
            "eBPF register {ebpf_reg} out of range; the verifier should have rejected this"
        );
        self.0[ebpf_reg as usize]
    }

    /// Rotate the table by `offset` positions. A thin wrapper test hook
    /// mirroring the historical `set_register_offset(x)` for `x < 11`:
    /// used to confirm the translator always calls [`RegisterMap::map`]
    /// instead of hardcoding a register identity.
    pub fn rotated(self, offset: usize) -> Self {
        let offset = offset % self.0.len();
        let mut out = self.0;
        out.rotate_left(offset);
        RegisterMap(out)
    }

    /// Fisher-Yates shuffle the table, seeded by `seed`. Mirrors the
    /// historical `set_register_offset(x)` for `x >= 11`.
    pub fn shuffled(self, seed: u64) -> Self {
        let mut out = self.0;
        let mut rng = StdRng::seed_from_u64(seed);
        out.shuffle(&mut rng);
        RegisterMap(out)
    }

    /// Iterate the table in eBPF register order, yielding
    /// `(ebpf_reg, x86_reg)` pairs.
    pub fn iter(self) -> impl Iterator<Item = (u8, u8)> {
        self.0.into_iter().enumerate().map(|(i, r)| (i as u8, r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn default_matches_documented_table() {
        let regs = RegisterMap::default();
        assert_eq!(regs.map(0), RAX);
        assert_eq!(regs.map(1), RDI);
        assert_eq!(regs.map(10), RBP);
    }

    #[test]
    fn never_assigns_reserved_registers() {
        let regs = RegisterMap::default();
        for (_, x86) in regs.iter() {
            assert_ne!(x86, RCX, "rcx is reserved for shifts/byte-moves/call staging");
            assert_ne!(x86, RSP, "rsp is reserved by the ABI");
            assert_ne!(x86, R12, "r12 is excluded by assembler encoding limitations");
        }
    }

    #[test]
    fn rotation_is_a_permutation() {
        let base = RegisterMap::default();
        for offset in 0..11 {
            let rotated = base.rotated(offset);
            let set: HashSet<u8> = rotated.iter().map(|(_, r)| r).collect();
            assert_eq!(set.len(), 11, "rotation must not duplicate or drop registers");
        }
        assert_eq!(base.rotated(0), base);
        assert_eq!(base.rotated(11), base);
    }

    #[test]
    fn shuffle_is_a_permutation_and_is_deterministic_per_seed() {
        let base = RegisterMap::default();
        let a = base.shuffled(42);
        let b = base.shuffled(42);
        assert_eq!(a, b, "same seed must reproduce the same permutation");

        let set: HashSet<u8> = a.iter().map(|(_, r)| r).collect();
        assert_eq!(set.len(), 11);
    }
}
