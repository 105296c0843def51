//! Per-ISA encoding helpers, strategies, and branch ladders.

pub mod arm32;
pub mod arm64;
pub mod x86;

use smallvec::SmallVec;

use crate::arch::Arch;
use crate::inst::DecodedInst;
use crate::strategy::{EmitCtx, StrategyRegistry};

/// Replacement byte sequence under construction.
pub type Seq = SmallVec<[u8; 32]>;

/// Result of one branch-ladder emission.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BranchOutcome {
    /// Form name recorded in the rewrite record.
    pub name: &'static str,
    /// Whether the emitted bytes satisfy the byte-set constraint.
    pub clean: bool,
    /// Whether the widening level increased during this emission.
    pub grew: bool,
}

/// Register the default rewriting strategies for `arch`.
pub(crate) fn register_default(registry: &mut StrategyRegistry, arch: Arch) {
    match arch {
        Arch::X86 | Arch::X64 => x86::strategies::register(registry, arch),
        Arch::Arm32 => arm32::strategies::register(registry, arch),
        Arch::Arm64 => arm64::strategies::register(registry, arch),
    }
}

/// Emit a PC-relative transfer through the architecture's widening ladder.
pub(crate) fn emit_branch(inst: &DecodedInst, widen: &mut u8, ctx: &mut EmitCtx) -> BranchOutcome {
    match ctx.arch {
        Arch::X86 | Arch::X64 => x86::branches::emit_branch(inst, widen, ctx),
        Arch::Arm32 => arm32::branches::emit_branch(inst, widen, ctx),
        Arch::Arm64 => arm64::branches::emit_branch(inst, widen, ctx),
    }
}
