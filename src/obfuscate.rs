//! Obfuscation strategies.
//!
//! These share the rewriting contract but run in the optional pre-rewrite
//! pass, sampled per instruction at the rates below. Decoration choices are
//! derived from a per-instruction seed drawn from the job PRNG, so a job
//! re-emits identically across relocation iterations. Every emission must
//! decode as ordinary instructions: the pass output is disassembled again
//! for the cleanliness pass, which rules out raw filler bytes.
//!
//! None of these apply to PC-relative transfers; wrapping a branch would
//! detach its recorded displacement from the relocation machinery.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::arch::Arch;
use crate::badbytes::BadByteSet;
use crate::error::StrategyError;
use crate::inst::{DecodedInst, FlowKind, Op, Operand};
use crate::isa::x86::encoding::{alu_rr, lea_reg_base_disp, modrm};
use crate::isa::Seq;
use crate::strategy::{EmitCtx, Strategy, StrategyRegistry};

/// Register the default obfuscation set for `arch`.
pub(crate) fn register(registry: &mut StrategyRegistry, arch: Arch) {
    match arch {
        Arch::X86 | Arch::X64 => {
            registry.register(Box::new(EquivSub { arch }));
            registry.register(Box::new(CallPopPic { arch }));
            registry.register(Box::new(JunkInsertion { arch }));
            registry.register(Box::new(OpaquePredicate { arch }));
            registry.register(Box::new(FnopPad { arch }));
        }
        Arch::Arm32 => registry.register(Box::new(Arm32Junk)),
        Arch::Arm64 => registry.register(Box::new(Arm64Junk)),
    }
}

/// Wrappable: no PC-relative flow and no PC-relative memory operand whose
/// displacement would detach from the relocation machinery.
fn is_plain(inst: &DecodedInst) -> bool {
    matches!(inst.flow, FlowKind::None)
        && !inst
            .operands
            .iter()
            .any(|op| matches!(op, Operand::Mem(m) if m.pc_relative))
}

fn finish(ctx: &mut EmitCtx, cand: Seq) -> Result<(), StrategyError> {
    if cand.is_empty() || !ctx.bad.bytes_ok(&cand) {
        return Err(StrategyError::Unencodable);
    }
    ctx.buf.put_bytes(&cand);
    Ok(())
}

// ---------------------------------------------------------------------------
// Flag-preserving junk before the instruction.

struct JunkInsertion {
    arch: Arch,
}

impl JunkInsertion {
    fn units(&self) -> &'static [&'static [u8]] {
        if self.arch == Arch::X86 {
            &[
                &[0x50, 0x58],       // push/pop eax
                &[0x51, 0x59],       // push/pop ecx
                &[0x90],             // nop
                &[0x8d, 0x36],       // lea esi, [esi]
                &[0x87, 0xdb],       // xchg ebx, ebx
            ]
        } else {
            &[
                &[0x50, 0x58],
                &[0x51, 0x59],
                &[0x90],
            ]
        }
    }
}

impl Strategy for JunkInsertion {
    fn name(&self) -> &'static str {
        "junk-insertion"
    }
    fn arch(&self) -> Arch {
        self.arch
    }
    fn priority(&self) -> i32 {
        50
    }
    fn rate(&self) -> f64 {
        0.35
    }
    fn is_applicable(&self, inst: &DecodedInst, _: &BadByteSet) -> bool {
        is_plain(inst)
    }
    fn worst_size(&self, inst: &DecodedInst) -> usize {
        inst.size() + 4
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let mut rng = SmallRng::seed_from_u64(ctx.seed);
        let units = self.units();
        let mut cand = Seq::new();
        for _ in 0..rng.random_range(1..=2) {
            cand.extend_from_slice(units[rng.random_range(0..units.len())]);
        }
        cand.extend_from_slice(&inst.bytes);
        finish(ctx, cand)
    }
}

// ---------------------------------------------------------------------------
// FPU no-op padding.

struct FnopPad {
    arch: Arch,
}

impl Strategy for FnopPad {
    fn name(&self) -> &'static str {
        "fnop-pad"
    }
    fn arch(&self) -> Arch {
        self.arch
    }
    fn priority(&self) -> i32 {
        40
    }
    fn rate(&self) -> f64 {
        0.15
    }
    fn is_applicable(&self, inst: &DecodedInst, _: &BadByteSet) -> bool {
        is_plain(inst)
    }
    fn worst_size(&self, inst: &DecodedInst) -> usize {
        inst.size() + 2
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let mut cand = Seq::from_slice(&[0xd9, 0xd0]);
        cand.extend_from_slice(&inst.bytes);
        finish(ctx, cand)
    }
}

// ---------------------------------------------------------------------------
// Semantic-equivalent substitution.

struct EquivSub {
    arch: Arch,
}

impl EquivSub {
    fn variants(&self, inst: &DecodedInst, bad: &BadByteSet) -> Vec<Seq> {
        let mut out = Vec::new();
        match inst.op {
            Op::Mov => {
                if let (Some(reg), Some(imm)) = (inst.reg_op(0), inst.imm_op(1)) {
                    if reg.bits == 32 && imm == 0 {
                        for opcode in [0x31u8, 0x29] {
                            let mut s = Seq::new();
                            alu_rr(&mut s, self.arch, opcode, reg.index, reg.index, 32);
                            out.push(s);
                        }
                    }
                    if reg.bits == 32
                        && imm > 0
                        && (self.arch == Arch::X86 || imm <= i32::MAX as i64)
                        && bad.integer_ok(imm as u64, 4)
                        && reg.index < 8
                    {
                        let mut s = Seq::new();
                        s.push(0x68);
                        s.extend_from_slice(&(imm as u32).to_le_bytes());
                        s.push(0x58 + reg.index);
                        out.push(s);
                    }
                }
            }
            Op::Xor | Op::Sub => {
                if let (Some(a), Some(b)) = (inst.reg_op(0), inst.reg_op(1)) {
                    if a == b && a.bits >= 32 {
                        let opcode = if inst.op == Op::Xor { 0x29 } else { 0x31 };
                        let mut s = Seq::new();
                        alu_rr(&mut s, self.arch, opcode, a.index, a.index, a.bits);
                        out.push(s);
                    }
                }
            }
            Op::Inc | Op::Dec => {
                if let Some(reg) = inst.reg_op(0) {
                    if reg.bits == 32 && reg.index != 4 && reg.index < 8 {
                        let disp = if inst.op == Op::Inc { 1 } else { -1 };
                        let mut s = Seq::new();
                        if lea_reg_base_disp(&mut s, bad, self.arch, reg.index, reg.index, disp, 32)
                            .is_ok()
                        {
                            out.push(s);
                        }
                    }
                }
            }
            _ => {}
        }
        out
    }
}

impl Strategy for EquivSub {
    fn name(&self) -> &'static str {
        "equiv-substitution"
    }
    fn arch(&self) -> Arch {
        self.arch
    }
    fn priority(&self) -> i32 {
        60
    }
    fn rate(&self) -> f64 {
        0.5
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        is_plain(inst) && !self.variants(inst, bad).is_empty()
    }
    fn worst_size(&self, inst: &DecodedInst) -> usize {
        inst.size() + 6
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let variants = self.variants(inst, ctx.bad);
        if variants.is_empty() {
            return Err(StrategyError::Unencodable);
        }
        let mut rng = SmallRng::seed_from_u64(ctx.seed);
        let pick = variants[rng.random_range(0..variants.len())].clone();
        finish(ctx, pick)
    }
}

// ---------------------------------------------------------------------------
// Opaque always-taken predicate over dead filler.
//
// Only applied ahead of instructions that overwrite the whole arithmetic
// flag set, because the predicate's CMP clobbers the flags.

struct OpaquePredicate {
    arch: Arch,
}

impl OpaquePredicate {
    fn filler(&self, rng: &mut SmallRng) -> Seq {
        // Dead but decodable: a short run of single-byte register ops.
        let pool: &[u8] = if self.arch == Arch::X86 {
            &[0x40, 0x41, 0x42, 0x43, 0x46, 0x47, 0x48, 0x4b]
        } else {
            &[0x90]
        };
        let n = rng.random_range(1..=3);
        (0..n).map(|_| pool[rng.random_range(0..pool.len())]).collect()
    }
}

impl Strategy for OpaquePredicate {
    fn name(&self) -> &'static str {
        "opaque-predicate"
    }
    fn arch(&self) -> Arch {
        self.arch
    }
    fn priority(&self) -> i32 {
        45
    }
    fn rate(&self) -> f64 {
        0.2
    }
    fn is_applicable(&self, inst: &DecodedInst, _: &BadByteSet) -> bool {
        is_plain(inst)
            && matches!(
                inst.op,
                Op::Add | Op::Sub | Op::Xor | Op::And | Op::Or | Op::Cmp | Op::Test | Op::Neg
            )
    }
    fn worst_size(&self, inst: &DecodedInst) -> usize {
        inst.size() + 7
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let mut rng = SmallRng::seed_from_u64(ctx.seed);
        let filler = self.filler(&mut rng);
        let mut cand = Seq::new();
        // cmp eax, eax ; jz over-the-filler (always taken)
        cand.push(0x39);
        cand.push(modrm(3, 0, 0));
        cand.push(0x74);
        cand.push(filler.len() as u8);
        cand.extend_from_slice(&filler);
        cand.extend_from_slice(&inst.bytes);
        finish(ctx, cand)
    }
}

// ---------------------------------------------------------------------------
// PIC delta retrieval: turn an in-blob absolute move into CALL/POP plus an
// arithmetic adjustment, making the load position-independent.

struct CallPopPic {
    arch: Arch,
}

impl Strategy for CallPopPic {
    fn name(&self) -> &'static str {
        "call-pop-pic"
    }
    fn arch(&self) -> Arch {
        self.arch
    }
    fn priority(&self) -> i32 {
        55
    }
    fn rate(&self) -> f64 {
        0.25
    }
    fn is_applicable(&self, inst: &DecodedInst, _: &BadByteSet) -> bool {
        is_plain(inst)
            && inst.op == Op::Mov
            && matches!(inst.reg_op(0), Some(r) if r.bits == 32 && r.index < 8)
            && inst.imm_op(1).is_some()
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        12
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let reg = inst.reg_op(0).ok_or(StrategyError::Unencodable)?;
        let imm = inst.imm_op(1).ok_or(StrategyError::Unencodable)? as u64;
        // Only immediates that point into the blob can be made
        // position-relative.
        if imm < ctx.base || imm >= ctx.base + ctx.input_len {
            return Err(StrategyError::Unencodable);
        }
        let target_abs = ctx.target_new_abs(imm);
        let mut cand = Seq::new();
        // call +0 ; pop reg ; add/sub reg, delta
        cand.push(0xe8);
        cand.extend_from_slice(&0u32.to_le_bytes());
        cand.push(0x58 + reg.index);
        let pop_addr = ctx.base + u64::from(ctx.offset()) + 5;
        let delta = target_abs.wrapping_sub(pop_addr) as i64;
        let (digit, mag) = if delta >= 0 {
            (0u8, delta as u32)
        } else {
            (5u8, delta.unsigned_abs() as u32)
        };
        cand.push(0x81);
        cand.push(modrm(3, digit, reg.index));
        cand.extend_from_slice(&mag.to_le_bytes());
        finish(ctx, cand)
    }
}

// ---------------------------------------------------------------------------
// ARM junk: a register move onto itself ahead of the instruction.

struct Arm32Junk;

impl Strategy for Arm32Junk {
    fn name(&self) -> &'static str {
        "arm-junk"
    }
    fn arch(&self) -> Arch {
        Arch::Arm32
    }
    fn priority(&self) -> i32 {
        50
    }
    fn rate(&self) -> f64 {
        0.3
    }
    fn is_applicable(&self, inst: &DecodedInst, _: &BadByteSet) -> bool {
        is_plain(inst) && inst.size() == 4
    }
    fn worst_size(&self, inst: &DecodedInst) -> usize {
        inst.size() + 4
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let mut rng = SmallRng::seed_from_u64(ctx.seed);
        let r = rng.random_range(1..=3u32);
        // mov rN, rN
        let word = 0xe1a0_0000 | (r << 12) | r;
        let mut cand = Seq::new();
        cand.extend_from_slice(&word.to_le_bytes());
        cand.extend_from_slice(&inst.bytes);
        finish(ctx, cand)
    }
}

struct Arm64Junk;

impl Strategy for Arm64Junk {
    fn name(&self) -> &'static str {
        "arm64-junk"
    }
    fn arch(&self) -> Arch {
        Arch::Arm64
    }
    fn priority(&self) -> i32 {
        50
    }
    fn rate(&self) -> f64 {
        0.3
    }
    fn is_applicable(&self, inst: &DecodedInst, _: &BadByteSet) -> bool {
        is_plain(inst) && inst.size() == 4
    }
    fn worst_size(&self, inst: &DecodedInst) -> usize {
        inst.size() + 4
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        // orr x13, x13, x13
        let word: u32 = 0xaa0d_01ad;
        let mut cand = Seq::new();
        cand.extend_from_slice(&word.to_le_bytes());
        cand.extend_from_slice(&inst.bytes);
        finish(ctx, cand)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{AddressMap, OutputBuffer};
    use crate::inst::{Reg, RepPrefix};
    use smallvec::smallvec;

    fn mov_ebx_5() -> DecodedInst {
        DecodedInst {
            address: 0x1000,
            bytes: smallvec![0xbb, 0x05, 0x00, 0x00, 0x00],
            op: Op::Mov,
            mnemonic: "mov".to_string(),
            operands: smallvec![
                crate::inst::Operand::Reg(Reg::new(3, 32)),
                crate::inst::Operand::Imm(5)
            ],
            flow: FlowKind::None,
            target: None,
            cc: None,
            rep: RepPrefix::None,
            elem_bits: 0,
        }
    }

    fn emit_seeded<S: Strategy>(
        s: &S,
        inst: &DecodedInst,
        bad: &BadByteSet,
        seed: u64,
    ) -> Option<Vec<u8>> {
        let mut buf = OutputBuffer::new();
        let map = AddressMap::default();
        let mut sites = Vec::new();
        let mut ctx = EmitCtx::new(&mut buf, bad, s.arch(), 0x1000, 0x40, &map, 0, seed, &mut sites);
        s.emit(inst, &mut ctx).ok()?;
        Some(buf.into_vec())
    }

    #[test]
    fn junk_is_deterministic_per_seed() {
        let bad = BadByteSet::empty();
        let strat = JunkInsertion { arch: Arch::X86 };
        let inst = mov_ebx_5();
        let a = emit_seeded(&strat, &inst, &bad, 7).unwrap();
        let b = emit_seeded(&strat, &inst, &bad, 7).unwrap();
        assert_eq!(a, b);
        assert!(a.ends_with(&inst.bytes));
    }

    #[test]
    fn equiv_push_pop_mov() {
        // The push-immediate variant carries the same nulls as the mov, so
        // under a null-free set the substitution offers nothing.
        let strat = EquivSub { arch: Arch::X86 };
        let inst = mov_ebx_5();
        assert!(!strat.is_applicable(&inst, &BadByteSet::null_only()));

        let bad = BadByteSet::empty();
        assert!(strat.is_applicable(&inst, &bad));
        let out = emit_seeded(&strat, &inst, &bad, 1).unwrap();
        assert_eq!(out, vec![0x68, 0x05, 0x00, 0x00, 0x00, 0x5b]);
    }

    #[test]
    fn opaque_predicate_wraps_flag_writers() {
        let bad = BadByteSet::empty();
        let strat = OpaquePredicate { arch: Arch::X86 };
        let inst = DecodedInst {
            address: 0,
            bytes: smallvec![0x31, 0xc0],
            op: Op::Xor,
            mnemonic: "xor".to_string(),
            operands: smallvec![
                crate::inst::Operand::Reg(Reg::new(0, 32)),
                crate::inst::Operand::Reg(Reg::new(0, 32))
            ],
            flow: FlowKind::None,
            target: None,
            cc: None,
            rep: RepPrefix::None,
            elem_bits: 0,
        };
        let out = emit_seeded(&strat, &inst, &bad, 3).unwrap();
        assert_eq!(&out[..2], &[0x39, 0xc0]);
        assert_eq!(out[2], 0x74);
        let skip = out[3] as usize;
        assert_eq!(&out[4 + skip..], &[0x31, 0xc0]);
    }

    #[test]
    fn call_pop_pic_rejects_external_immediates() {
        let bad = BadByteSet::empty();
        let strat = CallPopPic { arch: Arch::X86 };
        // 5 is below the base address 0x1000 used by the harness.
        let inst = mov_ebx_5();
        assert!(emit_seeded(&strat, &inst, &bad, 1).is_none());
    }
}
