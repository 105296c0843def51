//! ARM32 rewriting strategies.
//!
//! All A32 instructions are single words, so every strategy here decodes the
//! fields it needs straight from the raw word and composes replacement words
//! with the `enc_*` helpers. Conditional instructions keep their condition
//! on every emitted word, which preserves the predicated behaviour without
//! any skip branches.

use super::encoding::{
    enc_branch, enc_dp_imm, enc_ldst_imm, enc_movt, enc_movw, push_word, rotated_imm_decode,
    rotated_imm_encode, split_displacement, words_clean, Cond, DpOp,
};
use crate::arch::Arch;
use crate::badbytes::BadByteSet;
use crate::error::StrategyError;
use crate::inst::{DecodedInst, Op};
use crate::isa::Seq;
use crate::strategy::{EmitCtx, Strategy, StrategyRegistry};
use smallvec::SmallVec;

/// Register the default ARM32 strategy set.
pub(crate) fn register(registry: &mut StrategyRegistry, arch: Arch) {
    debug_assert_eq!(arch, Arch::Arm32);
    registry.register(Box::new(MvnComplement));
    registry.register(Box::new(DpAltRotation));
    registry.register(Box::new(DpChunkSplit));
    registry.register(Box::new(DpAddSubAdjust));
    registry.register(Box::new(LdstDispSplit));
    registry.register(Box::new(MovwMovt));
    registry.register(Box::new(LoadLiteral));
}

fn unclean(inst: &DecodedInst, bad: &BadByteSet) -> bool {
    !bad.bytes_ok(&inst.bytes)
}

/// Fields of a data-processing immediate word.
struct DpImm {
    cond: Cond,
    s: bool,
    rn: u8,
    rd: u8,
    imm12: u16,
}

fn dp_imm_parts(inst: &DecodedInst) -> Option<DpImm> {
    if inst.size() != 4 {
        return None;
    }
    let word = inst.word();
    if (word >> 25) & 0b111 != 0b001 {
        return None;
    }
    Some(DpImm {
        cond: Cond::from_bits((word >> 28) as u8)?,
        s: (word >> 20) & 1 == 1,
        rn: ((word >> 16) & 0xf) as u8,
        rd: ((word >> 12) & 0xf) as u8,
        imm12: (word & 0xfff) as u16,
    })
}

/// The value an immediate move family instruction leaves in its register.
fn move_value(inst: &DecodedInst) -> Option<(Cond, u8, u32)> {
    let p = dp_imm_parts(inst)?;
    if p.s || p.rd == 15 {
        return None;
    }
    let value = match inst.op {
        Op::Mov => rotated_imm_decode(p.imm12),
        Op::Mvn => !rotated_imm_decode(p.imm12),
        Op::Movw => {
            let word = inst.word();
            ((word >> 16) & 0xf) << 12 | (word & 0xfff)
        }
        _ => return None,
    };
    Some((p.cond, p.rd, value))
}

/// Byte-aligned chunks of a value, each rotated-immediate encodable.
fn chunks(value: u32) -> SmallVec<[u32; 4]> {
    let mut out = SmallVec::new();
    for i in 0..4 {
        let c = value & (0xff << (8 * i));
        if c != 0 {
            out.push(c);
        }
    }
    out
}

fn finish(ctx: &mut EmitCtx, words: &[u32]) -> Result<(), StrategyError> {
    if words.is_empty() || !words_clean(ctx.bad, words) {
        return Err(StrategyError::Unencodable);
    }
    let mut seq = Seq::new();
    for &w in words {
        push_word(&mut seq, w);
    }
    ctx.buf.put_bytes(&seq);
    Ok(())
}

// ---------------------------------------------------------------------------
// MOV #imm -> MVN #~imm (and the reverse).

struct MvnComplement;

impl MvnComplement {
    fn build(inst: &DecodedInst) -> Option<u32> {
        let (cond, rd, value) = move_value(inst)?;
        match inst.op {
            Op::Mov => Some(enc_dp_imm(cond, DpOp::Mvn, false, 0, rd, rotated_imm_encode(!value)?)),
            Op::Mvn => Some(enc_dp_imm(cond, DpOp::Mov, false, 0, rd, rotated_imm_encode(value)?)),
            _ => None,
        }
    }
}

impl Strategy for MvnComplement {
    fn name(&self) -> &'static str {
        "mvn-complement"
    }
    fn arch(&self) -> Arch {
        Arch::Arm32
    }
    fn priority(&self) -> i32 {
        100
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        unclean(inst, bad)
            && matches!(
                Self::build(inst),
                Some(w) if bad.integer_ok(u64::from(w), 4)
            )
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        4
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let word = Self::build(inst).ok_or(StrategyError::Unencodable)?;
        finish(ctx, &[word])
    }
}

// ---------------------------------------------------------------------------
// Same operation, different rotation of the same immediate.

struct DpAltRotation;

impl DpAltRotation {
    fn build(inst: &DecodedInst, bad: &BadByteSet) -> Option<u32> {
        let p = dp_imm_parts(inst)?;
        // Rotation choice feeds the shifter carry; stay away from the
        // flag-setting forms.
        if p.s || matches!(inst.op, Op::Movw | Op::Movt | Op::Other) {
            return None;
        }
        let word = inst.word();
        let value = rotated_imm_decode(p.imm12);
        for rot in 0..16u32 {
            let payload = value.rotate_left(rot * 2);
            if payload >= 256 {
                continue;
            }
            let imm12 = ((rot as u16) << 8) | payload as u16;
            if imm12 == p.imm12 {
                continue;
            }
            let cand = (word & 0xffff_f000) | u32::from(imm12);
            if bad.integer_ok(u64::from(cand), 4) {
                return Some(cand);
            }
        }
        None
    }
}

impl Strategy for DpAltRotation {
    fn name(&self) -> &'static str {
        "dp-alt-rotation"
    }
    fn arch(&self) -> Arch {
        Arch::Arm32
    }
    fn priority(&self) -> i32 {
        95
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        unclean(inst, bad) && Self::build(inst, bad).is_some()
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        4
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let word = Self::build(inst, ctx.bad).ok_or(StrategyError::Unencodable)?;
        finish(ctx, &[word])
    }
}

// ---------------------------------------------------------------------------
// Additive decomposition into byte-aligned chunks.

struct DpChunkSplit;

impl DpChunkSplit {
    fn build(inst: &DecodedInst) -> Option<SmallVec<[u32; 5]>> {
        let mut words = SmallVec::new();
        match inst.op {
            Op::Mov | Op::Mvn | Op::Movw => {
                let (cond, rd, value) = move_value(inst)?;
                let parts = chunks(value);
                if parts.len() < 2 {
                    return None;
                }
                for (i, &c) in parts.iter().enumerate() {
                    let imm = rotated_imm_encode(c)?;
                    let w = if i == 0 {
                        enc_dp_imm(cond, DpOp::Mov, false, 0, rd, imm)
                    } else {
                        enc_dp_imm(cond, DpOp::Add, false, rd, rd, imm)
                    };
                    words.push(w);
                }
            }
            Op::Add | Op::Sub => {
                let p = dp_imm_parts(inst)?;
                if p.s || p.rd == 15 || p.rn == 15 {
                    return None;
                }
                let op = if inst.op == Op::Add { DpOp::Add } else { DpOp::Sub };
                let value = rotated_imm_decode(p.imm12);
                let parts = chunks(value);
                if parts.len() < 2 {
                    return None;
                }
                for (i, &c) in parts.iter().enumerate() {
                    let imm = rotated_imm_encode(c)?;
                    let w = if i == 0 {
                        enc_dp_imm(p.cond, op, false, p.rn, p.rd, imm)
                    } else {
                        enc_dp_imm(p.cond, op, false, p.rd, p.rd, imm)
                    };
                    words.push(w);
                }
            }
            _ => return None,
        }
        Some(words)
    }
}

impl Strategy for DpChunkSplit {
    fn name(&self) -> &'static str {
        "dp-chunk-split"
    }
    fn arch(&self) -> Arch {
        Arch::Arm32
    }
    fn priority(&self) -> i32 {
        90
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        unclean(inst, bad)
            && matches!(Self::build(inst), Some(ws) if words_clean(bad, &ws))
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        16
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let words = Self::build(inst).ok_or(StrategyError::Unencodable)?;
        finish(ctx, &words)
    }
}

// ---------------------------------------------------------------------------
// Move with a small adjustment: load a nearby encodable constant, then add
// or subtract the difference.

struct DpAddSubAdjust;

impl DpAddSubAdjust {
    fn build(inst: &DecodedInst, bad: &BadByteSet) -> Option<[u32; 2]> {
        let (cond, rd, value) = move_value(inst)?;
        for adj in 1..=255u32 {
            let adj_imm = match rotated_imm_encode(adj) {
                Some(i) => i,
                None => continue,
            };
            for (base, fixup) in [
                (value.wrapping_add(adj), DpOp::Sub),
                (value.wrapping_sub(adj), DpOp::Add),
            ] {
                if let Some(base_imm) = rotated_imm_encode(base) {
                    let words = [
                        enc_dp_imm(cond, DpOp::Mov, false, 0, rd, base_imm),
                        enc_dp_imm(cond, fixup, false, rd, rd, adj_imm),
                    ];
                    if words_clean(bad, &words) {
                        return Some(words);
                    }
                }
            }
        }
        None
    }
}

impl Strategy for DpAddSubAdjust {
    fn name(&self) -> &'static str {
        "dp-addsub-adjust"
    }
    fn arch(&self) -> Arch {
        Arch::Arm32
    }
    fn priority(&self) -> i32 {
        88
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        unclean(inst, bad) && Self::build(inst, bad).is_some()
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        8
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let words = Self::build(inst, ctx.bad).ok_or(StrategyError::Unencodable)?;
        finish(ctx, &words)
    }
}

// ---------------------------------------------------------------------------
// Load/store displacement split: pre-adjust the base, access with a small
// residual, restore.

struct LdstDispSplit;

struct LdstImm {
    cond: Cond,
    load: bool,
    byte: bool,
    rn: u8,
    rt: u8,
    disp: i32,
}

fn ldst_imm_parts(inst: &DecodedInst) -> Option<LdstImm> {
    if inst.size() != 4 {
        return None;
    }
    let word = inst.word();
    // Immediate offset form with P=1, W=0 only.
    if (word >> 25) & 0b111 != 0b010 || (word >> 24) & 1 != 1 || (word >> 21) & 1 != 0 {
        return None;
    }
    let imm12 = (word & 0xfff) as i32;
    let disp = if (word >> 23) & 1 == 1 { imm12 } else { -imm12 };
    Some(LdstImm {
        cond: Cond::from_bits((word >> 28) as u8)?,
        load: (word >> 20) & 1 == 1,
        byte: (word >> 22) & 1 == 1,
        rn: ((word >> 16) & 0xf) as u8,
        rt: ((word >> 12) & 0xf) as u8,
        disp,
    })
}

impl LdstDispSplit {
    fn build(inst: &DecodedInst, bad: &BadByteSet) -> Option<SmallVec<[u32; 3]>> {
        let p = ldst_imm_parts(inst)?;
        if p.rn == 15 || p.rt == 15 || (!p.load && p.rt == p.rn) {
            return None;
        }
        let restore = !(p.load && p.rt == p.rn);
        let compose = |pre: i32, res: i32| -> Option<SmallVec<[u32; 3]>> {
            let mag = rotated_imm_encode(pre.unsigned_abs())?;
            let (fwd, back) = if pre >= 0 {
                (DpOp::Add, DpOp::Sub)
            } else {
                (DpOp::Sub, DpOp::Add)
            };
            let mut words: SmallVec<[u32; 3]> = SmallVec::new();
            words.push(enc_dp_imm(p.cond, fwd, false, p.rn, p.rn, mag));
            words.push(enc_ldst_imm(p.cond, p.load, p.byte, p.rn, p.rt, res)?);
            if restore {
                words.push(enc_dp_imm(p.cond, back, false, p.rn, p.rn, mag));
            }
            Some(words)
        };
        let (pre, res) = split_displacement(p.disp, |pre, res| {
            matches!(compose(pre, res), Some(ws) if words_clean(bad, &ws))
        })?;
        compose(pre, res)
    }
}

impl Strategy for LdstDispSplit {
    fn name(&self) -> &'static str {
        "ldst-disp-split"
    }
    fn arch(&self) -> Arch {
        Arch::Arm32
    }
    fn priority(&self) -> i32 {
        85
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        unclean(inst, bad) && Self::build(inst, bad).is_some()
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        12
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let words = Self::build(inst, ctx.bad).ok_or(StrategyError::Unencodable)?;
        finish(ctx, &words)
    }
}

// ---------------------------------------------------------------------------
// MOVW/MOVT wide load (ARMv7).

struct MovwMovt;

impl MovwMovt {
    fn build(inst: &DecodedInst) -> Option<SmallVec<[u32; 2]>> {
        let (cond, rd, value) = move_value(inst)?;
        let mut words = SmallVec::new();
        words.push(enc_movw(cond, rd, (value & 0xffff) as u16));
        if value >> 16 != 0 {
            words.push(enc_movt(cond, rd, (value >> 16) as u16));
        }
        Some(words)
    }
}

impl Strategy for MovwMovt {
    fn name(&self) -> &'static str {
        "movw-movt"
    }
    fn arch(&self) -> Arch {
        Arch::Arm32
    }
    fn priority(&self) -> i32 {
        80
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        unclean(inst, bad)
            && matches!(Self::build(inst), Some(ws) if words_clean(bad, &ws))
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        8
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let words = Self::build(inst).ok_or(StrategyError::Unencodable)?;
        finish(ctx, &words)
    }
}

// ---------------------------------------------------------------------------
// PC-relative literal load. Only viable when the literal itself is clean,
// which rules it out for the common null-free case; kept for byte sets that
// permit zeros but poison the data-processing space.

struct LoadLiteral;

impl LoadLiteral {
    fn build(inst: &DecodedInst) -> Option<SmallVec<[u32; 3]>> {
        let (cond, rd, value) = move_value(inst)?;
        let mut words = SmallVec::new();
        // b +0 (over the literal) ; .word value ; ldr rd, [pc, #-12]
        words.push(enc_branch(Cond::Al, false, 0)?);
        words.push(value);
        words.push(enc_ldst_imm(cond, true, false, 15, rd, -12)?);
        Some(words)
    }
}

impl Strategy for LoadLiteral {
    fn name(&self) -> &'static str {
        "load-literal"
    }
    fn arch(&self) -> Arch {
        Arch::Arm32
    }
    fn priority(&self) -> i32 {
        70
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        unclean(inst, bad)
            && matches!(Self::build(inst), Some(ws) if words_clean(bad, &ws))
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        12
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let words = Self::build(inst).ok_or(StrategyError::Unencodable)?;
        finish(ctx, &words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{AddressMap, OutputBuffer};
    use crate::inst::{FlowKind, RepPrefix};
    use smallvec::smallvec;

    fn arm_inst(word: u32, op: Op) -> DecodedInst {
        DecodedInst {
            address: 0x1000,
            bytes: SmallVec::from_slice(&word.to_le_bytes()),
            op,
            mnemonic: String::new(),
            operands: smallvec![],
            flow: FlowKind::None,
            target: None,
            cc: Some((word >> 28) as u8),
            rep: RepPrefix::None,
            elem_bits: 0,
        }
    }

    fn emit_words<S: Strategy>(s: &S, inst: &DecodedInst, bad: &BadByteSet) -> Option<Vec<u32>> {
        let mut buf = OutputBuffer::new();
        let map = AddressMap::default();
        let mut sites = Vec::new();
        let mut ctx = EmitCtx::new(&mut buf, bad, Arch::Arm32, 0, 0, &map, 0, 0, &mut sites);
        s.emit(inst, &mut ctx).ok()?;
        let bytes = buf.into_vec();
        Some(
            bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    #[test]
    fn mov_ff_rewrites_cleanly_under_ff_ban() {
        // mov r0, #0xff with 0xff forbidden. The complement 0xffffff00 has
        // no rotated encoding, so the MVN rung cannot fire; the add/sub
        // adjustment picks up the chain.
        let bad = BadByteSet::new(&[0xff]);
        let inst = arm_inst(0xe3a0_00ff, Op::Mov);
        assert!(!MvnComplement.is_applicable(&inst, &bad));
        let strat = DpAddSubAdjust;
        assert!(strat.is_applicable(&inst, &bad));
        let words = emit_words(&strat, &inst, &bad).unwrap();
        assert_eq!(words.len(), 2);
        assert!(words_clean(&bad, &words));
        // mov r0, #base ; add/sub r0, r0, #adj recomposes 0xff.
        let base = rotated_imm_decode((words[0] & 0xfff) as u16);
        let adj = rotated_imm_decode((words[1] & 0xfff) as u16);
        let result = if (words[1] >> 21) & 0xf == DpOp::Add as u32 {
            base.wrapping_add(adj)
        } else {
            base.wrapping_sub(adj)
        };
        assert_eq!(result, 0xff);
    }

    #[test]
    fn chunk_split_of_two_chunk_value() {
        // mov r1, #0x3fc encodes as payload 0xff with rotation 30; banning
        // 0xff forces the two-chunk recomposition 0xfc + 0x300.
        let imm = rotated_imm_encode(0x3fc).unwrap();
        let word = enc_dp_imm(Cond::Al, DpOp::Mov, false, 0, 1, imm);
        let bad = BadByteSet::new(&[0xff]);
        assert!(!bad.integer_ok(u64::from(word), 4));
        let inst = arm_inst(word, Op::Mov);
        let strat = DpChunkSplit;
        assert!(strat.is_applicable(&inst, &bad));
        let words = emit_words(&strat, &inst, &bad).unwrap();
        assert_eq!(words.len(), 2);
        assert!(words_clean(&bad, &words));
        let w0_value = rotated_imm_decode((words[0] & 0xfff) as u16);
        let w1_value = rotated_imm_decode((words[1] & 0xfff) as u16);
        assert_eq!(w0_value + w1_value, 0x3fc);
    }

    #[test]
    fn ldst_split_round_trip() {
        // ldr r0, [r1, #0x104]: banned byte 0x01 poisons the imm12 field.
        let word = enc_ldst_imm(Cond::Al, true, false, 1, 0, 0x104).unwrap();
        let bad = BadByteSet::new(&[0x04]);
        assert!(!bad.integer_ok(u64::from(word), 4));
        let inst = arm_inst(word, Op::Ldr);
        let strat = LdstDispSplit;
        assert!(strat.is_applicable(&inst, &bad));
        let words = emit_words(&strat, &inst, &bad).unwrap();
        assert_eq!(words.len(), 3, "adjust, access, restore");
        assert!(words_clean(&bad, &words));
        // The adjustment and residual recompose the displacement.
        let pre_imm = rotated_imm_decode((words[0] & 0xfff) as u16) as i32;
        let res_imm = (words[1] & 0xfff) as i32;
        let res = if (words[1] >> 23) & 1 == 1 { res_imm } else { -res_imm };
        let pre = if (words[0] >> 21) & 0xf == DpOp::Add as u32 { pre_imm } else { -pre_imm };
        assert_eq!(pre + res, 0x104);
    }

    #[test]
    fn movw_movt_pair() {
        let bad = BadByteSet::new(&[0x24]);
        // mov r2, #0xff000000 carries 0x24 in its second byte.
        let imm = rotated_imm_encode(0xff00_0000).unwrap();
        let word = enc_dp_imm(Cond::Al, DpOp::Mov, false, 0, 2, imm);
        assert!(!bad.integer_ok(u64::from(word), 4));
        let inst = arm_inst(word, Op::Mov);
        let strat = MovwMovt;
        assert!(strat.is_applicable(&inst, &bad));
        let words = emit_words(&strat, &inst, &bad).unwrap();
        assert_eq!(words.len(), 2);
        assert_eq!(words[0], enc_movw(Cond::Al, 2, 0x0000));
        assert_eq!(words[1], enc_movt(Cond::Al, 2, 0xff00));
    }
}
