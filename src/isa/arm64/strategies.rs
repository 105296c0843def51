//! AArch64 rewriting strategies.
//!
//! Fixed-width words make the options narrower than on x86: the wide-move
//! family recomposes constants through MOVZ/MOVN/MOVK, ORR-from-zero and
//! arithmetic fixups; arithmetic immediates split additively; loads and
//! stores split their scaled offset around a base adjustment.

use super::encoding::{
    emit_load_imm, enc_addsub_imm, enc_ldst_uimm, words_clean, Words,
};
use crate::arch::Arch;
use crate::badbytes::BadByteSet;
use crate::error::StrategyError;
use crate::inst::{DecodedInst, Op};
use crate::isa::Seq;
use crate::strategy::{EmitCtx, Strategy, StrategyRegistry};
use smallvec::SmallVec;

/// Register the default AArch64 strategy set.
pub(crate) fn register(registry: &mut StrategyRegistry, arch: Arch) {
    debug_assert_eq!(arch, Arch::Arm64);
    registry.register(Box::new(MovWideRecompose));
    registry.register(Box::new(AddSubImmSplit));
    registry.register(Box::new(LdstOffSplit));
}

fn unclean(inst: &DecodedInst, bad: &BadByteSet) -> bool {
    !bad.bytes_ok(&inst.bytes)
}

fn push_words(ctx: &mut EmitCtx, words: &[u32]) -> Result<(), StrategyError> {
    if words.is_empty() || !words_clean(ctx.bad, words) {
        return Err(StrategyError::Unencodable);
    }
    let mut seq = Seq::new();
    for &w in words {
        seq.extend_from_slice(&w.to_le_bytes());
    }
    ctx.buf.put_bytes(&seq);
    Ok(())
}

// ---------------------------------------------------------------------------
// MOVZ/MOVN recomposition through the clean-constant ladder.

struct MovWideRecompose;

impl MovWideRecompose {
    fn parts(inst: &DecodedInst) -> Option<(bool, u8, u64)> {
        if inst.size() != 4 {
            return None;
        }
        let word = inst.word();
        let sf = word >> 31 == 1;
        let rd = (word & 0x1f) as u8;
        if rd == 31 {
            return None;
        }
        let hw = (word >> 21) & 3;
        if !sf && hw > 1 {
            return None;
        }
        let imm16 = u64::from((word >> 5) & 0xffff);
        let value = match inst.op {
            Op::Movz => imm16 << (16 * hw),
            Op::Movn => {
                let v = !(imm16 << (16 * hw));
                if sf {
                    v
                } else {
                    v & 0xffff_ffff
                }
            }
            _ => return None,
        };
        Some((sf, rd, value))
    }
}

impl Strategy for MovWideRecompose {
    fn name(&self) -> &'static str {
        "movwide-recompose"
    }
    fn arch(&self) -> Arch {
        Arch::Arm64
    }
    fn priority(&self) -> i32 {
        100
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        if !unclean(inst, bad) {
            return false;
        }
        match Self::parts(inst) {
            Some((sf, rd, value)) => {
                let mut out = Words::new();
                emit_load_imm(&mut out, bad, rd, value, sf).is_ok()
            }
            None => false,
        }
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        20
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let (sf, rd, value) = Self::parts(inst).ok_or(StrategyError::Unencodable)?;
        let mut out = Words::new();
        emit_load_imm(&mut out, ctx.bad, rd, value, sf)?;
        push_words(ctx, &out)
    }
}

// ---------------------------------------------------------------------------
// ADD/SUB immediate split.

struct AddSubImmSplit;

struct AddSubImm {
    sf: bool,
    sub: bool,
    rd: u8,
    rn: u8,
    value: u32,
}

fn addsub_parts(inst: &DecodedInst) -> Option<AddSubImm> {
    if inst.size() != 4 || (inst.op != Op::Add && inst.op != Op::Sub) {
        return None;
    }
    let word = inst.word();
    if (word >> 24) & 0x1f != 0b1_0001 || (word >> 29) & 1 == 1 {
        return None;
    }
    let imm12 = (word >> 10) & 0xfff;
    let shifted = (word >> 22) & 1 == 1;
    Some(AddSubImm {
        sf: word >> 31 == 1,
        sub: (word >> 30) & 1 == 1,
        rd: (word & 0x1f) as u8,
        rn: ((word >> 5) & 0x1f) as u8,
        value: imm12 << (if shifted { 12 } else { 0 }),
    })
}

/// A non-zero value as a single ADD/SUB immediate, if representable.
fn addsub_imm_field(value: u32) -> Option<(u16, bool)> {
    if value == 0 {
        return None;
    }
    if value <= 0xfff {
        Some((value as u16, false))
    } else if value & 0xfff == 0 && value >> 12 <= 0xfff {
        Some(((value >> 12) as u16, true))
    } else {
        None
    }
}

impl AddSubImmSplit {
    fn build(inst: &DecodedInst, bad: &BadByteSet) -> Option<[u32; 2]> {
        let p = addsub_parts(inst)?;
        let try_pair = |a: u32, b: u32| -> Option<[u32; 2]> {
            let (ia, sha) = addsub_imm_field(a)?;
            let (ib, shb) = addsub_imm_field(b)?;
            let words = [
                enc_addsub_imm(p.sf, p.sub, p.rd, p.rn, ia, sha),
                enc_addsub_imm(p.sf, p.sub, p.rd, p.rd, ib, shb),
            ];
            words_clean(bad, &words).then_some(words)
        };
        // Natural high/low split first, then an enumerated small residual.
        let hi = p.value & 0xfff_000;
        let lo = p.value & 0xfff;
        if hi != 0 && lo != 0 {
            if let Some(w) = try_pair(hi, lo) {
                return Some(w);
            }
        }
        for adj in 1..=255u32 {
            if adj >= p.value {
                break;
            }
            if let Some(w) = try_pair(p.value - adj, adj) {
                return Some(w);
            }
        }
        None
    }
}

impl Strategy for AddSubImmSplit {
    fn name(&self) -> &'static str {
        "addsub-imm-split"
    }
    fn arch(&self) -> Arch {
        Arch::Arm64
    }
    fn priority(&self) -> i32 {
        90
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        unclean(inst, bad) && Self::build(inst, bad).is_some()
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        8
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let words = Self::build(inst, ctx.bad).ok_or(StrategyError::Unencodable)?;
        push_words(ctx, &words)
    }
}

// ---------------------------------------------------------------------------
// Load/store unsigned-offset split.

struct LdstOffSplit;

struct LdstImm {
    scale: u8,
    load: bool,
    rt: u8,
    rn: u8,
    disp: u32,
}

fn ldst_parts(inst: &DecodedInst) -> Option<LdstImm> {
    if inst.size() != 4 || (inst.op != Op::Ldr && inst.op != Op::Str) {
        return None;
    }
    let word = inst.word();
    if (word >> 24) & 0x3f != 0b11_1001 {
        return None;
    }
    let opc = (word >> 22) & 3;
    if opc > 1 {
        // Sign-extending loads keep their encoding.
        return None;
    }
    let scale = (word >> 30) as u8;
    let imm12 = (word >> 10) & 0xfff;
    Some(LdstImm {
        scale,
        load: opc == 1,
        rt: (word & 0x1f) as u8,
        rn: ((word >> 5) & 0x1f) as u8,
        disp: imm12 << scale,
    })
}

impl LdstOffSplit {
    fn build(inst: &DecodedInst, bad: &BadByteSet) -> Option<SmallVec<[u32; 3]>> {
        let p = ldst_parts(inst)?;
        if p.rt == p.rn && !p.load {
            return None;
        }
        let restore = !(p.load && p.rt == p.rn);
        let unit = 1u32 << p.scale;
        for units in 1..=255u32 {
            let res = units * unit;
            if res >= p.disp {
                break;
            }
            let pre = p.disp - res;
            let (pi, psh) = match addsub_imm_field(pre) {
                Some(f) => f,
                None => continue,
            };
            let mut words: SmallVec<[u32; 3]> = SmallVec::new();
            words.push(enc_addsub_imm(true, false, p.rn, p.rn, pi, psh));
            words.push(enc_ldst_uimm(p.scale, p.load, p.rt, p.rn, units as u16));
            if restore {
                words.push(enc_addsub_imm(true, true, p.rn, p.rn, pi, psh));
            }
            if words_clean(bad, &words) {
                return Some(words);
            }
        }
        None
    }
}

impl Strategy for LdstOffSplit {
    fn name(&self) -> &'static str {
        "ldst-off-split"
    }
    fn arch(&self) -> Arch {
        Arch::Arm64
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
        push_words(ctx, &words)
    }
}
