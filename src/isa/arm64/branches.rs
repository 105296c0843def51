//! AArch64 branch rewriting ladder.
//!
//! Rungs: the original branch word with a recomputed offset; for the
//! conditional forms an inverted-condition skip over an unconditional `B`;
//! and the same skip over an absolute transfer through x17 (`BR`/`BLR`),
//! which also serves plain `B`/`BL` directly. x17 is the second
//! intra-procedure-call scratch register.

use smallvec::SmallVec;

use super::encoding::{
    emit_load_imm, enc_b, enc_b_cond, enc_blr, enc_br, enc_cbz, enc_tbz, invert_cond, words_clean,
    Words,
};
use crate::buffer::SiteKind;
use crate::inst::{DecodedInst, Op};
use crate::isa::{BranchOutcome, Seq};
use crate::strategy::EmitCtx;

const SCRATCH: u8 = 17;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Form {
    Orig,
    InvSkipNear,
    Abs,
}

#[derive(Clone, Copy)]
enum Kind {
    B,
    Bl,
    BCond(u8),
    Cbz { sf: bool, nonzero: bool, rt: u8 },
    Tbz { b5: bool, nonzero: bool, bit: u8, rt: u8 },
}

fn classify(inst: &DecodedInst) -> Option<Kind> {
    let word = inst.word();
    match inst.op {
        Op::B => match inst.cc {
            None => Some(Kind::B),
            Some(cc) if cc >= 14 => Some(Kind::B),
            Some(cc) => Some(Kind::BCond(cc)),
        },
        Op::Bl => Some(Kind::Bl),
        Op::Cbz | Op::Cbnz => Some(Kind::Cbz {
            sf: word >> 31 == 1,
            nonzero: inst.op == Op::Cbnz,
            rt: (word & 0x1f) as u8,
        }),
        Op::Tbz | Op::Tbnz => Some(Kind::Tbz {
            b5: word >> 31 == 1,
            nonzero: inst.op == Op::Tbnz,
            bit: ((word >> 19) & 0x1f) as u8,
            rt: (word & 0x1f) as u8,
        }),
        _ => None,
    }
}

/// Direct encoding of `kind` at `addr` targeting `target`.
fn direct(kind: Kind, addr: u64, target: u64) -> Option<(u32, SiteKind)> {
    let delta = target.wrapping_sub(addr) as i64;
    if delta & 3 != 0 {
        return None;
    }
    let words = delta >> 2;
    match kind {
        Kind::B => Some((enc_b(false, words)?, SiteKind::A64Branch26)),
        Kind::Bl => Some((enc_b(true, words)?, SiteKind::A64Branch26)),
        Kind::BCond(cc) => Some((enc_b_cond(cc, words)?, SiteKind::A64Branch19)),
        Kind::Cbz { sf, nonzero, rt } => {
            Some((enc_cbz(sf, nonzero, rt, words)?, SiteKind::A64Branch19))
        }
        Kind::Tbz { b5, nonzero, bit, rt } => {
            Some((enc_tbz(b5, nonzero, bit, rt, words)?, SiteKind::A64Branch14))
        }
    }
}

/// Inverted-condition form of `kind` skipping `skip_words` words.
fn inverted(kind: Kind, skip_words: i64) -> Option<u32> {
    match kind {
        Kind::B | Kind::Bl => None,
        Kind::BCond(cc) => enc_b_cond(invert_cond(cc)?, skip_words),
        Kind::Cbz { sf, nonzero, rt } => enc_cbz(sf, !nonzero, rt, skip_words),
        Kind::Tbz { b5, nonzero, bit, rt } => enc_tbz(b5, !nonzero, bit, rt, skip_words),
    }
}

fn abs_block(ctx: &EmitCtx, target: u64, link: bool) -> Option<Words> {
    let mut words = Words::new();
    emit_load_imm(&mut words, ctx.bad, SCRATCH, target, true).ok()?;
    words.push(if link { enc_blr(SCRATCH) } else { enc_br(SCRATCH) });
    Some(words)
}

struct Candidate {
    words: SmallVec<[u32; 8]>,
    site: Option<(u32, SiteKind)>,
    name: &'static str,
}

fn build(
    form: Form,
    kind: Kind,
    target_new: u64,
    pc_base: u64,
    ctx: &EmitCtx,
) -> Option<Candidate> {
    match form {
        Form::Orig => {
            let (word, site) = direct(kind, pc_base, target_new)?;
            let mut words = SmallVec::new();
            words.push(word);
            Some(Candidate {
                words,
                site: Some((0, site)),
                name: "branch-direct",
            })
        }
        Form::InvSkipNear => {
            let mut words = SmallVec::new();
            words.push(inverted(kind, 2)?);
            let delta = target_new.wrapping_sub(pc_base + 4) as i64;
            if delta & 3 != 0 {
                return None;
            }
            words.push(enc_b(false, delta >> 2)?);
            Some(Candidate {
                words,
                site: Some((4, SiteKind::A64Branch26)),
                name: "branch-invert-skip",
            })
        }
        Form::Abs => {
            let link = matches!(kind, Kind::Bl);
            let block = abs_block(ctx, target_new, link)?;
            let mut words: SmallVec<[u32; 8]> = SmallVec::new();
            match kind {
                Kind::B | Kind::Bl => {}
                _ => {
                    words.push(inverted(kind, 1 + block.len() as i64)?);
                }
            }
            words.extend_from_slice(&block);
            Some(Candidate {
                words,
                site: None,
                name: "branch-absolute",
            })
        }
    }
}

/// Emit an A64 relative branch through the ladder.
pub(crate) fn emit_branch(inst: &DecodedInst, widen: &mut u8, ctx: &mut EmitCtx) -> BranchOutcome {
    let kind = match classify(inst) {
        Some(k) => k,
        None => {
            let clean = ctx.bad.bytes_ok(&inst.bytes);
            let bytes = inst.bytes.clone();
            ctx.buf.put_bytes(&bytes);
            return BranchOutcome {
                name: "identity",
                clean,
                grew: false,
            };
        }
    };
    let target = inst.target.unwrap_or(inst.address);
    let target_new = ctx.target_new_abs(target);
    let at = ctx.buf.cur_offset();
    let pc_base = ctx.base + u64::from(at);

    let forms: &[Form] = match kind {
        Kind::B | Kind::Bl => &[Form::Orig, Form::Abs],
        _ => &[Form::Orig, Form::InvSkipNear, Form::Abs],
    };

    let start = usize::from(*widen).min(forms.len() - 1);
    let mut fallback: Option<(usize, Candidate)> = None;
    let mut chosen: Option<(usize, Candidate)> = None;
    for (lvl, &form) in forms.iter().enumerate().skip(start) {
        if let Some(cand) = build(form, kind, target_new, pc_base, ctx) {
            if words_clean(ctx.bad, &cand.words) {
                chosen = Some((lvl, cand));
                break;
            }
            if fallback.is_none() {
                fallback = Some((lvl, cand));
            }
        }
    }

    let (clean, (lvl, cand)) = match chosen {
        Some(c) => (true, c),
        None => match fallback {
            Some(f) => (false, f),
            None => {
                let clean = ctx.bad.bytes_ok(&inst.bytes);
                let bytes = inst.bytes.clone();
                ctx.buf.put_bytes(&bytes);
                return BranchOutcome {
                    name: "identity",
                    clean,
                    grew: false,
                };
            }
        },
    };

    let grew = lvl as u8 > *widen;
    *widen = (*widen).max(lvl as u8);
    if let Some((rel, kind)) = cand.site {
        ctx.record_site(kind, at + rel, target);
    }
    let mut seq = Seq::new();
    for &w in &cand.words {
        seq.extend_from_slice(&w.to_le_bytes());
    }
    ctx.buf.put_bytes(&seq);
    BranchOutcome {
        name: cand.name,
        clean,
        grew,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::badbytes::BadByteSet;
    use crate::buffer::{AddressMap, OutputBuffer, RewriteRecord};
    use crate::inst::{FlowKind, RepPrefix};
    use smallvec::smallvec;

    fn b_uncond(addr: u64, off_words: i32) -> DecodedInst {
        let word = enc_b(false, i64::from(off_words)).unwrap();
        DecodedInst {
            address: addr,
            bytes: SmallVec::from_slice(&word.to_le_bytes()),
            op: Op::B,
            mnemonic: "b".to_string(),
            operands: smallvec![],
            flow: FlowKind::Jump { cond: false },
            target: Some(addr.wrapping_add(i64::from(off_words * 4) as u64)),
            cc: None,
            rep: RepPrefix::None,
            elem_bits: 0,
        }
    }

    #[test]
    fn stable_layout_is_identity() {
        let bad = BadByteSet::new(&[0x42]);
        let inst = b_uncond(0x1000, 4);
        let records = vec![
            RewriteRecord {
                old_address: 0x1000,
                old_size: 4,
                new_offset: 0,
                new_size: 4,
                strategy: "x",
            },
            RewriteRecord {
                old_address: 0x1010,
                old_size: 4,
                new_offset: 0x10,
                new_size: 4,
                strategy: "x",
            },
        ];
        let map = AddressMap::from_records(&records);
        let mut buf = OutputBuffer::new();
        let mut sites = Vec::new();
        let mut widen = 0;
        let mut ctx = EmitCtx::new(&mut buf, &bad, Arch::Arm64, 0x1000, 0x100, &map, 0, 0, &mut sites);
        let outcome = emit_branch(&inst, &mut widen, &mut ctx);
        assert!(outcome.clean);
        assert_eq!(buf.as_slice(), &enc_b(false, 4).unwrap().to_le_bytes());
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].kind, SiteKind::A64Branch26);
    }

    #[test]
    fn inverted_skip_shape() {
        // cbz x3, rewritten as cbnz-over + b.
        let kind = Kind::Cbz {
            sf: true,
            nonzero: false,
            rt: 3,
        };
        let bad = BadByteSet::empty();
        let map = AddressMap::default();
        let mut buf = OutputBuffer::new();
        let mut sites = Vec::new();
        let ctx = EmitCtx::new(&mut buf, &bad, Arch::Arm64, 0, 0, &map, 0, 0, &mut sites);
        let cand = build(Form::InvSkipNear, kind, 0x2000, 0x1000, &ctx).unwrap();
        assert_eq!(cand.words.len(), 2);
        assert_eq!(cand.words[0], enc_cbz(true, true, 3, 2).unwrap());
        let expect_off = (0x2000u64 - 0x1004) as i64 >> 2;
        assert_eq!(cand.words[1], enc_b(false, expect_off).unwrap());
    }
}
