//! ARM32 branch rewriting ladder.
//!
//! Rungs, in order: the original B/BL word with a recomputed offset; a
//! PC-arithmetic branch (`ADD`/`SUB PC, PC, #rot`), which keeps the
//! condition and encodes short hops without the imm24 field's high zero
//! bytes; the inverted-condition one-word skip followed by an unconditional
//! branch whose offset is one word smaller; and an absolute transfer through
//! IP (`MOVW`/`MOVT` + `BX`/`BLX`), which is conditionally executed as a
//! whole so no skip is needed. `BL` variants re-materialise the link
//! register with `MOV LR, PC` where the PC-arithmetic rung is used.

use smallvec::SmallVec;

use super::encoding::{
    enc_blx_reg, enc_branch, enc_bx, enc_dp_imm, enc_mov_reg, enc_movt, enc_movw, push_word,
    rotated_imm_encode, words_clean, Cond, DpOp,
};
use crate::buffer::SiteKind;
use crate::inst::{DecodedInst, Op};
use crate::isa::{BranchOutcome, Seq};
use crate::strategy::EmitCtx;

/// Scratch register for absolute transfers: IP (r12), the intra-procedure
/// call register.
const SCRATCH: u8 = 12;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Form {
    Orig,
    PcArith,
    InvSkip,
    Abs,
}

struct Candidate {
    words: SmallVec<[u32; 4]>,
    site: Option<(u32, SiteKind)>,
    name: &'static str,
}

fn pc_arith_word(cond: Cond, delta: i64) -> Option<u32> {
    if delta & 3 != 0 {
        return None;
    }
    let (op, mag) = if delta >= 0 {
        (DpOp::Add, delta as u64)
    } else {
        (DpOp::Sub, delta.unsigned_abs())
    };
    let mag = u32::try_from(mag).ok()?;
    let imm = rotated_imm_encode(mag)?;
    Some(enc_dp_imm(cond, op, false, 15, 15, imm))
}

fn abs_load_scratch(cond: Cond, value: u32, words: &mut SmallVec<[u32; 4]>) {
    words.push(enc_movw(cond, SCRATCH, (value & 0xffff) as u16));
    if value >> 16 != 0 {
        words.push(enc_movt(cond, SCRATCH, (value >> 16) as u16));
    }
}

fn build(
    form: Form,
    cond: Cond,
    link: bool,
    target_new: u64,
    pc_base: u64,
) -> Option<Candidate> {
    match form {
        Form::Orig => {
            let off = target_new.wrapping_sub(pc_base + 8) as i64;
            let word = enc_branch(cond, link, off)?;
            let mut words = SmallVec::new();
            words.push(word);
            Some(Candidate {
                words,
                site: Some((0, SiteKind::A32Branch24)),
                name: "branch-imm24",
            })
        }
        Form::PcArith => {
            let mut words = SmallVec::new();
            if link {
                // mov lr, pc leaves the address of the following word plus
                // four, which is exactly the end of this two-word sequence.
                words.push(enc_mov_reg(cond, 14, 15));
                let delta = target_new.wrapping_sub(pc_base + 4 + 8) as i64;
                words.push(pc_arith_word(cond, delta)?);
            } else {
                let delta = target_new.wrapping_sub(pc_base + 8) as i64;
                words.push(pc_arith_word(cond, delta)?);
            }
            Some(Candidate {
                words,
                site: None,
                name: "branch-pc-arith",
            })
        }
        Form::InvSkip => {
            if link || cond == Cond::Al {
                return None;
            }
            let inv = cond.invert()?;
            let mut words = SmallVec::new();
            words.push(enc_branch(inv, false, 0)?);
            let off = target_new.wrapping_sub(pc_base + 4 + 8) as i64;
            words.push(enc_branch(Cond::Al, false, off)?);
            Some(Candidate {
                words,
                site: Some((4, SiteKind::A32Branch24)),
                name: "branch-invert-skip",
            })
        }
        Form::Abs => {
            let target32 = u32::try_from(target_new).ok()?;
            let mut words = SmallVec::new();
            abs_load_scratch(cond, target32, &mut words);
            if link {
                words.push(enc_blx_reg(cond, SCRATCH));
            } else {
                words.push(enc_bx(cond, SCRATCH));
            }
            Some(Candidate {
                words,
                site: None,
                name: "branch-absolute",
            })
        }
    }
}

/// Emit an A32 `B`/`BL` through the ladder; see the module docs for rungs.
pub(crate) fn emit_branch(inst: &DecodedInst, widen: &mut u8, ctx: &mut EmitCtx) -> BranchOutcome {
    let cond = inst
        .cc
        .and_then(Cond::from_bits)
        .unwrap_or(Cond::Al);
    let link = inst.op == Op::Bl;
    if inst.op != Op::B && inst.op != Op::Bl {
        let clean = ctx.bad.bytes_ok(&inst.bytes);
        let bytes = inst.bytes.clone();
        ctx.buf.put_bytes(&bytes);
        return BranchOutcome {
            name: "identity",
            clean,
            grew: false,
        };
    }

    let target = inst.target.unwrap_or(inst.address);
    let target_new = ctx.target_new_abs(target);
    let at = ctx.buf.cur_offset();
    let pc_base = ctx.base + u64::from(at);

    let forms: &[Form] = if link {
        &[Form::Orig, Form::PcArith, Form::Abs]
    } else if cond == Cond::Al {
        &[Form::Orig, Form::PcArith, Form::Abs]
    } else {
        &[Form::Orig, Form::PcArith, Form::InvSkip, Form::Abs]
    };

    let start = usize::from(*widen).min(forms.len() - 1);
    let mut fallback: Option<(usize, Candidate)> = None;
    let mut chosen: Option<(usize, Candidate)> = None;
    for (lvl, &form) in forms.iter().enumerate().skip(start) {
        if let Some(cand) = build(form, cond, link, target_new, pc_base) {
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
        push_word(&mut seq, w);
    }
    ctx.buf.put_bytes(&seq);
    BranchOutcome {
        name: cand.name,
        clean,
        grew,
    }
}
