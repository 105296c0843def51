//! x86 branch emission and the displacement widening ladder.
//!
//! Every PC-relative transfer is emitted here, never by a registry strategy:
//! the ladder keeps a per-instruction widening level that must grow
//! monotonically across relocation iterations. The rungs are the original
//! width, the near (32-bit) width, and an absolute transfer that needs no
//! displacement at all. JECXZ/JCXZ/JRCXZ and the LOOP family get a prelude
//! that reduces them to a plain conditional jump; LOOPE/LOOPNE keep their
//! opcode and branch through a local trampoline instead, since no wider
//! encoding of their condition exists.

use super::encoding::{alu_rr, call_reg, emit_load_imm, jmp_reg, rex, Seq};
use crate::arch::Arch;
use crate::buffer::SiteKind;
use crate::inst::{DecodedInst, Op};
use crate::isa::BranchOutcome;
use crate::strategy::EmitCtx;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Form {
    /// Original encoding, displacement byte patched.
    Short,
    /// 32-bit displacement form (with prelude where needed).
    Near,
    /// Absolute transfer through the stack or a scratch register.
    Abs,
    /// LOOPE/LOOPNE: original opcode hopping through a local near jump.
    TrampNear,
    /// Same trampoline with an absolute tail.
    TrampAbs,
}

#[derive(Clone, Copy)]
enum Kind {
    Jmp,
    Jcc(u8),
    Call,
    /// JECXZ family; `wide` selects the RCX test, `narrow16` the CX test.
    Jecxz { wide: bool, narrow16: bool },
    Loop,
    LoopCc,
}

fn classify(inst: &DecodedInst, arch: Arch) -> Option<Kind> {
    let has67 = inst.bytes.contains(&0x67);
    match inst.op {
        Op::Jmp => Some(Kind::Jmp),
        Op::Jcc => inst.cc.map(Kind::Jcc),
        Op::Call => Some(Kind::Call),
        Op::Jecxz => Some(Kind::Jecxz {
            wide: arch == Arch::X64 && !has67,
            narrow16: arch == Arch::X86 && has67,
        }),
        Op::Loop => Some(Kind::Loop),
        Op::Loope | Op::Loopne => Some(Kind::LoopCc),
        _ => None,
    }
}

fn short_original(inst: &DecodedInst) -> bool {
    // Near JMP/Jcc/CALL carry a 4-byte displacement; everything else in the
    // ladder is a 2- or 3-byte short form.
    let mut i = 0;
    while i < inst.bytes.len()
        && matches!(
            inst.bytes[i],
            0xf0 | 0xf2 | 0xf3 | 0x2e | 0x36 | 0x3e | 0x26 | 0x64 | 0x65 | 0x66 | 0x67
        )
    {
        i += 1;
    }
    !matches!(inst.bytes.get(i), Some(0xe9) | Some(0xe8) | Some(0x0f))
}

/// Counter-test prelude for the JECXZ family.
fn jecxz_prelude(arch: Arch, wide: bool, narrow16: bool) -> Seq {
    let mut seq = Seq::new();
    if narrow16 {
        seq.push(0x66);
    }
    alu_rr(&mut seq, arch, 0x85, 1, 1, if wide { 64 } else { 32 });
    seq
}

/// Counter-decrement prelude for the LOOP family.
fn loop_prelude(arch: Arch) -> Seq {
    let mut seq = Seq::new();
    if arch == Arch::X64 {
        seq.push(rex(true, false, false, false));
        seq.push(0xff);
        seq.push(0xc9);
    } else {
        seq.push(0x49);
    }
    seq
}

/// Absolute jump block: `PUSH imm ; RET` when the target immediate is clean
/// and pushable, otherwise a clean load into the scratch register and
/// `JMP reg`.
fn abs_jmp_block(ctx: &EmitCtx, target_new: u64) -> Option<Seq> {
    if target_new <= i32::MAX as u64 && ctx.bad.integer_ok(target_new, 4) {
        let mut seq = Seq::new();
        seq.push(0x68);
        seq.extend_from_slice(&(target_new as u32).to_le_bytes());
        seq.push(0xc3);
        if ctx.bad.bytes_ok(&seq) {
            return Some(seq);
        }
    }
    let bits = if ctx.arch == Arch::X64 { 64 } else { 32 };
    let mut seq = Seq::new();
    emit_load_imm(&mut seq, ctx.bad, ctx.arch, 0, target_new, bits).ok()?;
    jmp_reg(&mut seq, ctx.arch, 0);
    Some(seq)
}

fn abs_call_block(ctx: &EmitCtx, target_new: u64) -> Option<Seq> {
    let bits = if ctx.arch == Arch::X64 { 64 } else { 32 };
    let mut seq = Seq::new();
    emit_load_imm(&mut seq, ctx.bad, ctx.arch, 0, target_new, bits).ok()?;
    call_reg(&mut seq, ctx.arch, 0);
    Some(seq)
}

struct Candidate {
    bytes: Seq,
    site: Option<(u32, SiteKind)>,
    name: &'static str,
}

/// Build the byte image of one ladder form, or `None` when the displacement
/// does not fit or a required sub-sequence cannot be produced.
fn build(
    kind: Kind,
    form: Form,
    inst: &DecodedInst,
    target_new: u64,
    pc_base: u64,
    ctx: &EmitCtx,
) -> Option<Candidate> {
    let arch = ctx.arch;
    match form {
        Form::Short => {
            let len = inst.bytes.len() as u64;
            let disp = target_new.wrapping_sub(pc_base + len) as i64;
            let disp8 = i8::try_from(disp).ok()?;
            let mut bytes = Seq::from_slice(&inst.bytes);
            let last = bytes.len() - 1;
            bytes[last] = disp8 as u8;
            Some(Candidate {
                bytes,
                site: Some((last as u32, SiteKind::X86Rel8)),
                name: "branch-short",
            })
        }
        Form::Near => {
            let (prelude, opcodes): (Seq, Seq) = match kind {
                Kind::Jmp => (Seq::new(), Seq::from_slice(&[0xe9])),
                Kind::Call => (Seq::new(), Seq::from_slice(&[0xe8])),
                Kind::Jcc(cc) => (Seq::new(), Seq::from_slice(&[0x0f, 0x80 + cc])),
                Kind::Jecxz { wide, narrow16 } => (
                    jecxz_prelude(arch, wide, narrow16),
                    Seq::from_slice(&[0x0f, 0x84]),
                ),
                Kind::Loop => (loop_prelude(arch), Seq::from_slice(&[0x0f, 0x85])),
                Kind::LoopCc => return None,
            };
            let total = prelude.len() + opcodes.len() + 4;
            let disp = target_new.wrapping_sub(pc_base + total as u64) as i64;
            let disp32 = i32::try_from(disp).ok()?;
            let mut bytes = prelude;
            bytes.extend_from_slice(&opcodes);
            let site_off = bytes.len() as u32;
            bytes.extend_from_slice(&disp32.to_le_bytes());
            Some(Candidate {
                bytes,
                site: Some((site_off, SiteKind::X86Rel32)),
                name: "branch-near",
            })
        }
        Form::Abs => {
            let (prelude, skip_cc): (Seq, Option<u8>) = match kind {
                Kind::Jmp | Kind::Call => (Seq::new(), None),
                Kind::Jcc(cc) => (Seq::new(), Some(cc ^ 1)),
                Kind::Jecxz { wide, narrow16 } => {
                    (jecxz_prelude(arch, wide, narrow16), Some(0x4 ^ 1))
                }
                Kind::Loop => (loop_prelude(arch), Some(0x5 ^ 1)),
                Kind::LoopCc => return None,
            };
            let block = match kind {
                Kind::Call => abs_call_block(ctx, target_new)?,
                _ => abs_jmp_block(ctx, target_new)?,
            };
            let mut bytes = prelude;
            if let Some(cc) = skip_cc {
                let skip = u8::try_from(block.len()).ok()?;
                bytes.push(0x70 + cc);
                bytes.push(skip);
            }
            bytes.extend_from_slice(&block);
            Some(Candidate {
                bytes,
                site: None,
                name: "branch-absolute",
            })
        }
        Form::TrampNear | Form::TrampAbs => {
            // loopcc +2 ; jmp short over ; <far transfer to target>
            let opcode = if inst.op == Op::Loopne { 0xe0 } else { 0xe1 };
            let far: Seq;
            let mut site = None;
            if form == Form::TrampNear {
                let total = 4 + 5;
                let disp = target_new.wrapping_sub(pc_base + total as u64) as i64;
                let disp32 = i32::try_from(disp).ok()?;
                let mut f = Seq::new();
                f.push(0xe9);
                f.extend_from_slice(&disp32.to_le_bytes());
                site = Some((5u32, SiteKind::X86Rel32));
                far = f;
            } else {
                far = abs_jmp_block(ctx, target_new)?;
            }
            let skip = u8::try_from(far.len()).ok()?;
            let mut bytes = Seq::from_slice(&[opcode, 0x02, 0xeb, skip]);
            bytes.extend_from_slice(&far);
            Some(Candidate {
                bytes,
                site,
                name: if form == Form::TrampNear {
                    "branch-trampoline"
                } else {
                    "branch-trampoline-absolute"
                },
            })
        }
    }
}

/// Emit `inst` at the current offset, choosing the lowest ladder rung at or
/// above `widen` whose bytes fit and are clean. When no rung is clean the
/// lowest fitting rung is emitted anyway and the outcome is marked unclean
/// for residual reporting.
pub(crate) fn emit_branch(inst: &DecodedInst, widen: &mut u8, ctx: &mut EmitCtx) -> BranchOutcome {
    let kind = match classify(inst, ctx.arch) {
        Some(k) => k,
        None => {
            // Relative flow the ladder does not model; emit verbatim.
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
        Kind::LoopCc => &[Form::Short, Form::TrampNear, Form::TrampAbs],
        Kind::Jmp | Kind::Jcc(_) if short_original(inst) => {
            &[Form::Short, Form::Near, Form::Abs]
        }
        Kind::Jmp | Kind::Jcc(_) | Kind::Call => &[Form::Near, Form::Abs],
        Kind::Jecxz { .. } | Kind::Loop => &[Form::Short, Form::Near, Form::Abs],
    };

    let start = usize::from(*widen).min(forms.len() - 1);
    let mut fallback: Option<(usize, Candidate)> = None;
    let mut chosen: Option<(usize, Candidate)> = None;
    for (lvl, &form) in forms.iter().enumerate().skip(start) {
        if let Some(cand) = build(kind, form, inst, target_new, pc_base, ctx) {
            if ctx.bad.bytes_ok(&cand.bytes) {
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
                // Nothing fits at all; keep the original bytes so the job
                // can complete for inspection.
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
    if let Some((rel, sitekind)) = cand.site {
        ctx.record_site(sitekind, at + rel, target);
    }
    ctx.buf.put_bytes(&cand.bytes);
    BranchOutcome {
        name: cand.name,
        clean,
        grew,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::badbytes::BadByteSet;
    use crate::buffer::{AddressMap, OutputBuffer, RewriteRecord};
    use crate::inst::{FlowKind, RepPrefix};
    use smallvec::smallvec;

    fn jmp_short(addr: u64, disp: i8) -> DecodedInst {
        let end = addr + 2;
        DecodedInst {
            address: addr,
            bytes: smallvec![0xeb, disp as u8],
            op: Op::Jmp,
            mnemonic: "jmp".to_string(),
            operands: smallvec![],
            flow: FlowKind::Jump { cond: false },
            target: Some(end.wrapping_add(disp as i64 as u64)),
            cc: None,
            rep: RepPrefix::None,
            elem_bits: 0,
        }
    }

    fn run(inst: &DecodedInst, map: &AddressMap, widen: &mut u8, bad: &BadByteSet) -> (Vec<u8>, BranchOutcome) {
        let mut buf = OutputBuffer::new();
        let mut sites = Vec::new();
        let mut ctx = EmitCtx::new(&mut buf, bad, Arch::X86, 0x1000, 0x100, map, 0, 0, &mut sites);
        let outcome = emit_branch(inst, widen, &mut ctx);
        (buf.into_vec(), outcome)
    }

    #[test]
    fn unchanged_layout_reproduces_original() {
        let bad = BadByteSet::null_only();
        let inst = jmp_short(0x1000, 0x10);
        let records = vec![
            RewriteRecord {
                old_address: 0x1000,
                old_size: 2,
                new_offset: 0,
                new_size: 2,
                strategy: "x",
            },
            RewriteRecord {
                old_address: 0x1012,
                old_size: 1,
                new_offset: 0x12,
                new_size: 1,
                strategy: "x",
            },
        ];
        let map = AddressMap::from_records(&records);
        let mut widen = 0;
        let (bytes, outcome) = run(&inst, &map, &mut widen, &bad);
        assert_eq!(bytes, vec![0xeb, 0x10]);
        assert!(outcome.clean);
        assert!(!outcome.grew);
        assert_eq!(widen, 0);
    }

    #[test]
    fn shifted_target_repatches_short_disp() {
        let bad = BadByteSet::null_only();
        let inst = jmp_short(0x1000, 0x10);
        // The target instruction moved 4 bytes further out.
        let records = vec![
            RewriteRecord {
                old_address: 0x1000,
                old_size: 2,
                new_offset: 0,
                new_size: 2,
                strategy: "x",
            },
            RewriteRecord {
                old_address: 0x1012,
                old_size: 1,
                new_offset: 0x16,
                new_size: 1,
                strategy: "x",
            },
        ];
        let map = AddressMap::from_records(&records);
        let mut widen = 0;
        let (bytes, outcome) = run(&inst, &map, &mut widen, &bad);
        assert_eq!(bytes, vec![0xeb, 0x14]);
        assert!(outcome.clean);
    }

    #[test]
    fn zero_disp_widens_under_nulls() {
        // jmp to the next instruction: disp8 would be 0x00.
        let bad = BadByteSet::null_only();
        let inst = jmp_short(0x1000, 0);
        let records = vec![
            RewriteRecord {
                old_address: 0x1000,
                old_size: 2,
                new_offset: 0,
                new_size: 2,
                strategy: "x",
            },
            RewriteRecord {
                old_address: 0x1002,
                old_size: 1,
                new_offset: 2,
                new_size: 1,
                strategy: "x",
            },
        ];
        let map = AddressMap::from_records(&records);
        let mut widen = 0;
        let (bytes, outcome) = run(&inst, &map, &mut widen, &bad);
        // The short displacement of 0 contains a null; the near form's -3
        // does not.
        assert!(outcome.clean);
        assert!(outcome.grew);
        assert_eq!(widen, 1);
        assert_eq!(bytes, vec![0xe9, 0xfd, 0xff, 0xff, 0xff]);
    }
}
