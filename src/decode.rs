//! Disassembler adapter.
//!
//! This module owns the entire capstone surface: it configures the
//! disassembler for the job's architecture and lowers every decoded
//! instruction into the crate-local [`DecodedInst`] shape. Branch targets
//! and condition codes are recovered from the raw encodings rather than the
//! disassembler's detail records, so the rest of the engine depends only on
//! the byte-level facts of each ISA.

use capstone::arch::{self, BuildsCapstone};
use capstone::prelude::*;
use capstone::Capstone;
use smallvec::SmallVec;

use crate::arch::Arch;
use crate::error::{RewriteError, RewriteResult};
use crate::inst::{DecodedInst, FlowKind, MemArg, Op, Operand, Reg, RepPrefix};

/// Disassemble `bytes` at `base` into address-ordered instructions.
///
/// Fails with [`RewriteError::Decode`] when the disassembler cannot advance,
/// reporting the input offset of the first undecodable byte.
pub fn disassemble(bytes: &[u8], base: u64, target: Arch) -> RewriteResult<Vec<DecodedInst>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    let cs = build_capstone(target)
        .map_err(|e| RewriteError::Config(format!("disassembler setup failed: {}", e)))?;
    let insns = cs
        .disasm_all(bytes, base)
        .map_err(|_| RewriteError::Decode { offset: 0 })?;

    let mut out = Vec::with_capacity(insns.len());
    let mut covered = 0u64;
    for insn in insns.iter() {
        let decoded = lower(&cs, &insn, target);
        covered += decoded.bytes.len() as u64;
        out.push(decoded);
    }

    // `disasm_all` stops silently at the first byte it cannot decode; the
    // engine treats incomplete coverage as a fatal decode error.
    if covered != bytes.len() as u64 {
        return Err(RewriteError::Decode { offset: covered });
    }

    log::debug!(
        "disassembled {} instructions ({} bytes) for {}",
        out.len(),
        covered,
        target
    );
    Ok(out)
}

fn build_capstone(target: Arch) -> Result<Capstone, capstone::Error> {
    match target {
        Arch::X86 => Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode32)
            .detail(true)
            .build(),
        Arch::X64 => Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .detail(true)
            .build(),
        Arch::Arm32 => Capstone::new()
            .arm()
            .mode(arch::arm::ArchMode::Arm)
            .detail(true)
            .build(),
        Arch::Arm64 => Capstone::new()
            .arm64()
            .mode(arch::arm64::ArchMode::Arm)
            .detail(true)
            .build(),
    }
}

fn lower(cs: &Capstone, insn: &capstone::Insn, target: Arch) -> DecodedInst {
    let mnemonic = insn.mnemonic().unwrap_or("").to_string();
    let bytes: SmallVec<[u8; 16]> = SmallVec::from_slice(insn.bytes());
    let operands = lower_operands(cs, insn, target);

    let mut inst = DecodedInst {
        address: insn.address(),
        bytes,
        op: Op::Other,
        mnemonic,
        operands,
        flow: FlowKind::None,
        target: None,
        cc: None,
        rep: RepPrefix::None,
        elem_bits: 0,
    };

    match target {
        Arch::X86 | Arch::X64 => classify_x86(&mut inst),
        Arch::Arm32 => classify_arm32(&mut inst),
        Arch::Arm64 => classify_arm64(&mut inst),
    }
    inst
}

fn lower_operands(cs: &Capstone, insn: &capstone::Insn, target: Arch) -> SmallVec<[Operand; 4]> {
    let mut out = SmallVec::new();
    let detail = match cs.insn_detail(insn) {
        Ok(d) => d,
        Err(_) => return out,
    };
    for op in detail.arch_detail().operands() {
        match op {
            arch::ArchOperand::X86Operand(x) => match x.op_type {
                arch::x86::X86OperandType::Reg(r) => {
                    if let Some(reg) = reg_from_id(cs, r, target) {
                        out.push(Operand::Reg(reg));
                    }
                }
                arch::x86::X86OperandType::Imm(v) => out.push(Operand::Imm(v)),
                arch::x86::X86OperandType::Mem(m) => {
                    out.push(Operand::Mem(mem_from_parts(
                        cs,
                        target,
                        m.base(),
                        m.index(),
                        m.scale().unsigned_abs() as u8,
                        m.disp(),
                    )));
                }
                _ => {}
            },
            arch::ArchOperand::ArmOperand(a) => match a.op_type {
                arch::arm::ArmOperandType::Reg(r) => {
                    if let Some(reg) = reg_from_id(cs, r, target) {
                        out.push(Operand::Reg(reg));
                    }
                }
                arch::arm::ArmOperandType::Imm(v) => out.push(Operand::Imm(i64::from(v))),
                arch::arm::ArmOperandType::Mem(m) => {
                    out.push(Operand::Mem(mem_from_parts(
                        cs,
                        target,
                        m.base(),
                        m.index(),
                        1,
                        i64::from(m.disp()),
                    )));
                }
                _ => {}
            },
            arch::ArchOperand::Arm64Operand(a) => match a.op_type {
                arch::arm64::Arm64OperandType::Reg(r) => {
                    if let Some(reg) = reg_from_id(cs, r, target) {
                        out.push(Operand::Reg(reg));
                    }
                }
                arch::arm64::Arm64OperandType::Imm(v) => out.push(Operand::Imm(v)),
                arch::arm64::Arm64OperandType::Mem(m) => {
                    out.push(Operand::Mem(mem_from_parts(
                        cs,
                        target,
                        m.base(),
                        m.index(),
                        1,
                        i64::from(m.disp()),
                    )));
                }
                _ => {}
            },
            _ => {}
        }
    }
    out
}

fn mem_from_parts(
    cs: &Capstone,
    target: Arch,
    base: RegId,
    index: RegId,
    scale: u8,
    disp: i64,
) -> MemArg {
    let base_reg = reg_from_id(cs, base, target);
    let pc_relative = matches!(
        cs.reg_name(base).as_deref(),
        Some("rip") | Some("eip") | Some("pc")
    );
    MemArg {
        base: if pc_relative { None } else { base_reg },
        index: reg_from_id(cs, index, target),
        scale: scale.max(1),
        disp,
        pc_relative,
    }
}

fn reg_from_id(cs: &Capstone, id: RegId, target: Arch) -> Option<Reg> {
    if id.0 == 0 {
        return None;
    }
    let name = cs.reg_name(id)?;
    parse_reg_name(&name, target)
}

/// Map a register name to its hardware encoding index and width.
///
/// Name-based mapping keeps the adapter independent of the disassembler's
/// numeric register identifiers, which are not stable across ISAs.
fn parse_reg_name(name: &str, target: Arch) -> Option<Reg> {
    match target {
        Arch::X86 | Arch::X64 => parse_x86_reg(name),
        Arch::Arm32 => parse_arm32_reg(name),
        Arch::Arm64 => parse_arm64_reg(name),
    }
}

fn parse_x86_reg(name: &str) -> Option<Reg> {
    let legacy_8 = ["al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil"];
    let legacy_8h = ["ah", "ch", "dh", "bh"];
    let legacy_16 = ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"];
    let legacy_32 = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
    let legacy_64 = ["rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi"];
    if let Some(i) = legacy_8.iter().position(|&n| n == name) {
        return Some(Reg::new(i as u8, 8));
    }
    if let Some(i) = legacy_8h.iter().position(|&n| n == name) {
        return Some(Reg {
            index: i as u8 + 4,
            bits: 8,
            high8: true,
        });
    }
    if let Some(i) = legacy_16.iter().position(|&n| n == name) {
        return Some(Reg::new(i as u8, 16));
    }
    if let Some(i) = legacy_32.iter().position(|&n| n == name) {
        return Some(Reg::new(i as u8, 32));
    }
    if let Some(i) = legacy_64.iter().position(|&n| n == name) {
        return Some(Reg::new(i as u8, 64));
    }
    // Extended registers: r8..r15 with optional b/w/d suffix.
    let rest = name.strip_prefix('r')?;
    let (digits, bits) = match rest.as_bytes().last() {
        Some(b'b') => (&rest[..rest.len() - 1], 8),
        Some(b'w') => (&rest[..rest.len() - 1], 16),
        Some(b'd') => (&rest[..rest.len() - 1], 32),
        _ => (rest, 64),
    };
    match digits.parse::<u8>() {
        Ok(n) if (8..=15).contains(&n) => Some(Reg::new(n, bits)),
        _ => None,
    }
}

fn parse_arm32_reg(name: &str) -> Option<Reg> {
    if let Some(rest) = name.strip_prefix('r') {
        if let Ok(n) = rest.parse::<u8>() {
            if n < 16 {
                return Some(Reg::new(n, 32));
            }
        }
    }
    match name {
        "sb" => Some(Reg::new(9, 32)),
        "sl" => Some(Reg::new(10, 32)),
        "fp" => Some(Reg::new(11, 32)),
        "ip" => Some(Reg::new(12, 32)),
        "sp" => Some(Reg::new(13, 32)),
        "lr" => Some(Reg::new(14, 32)),
        "pc" => Some(Reg::new(15, 32)),
        _ => None,
    }
}

fn parse_arm64_reg(name: &str) -> Option<Reg> {
    if let Some(rest) = name.strip_prefix('x') {
        if let Ok(n) = rest.parse::<u8>() {
            if n <= 30 {
                return Some(Reg::new(n, 64));
            }
        }
    }
    if let Some(rest) = name.strip_prefix('w') {
        if let Ok(n) = rest.parse::<u8>() {
            if n <= 30 {
                return Some(Reg::new(n, 32));
            }
        }
    }
    match name {
        "lr" => Some(Reg::new(30, 64)),
        "sp" | "wsp" => Some(Reg::new(31, 64)),
        "xzr" => Some(Reg::new(31, 64)),
        "wzr" => Some(Reg::new(31, 32)),
        _ => None,
    }
}

/// x86 legacy and REX prefixes, skipped when locating the opcode byte.
fn is_x86_prefix(b: u8, x64: bool) -> bool {
    matches!(
        b,
        0xf0 | 0xf2 | 0xf3 | 0x2e | 0x36 | 0x3e | 0x26 | 0x64 | 0x65 | 0x66 | 0x67
    ) || (x64 && (0x40..=0x4f).contains(&b))
}

fn x86_opcode_index(bytes: &[u8], x64: bool) -> usize {
    let mut i = 0;
    while i < bytes.len() && is_x86_prefix(bytes[i], x64) {
        i += 1;
    }
    i
}

fn classify_x86(inst: &mut DecodedInst) {
    let mut words = inst.mnemonic.split_whitespace();
    let first = words.next().unwrap_or("");
    let second = words.next();
    let (rep, opword) = match (first, second) {
        ("rep", Some(w)) => (RepPrefix::Rep, w),
        ("repe" | "repz", Some(w)) => (RepPrefix::Repe, w),
        ("repne" | "repnz", Some(w)) => (RepPrefix::Repne, w),
        ("lock", Some(w)) => (RepPrefix::None, w),
        _ => (RepPrefix::None, first),
    };
    inst.rep = rep;

    let string_elem = |w: &str| match w.as_bytes().last() {
        Some(b'b') => 8,
        Some(b'w') => 16,
        Some(b'd') => 32,
        Some(b'q') => 64,
        _ => 0,
    };

    inst.op = match opword {
        "mov" | "movabs" => Op::Mov,
        "add" => Op::Add,
        "sub" => Op::Sub,
        "and" => Op::And,
        "or" => Op::Or,
        "xor" => Op::Xor,
        "cmp" => Op::Cmp,
        "test" => Op::Test,
        "lea" => Op::Lea,
        "push" => Op::Push,
        "pop" => Op::Pop,
        "inc" => Op::Inc,
        "dec" => Op::Dec,
        "neg" => Op::Neg,
        "not" => Op::Not,
        "shl" | "sal" => Op::Shl,
        "xlatb" | "xlat" => Op::Xlat,
        "lahf" => Op::Lahf,
        "sahf" => Op::Sahf,
        "enter" => Op::Enter,
        "leave" => Op::Leave,
        "ret" | "retn" => Op::Ret,
        "call" => Op::Call,
        "jmp" => Op::Jmp,
        "jecxz" | "jcxz" | "jrcxz" => Op::Jecxz,
        "loop" => Op::Loop,
        "loope" | "loopz" => Op::Loope,
        "loopne" | "loopnz" => Op::Loopne,
        w if w.starts_with("movs") && string_elem(w) != 0 && w.len() == 5 => {
            inst.elem_bits = string_elem(w);
            Op::Movs
        }
        w if w.starts_with("stos") && string_elem(w) != 0 && w.len() == 5 => {
            inst.elem_bits = string_elem(w);
            Op::Stos
        }
        w if w.starts_with("lods") && string_elem(w) != 0 && w.len() == 5 => {
            inst.elem_bits = string_elem(w);
            Op::Lods
        }
        w if w.starts_with("scas") && string_elem(w) != 0 && w.len() == 5 => {
            inst.elem_bits = string_elem(w);
            Op::Scas
        }
        w if w.starts_with("cmps") && string_elem(w) != 0 && w.len() == 5 => {
            inst.elem_bits = string_elem(w);
            Op::Cmps
        }
        w if w.starts_with('j') => Op::Jcc,
        _ => Op::Other,
    };

    // Condition code and relative-branch target from the raw bytes.
    let x64 = true; // prefix scan is mode-insensitive apart from REX
    let oi = x86_opcode_index(&inst.bytes, x64);
    let b = inst.bytes.get(oi).copied().unwrap_or(0);
    let b2 = inst.bytes.get(oi + 1).copied().unwrap_or(0);
    let end = inst.address + inst.bytes.len() as u64;

    let rel8 = |inst: &DecodedInst| {
        let d = *inst.bytes.last().unwrap() as i8;
        end.wrapping_add(d as i64 as u64)
    };
    let rel32 = |inst: &DecodedInst| {
        let n = inst.bytes.len();
        let d = i32::from_le_bytes([
            inst.bytes[n - 4],
            inst.bytes[n - 3],
            inst.bytes[n - 2],
            inst.bytes[n - 1],
        ]);
        end.wrapping_add(d as i64 as u64)
    };

    match inst.op {
        Op::Jcc => {
            if (0x70..=0x7f).contains(&b) {
                inst.cc = Some(b & 0xf);
                inst.target = Some(rel8(inst));
                inst.flow = FlowKind::Jump { cond: true };
            } else if b == 0x0f && (0x80..=0x8f).contains(&b2) {
                inst.cc = Some(b2 & 0xf);
                inst.target = Some(rel32(inst));
                inst.flow = FlowKind::Jump { cond: true };
            }
        }
        Op::Jmp => {
            if b == 0xeb {
                inst.target = Some(rel8(inst));
                inst.flow = FlowKind::Jump { cond: false };
            } else if b == 0xe9 {
                inst.target = Some(rel32(inst));
                inst.flow = FlowKind::Jump { cond: false };
            }
            // FF /4 indirect forms stay FlowKind::None.
        }
        Op::Call => {
            if b == 0xe8 {
                inst.target = Some(rel32(inst));
                inst.flow = FlowKind::Call;
            }
        }
        Op::Jecxz | Op::Loop | Op::Loope | Op::Loopne => {
            if matches!(b, 0xe0..=0xe3) {
                inst.target = Some(rel8(inst));
                inst.flow = FlowKind::Jump { cond: true };
            }
        }
        _ => {}
    }
}

fn classify_arm32(inst: &mut DecodedInst) {
    if inst.bytes.len() != 4 {
        return;
    }
    let word = inst.word();
    let cond = (word >> 28) as u8;
    if cond == 0xf {
        // Unconditional space (BLX imm, preload hints); left as Other.
        return;
    }
    inst.cc = Some(cond);

    if (word >> 25) & 0b111 == 0b101 {
        let link = (word >> 24) & 1 == 1;
        inst.op = if link { Op::Bl } else { Op::B };
        let imm24 = word & 0x00ff_ffff;
        let off = ((imm24 << 8) as i32 >> 8) << 2;
        inst.target = Some(inst.address.wrapping_add(8).wrapping_add(off as i64 as u64));
        inst.flow = if link {
            FlowKind::Call
        } else {
            FlowKind::Jump { cond: cond != 0xe }
        };
    } else if (word >> 20) & 0xff == 0b0011_0000 {
        inst.op = Op::Movw;
    } else if (word >> 20) & 0xff == 0b0011_0100 {
        inst.op = Op::Movt;
    } else if (word >> 26) & 0b11 == 0b01 {
        inst.op = if (word >> 20) & 1 == 1 { Op::Ldr } else { Op::Str };
    } else if (word >> 25) & 0b111 == 0b001 {
        inst.op = match (word >> 21) & 0xf {
            0 => Op::And,
            1 => Op::Eor,
            2 => Op::Sub,
            3 => Op::Rsb,
            4 => Op::Add,
            8 => Op::Test,
            10 => Op::Cmp,
            11 => Op::Cmn,
            12 => Op::Orr,
            13 => Op::Mov,
            14 => Op::Bic,
            15 => Op::Mvn,
            _ => Op::Other,
        };
    } else if word & 0x0fff_fff0 == 0x012f_ff10 {
        inst.op = Op::Bx;
    }
}

fn classify_arm64(inst: &mut DecodedInst) {
    if inst.bytes.len() != 4 {
        return;
    }
    let word = inst.word();
    let sext = |v: u32, bits: u32| ((v << (32 - bits)) as i32 >> (32 - bits)) as i64;

    if word >> 26 == 0b000101 || word >> 26 == 0b100101 {
        let link = word >> 31 == 1;
        inst.op = if link { Op::Bl } else { Op::B };
        let off = sext(word & 0x03ff_ffff, 26) << 2;
        inst.target = Some(inst.address.wrapping_add(off as u64));
        inst.flow = if link {
            FlowKind::Call
        } else {
            FlowKind::Jump { cond: false }
        };
    } else if word >> 24 == 0b0101_0100 && word & 0x10 == 0 {
        inst.op = Op::B;
        inst.cc = Some((word & 0xf) as u8);
        let off = sext((word >> 5) & 0x7_ffff, 19) << 2;
        inst.target = Some(inst.address.wrapping_add(off as u64));
        inst.flow = FlowKind::Jump { cond: true };
    } else if (word >> 24) & 0x7f == 0b011_0100 || (word >> 24) & 0x7f == 0b011_0101 {
        inst.op = if (word >> 24) & 1 == 0 { Op::Cbz } else { Op::Cbnz };
        let off = sext((word >> 5) & 0x7_ffff, 19) << 2;
        inst.target = Some(inst.address.wrapping_add(off as u64));
        inst.flow = FlowKind::Jump { cond: true };
    } else if (word >> 24) & 0x7f == 0b011_0110 || (word >> 24) & 0x7f == 0b011_0111 {
        inst.op = if (word >> 24) & 1 == 0 { Op::Tbz } else { Op::Tbnz };
        let off = sext((word >> 5) & 0x3fff, 14) << 2;
        inst.target = Some(inst.address.wrapping_add(off as u64));
        inst.flow = FlowKind::Jump { cond: true };
    } else if (word >> 23) & 0x3f == 0b10_0101 {
        inst.op = match (word >> 29) & 0b11 {
            0b00 => Op::Movn,
            0b10 => Op::Movz,
            0b11 => Op::Movk,
            _ => Op::Other,
        };
    } else if (word >> 24) & 0x1f == 0b1_0001 {
        inst.op = if (word >> 30) & 1 == 1 { Op::Sub } else { Op::Add };
    } else if (word >> 24) & 0x3f == 0b11_1001 {
        inst.op = match (word >> 22) & 0b11 {
            0b00 => Op::Str,
            0b01 => Op::Ldr,
            _ => Op::Other,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg_names() {
        assert_eq!(parse_reg_name("eax", Arch::X86), Some(Reg::new(0, 32)));
        assert_eq!(parse_reg_name("bl", Arch::X86), Some(Reg::new(3, 8)));
        assert_eq!(
            parse_reg_name("ah", Arch::X86).map(|r| (r.index, r.high8)),
            Some((4, true))
        );
        assert_eq!(parse_reg_name("r10d", Arch::X64), Some(Reg::new(10, 32)));
        assert_eq!(parse_reg_name("r15", Arch::X64), Some(Reg::new(15, 64)));
        assert_eq!(parse_reg_name("r3", Arch::Arm32), Some(Reg::new(3, 32)));
        assert_eq!(parse_reg_name("r8", Arch::Arm32), Some(Reg::new(8, 32)));
        assert_eq!(parse_reg_name("sp", Arch::Arm32), Some(Reg::new(13, 32)));
        assert_eq!(parse_reg_name("x29", Arch::Arm64), Some(Reg::new(29, 64)));
        assert_eq!(parse_reg_name("wzr", Arch::Arm64), Some(Reg::new(31, 32)));
        assert_eq!(parse_reg_name("bogus", Arch::X86), None);
    }

    #[test]
    fn x86_stream_decodes_fully() {
        // mov eax, 0 ; xor ebx, ebx ; ret
        let code = [0xb8, 0x00, 0x00, 0x00, 0x00, 0x31, 0xdb, 0xc3];
        let insts = disassemble(&code, 0x1000, Arch::X86).unwrap();
        assert_eq!(insts.len(), 3);
        assert_eq!(insts[0].op, Op::Mov);
        assert_eq!(insts[0].imm_op(1), Some(0));
        assert_eq!(insts[1].op, Op::Xor);
        assert_eq!(insts[2].op, Op::Ret);
        assert_eq!(insts[1].address, 0x1005);
    }

    #[test]
    fn x86_branch_targets() {
        // jmp +5 (to 0x1007) ; nops
        let code = [0xeb, 0x05, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90];
        let insts = disassemble(&code, 0x1000, Arch::X86).unwrap();
        assert_eq!(insts[0].op, Op::Jmp);
        assert_eq!(insts[0].flow, FlowKind::Jump { cond: false });
        assert_eq!(insts[0].target, Some(0x1007));
    }

    #[test]
    fn x86_jcc_cc() {
        // jne +2
        let code = [0x75, 0x02, 0x90, 0x90];
        let insts = disassemble(&code, 0, Arch::X86).unwrap();
        assert_eq!(insts[0].op, Op::Jcc);
        assert_eq!(insts[0].cc, Some(0x5));
        assert_eq!(insts[0].target, Some(4));
    }

    #[test]
    fn truncated_input_is_a_decode_error() {
        // A lone ModR/M-needing opcode with no ModR/M byte.
        let code = [0x90, 0x0f];
        let err = disassemble(&code, 0, Arch::X86).unwrap_err();
        assert_eq!(err, RewriteError::Decode { offset: 1 });
    }

    #[test]
    fn arm32_branch() {
        // bne #+16: cond=NE imm24=4 -> word 0x1a000004
        let code = 0x1a00_0004u32.to_le_bytes();
        let insts = disassemble(&code, 0x1000, Arch::Arm32).unwrap();
        assert_eq!(insts[0].op, Op::B);
        assert_eq!(insts[0].cc, Some(1));
        assert_eq!(insts[0].target, Some(0x1000 + 8 + 16));
        assert_eq!(insts[0].flow, FlowKind::Jump { cond: true });
    }

    #[test]
    fn arm32_dp_imm() {
        // mov r0, #0xff -> 0xe3a000ff
        let code = 0xe3a0_00ffu32.to_le_bytes();
        let insts = disassemble(&code, 0, Arch::Arm32).unwrap();
        assert_eq!(insts[0].op, Op::Mov);
        assert_eq!(insts[0].cc, Some(0xe));
    }

    #[test]
    fn arm64_branches() {
        // b #+8 ; cbz x0, #+8
        let b = 0x1400_0002u32.to_le_bytes();
        let cbz = 0xb400_0040u32.to_le_bytes();
        let code: Vec<u8> = b.iter().chain(cbz.iter()).copied().collect();
        let insts = disassemble(&code, 0x2000, Arch::Arm64).unwrap();
        assert_eq!(insts[0].op, Op::B);
        assert_eq!(insts[0].target, Some(0x2008));
        assert_eq!(insts[1].op, Op::Cbz);
        assert_eq!(insts[1].target, Some(0x200c));
    }

    #[test]
    fn rep_prefix_classification() {
        // rep movsb
        let code = [0xf3, 0xa4];
        let insts = disassemble(&code, 0, Arch::X86).unwrap();
        assert_eq!(insts[0].op, Op::Movs);
        assert_eq!(insts[0].rep, RepPrefix::Rep);
        assert_eq!(insts[0].elem_bits, 8);
    }
}
