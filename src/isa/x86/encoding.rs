//! x86 encoding helpers.
//!
//! Small builders for ModR/M, SIB and REX bytes, emitters for the handful of
//! instruction forms the strategies compose, and the clean-constant search
//! routines behind the immediate-substitution family. Every search helper
//! returns `Option`/`Result`; callers treat failure as a signal to try the
//! next transform.

use crate::arch::Arch;
use crate::badbytes::BadByteSet;
use crate::error::StrategyError;
pub use crate::isa::Seq;

/// Encode the ModR/M byte.
#[inline]
pub fn modrm(m0d: u8, reg: u8, rm: u8) -> u8 {
    debug_assert!(m0d < 4);
    ((m0d & 3) << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Encode the SIB byte (scale is the log2 factor).
#[inline]
pub fn sib(scale: u8, index: u8, base: u8) -> u8 {
    debug_assert!(scale < 4);
    ((scale & 3) << 6) | ((index & 7) << 3) | (base & 7)
}

/// Encode a REX prefix byte.
#[inline]
pub fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
    0x40 | (u8::from(w) << 3) | (u8::from(r) << 2) | (u8::from(x) << 1) | u8::from(b)
}

fn push_rex(seq: &mut Seq, arch: Arch, w64: bool, reg: u8, rm: u8) {
    if arch == Arch::X64 && (w64 || reg >= 8 || rm >= 8) {
        seq.push(rex(w64, reg >= 8, false, rm >= 8));
    }
}

/// `MOV reg, imm` in the `B8+r` form. 32-bit operands zero-extend on x64;
/// 64-bit operands use the `movabs` form.
pub fn mov_reg_imm(seq: &mut Seq, arch: Arch, reg: u8, value: u64, bits: u8) {
    match bits {
        64 => {
            debug_assert_eq!(arch, Arch::X64);
            seq.push(rex(true, false, false, reg >= 8));
            seq.push(0xb8 + (reg & 7));
            seq.extend_from_slice(&value.to_le_bytes());
        }
        32 => {
            push_rex(seq, arch, false, 0, reg);
            seq.push(0xb8 + (reg & 7));
            seq.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => unreachable!("unsupported mov width"),
    }
}

/// Group-1 ALU op with a 32-bit immediate: `81 /digit id`.
///
/// Digits: ADD=0 OR=1 ADC=2 SBB=3 AND=4 SUB=5 XOR=6 CMP=7. On x64 the
/// immediate sign-extends when `bits` is 64.
pub fn alu_reg_imm32(seq: &mut Seq, arch: Arch, digit: u8, reg: u8, imm: u32, bits: u8) {
    push_rex(seq, arch, bits == 64, 0, reg);
    seq.push(0x81);
    seq.push(modrm(3, digit, reg));
    seq.extend_from_slice(&imm.to_le_bytes());
}

/// Register-to-register ALU form (`31 /r` XOR, `29 /r` SUB, `01 /r` ADD,
/// `85 /r` TEST, ...), with both operands the same register class.
pub fn alu_rr(seq: &mut Seq, arch: Arch, opcode: u8, reg: u8, rm: u8, bits: u8) {
    if arch == Arch::X64 && (bits == 64 || reg >= 8 || rm >= 8) {
        seq.push(rex(bits == 64, reg >= 8, false, rm >= 8));
    }
    seq.push(opcode);
    seq.push(modrm(3, reg, rm));
}

/// `F7 /digit` unary form: NOT=2, NEG=3.
pub fn unary_f7(seq: &mut Seq, arch: Arch, digit: u8, reg: u8, bits: u8) {
    push_rex(seq, arch, bits == 64, 0, reg);
    seq.push(0xf7);
    seq.push(modrm(3, digit, reg));
}

/// `SHL reg, imm8` (`C1 /4 ib`).
pub fn shl_reg_imm8(seq: &mut Seq, arch: Arch, reg: u8, amount: u8, bits: u8) {
    push_rex(seq, arch, bits == 64, 0, reg);
    seq.push(0xc1);
    seq.push(modrm(3, 4, reg));
    seq.push(amount);
}

/// `PUSH reg`.
pub fn push_reg(seq: &mut Seq, arch: Arch, reg: u8) {
    if arch == Arch::X64 && reg >= 8 {
        seq.push(rex(false, false, false, true));
    }
    seq.push(0x50 + (reg & 7));
}

/// `POP reg`.
pub fn pop_reg(seq: &mut Seq, arch: Arch, reg: u8) {
    if arch == Arch::X64 && reg >= 8 {
        seq.push(rex(false, false, false, true));
    }
    seq.push(0x58 + (reg & 7));
}

/// `JMP reg` (`FF /4`).
pub fn jmp_reg(seq: &mut Seq, arch: Arch, reg: u8) {
    if arch == Arch::X64 && reg >= 8 {
        seq.push(rex(false, false, false, true));
    }
    seq.push(0xff);
    seq.push(modrm(3, 4, reg));
}

/// `CALL reg` (`FF /2`).
pub fn call_reg(seq: &mut Seq, arch: Arch, reg: u8) {
    if arch == Arch::X64 && reg >= 8 {
        seq.push(rex(false, false, false, true));
    }
    seq.push(0xff);
    seq.push(modrm(3, 2, reg));
}

/// `LEA dst, [base + disp]`, choosing the 8- or 32-bit displacement form.
///
/// Fails when neither displacement encoding is clean.
pub fn lea_reg_base_disp(
    seq: &mut Seq,
    bad: &BadByteSet,
    arch: Arch,
    dst: u8,
    base: u8,
    disp: i32,
    bits: u8,
) -> Result<(), StrategyError> {
    let fits8 = i8::try_from(disp).is_ok();
    let disp8_ok = fits8 && !bad.is_bad(disp as u8);
    let disp32_ok = bad.integer_ok(disp as u32 as u64, 4);
    let (m0d, small) = if disp8_ok {
        (1, true)
    } else if disp32_ok {
        (2, false)
    } else {
        return Err(StrategyError::Unencodable);
    };
    if arch == Arch::X64 && (bits == 64 || dst >= 8 || base >= 8) {
        seq.push(rex(bits == 64, dst >= 8, false, base >= 8));
    }
    seq.push(0x8d);
    seq.push(modrm(m0d, dst, base));
    if base & 7 == 4 {
        // RSP/R12-class bases need a SIB byte with no index.
        seq.push(sib(0, 4, base));
    }
    if small {
        seq.push(disp as u8);
    } else {
        seq.extend_from_slice(&disp.to_le_bytes());
    }
    Ok(())
}

/// Find a key `K` with clean bytes such that `V ^ K` is clean, bytewise.
pub fn find_xor_key(bad: &BadByteSet, value: u64, width: usize) -> Option<u64> {
    let v = value.to_le_bytes();
    let mut key = [0u8; 8];
    for i in 0..width {
        key[i] = bad.clean_bytes().find(|&k| !bad.is_bad(v[i] ^ k))?;
    }
    Some(u64::from_le_bytes(key))
}

/// Find `(A, B)` with `A + B = V` (wrapping at `width` bytes) and every byte
/// of both halves clean. Column addition with backtracking over the carry.
pub fn find_add_split(bad: &BadByteSet, value: u64, width: usize) -> Option<(u64, u64)> {
    let v = value.to_le_bytes();
    let mut a = [0u8; 8];
    let mut b = [0u8; 8];
    if split_rec(bad, &v, width, 0, 0, &mut a, &mut b, false) {
        Some((u64::from_le_bytes(a), u64::from_le_bytes(b)))
    } else {
        None
    }
}

/// Find `(A, B)` with `A - B = V` (wrapping at `width` bytes), both clean.
pub fn find_sub_split(bad: &BadByteSet, value: u64, width: usize) -> Option<(u64, u64)> {
    // A - B = V is the column addition V + B = A.
    let v = value.to_le_bytes();
    let mut b = [0u8; 8];
    let mut a = [0u8; 8];
    if split_rec(bad, &v, width, 0, 0, &mut b, &mut a, true) {
        Some((u64::from_le_bytes(a), u64::from_le_bytes(b)))
    } else {
        None
    }
}

/// Column-wise search: pick clean `x[i]`, derive `y[i]` from the running
/// carry. In sum mode `x + y = v`; in difference mode `v + x = y`.
#[allow(clippy::too_many_arguments)]
fn split_rec(
    bad: &BadByteSet,
    v: &[u8; 8],
    width: usize,
    idx: usize,
    carry: u32,
    x: &mut [u8; 8],
    y: &mut [u8; 8],
    diff: bool,
) -> bool {
    if idx == width {
        // The final carry vanishes modulo 2^(8*width).
        return true;
    }
    for cand in bad.clean_bytes() {
        let (other, next_carry) = if diff {
            let sum = u32::from(v[idx]) + u32::from(cand) + carry;
            ((sum & 0xff) as u8, sum >> 8)
        } else {
            let need = u32::from(v[idx]);
            let other = (need
                .wrapping_sub(u32::from(cand))
                .wrapping_sub(carry))
                & 0xff;
            let sum = u32::from(cand) + other + carry;
            (other as u8, sum >> 8)
        };
        if bad.is_bad(other) {
            continue;
        }
        x[idx] = cand;
        y[idx] = other;
        if split_rec(bad, v, width, idx + 1, next_carry, x, y, diff) {
            return true;
        }
    }
    false
}

/// Find `(m, k)` with `value = m << k`, `m` clean at `width` bytes, and a
/// clean shift count.
pub fn find_shift(bad: &BadByteSet, value: u64, width: usize) -> Option<(u64, u8)> {
    if value == 0 {
        return None;
    }
    let bits = width as u32 * 8;
    for k in 1..bits {
        if value & ((1u64 << k) - 1) != 0 {
            continue;
        }
        let m = value >> k;
        if m != 0 && bad.integer_ok(m, width) && !bad.is_bad(k as u8) {
            return Some((m, k as u8));
        }
    }
    None
}

fn try_candidate(seq: &mut Seq, bad: &BadByteSet, cand: Seq) -> bool {
    if !cand.is_empty() && bad.bytes_ok(&cand) {
        seq.extend_from_slice(&cand);
        true
    } else {
        false
    }
}

/// Load `value` into `reg` without emitting any forbidden byte.
///
/// Walks the transform ladder of the immediate-substitution family: direct
/// move, zero idioms, bitwise complement, arithmetic negation, XOR key,
/// additive and subtractive splits, shift-and-combine, and (32-bit x86) the
/// 16-bit increment chain. The first fully clean candidate wins.
pub fn emit_load_imm(
    seq: &mut Seq,
    bad: &BadByteSet,
    arch: Arch,
    reg: u8,
    value: u64,
    bits: u8,
) -> Result<(), StrategyError> {
    debug_assert!(bits == 32 || bits == 64);
    if bits == 64 && value > u64::from(u32::MAX) {
        return emit_load_imm64(seq, bad, arch, reg, value);
    }
    let value = value & 0xffff_ffff;
    let width = 4usize;

    // Direct move.
    let mut cand = Seq::new();
    mov_reg_imm(&mut cand, arch, reg, value, 32);
    if try_candidate(seq, bad, cand) {
        return Ok(());
    }

    // Zero idioms.
    if value == 0 {
        for opcode in [0x31u8, 0x29] {
            let mut cand = Seq::new();
            alu_rr(&mut cand, arch, opcode, reg, reg, 32);
            if try_candidate(seq, bad, cand) {
                return Ok(());
            }
        }
        return Err(StrategyError::Unencodable);
    }

    // Bitwise complement: mov reg, ~V ; not reg.
    let inv = !value & 0xffff_ffff;
    if bad.integer_ok(inv, width) {
        let mut cand = Seq::new();
        mov_reg_imm(&mut cand, arch, reg, inv, 32);
        unary_f7(&mut cand, arch, 2, reg, 32);
        if try_candidate(seq, bad, cand) {
            return Ok(());
        }
    }

    // Arithmetic negation: mov reg, -V ; neg reg.
    let neg = value.wrapping_neg() & 0xffff_ffff;
    if bad.integer_ok(neg, width) {
        let mut cand = Seq::new();
        mov_reg_imm(&mut cand, arch, reg, neg, 32);
        unary_f7(&mut cand, arch, 3, reg, 32);
        if try_candidate(seq, bad, cand) {
            return Ok(());
        }
    }

    // XOR with a clean key.
    if let Some(key) = find_xor_key(bad, value, width) {
        let mut cand = Seq::new();
        mov_reg_imm(&mut cand, arch, reg, value ^ key, 32);
        alu_reg_imm32(&mut cand, arch, 6, reg, key as u32, 32);
        if try_candidate(seq, bad, cand) {
            return Ok(());
        }
    }

    // Additive split.
    if let Some((a, b)) = find_add_split(bad, value, width) {
        let mut cand = Seq::new();
        mov_reg_imm(&mut cand, arch, reg, a, 32);
        alu_reg_imm32(&mut cand, arch, 0, reg, b as u32, 32);
        if try_candidate(seq, bad, cand) {
            return Ok(());
        }
    }

    // Subtractive split.
    if let Some((a, b)) = find_sub_split(bad, value, width) {
        let mut cand = Seq::new();
        mov_reg_imm(&mut cand, arch, reg, a, 32);
        alu_reg_imm32(&mut cand, arch, 5, reg, b as u32, 32);
        if try_candidate(seq, bad, cand) {
            return Ok(());
        }
    }

    // Shift-and-combine.
    if let Some((m, k)) = find_shift(bad, value, width) {
        let mut cand = Seq::new();
        mov_reg_imm(&mut cand, arch, reg, m, 32);
        shl_reg_imm8(&mut cand, arch, reg, k, 32);
        if try_candidate(seq, bad, cand) {
            return Ok(());
        }
    }

    // Tiny constants on 32-bit x86: zero then 16-bit increments.
    if arch == Arch::X86 && value <= 16 {
        let mut cand = Seq::new();
        alu_rr(&mut cand, arch, 0x31, reg, reg, 32);
        for _ in 0..value {
            cand.push(0x66);
            cand.push(0x40 + reg);
        }
        if try_candidate(seq, bad, cand) {
            return Ok(());
        }
    }

    Err(StrategyError::Unencodable)
}

/// 64-bit loads that do not fit the zero-extended 32-bit path.
fn emit_load_imm64(
    seq: &mut Seq,
    bad: &BadByteSet,
    arch: Arch,
    reg: u8,
    value: u64,
) -> Result<(), StrategyError> {
    debug_assert_eq!(arch, Arch::X64);

    // Direct movabs.
    let mut cand = Seq::new();
    mov_reg_imm(&mut cand, arch, reg, value, 64);
    if try_candidate(seq, bad, cand) {
        return Ok(());
    }

    // Complement and negation over the full width.
    for (digit, transformed) in [(2u8, !value), (3u8, value.wrapping_neg())] {
        if bad.integer_ok(transformed, 8) {
            let mut cand = Seq::new();
            mov_reg_imm(&mut cand, arch, reg, transformed, 64);
            unary_f7(&mut cand, arch, digit, reg, 64);
            if try_candidate(seq, bad, cand) {
                return Ok(());
            }
        }
    }

    // Compose from halves: load the high word, shift it up, add the low
    // word (which must stay positive under imm32 sign extension).
    let hi = value >> 32;
    let lo = value & 0xffff_ffff;
    let mut cand = Seq::new();
    emit_load_imm(&mut cand, bad, arch, reg, hi, 32)?;
    shl_reg_imm8(&mut cand, arch, reg, 32, 64);
    if lo != 0 {
        if lo <= i32::MAX as u64 && bad.integer_ok(lo, 4) {
            alu_reg_imm32(&mut cand, arch, 0, reg, lo as u32, 64);
        } else if let Some((a, b)) = find_add_split(bad, lo, 4) {
            if a > i32::MAX as u64 || b > i32::MAX as u64 {
                return Err(StrategyError::Unencodable);
            }
            alu_reg_imm32(&mut cand, arch, 0, reg, a as u32, 64);
            alu_reg_imm32(&mut cand, arch, 0, reg, b as u32, 64);
        } else {
            return Err(StrategyError::Unencodable);
        }
    }
    if try_candidate(seq, bad, cand) {
        return Ok(());
    }
    Err(StrategyError::Unencodable)
}
