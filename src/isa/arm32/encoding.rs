//! ARM32 (A32) encoding helpers.
//!
//! Word composers for the data-processing, load/store and branch classes,
//! the rotated 8-bit immediate codec, and the condition-code inverter. All
//! output is a 32-bit instruction word; the caller writes it little-endian.

use crate::badbytes::BadByteSet;

/// A32 condition codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Cond {
    Eq = 0,
    Ne = 1,
    Hs = 2,
    Lo = 3,
    Mi = 4,
    Pl = 5,
    Vs = 6,
    Vc = 7,
    Hi = 8,
    Ls = 9,
    Ge = 10,
    Lt = 11,
    Gt = 12,
    Le = 13,
    Al = 14,
}

impl Cond {
    /// Decode a 4-bit condition field. The `0b1111` slot is not a condition.
    pub fn from_bits(bits: u8) -> Option<Cond> {
        use Cond::*;
        Some(match bits {
            0 => Eq,
            1 => Ne,
            2 => Hs,
            3 => Lo,
            4 => Mi,
            5 => Pl,
            6 => Vs,
            7 => Vc,
            8 => Hi,
            9 => Ls,
            10 => Ge,
            11 => Lt,
            12 => Gt,
            13 => Le,
            14 => Al,
            _ => return None,
        })
    }

    /// Machine encoding of this condition.
    pub fn bits(self) -> u32 {
        self as u32
    }

    /// The inverted condition. `AL` has no inverse; the reserved `0b1111`
    /// slot never decodes to a `Cond` in the first place.
    pub fn invert(self) -> Option<Cond> {
        use Cond::*;
        Some(match self {
            Eq => Ne,
            Ne => Eq,
            Hs => Lo,
            Lo => Hs,
            Mi => Pl,
            Pl => Mi,
            Vs => Vc,
            Vc => Vs,
            Hi => Ls,
            Ls => Hi,
            Ge => Lt,
            Lt => Ge,
            Gt => Le,
            Le => Gt,
            Al => return None,
        })
    }
}

/// Data-processing opcodes (bits 24:21 of the immediate form).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum DpOp {
    And = 0,
    Eor = 1,
    Sub = 2,
    Rsb = 3,
    Add = 4,
    Adc = 5,
    Sbc = 6,
    Rsc = 7,
    Tst = 8,
    Teq = 9,
    Cmp = 10,
    Cmn = 11,
    Orr = 12,
    Mov = 13,
    Bic = 14,
    Mvn = 15,
}

/// Encode a value as a rotated 8-bit immediate, if possible.
///
/// The result packs the rotation count (in units of two bit positions) into
/// the high nibble and the 8-bit payload into the low byte of the 12-bit
/// field. The search is exhaustive over the 16 even rotations.
pub fn rotated_imm_encode(value: u32) -> Option<u16> {
    for rot in 0..16u32 {
        let payload = value.rotate_left(rot * 2);
        if payload < 256 {
            return Some(((rot as u16) << 8) | payload as u16);
        }
    }
    None
}

/// Decode a 12-bit rotated-immediate field back to its value.
pub fn rotated_imm_decode(enc: u16) -> u32 {
    let rot = u32::from(enc >> 8) & 0xf;
    let payload = u32::from(enc & 0xff);
    payload.rotate_right(rot * 2)
}

/// Data-processing, immediate form.
pub fn enc_dp_imm(cond: Cond, op: DpOp, s: bool, rn: u8, rd: u8, imm12: u16) -> u32 {
    (cond.bits() << 28)
        | (1 << 25)
        | ((op as u32) << 21)
        | (u32::from(s) << 20)
        | (u32::from(rn & 0xf) << 16)
        | (u32::from(rd & 0xf) << 12)
        | u32::from(imm12 & 0xfff)
}

/// Register-to-register `MOV rd, rm`.
pub fn enc_mov_reg(cond: Cond, rd: u8, rm: u8) -> u32 {
    (cond.bits() << 28) | (0b1101 << 21) | (u32::from(rd & 0xf) << 12) | u32::from(rm & 0xf)
}

/// `MOVW rd, #imm16` (ARMv7).
pub fn enc_movw(cond: Cond, rd: u8, imm16: u16) -> u32 {
    let imm4 = u32::from(imm16 >> 12);
    let imm12 = u32::from(imm16 & 0xfff);
    (cond.bits() << 28) | (0b0011_0000 << 20) | (imm4 << 16) | (u32::from(rd & 0xf) << 12) | imm12
}

/// `MOVT rd, #imm16` (ARMv7).
pub fn enc_movt(cond: Cond, rd: u8, imm16: u16) -> u32 {
    let imm4 = u32::from(imm16 >> 12);
    let imm12 = u32::from(imm16 & 0xfff);
    (cond.bits() << 28) | (0b0011_0100 << 20) | (imm4 << 16) | (u32::from(rd & 0xf) << 12) | imm12
}

/// Single-register load/store with an immediate offset (offset addressing,
/// no writeback). The displacement must lie in `[-4095, 4095]`.
pub fn enc_ldst_imm(cond: Cond, load: bool, byte: bool, rn: u8, rt: u8, offset: i32) -> Option<u32> {
    if offset.unsigned_abs() > 4095 {
        return None;
    }
    let u = u32::from(offset >= 0);
    Some(
        (cond.bits() << 28)
            | (0b01 << 26)
            | (1 << 24)
            | (u << 23)
            | (u32::from(byte) << 22)
            | (u32::from(load) << 20)
            | (u32::from(rn & 0xf) << 16)
            | (u32::from(rt & 0xf) << 12)
            | offset.unsigned_abs(),
    )
}

/// `B`/`BL` with a byte offset measured from the fetch PC (instruction
/// address plus 8). Must be word-aligned and within the 26-bit byte range.
pub fn enc_branch(cond: Cond, link: bool, offset: i64) -> Option<u32> {
    if offset & 3 != 0 {
        return None;
    }
    let words = offset >> 2;
    if words < -(1 << 23) || words >= (1 << 23) {
        return None;
    }
    Some(
        (cond.bits() << 28)
            | (0b101 << 25)
            | (u32::from(link) << 24)
            | (words as u32 & 0x00ff_ffff),
    )
}

/// Byte offset encoded in a `B`/`BL` word, from the fetch PC.
pub fn dec_branch_offset(word: u32) -> i64 {
    let imm24 = word & 0x00ff_ffff;
    (((imm24 << 8) as i32) >> 8) as i64 * 4
}

/// `BX rm`.
pub fn enc_bx(cond: Cond, rm: u8) -> u32 {
    (cond.bits() << 28) | 0x012f_ff10 | u32::from(rm & 0xf)
}

/// `BLX rm`.
pub fn enc_blx_reg(cond: Cond, rm: u8) -> u32 {
    (cond.bits() << 28) | 0x012f_ff30 | u32::from(rm & 0xf)
}

/// Split a load/store displacement into a rotated-encodable pre-adjustment
/// and a residual that fits the single-displacement range, such that the
/// three words of the adjusted access are clean. `check` receives
/// `(pre, residual)` and judges the composed words.
pub fn split_displacement<F>(d: i32, mut check: F) -> Option<(i32, i32)>
where
    F: FnMut(i32, i32) -> bool,
{
    // Enumerate small residuals; the pre-adjustment takes the rest.
    for mag in 1..=255i32 {
        for res in [mag, -mag] {
            let pre = d - res;
            if pre == 0 || res.unsigned_abs() > 4095 {
                continue;
            }
            if rotated_imm_encode(pre.unsigned_abs()).is_none() {
                continue;
            }
            if check(pre, res) {
                return Some((pre, res));
            }
        }
    }
    None
}

/// Push a word onto a little-endian byte sequence.
pub fn push_word(seq: &mut crate::isa::Seq, word: u32) {
    seq.extend_from_slice(&word.to_le_bytes());
}

/// Are all of `words` free of forbidden bytes?
pub fn words_clean(bad: &BadByteSet, words: &[u32]) -> bool {
    words.iter().all(|&w| bad.integer_ok(u64::from(w), 4))
}
