//! x86/x64 rewriting strategies.
//!
//! One type per transformation family; all of them key on instructions whose
//! original encoding contains a forbidden byte and re-express the same
//! architectural effect through clean opcodes. Priorities put the cheap
//! idioms (zeroing, push/pop moves, increment chains) ahead of the generic
//! immediate transforms, with the whole-instruction substitutions
//! (string ops, XLAT, LAHF/SAHF, ENTER/LEAVE) at the bottom.

use super::encoding::{
    alu_reg_imm32, alu_rr, find_add_split, find_shift, find_sub_split, find_xor_key,
    lea_reg_base_disp, modrm, mov_reg_imm, pop_reg, rex, shl_reg_imm8, sib, unary_f7, Seq,
};
use crate::arch::Arch;
use crate::badbytes::BadByteSet;
use crate::error::StrategyError;
use crate::inst::{DecodedInst, Op, Reg, RepPrefix};
use crate::strategy::{EmitCtx, Strategy};
use crate::strategy::StrategyRegistry;

/// Register the default x86 strategy set for `arch` (X86 or X64).
pub(crate) fn register(registry: &mut StrategyRegistry, arch: Arch) {
    debug_assert!(arch.is_x86_family());
    registry.register(Box::new(ZeroIdiom { arch }));
    registry.register(Box::new(PushPopMov { arch }));
    registry.register(Box::new(ByteRegChain { arch }));
    registry.register(Box::new(ImmNot { arch }));
    registry.register(Box::new(ImmNeg { arch }));
    registry.register(Box::new(ImmXorKey { arch }));
    registry.register(Box::new(ImmAddSplit { arch }));
    registry.register(Box::new(ImmSubSplit { arch }));
    registry.register(Box::new(ImmShift { arch }));
    registry.register(Box::new(AddSubLea { arch }));
    registry.register(Box::new(StringRep { arch }));
    registry.register(Box::new(Xlat { arch }));
    registry.register(Box::new(Lahf { arch }));
    registry.register(Box::new(Sahf { arch }));
    registry.register(Box::new(Enter { arch }));
    registry.register(Box::new(Leave { arch }));
}

fn unclean(inst: &DecodedInst, bad: &BadByteSet) -> bool {
    !bad.bytes_ok(&inst.bytes)
}

/// `MOV reg, imm` with a word-sized destination, as (reg, value, bits).
fn mov_reg_imm_parts(inst: &DecodedInst) -> Option<(Reg, u64, u8)> {
    if inst.op != Op::Mov {
        return None;
    }
    let reg = inst.reg_op(0)?;
    let imm = inst.imm_op(1)?;
    match reg.bits {
        32 => Some((reg, imm as u64 & 0xffff_ffff, 32)),
        64 => Some((reg, imm as u64, 64)),
        _ => None,
    }
}

fn finish(ctx: &mut EmitCtx, cand: Seq) -> Result<(), StrategyError> {
    if cand.is_empty() || !ctx.bad.bytes_ok(&cand) {
        return Err(StrategyError::Unencodable);
    }
    ctx.buf.put_bytes(&cand);
    Ok(())
}

// ---------------------------------------------------------------------------
// Zeroing: MOV reg, 0 -> XOR reg, reg (or SUB reg, reg).

struct ZeroIdiom {
    arch: Arch,
}

impl Strategy for ZeroIdiom {
    fn name(&self) -> &'static str {
        "zero-idiom"
    }
    fn arch(&self) -> Arch {
        self.arch
    }
    fn priority(&self) -> i32 {
        120
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        unclean(inst, bad) && matches!(mov_reg_imm_parts(inst), Some((_, 0, _)))
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        3
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let (reg, _, bits) = mov_reg_imm_parts(inst).ok_or(StrategyError::Unencodable)?;
        // XOR r32, r32 zero-extends on x64, so the 32-bit form serves both
        // widths.
        let op_bits = if bits == 64 && reg.index < 8 { 32 } else { bits };
        for opcode in [0x31u8, 0x29] {
            let mut cand = Seq::new();
            alu_rr(&mut cand, self.arch, opcode, reg.index, reg.index, op_bits);
            if ctx.bad.bytes_ok(&cand) {
                return finish(ctx, cand);
            }
        }
        Err(StrategyError::Unencodable)
    }
}

// ---------------------------------------------------------------------------
// MOV reg, imm -> PUSH imm ; POP reg.

struct PushPopMov {
    arch: Arch,
}

impl Strategy for PushPopMov {
    fn name(&self) -> &'static str {
        "push-pop-mov"
    }
    fn arch(&self) -> Arch {
        self.arch
    }
    fn priority(&self) -> i32 {
        110
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        if !unclean(inst, bad) {
            return false;
        }
        match mov_reg_imm_parts(inst) {
            // PUSH imm32 sign-extends on x64; restrict to values that
            // round-trip.
            Some((_, v, 32)) => self.arch == Arch::X86 || v <= i32::MAX as u64,
            Some((_, v, 64)) => v <= i32::MAX as u64,
            _ => false,
        }
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        7
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let (reg, value, _) = mov_reg_imm_parts(inst).ok_or(StrategyError::Unencodable)?;
        let mut cand = Seq::new();
        cand.push(0x68);
        cand.extend_from_slice(&(value as u32).to_le_bytes());
        pop_reg(&mut cand, self.arch, reg.index);
        finish(ctx, cand)
    }
}

// ---------------------------------------------------------------------------
// Small byte-register constants: zero then a 16-bit increment chain.

struct ByteRegChain {
    arch: Arch,
}

impl Strategy for ByteRegChain {
    fn name(&self) -> &'static str {
        "byte-reg-chain"
    }
    fn arch(&self) -> Arch {
        self.arch
    }
    fn priority(&self) -> i32 {
        105
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        if !unclean(inst, bad) || inst.op != Op::Mov {
            return false;
        }
        match (inst.reg_op(0), inst.imm_op(1)) {
            (Some(reg), Some(n)) => {
                reg.bits == 8 && reg.index < 4 && !reg.high8 && (0..=16).contains(&n)
            }
            _ => false,
        }
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        2 + 16 * 3
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let reg = inst.reg_op(0).ok_or(StrategyError::Unencodable)?;
        let n = inst.imm_op(1).ok_or(StrategyError::Unencodable)?;
        let mut cand = Seq::new();
        // Clobbers the full 32-bit register; the byte destination is
        // realised by counting up the 16-bit view, whose `66 40+r` / `66
        // ff /0` encodings avoid most byte sets.
        alu_rr(&mut cand, self.arch, 0x31, reg.index, reg.index, 32);
        for _ in 0..n {
            cand.push(0x66);
            if self.arch == Arch::X86 {
                cand.push(0x40 + reg.index);
            } else {
                cand.push(0xff);
                cand.push(modrm(3, 0, reg.index));
            }
        }
        finish(ctx, cand)
    }
}

// ---------------------------------------------------------------------------
// Immediate substitution family. One strategy per transform; each loads a
// register-width constant through a single bitwise identity.

macro_rules! imm_strategy {
    ($ty:ident, $name:literal, $prio:literal) => {
        struct $ty {
            arch: Arch,
        }

        impl $ty {
            fn parts(inst: &DecodedInst) -> Option<(Reg, u64, u8)> {
                mov_reg_imm_parts(inst)
            }
        }
    };
}

imm_strategy!(ImmNot, "imm-not", 100);
imm_strategy!(ImmNeg, "imm-neg", 95);
imm_strategy!(ImmXorKey, "imm-xor-key", 90);
imm_strategy!(ImmAddSplit, "imm-add-split", 85);
imm_strategy!(ImmSubSplit, "imm-sub-split", 80);
imm_strategy!(ImmShift, "imm-shift", 75);

fn imm_width(bits: u8) -> usize {
    usize::from(bits / 8)
}

impl Strategy for ImmNot {
    fn name(&self) -> &'static str {
        "imm-not"
    }
    fn arch(&self) -> Arch {
        self.arch
    }
    fn priority(&self) -> i32 {
        100
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        match Self::parts(inst) {
            Some((_, v, bits)) => {
                unclean(inst, bad) && v != 0 && {
                    let mask = if bits == 32 { 0xffff_ffff } else { u64::MAX };
                    bad.integer_ok(!v & mask, imm_width(bits))
                }
            }
            None => false,
        }
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        14
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let (reg, v, bits) = Self::parts(inst).ok_or(StrategyError::Unencodable)?;
        let mask = if bits == 32 { 0xffff_ffff } else { u64::MAX };
        let mut cand = Seq::new();
        mov_reg_imm(&mut cand, self.arch, reg.index, !v & mask, bits);
        unary_f7(&mut cand, self.arch, 2, reg.index, bits);
        finish(ctx, cand)
    }
}

impl Strategy for ImmNeg {
    fn name(&self) -> &'static str {
        "imm-neg"
    }
    fn arch(&self) -> Arch {
        self.arch
    }
    fn priority(&self) -> i32 {
        95
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        match Self::parts(inst) {
            Some((_, v, bits)) => {
                let mask = if bits == 32 { 0xffff_ffff } else { u64::MAX };
                unclean(inst, bad)
                    && v != 0
                    && bad.integer_ok(v.wrapping_neg() & mask, imm_width(bits))
            }
            None => false,
        }
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        14
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let (reg, v, bits) = Self::parts(inst).ok_or(StrategyError::Unencodable)?;
        let mask = if bits == 32 { 0xffff_ffff } else { u64::MAX };
        let mut cand = Seq::new();
        mov_reg_imm(&mut cand, self.arch, reg.index, v.wrapping_neg() & mask, bits);
        unary_f7(&mut cand, self.arch, 3, reg.index, bits);
        finish(ctx, cand)
    }
}

impl Strategy for ImmXorKey {
    fn name(&self) -> &'static str {
        "imm-xor-key"
    }
    fn arch(&self) -> Arch {
        self.arch
    }
    fn priority(&self) -> i32 {
        90
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        match Self::parts(inst) {
            // The 64-bit XOR immediate form sign-extends 32 bits; keep the
            // transform inside that window.
            Some((_, v, bits)) => {
                unclean(inst, bad)
                    && (bits == 32 || v <= i32::MAX as u64)
                    && find_xor_key(bad, v, 4).is_some()
            }
            None => false,
        }
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        13
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let (reg, v, bits) = Self::parts(inst).ok_or(StrategyError::Unencodable)?;
        let key = find_xor_key(ctx.bad, v, 4).ok_or(StrategyError::Unencodable)?;
        if key > i32::MAX as u64 && bits == 64 {
            return Err(StrategyError::Unencodable);
        }
        let mut cand = Seq::new();
        mov_reg_imm(&mut cand, self.arch, reg.index, v ^ key, bits.min(32));
        alu_reg_imm32(&mut cand, self.arch, 6, reg.index, key as u32, bits);
        finish(ctx, cand)
    }
}

impl Strategy for ImmAddSplit {
    fn name(&self) -> &'static str {
        "imm-add-split"
    }
    fn arch(&self) -> Arch {
        self.arch
    }
    fn priority(&self) -> i32 {
        85
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        match Self::parts(inst) {
            Some((_, v, 32)) => unclean(inst, bad) && find_add_split(bad, v, 4).is_some(),
            _ => false,
        }
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        13
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let (reg, v, _) = Self::parts(inst).ok_or(StrategyError::Unencodable)?;
        let (a, b) = find_add_split(ctx.bad, v, 4).ok_or(StrategyError::Unencodable)?;
        let mut cand = Seq::new();
        mov_reg_imm(&mut cand, self.arch, reg.index, a, 32);
        alu_reg_imm32(&mut cand, self.arch, 0, reg.index, b as u32, 32);
        finish(ctx, cand)
    }
}

impl Strategy for ImmSubSplit {
    fn name(&self) -> &'static str {
        "imm-sub-split"
    }
    fn arch(&self) -> Arch {
        self.arch
    }
    fn priority(&self) -> i32 {
        80
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        match Self::parts(inst) {
            Some((_, v, 32)) => unclean(inst, bad) && find_sub_split(bad, v, 4).is_some(),
            _ => false,
        }
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        13
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let (reg, v, _) = Self::parts(inst).ok_or(StrategyError::Unencodable)?;
        let (a, b) = find_sub_split(ctx.bad, v, 4).ok_or(StrategyError::Unencodable)?;
        let mut cand = Seq::new();
        mov_reg_imm(&mut cand, self.arch, reg.index, a, 32);
        alu_reg_imm32(&mut cand, self.arch, 5, reg.index, b as u32, 32);
        finish(ctx, cand)
    }
}

impl Strategy for ImmShift {
    fn name(&self) -> &'static str {
        "imm-shift"
    }
    fn arch(&self) -> Arch {
        self.arch
    }
    fn priority(&self) -> i32 {
        75
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        match Self::parts(inst) {
            Some((_, v, bits)) => unclean(inst, bad) && find_shift(bad, v, imm_width(bits)).is_some(),
            None => false,
        }
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        14
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let (reg, v, bits) = Self::parts(inst).ok_or(StrategyError::Unencodable)?;
        let (m, k) = find_shift(ctx.bad, v, imm_width(bits)).ok_or(StrategyError::Unencodable)?;
        let mov_bits = if bits == 64 && m > u64::from(u32::MAX) {
            64
        } else {
            32
        };
        let mut cand = Seq::new();
        mov_reg_imm(&mut cand, self.arch, reg.index, m, mov_bits);
        shl_reg_imm8(&mut cand, self.arch, reg.index, k, bits);
        finish(ctx, cand)
    }
}

// ---------------------------------------------------------------------------
// Addressing-mode rewrite: ADD/SUB reg, imm -> LEA reg, [reg + imm].

struct AddSubLea {
    arch: Arch,
}

impl AddSubLea {
    fn parts(inst: &DecodedInst) -> Option<(Reg, i64, bool)> {
        if inst.op != Op::Add && inst.op != Op::Sub {
            return None;
        }
        let reg = inst.reg_op(0)?;
        let imm = inst.imm_op(1)?;
        if reg.bits != 32 && reg.bits != 64 {
            return None;
        }
        Some((reg, imm, inst.op == Op::Sub))
    }
}

impl Strategy for AddSubLea {
    fn name(&self) -> &'static str {
        "addsub-lea"
    }
    fn arch(&self) -> Arch {
        self.arch
    }
    fn priority(&self) -> i32 {
        70
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        if !unclean(inst, bad) {
            return false;
        }
        match Self::parts(inst) {
            Some((_, imm, _)) => i32::try_from(imm).is_ok(),
            None => false,
        }
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        16
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let (reg, imm, is_sub) = Self::parts(inst).ok_or(StrategyError::Unencodable)?;
        let disp = if is_sub {
            (imm as i32).wrapping_neg()
        } else {
            imm as i32
        };
        let mut cand = Seq::new();
        if lea_reg_base_disp(&mut cand, ctx.bad, self.arch, reg.index, reg.index, disp, reg.bits)
            .is_ok()
            && ctx.bad.bytes_ok(&cand)
        {
            return finish(ctx, cand);
        }
        // Split displacement across two LEAs. On x64 keep both halves
        // non-negative so the 32-bit displacement sign extension stays
        // exact.
        let (a, b) = find_add_split(ctx.bad, disp as u32 as u64, 4).ok_or(StrategyError::Unencodable)?;
        if reg.bits == 64
            && (disp < 0 || a > i32::MAX as u64 || b > i32::MAX as u64 || a + b != disp as u64)
        {
            return Err(StrategyError::Unencodable);
        }
        let mut cand = Seq::new();
        lea_reg_base_disp(&mut cand, ctx.bad, self.arch, reg.index, reg.index, a as i32, reg.bits)?;
        lea_reg_base_disp(&mut cand, ctx.bad, self.arch, reg.index, reg.index, b as i32, reg.bits)?;
        finish(ctx, cand)
    }
}

// ---------------------------------------------------------------------------
// REP string expansion.

struct StringRep {
    arch: Arch,
}

impl StringRep {
    /// Base one-byte opcode of the element-sized string primitive.
    fn strop(&self, inst: &DecodedInst) -> Option<Seq> {
        let byte_op = match inst.op {
            Op::Movs => 0xa4,
            Op::Stos => 0xaa,
            Op::Lods => 0xac,
            Op::Scas => 0xae,
            Op::Cmps => 0xa6,
            _ => return None,
        };
        let mut seq = Seq::new();
        match inst.elem_bits {
            8 => seq.push(byte_op),
            16 => {
                seq.push(0x66);
                seq.push(byte_op + 1);
            }
            32 => seq.push(byte_op + 1),
            64 => {
                seq.push(rex(true, false, false, false));
                seq.push(byte_op + 1);
            }
            _ => return None,
        }
        Some(seq)
    }

    fn test_counter(&self) -> Seq {
        let mut seq = Seq::new();
        alu_rr(&mut seq, self.arch, 0x85, 1, 1, if self.arch == Arch::X64 { 64 } else { 32 });
        seq
    }
}

impl Strategy for StringRep {
    fn name(&self) -> &'static str {
        "string-expand"
    }
    fn arch(&self) -> Arch {
        self.arch
    }
    fn priority(&self) -> i32 {
        60
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        if !unclean(inst, bad) || inst.rep == RepPrefix::None {
            return false;
        }
        matches!(inst.op, Op::Movs | Op::Stos | Op::Lods | Op::Scas | Op::Cmps)
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        16
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let strop = self.strop(inst).ok_or(StrategyError::Unsupported)?;
        let test = self.test_counter();
        let conditional = matches!(inst.op, Op::Scas | Op::Cmps);

        let mut cand = Seq::new();
        if conditional {
            // top: test ; jz end ; strop ; lea ecx,[ecx-1] ; jcc top
            // REPE loops back on ZF set, REPNE on ZF clear; a bare REP on
            // SCAS/CMPS behaves as REPE.
            let back_cc: u8 = if inst.rep == RepPrefix::Repne { 0x75 } else { 0x74 };
            let mut dec = Seq::new();
            if self.arch == Arch::X64 {
                dec.push(rex(true, false, false, false));
            }
            dec.push(0x8d);
            dec.push(modrm(1, 1, 1));
            dec.push(0xff);

            let body = strop.len() + dec.len();
            let end_disp = (body + 2) as u8;
            let back_disp = -((test.len() + 2 + body + 2) as i8);
            cand.extend_from_slice(&test);
            cand.push(0x74);
            cand.push(end_disp);
            cand.extend_from_slice(&strop);
            cand.extend_from_slice(&dec);
            cand.push(back_cc);
            cand.push(back_disp as u8);
        } else {
            // top: test ; jz end ; strop ; dec ; jmp top
            let mut dec = Seq::new();
            if self.arch == Arch::X64 {
                dec.push(rex(true, false, false, false));
                dec.push(0xff);
                dec.push(modrm(3, 1, 1));
            } else {
                dec.push(0x49);
            }
            let body = strop.len() + dec.len();
            let end_disp = (body + 2) as u8;
            let back_disp = -((test.len() + 2 + body + 2) as i8);
            cand.extend_from_slice(&test);
            cand.push(0x74);
            cand.push(end_disp);
            cand.extend_from_slice(&strop);
            cand.extend_from_slice(&dec);
            cand.push(0xeb);
            cand.push(back_disp as u8);
        }
        finish(ctx, cand)
    }
}

// ---------------------------------------------------------------------------
// Whole-instruction substitutions.

struct Xlat {
    arch: Arch,
}

impl Strategy for Xlat {
    fn name(&self) -> &'static str {
        "xlat-expand"
    }
    fn arch(&self) -> Arch {
        self.arch
    }
    fn priority(&self) -> i32 {
        55
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        inst.op == Op::Xlat && unclean(inst, bad)
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        12
    }
    fn emit(&self, _: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let wide = self.arch == Arch::X64;
        let mut cand = Seq::new();
        // movzx eax, al ; add eax, ebx ; mov al, [eax]
        if wide {
            cand.push(rex(true, false, false, false));
        }
        cand.extend_from_slice(&[0x0f, 0xb6, 0xc0]);
        if wide {
            cand.push(rex(true, false, false, false));
        }
        cand.extend_from_slice(&[0x01, 0xd8]);
        if !ctx.bad.is_bad(0x00) {
            cand.extend_from_slice(&[0x8a, 0x00]);
        } else {
            // [EAX] through a SIB byte avoids the 0x00 ModR/M encoding.
            cand.extend_from_slice(&[0x8a, modrm(0, 0, 4), sib(0, 4, 0)]);
        }
        finish(ctx, cand)
    }
}

struct Lahf {
    arch: Arch,
}

impl Strategy for Lahf {
    fn name(&self) -> &'static str {
        "lahf-expand"
    }
    fn arch(&self) -> Arch {
        self.arch
    }
    fn priority(&self) -> i32 {
        54
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        inst.op == Op::Lahf && unclean(inst, bad)
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        4
    }
    fn emit(&self, _: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        // pushf ; pop eax ; mov ah, al
        finish(ctx, Seq::from_slice(&[0x9c, 0x58, 0x88, 0xc4]))
    }
}

struct Sahf {
    arch: Arch,
}

impl Strategy for Sahf {
    fn name(&self) -> &'static str {
        "sahf-expand"
    }
    fn arch(&self) -> Arch {
        self.arch
    }
    fn priority(&self) -> i32 {
        53
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        inst.op == Op::Sahf && unclean(inst, bad)
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        6
    }
    fn emit(&self, _: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        // pushf ; pop ebx ; mov bl, ah ; push ebx ; popf
        finish(ctx, Seq::from_slice(&[0x9c, 0x5b, 0x88, 0xe3, 0x53, 0x9d]))
    }
}

struct Enter {
    arch: Arch,
}

impl Strategy for Enter {
    fn name(&self) -> &'static str {
        "enter-expand"
    }
    fn arch(&self) -> Arch {
        self.arch
    }
    fn priority(&self) -> i32 {
        52
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        inst.op == Op::Enter && unclean(inst, bad)
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        18
    }
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let frame = inst.imm_op(0).unwrap_or(0) as u32 & 0xffff;
        let nesting = inst.imm_op(1).unwrap_or(0);
        if nesting != 0 {
            return Err(StrategyError::Unsupported);
        }
        let wide = self.arch == Arch::X64;
        let mut cand = Seq::new();
        // push ebp ; mov ebp, esp ; sub esp, frame
        cand.push(0x55);
        if wide {
            cand.push(rex(true, false, false, false));
        }
        cand.extend_from_slice(&[0x89, 0xe5]);
        if frame != 0 {
            let bits = if wide { 64 } else { 32 };
            if frame <= 0x7f && !ctx.bad.is_bad(frame as u8) {
                if wide {
                    cand.push(rex(true, false, false, false));
                }
                cand.extend_from_slice(&[0x83, 0xec, frame as u8]);
            } else if ctx.bad.integer_ok(u64::from(frame), 4) {
                alu_reg_imm32(&mut cand, self.arch, 5, 4, frame, bits);
            } else if let Some((a, b)) = find_add_split(ctx.bad, u64::from(frame), 4) {
                // Both halves stay within the 16-bit frame range plus
                // carry, so the sign extension is harmless.
                alu_reg_imm32(&mut cand, self.arch, 5, 4, a as u32, bits);
                alu_reg_imm32(&mut cand, self.arch, 5, 4, b as u32, bits);
            } else {
                return Err(StrategyError::Unencodable);
            }
        }
        finish(ctx, cand)
    }
}

struct Leave {
    arch: Arch,
}

impl Strategy for Leave {
    fn name(&self) -> &'static str {
        "leave-expand"
    }
    fn arch(&self) -> Arch {
        self.arch
    }
    fn priority(&self) -> i32 {
        51
    }
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool {
        inst.op == Op::Leave && unclean(inst, bad)
    }
    fn worst_size(&self, _: &DecodedInst) -> usize {
        5
    }
    fn emit(&self, _: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
        let mut cand = Seq::new();
        if self.arch == Arch::X64 {
            // mov rsp, rbp ; pop rbp
            cand.extend_from_slice(&[0x48, 0x89, 0xec, 0x5d]);
        } else {
            cand.extend_from_slice(&[0x89, 0xec, 0x5d]);
        }
        finish(ctx, cand)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{AddressMap, OutputBuffer};
    use crate::inst::FlowKind;
    use smallvec::{smallvec, SmallVec};

    fn mov_eax_0() -> DecodedInst {
        DecodedInst {
            address: 0x1000,
            bytes: smallvec![0xb8, 0x00, 0x00, 0x00, 0x00],
            op: Op::Mov,
            mnemonic: "mov".to_string(),
            operands: smallvec![
                crate::inst::Operand::Reg(Reg::new(0, 32)),
                crate::inst::Operand::Imm(0)
            ],
            flow: FlowKind::None,
            target: None,
            cc: None,
            rep: RepPrefix::None,
            elem_bits: 0,
        }
    }

    fn emit_with<S: Strategy>(s: &S, inst: &DecodedInst, bad: &BadByteSet) -> Option<Vec<u8>> {
        let mut buf = OutputBuffer::new();
        let map = AddressMap::default();
        let mut sites = Vec::new();
        let mut ctx = EmitCtx::new(&mut buf, bad, s.arch(), 0, 0, &map, 0, 0, &mut sites);
        match s.emit(inst, &mut ctx) {
            Ok(()) => Some(buf.into_vec()),
            Err(_) => None,
        }
    }

    #[test]
    fn zero_idiom_emits_xor() {
        let bad = BadByteSet::null_only();
        let strat = ZeroIdiom { arch: Arch::X86 };
        let inst = mov_eax_0();
        assert!(strat.is_applicable(&inst, &bad));
        assert_eq!(emit_with(&strat, &inst, &bad).unwrap(), vec![0x31, 0xc0]);
    }

    #[test]
    fn byte_chain_matches_reference_shape() {
        // mov bl, 3 with 0x03 forbidden
        let bad = BadByteSet::new(&[0x03]);
        let inst = DecodedInst {
            address: 0,
            bytes: smallvec![0xb3, 0x03],
            op: Op::Mov,
            mnemonic: "mov".to_string(),
            operands: smallvec![
                crate::inst::Operand::Reg(Reg::new(3, 8)),
                crate::inst::Operand::Imm(3)
            ],
            flow: FlowKind::None,
            target: None,
            cc: None,
            rep: RepPrefix::None,
            elem_bits: 0,
        };
        let strat = ByteRegChain { arch: Arch::X86 };
        assert!(strat.is_applicable(&inst, &bad));
        let out = emit_with(&strat, &inst, &bad).unwrap();
        assert_eq!(out, vec![0x31, 0xdb, 0x66, 0x43, 0x66, 0x43, 0x66, 0x43]);
        assert!(bad.bytes_ok(&out));
    }

    #[test]
    fn imm_not_round_trip() {
        // mov eax, 0x00123456: unclean under nulls, complement is clean.
        let bad = BadByteSet::null_only();
        let inst = DecodedInst {
            address: 0,
            bytes: smallvec![0xb8, 0x56, 0x34, 0x12, 0x00],
            op: Op::Mov,
            mnemonic: "mov".to_string(),
            operands: smallvec![
                crate::inst::Operand::Reg(Reg::new(0, 32)),
                crate::inst::Operand::Imm(0x0012_3456)
            ],
            flow: FlowKind::None,
            target: None,
            cc: None,
            rep: RepPrefix::None,
            elem_bits: 0,
        };
        let strat = ImmNot { arch: Arch::X86 };
        assert!(strat.is_applicable(&inst, &bad));
        let out = emit_with(&strat, &inst, &bad).unwrap();
        // mov eax, 0xffedcba9 ; not eax
        assert_eq!(out, vec![0xb8, 0xa9, 0xcb, 0xed, 0xff, 0xf7, 0xd0]);
        assert!(bad.bytes_ok(&out));

        // A value whose complement carries nulls is out of reach for this
        // transform.
        let mut worse = inst.clone();
        worse.operands[1] = crate::inst::Operand::Imm(0x00ff_ffff);
        worse.bytes = smallvec![0xb8, 0xff, 0xff, 0xff, 0x00];
        assert!(!strat.is_applicable(&worse, &bad));
    }

    #[test]
    fn string_rep_movsb_loop() {
        let bad = BadByteSet::null_only();
        let inst = DecodedInst {
            address: 0,
            bytes: smallvec![0xf3, 0xa4],
            op: Op::Movs,
            mnemonic: "rep movsb".to_string(),
            operands: smallvec![],
            flow: FlowKind::None,
            target: None,
            cc: None,
            rep: RepPrefix::Rep,
            elem_bits: 8,
        };
        let strat = StringRep { arch: Arch::X86 };
        assert!(strat.is_applicable(&inst, &bad));
        let out = emit_with(&strat, &inst, &bad).unwrap();
        assert_eq!(out, vec![0x85, 0xc9, 0x74, 0x04, 0xa4, 0x49, 0xeb, 0xf8]);
    }

    #[test]
    fn repe_scasb_loop() {
        let bad = BadByteSet::null_only();
        let inst = DecodedInst {
            address: 0,
            bytes: smallvec![0xf3, 0xae],
            op: Op::Scas,
            mnemonic: "repe scasb".to_string(),
            operands: smallvec![],
            flow: FlowKind::None,
            target: None,
            cc: None,
            rep: RepPrefix::Repe,
            elem_bits: 8,
        };
        let strat = StringRep { arch: Arch::X86 };
        let out = emit_with(&strat, &inst, &bad).unwrap();
        assert_eq!(
            out,
            vec![0x85, 0xc9, 0x74, 0x06, 0xae, 0x8d, 0x49, 0xff, 0x74, 0xf6]
        );
    }

    #[test]
    fn substitution_bytes() {
        let bad = BadByteSet::new(&[0x9f, 0x9e, 0xc9, 0xd7]);
        let mk = |op: Op, bytes: &[u8]| DecodedInst {
            address: 0,
            bytes: SmallVec::from_slice(bytes),
            op,
            mnemonic: String::new(),
            operands: smallvec![],
            flow: FlowKind::None,
            target: None,
            cc: None,
            rep: RepPrefix::None,
            elem_bits: 0,
        };
        let lahf = Lahf { arch: Arch::X86 };
        assert_eq!(
            emit_with(&lahf, &mk(Op::Lahf, &[0x9f]), &bad).unwrap(),
            vec![0x9c, 0x58, 0x88, 0xc4]
        );
        let sahf = Sahf { arch: Arch::X86 };
        assert_eq!(
            emit_with(&sahf, &mk(Op::Sahf, &[0x9e]), &bad).unwrap(),
            vec![0x9c, 0x5b, 0x88, 0xe3, 0x53, 0x9d]
        );
        let leave = Leave { arch: Arch::X86 };
        assert_eq!(
            emit_with(&leave, &mk(Op::Leave, &[0xc9]), &bad).unwrap(),
            vec![0x89, 0xec, 0x5d]
        );
        let xlat = Xlat { arch: Arch::X86 };
        assert_eq!(
            emit_with(&xlat, &mk(Op::Xlat, &[0xd7]), &bad).unwrap(),
            vec![0x0f, 0xb6, 0xc0, 0x01, 0xd8, 0x8a, 0x00]
        );
    }

    #[test]
    fn enter_rejects_nesting() {
        let bad = BadByteSet::null_only();
        let inst = DecodedInst {
            address: 0,
            bytes: smallvec![0xc8, 0x00, 0x10, 0x01],
            op: Op::Enter,
            mnemonic: "enter".to_string(),
            operands: smallvec![
                crate::inst::Operand::Imm(0x1000),
                crate::inst::Operand::Imm(1)
            ],
            flow: FlowKind::None,
            target: None,
            cc: None,
            rep: RepPrefix::None,
            elem_bits: 0,
        };
        let strat = Enter { arch: Arch::X86 };
        let mut buf = OutputBuffer::new();
        let map = AddressMap::default();
        let mut sites = Vec::new();
        let mut ctx = EmitCtx::new(&mut buf, &bad, Arch::X86, 0, 0, &map, 0, 0, &mut sites);
        assert_eq!(strat.emit(&inst, &mut ctx), Err(StrategyError::Unsupported));
    }
}
