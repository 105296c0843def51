//! The decoded-instruction data model.
//!
//! The disassembler adapter lowers every instruction to this architecture
//! independent shape. Instructions live in an indexed array owned by the job;
//! strategies borrow them read-only and never see the underlying
//! disassembler's types.

use smallvec::SmallVec;

/// A general-purpose register operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reg {
    /// Hardware encoding index (ModR/M index on x86, register number on ARM).
    pub index: u8,
    /// Operand width in bits.
    pub bits: u8,
    /// x86 only: true for the legacy high-byte registers AH/CH/DH/BH, which
    /// share encoding indices 4..=7 with SPL/BPL/SIL/DIL.
    pub high8: bool,
}

impl Reg {
    /// Construct a plain (non-high-byte) register.
    pub fn new(index: u8, bits: u8) -> Self {
        Self {
            index,
            bits,
            high8: false,
        }
    }
}

/// A memory operand: `[base + index*scale + disp]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemArg {
    /// Base register, if any.
    pub base: Option<Reg>,
    /// Index register, if any.
    pub index: Option<Reg>,
    /// Scale factor applied to the index register (1, 2, 4 or 8).
    pub scale: u8,
    /// Signed displacement.
    pub disp: i64,
    /// True when the base is the program counter (RIP on x64, PC on ARM).
    pub pc_relative: bool,
}

/// One operand of a decoded instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    /// Register operand.
    Reg(Reg),
    /// Immediate operand.
    Imm(i64),
    /// Memory operand.
    Mem(MemArg),
}

/// Control-flow classification of an instruction, for the relative forms the
/// relocation pass must track.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowKind {
    /// Not a PC-relative transfer.
    None,
    /// A PC-relative jump.
    Jump {
        /// True for conditional forms.
        cond: bool,
    },
    /// A PC-relative call.
    Call,
}

/// String-operation repeat prefix (x86).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepPrefix {
    /// No repeat prefix.
    None,
    /// `REP` (`F3` on MOVS/STOS/LODS).
    Rep,
    /// `REPE`/`REPZ`.
    Repe,
    /// `REPNE`/`REPNZ`.
    Repne,
}

/// Normalized operation kind.
///
/// This is a closed vocabulary covering exactly the instructions the
/// strategies inspect; everything else decodes to [`Op::Other`] and is only
/// ever emitted verbatim or wrapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Op {
    // x86
    Mov,
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cmp,
    Test,
    Lea,
    Push,
    Pop,
    Inc,
    Dec,
    Neg,
    Not,
    Shl,
    Xlat,
    Lahf,
    Sahf,
    Enter,
    Leave,
    Jmp,
    Jcc,
    Call,
    Jecxz,
    Loop,
    Loope,
    Loopne,
    Ret,
    Movs,
    Stos,
    Lods,
    Scas,
    Cmps,
    // ARM (both widths)
    B,
    Bl,
    Bx,
    Mvn,
    Rsb,
    Bic,
    Orr,
    Eor,
    Cmn,
    Ldr,
    Str,
    Movw,
    Movt,
    // AArch64
    Movz,
    Movn,
    Movk,
    Cbz,
    Cbnz,
    Tbz,
    Tbnz,
    Other,
}

/// One instruction decoded from the input blob.
#[derive(Clone, Debug)]
pub struct DecodedInst {
    /// Address of the instruction in the original input (`base + offset`).
    pub address: u64,
    /// Raw encoded bytes.
    pub bytes: SmallVec<[u8; 16]>,
    /// Normalized operation kind.
    pub op: Op,
    /// Mnemonic as printed by the disassembler.
    pub mnemonic: String,
    /// Decoded operands in disassembly order.
    pub operands: SmallVec<[Operand; 4]>,
    /// Control-flow classification.
    pub flow: FlowKind,
    /// Absolute target address of a PC-relative transfer.
    pub target: Option<u64>,
    /// Condition code: x86 `cc` nibble for Jcc, ARM condition field
    /// otherwise. `None` when the instruction is unconditional or the code
    /// is not recoverable from the encoding.
    pub cc: Option<u8>,
    /// Repeat prefix for x86 string operations.
    pub rep: RepPrefix,
    /// Element width in bits for x86 string operations (8, 16 or 32), else 0.
    pub elem_bits: u8,
}

impl DecodedInst {
    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// The instruction as a little-endian 32-bit word (fixed-width ISAs).
    pub fn word(&self) -> u32 {
        debug_assert!(self.bytes.len() >= 4);
        u32::from_le_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]])
    }

    /// True for PC-relative jumps and calls.
    pub fn is_relative_flow(&self) -> bool {
        !matches!(self.flow, FlowKind::None)
    }

    /// Register operand `n`, if operand `n` exists and is a register.
    pub fn reg_op(&self, n: usize) -> Option<Reg> {
        match self.operands.get(n) {
            Some(Operand::Reg(r)) => Some(*r),
            _ => None,
        }
    }

    /// Immediate operand `n`, if operand `n` exists and is an immediate.
    pub fn imm_op(&self, n: usize) -> Option<i64> {
        match self.operands.get(n) {
            Some(Operand::Imm(v)) => Some(*v),
            _ => None,
        }
    }

    /// Memory operand `n`, if operand `n` exists and is a memory reference.
    pub fn mem_op(&self, n: usize) -> Option<&MemArg> {
        match self.operands.get(n) {
            Some(Operand::Mem(m)) => Some(m),
            _ => None,
        }
    }
}
