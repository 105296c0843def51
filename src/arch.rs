//! Target architecture descriptors.

use core::fmt;
use core::str::FromStr;

/// The four instruction set architectures the engine rewrites.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Arch {
    /// 32-bit x86.
    X86,
    /// 64-bit x86.
    X64,
    /// 32-bit ARM, A32 encoding.
    Arm32,
    /// AArch64.
    Arm64,
}

impl Arch {
    /// Natural word size in bytes.
    pub fn word_bytes(self) -> u8 {
        match self {
            Self::X86 | Self::Arm32 => 4,
            Self::X64 | Self::Arm64 => 8,
        }
    }

    /// Pointer width in bits.
    pub fn pointer_bits(self) -> u8 {
        self.word_bytes() * 8
    }

    /// Minimum instruction alignment in bytes.
    pub fn insn_align(self) -> u8 {
        match self {
            Self::X86 | Self::X64 => 1,
            Self::Arm32 | Self::Arm64 => 4,
        }
    }

    /// True for the two variable-length x86 modes.
    pub fn is_x86_family(self) -> bool {
        matches!(self, Self::X86 | Self::X64)
    }

    /// True for the two fixed-width ARM modes.
    pub fn is_arm_family(self) -> bool {
        matches!(self, Self::Arm32 | Self::Arm64)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::X86 => "x86",
            Self::X64 => "x64",
            Self::Arm32 => "arm",
            Self::Arm64 => "arm64",
        })
    }
}

impl FromStr for Arch {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86" | "i386" => Ok(Self::X86),
            "x64" | "x86_64" | "amd64" => Ok(Self::X64),
            "arm" | "arm32" => Ok(Self::Arm32),
            "arm64" | "aarch64" => Ok(Self::Arm64),
            _ => Err(()),
        }
    }
}
