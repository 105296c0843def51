//! Error and result types for the rewriting engine.

use thiserror::Error;

/// A fatal error that aborts a rewrite job.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RewriteError {
    /// The disassembler could not advance past the given input offset.
    #[error("undecodable instruction at input offset {offset:#x}")]
    Decode {
        /// Byte offset into the input blob at which decoding stopped.
        offset: u64,
    },

    /// The relocation pass did not reach a stable layout within the
    /// configured iteration ceiling, or a hard resource ceiling was hit.
    #[error("displacements did not converge after {iterations} iterations")]
    RelocationUnconvergent {
        /// Number of emission passes that ran before giving up.
        iterations: u32,
    },

    /// Invalid job configuration, reported before disassembly begins.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The job was cancelled cooperatively at an instruction boundary.
    #[error("job cancelled")]
    Cancelled,
}

/// Result type used throughout the engine.
pub type RewriteResult<T> = Result<T, RewriteError>;

/// Why an instruction ended up in the residual list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResidualReason {
    /// No applicable strategy produced a compliant byte sequence; the
    /// original bytes were emitted verbatim.
    NoCleanEncoding,
    /// A strategy recognised the instruction but refused a subcase it
    /// cannot express (e.g. `ENTER` with a non-zero nesting level).
    UnsupportedInstruction,
}

impl core::fmt::Display for ResidualReason {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Self::NoCleanEncoding => f.write_str("no clean encoding"),
            Self::UnsupportedInstruction => f.write_str("unsupported instruction"),
        }
    }
}

/// A per-instruction failure entry of the final report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Residual {
    /// Address of the instruction in the original input.
    pub address: u64,
    /// Why the instruction could not be rewritten cleanly.
    pub reason: ResidualReason,
}

/// Failure signal returned by a strategy's `emit`.
///
/// Strategies do not abort the job; the driver reverts the partial append
/// and tries the next candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum StrategyError {
    /// The strategy found no compliant encoding for this instance.
    #[error("no compliant encoding")]
    Unencodable,
    /// The strategy does not handle this subcase at all.
    #[error("unsupported subcase")]
    Unsupported,
}
