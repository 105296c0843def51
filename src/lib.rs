//! Byvalver: a multi-architecture machine-code rewriting engine.
//!
//! The engine takes a flat binary blob, disassembles it for one of four
//! target architectures (x86, x64, ARM32, AArch64), and re-emits a
//! semantically equivalent blob whose encoding contains none of a
//! caller-supplied set of forbidden byte values. It is used when a payload
//! must survive a transport that strips or terminates on particular bytes;
//! the classic case is null-free shellcode.
//!
//! The pipeline has six stages: the bad-byte oracle, the architecture
//! descriptor, the disassembler adapter, the strategy registry, the
//! selection-and-emission driver, and the control-flow relocation pass that
//! re-resolves every displacement across the size-changed output.
//!
//! ```no_run
//! use byvalver::{Arch, BadByteSet, Rewriter};
//!
//! // mov eax, 0 encodes with four nulls; the engine swaps in xor eax, eax.
//! let rewriter = Rewriter::new(Arch::X86, BadByteSet::null_only());
//! let out = rewriter.rewrite(&[0xb8, 0x00, 0x00, 0x00, 0x00])?;
//! assert!(out.bytes.iter().all(|&b| b != 0));
//! assert!(out.residuals.is_empty());
//! # Ok::<(), byvalver::RewriteError>(())
//! ```
//!
//! Instructions that no strategy can express cleanly are emitted verbatim
//! and reported in [`RewriteOutput::residuals`]; only undecodable input and
//! an unconvergent relocation abort a job.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub mod arch;
pub mod badbytes;
pub mod buffer;
pub mod decode;
pub mod engine;
pub mod error;
pub mod inst;
pub mod isa;
pub mod strategy;

mod obfuscate;
mod reloc;

pub use crate::arch::Arch;
pub use crate::badbytes::BadByteSet;
pub use crate::buffer::{AddressMap, CodeOffset, OutputBuffer, RelocSite, RewriteRecord, SiteKind};
pub use crate::engine::{RewriteOutput, Rewriter};
pub use crate::error::{Residual, ResidualReason, RewriteError, RewriteResult, StrategyError};
pub use crate::inst::{DecodedInst, FlowKind, MemArg, Op, Operand, Reg, RepPrefix};
pub use crate::strategy::{Advisor, EmitCtx, NullAdvisor, Strategy, StrategyRegistry};
