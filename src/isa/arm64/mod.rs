//! AArch64 support: word composers, rewriting strategies, and the branch
//! rewriting ladder.

pub(crate) mod branches;
pub mod encoding;
pub(crate) mod strategies;
