//! x86 and x64 support: encoding builders, rewriting strategies, and the
//! branch widening ladder.

pub(crate) mod branches;
pub mod encoding;
pub(crate) mod strategies;
