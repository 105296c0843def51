//! Control-flow relocation: offset convergence and final verification.
//!
//! Rewriting changes instruction sizes, so every displacement in the output
//! depends on where the other instructions landed. The engine re-runs the
//! emission pass against the previous iteration's address map until the map
//! stops moving and no branch widened; per-instruction widening levels only
//! grow, which bounds the iteration count together with the configured
//! ceiling. The final pass therefore computed every displacement from the
//! exact layout it produced, and `verify` re-decodes each recorded site to
//! prove it.

use log::debug;

use crate::buffer::{AddressMap, OutputBuffer, RelocSite, RewriteRecord, SiteKind};
use crate::error::{Residual, RewriteError, RewriteResult};
use crate::inst::DecodedInst;

/// Output of one emission pass.
pub(crate) struct Pass {
    pub buf: OutputBuffer,
    pub records: Vec<RewriteRecord>,
    pub sites: Vec<RelocSite>,
    pub residuals: Vec<Residual>,
    /// Whether any branch bumped its widening level during this pass.
    pub grew: bool,
}

/// Run `emit` until the layout stabilises, then verify every relocation
/// site against the final map.
pub(crate) fn converge<F>(
    insts: &[DecodedInst],
    base: u64,
    iteration_ceiling: u32,
    mut emit: F,
) -> RewriteResult<Pass>
where
    F: FnMut(&AddressMap, &mut [u8]) -> RewriteResult<Pass>,
{
    let mut widen = vec![0u8; insts.len()];
    let mut map = AddressMap::identity(insts, base);

    for iteration in 1..=iteration_ceiling {
        let pass = emit(&map, &mut widen)?;
        let new_map = AddressMap::from_records(&pass.records);
        let stable = !pass.grew && new_map == map;
        debug!(
            "relocation iteration {}: {} bytes, grew={}, stable={}",
            iteration,
            pass.buf.len(),
            pass.grew,
            stable
        );
        map = new_map;
        if stable {
            verify(&pass.buf, &pass.sites, &map, base)?;
            return Ok(pass);
        }
    }

    Err(RewriteError::RelocationUnconvergent {
        iterations: iteration_ceiling,
    })
}

fn sext(v: u32, bits: u32) -> i64 {
    (((v << (32 - bits)) as i32) >> (32 - bits)) as i64
}

fn word_at(buf: &OutputBuffer, offset: u32) -> u32 {
    let b = buf.as_slice();
    let i = offset as usize;
    u32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]])
}

/// Re-decode every site's displacement and check that it resolves to the
/// new location of its recorded target.
pub(crate) fn verify(
    buf: &OutputBuffer,
    sites: &[RelocSite],
    map: &AddressMap,
    base: u64,
) -> RewriteResult<()> {
    for site in sites {
        let expected = match map.lookup(site.target) {
            Some(off) => base + u64::from(off),
            None => site.target,
        };
        let got = match site.kind {
            SiteKind::X86Rel8 => {
                let disp = buf.as_slice()[site.offset as usize] as i8;
                let pc = base + u64::from(site.offset) + 1;
                pc.wrapping_add(disp as i64 as u64)
            }
            SiteKind::X86Rel32 => {
                let b = buf.as_slice();
                let i = site.offset as usize;
                let disp = i32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
                let pc = base + u64::from(site.offset) + 4;
                pc.wrapping_add(disp as i64 as u64)
            }
            SiteKind::X86RipDisp32 { tail } => {
                let b = buf.as_slice();
                let i = site.offset as usize;
                let disp = i32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
                let pc = base + u64::from(site.offset) + 4 + u64::from(tail);
                pc.wrapping_add(disp as i64 as u64)
            }
            SiteKind::A32Branch24 => {
                let word = word_at(buf, site.offset);
                let off = sext(word & 0x00ff_ffff, 24) * 4;
                (base + u64::from(site.offset) + 8).wrapping_add(off as u64)
            }
            SiteKind::A64Branch26 => {
                let word = word_at(buf, site.offset);
                let off = sext(word & 0x03ff_ffff, 26) * 4;
                (base + u64::from(site.offset)).wrapping_add(off as u64)
            }
            SiteKind::A64Branch19 => {
                let word = word_at(buf, site.offset);
                let off = sext((word >> 5) & 0x7_ffff, 19) * 4;
                (base + u64::from(site.offset)).wrapping_add(off as u64)
            }
            SiteKind::A64Branch14 => {
                let word = word_at(buf, site.offset);
                let off = sext((word >> 5) & 0x3fff, 14) * 4;
                (base + u64::from(site.offset)).wrapping_add(off as u64)
            }
        };
        if got != expected {
            log::error!(
                "relocation mismatch at output offset {:#x}: encodes {:#x}, expected {:#x}",
                site.offset,
                got,
                expected
            );
            return Err(RewriteError::RelocationUnconvergent { iterations: 0 });
        }
    }
    Ok(())
}
