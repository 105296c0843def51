//! Strategy contract, registry, and selection support.
//!
//! A strategy is one way of re-expressing an instruction. Each declares the
//! architecture it serves, a priority, an applicability predicate, a size
//! bound for provisional layout, and an emitter. The driver filters the
//! registry per instruction, orders candidates by descending priority
//! (registration order breaks ties), and verifies every emission against the
//! bad-byte oracle, reverting and moving on when a strategy fails.

use crate::arch::Arch;
use crate::badbytes::BadByteSet;
use crate::buffer::{AddressMap, CodeOffset, OutputBuffer, RelocSite, SiteKind};
use crate::error::StrategyError;
use crate::inst::DecodedInst;

/// Everything an `emit` implementation may touch.
pub struct EmitCtx<'a> {
    /// The output buffer; strategies only append.
    pub buf: &'a mut OutputBuffer,
    /// The job's bad-byte oracle.
    pub bad: &'a BadByteSet,
    /// The job's target architecture.
    pub arch: Arch,
    /// Base address the input is assumed to be loaded at.
    pub base: u64,
    /// Length of the original input blob in bytes.
    pub input_len: u64,
    /// Old-address to new-offset map from the previous relocation iteration.
    pub map: &'a AddressMap,
    /// Index of the instruction being emitted.
    pub inst_index: usize,
    /// Per-instruction decoration seed for sampled strategies; zero in the
    /// cleanliness pass.
    pub seed: u64,
    sites: &'a mut Vec<RelocSite>,
}

impl<'a> EmitCtx<'a> {
    /// Build a context for one instruction emission.
    pub(crate) fn new(
        buf: &'a mut OutputBuffer,
        bad: &'a BadByteSet,
        arch: Arch,
        base: u64,
        input_len: u64,
        map: &'a AddressMap,
        inst_index: usize,
        seed: u64,
        sites: &'a mut Vec<RelocSite>,
    ) -> Self {
        Self {
            buf,
            bad,
            arch,
            base,
            input_len,
            map,
            inst_index,
            seed,
            sites,
        }
    }

    /// Current output offset.
    pub fn offset(&self) -> CodeOffset {
        self.buf.cur_offset()
    }

    /// Record a displacement field that the relocation pass must resolve.
    pub fn record_site(&mut self, kind: SiteKind, offset: CodeOffset, target: u64) {
        self.sites.push(RelocSite {
            inst_index: self.inst_index,
            offset,
            kind,
            target,
        });
    }

    /// Number of recorded sites; used by the driver to revert a failed
    /// emission.
    pub(crate) fn sites_len(&self) -> usize {
        self.sites.len()
    }

    /// Drop sites recorded after `mark`.
    pub(crate) fn truncate_sites(&mut self, mark: usize) {
        self.sites.truncate(mark);
    }

    /// Where `old` (an original address) now lives, as an absolute address.
    ///
    /// Addresses outside the instruction map (targets in data or outside
    /// the blob) are assumed not to move.
    pub fn target_new_abs(&self, old: u64) -> u64 {
        match self.map.lookup(old) {
            Some(off) => self.base + u64::from(off),
            None => old,
        }
    }
}

/// One rewriting (or obfuscation) strategy.
pub trait Strategy {
    /// Human-readable name, used in records and logs.
    fn name(&self) -> &'static str;

    /// Architecture this instance serves.
    fn arch(&self) -> Arch;

    /// Selection priority; higher is preferred.
    fn priority(&self) -> i32;

    /// Sampling rate for the obfuscation pass. Rewriting strategies keep
    /// the default of 1.0 and are never sampled.
    fn rate(&self) -> f64 {
        1.0
    }

    /// May this strategy rewrite `inst`? Pure; may consult the oracle and
    /// any part of the instruction.
    fn is_applicable(&self, inst: &DecodedInst, bad: &BadByteSet) -> bool;

    /// Upper bound on the number of bytes `emit` will append.
    fn worst_size(&self, inst: &DecodedInst) -> usize;

    /// Append the replacement bytes, possibly recording relocation sites.
    fn emit(&self, inst: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError>;
}

/// Ordered collection of registered strategies.
#[derive(Default)]
pub struct StrategyRegistry {
    entries: Vec<Box<dyn Strategy>>,
}

impl StrategyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a strategy. Registration order is the tiebreaker among equal
    /// priorities.
    pub fn register(&mut self, strategy: Box<dyn Strategy>) {
        self.entries.push(strategy);
    }

    /// Number of registered strategies.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Strategy at `index`.
    pub fn get(&self, index: usize) -> &dyn Strategy {
        &*self.entries[index]
    }

    /// Indices of the applicable strategies for `inst`, highest priority
    /// first; ties keep registration order (the sort is stable).
    pub fn candidates(&self, arch: Arch, inst: &DecodedInst, bad: &BadByteSet) -> Vec<usize> {
        let mut out: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, s)| s.arch() == arch && s.is_applicable(inst, bad))
            .map(|(i, _)| i)
            .collect();
        out.sort_by_key(|&i| core::cmp::Reverse(self.entries[i].priority()));
        out
    }
}

/// External selection advisor.
///
/// A host may reorder the candidate list before the driver walks it, e.g.
/// from a learned scoring model. The engine is fully deterministic under
/// [`NullAdvisor`].
pub trait Advisor {
    /// Return a permutation of `0..candidates.len()`, or `None` to keep the
    /// registry order. Invalid permutations are ignored.
    fn advise(&self, inst: &DecodedInst, candidates: &[&dyn Strategy]) -> Option<Vec<usize>>;
}

/// The default advisor: keeps registry order.
pub struct NullAdvisor;

impl Advisor for NullAdvisor {
    fn advise(&self, _inst: &DecodedInst, _candidates: &[&dyn Strategy]) -> Option<Vec<usize>> {
        None
    }
}

/// Apply an advisor's permutation to a candidate index list, validating it.
pub(crate) fn apply_advice(order: &mut Vec<usize>, advice: Option<Vec<usize>>) {
    if let Some(perm) = advice {
        if perm.len() == order.len() {
            let mut seen = vec![false; perm.len()];
            let valid = perm.iter().all(|&i| {
                if i < seen.len() && !seen[i] {
                    seen[i] = true;
                    true
                } else {
                    false
                }
            });
            if valid {
                let reordered: Vec<usize> = perm.iter().map(|&i| order[i]).collect();
                *order = reordered;
                return;
            }
            log::warn!("advisor returned an invalid permutation; ignoring");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::{FlowKind, Op, RepPrefix};
    use smallvec::smallvec;

    struct Fixed {
        name: &'static str,
        prio: i32,
    }

    impl Strategy for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }
        fn arch(&self) -> Arch {
            Arch::X86
        }
        fn priority(&self) -> i32 {
            self.prio
        }
        fn is_applicable(&self, _: &DecodedInst, _: &BadByteSet) -> bool {
            true
        }
        fn worst_size(&self, _: &DecodedInst) -> usize {
            1
        }
        fn emit(&self, _: &DecodedInst, ctx: &mut EmitCtx) -> Result<(), StrategyError> {
            ctx.buf.put1(0x90);
            Ok(())
        }
    }

    fn nop_inst() -> DecodedInst {
        DecodedInst {
            address: 0,
            bytes: smallvec![0x90],
            op: Op::Other,
            mnemonic: "nop".to_string(),
            operands: smallvec![],
            flow: FlowKind::None,
            target: None,
            cc: None,
            rep: RepPrefix::None,
            elem_bits: 0,
        }
    }

    #[test]
    fn ordering_is_priority_then_registration() {
        let mut reg = StrategyRegistry::new();
        reg.register(Box::new(Fixed {
            name: "lo",
            prio: 1,
        }));
        reg.register(Box::new(Fixed {
            name: "hi",
            prio: 9,
        }));
        reg.register(Box::new(Fixed {
            name: "hi2",
            prio: 9,
        }));
        let inst = nop_inst();
        let order = reg.candidates(Arch::X86, &inst, &BadByteSet::null_only());
        let names: Vec<&str> = order.iter().map(|&i| reg.get(i).name()).collect();
        assert_eq!(names, vec!["hi", "hi2", "lo"]);
    }

    #[test]
    fn arch_filter() {
        let mut reg = StrategyRegistry::new();
        reg.register(Box::new(Fixed {
            name: "x",
            prio: 0,
        }));
        let inst = nop_inst();
        assert!(reg
            .candidates(Arch::Arm32, &inst, &BadByteSet::null_only())
            .is_empty());
    }

    #[test]
    fn advice_validation() {
        let mut order = vec![10, 11, 12];
        apply_advice(&mut order, Some(vec![2, 0, 1]));
        assert_eq!(order, vec![12, 10, 11]);

        let mut order = vec![10, 11];
        apply_advice(&mut order, Some(vec![0, 0]));
        assert_eq!(order, vec![10, 11]);

        let mut order = vec![10, 11];
        apply_advice(&mut order, None);
        assert_eq!(order, vec![10, 11]);
    }
}
