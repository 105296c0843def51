//! Job configuration and the emission driver.
//!
//! A [`Rewriter`] holds the per-run configuration and the strategy
//! registries. `rewrite` runs the pipeline: optional obfuscation pass
//! (sampled once per job from the job PRNG), then the cleanliness pass,
//! each of which disassembles its input and emits to convergence through
//! the relocation loop in [`crate::reloc`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::arch::Arch;
use crate::badbytes::BadByteSet;
use crate::buffer::{AddressMap, OutputBuffer, RewriteRecord, SiteKind};
use crate::decode;
use crate::error::{Residual, ResidualReason, RewriteError, RewriteResult, StrategyError};
use crate::inst::{DecodedInst, Operand};
use crate::isa;
use crate::obfuscate;
use crate::reloc::{self, Pass};
use crate::strategy::{apply_advice, Advisor, EmitCtx, NullAdvisor, Strategy, StrategyRegistry};

/// Final product of a rewrite job.
#[derive(Debug)]
pub struct RewriteOutput {
    /// The rewritten blob.
    pub bytes: Vec<u8>,
    /// Instructions for which no clean encoding was found, in address
    /// order.
    pub residuals: Vec<Residual>,
    /// One record per processed instruction.
    pub records: Vec<RewriteRecord>,
}

/// An obfuscation decision made once per job for one instruction.
#[derive(Clone, Copy)]
struct ObfPick {
    strategy: usize,
    seed: u64,
}

/// Configured rewriting engine.
///
/// Construction registers the default strategy sets; hosts may add their
/// own with [`Rewriter::register_strategy`] before the first job.
pub struct Rewriter {
    arch: Arch,
    bad: BadByteSet,
    base: u64,
    obfuscate: bool,
    iteration_ceiling: u32,
    instruction_ceiling: usize,
    cancel: Option<Arc<AtomicBool>>,
    seed: u64,
    registry: StrategyRegistry,
    obf_registry: StrategyRegistry,
    advisor: Box<dyn Advisor>,
}

impl Rewriter {
    /// Engine with the default strategy sets for `arch`.
    pub fn new(arch: Arch, bad: BadByteSet) -> Self {
        let mut registry = StrategyRegistry::new();
        isa::register_default(&mut registry, arch);
        let mut obf_registry = StrategyRegistry::new();
        obfuscate::register(&mut obf_registry, arch);
        Self::with_registries(arch, bad, registry, obf_registry)
    }

    /// Engine with no registered strategies; branches still pass through
    /// the widening ladder, everything else is emitted verbatim.
    pub fn bare(arch: Arch, bad: BadByteSet) -> Self {
        Self::with_registries(arch, bad, StrategyRegistry::new(), StrategyRegistry::new())
    }

    fn with_registries(
        arch: Arch,
        bad: BadByteSet,
        registry: StrategyRegistry,
        obf_registry: StrategyRegistry,
    ) -> Self {
        Self {
            arch,
            bad,
            base: 0,
            obfuscate: false,
            iteration_ceiling: 8,
            instruction_ceiling: 1 << 20,
            cancel: None,
            seed: 0x62_76_6c_76,
            registry,
            obf_registry,
            advisor: Box::new(NullAdvisor),
        }
    }

    /// Base address the blob is assumed to be loaded at (default 0).
    pub fn base_address(mut self, base: u64) -> Self {
        self.base = base;
        self
    }

    /// Enable the pre-rewrite obfuscation pass (default off).
    pub fn enable_obfuscation(mut self, on: bool) -> Self {
        self.obfuscate = on;
        self
    }

    /// Maximum relocation passes per job (default 8; must be at least 1).
    pub fn iteration_ceiling(mut self, ceiling: u32) -> Self {
        self.iteration_ceiling = ceiling;
        self
    }

    /// Hard cap on the number of decoded instructions.
    pub fn instruction_ceiling(mut self, ceiling: usize) -> Self {
        self.instruction_ceiling = ceiling;
        self
    }

    /// Cooperative cancellation flag, checked at instruction boundaries.
    pub fn cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Seed for the job PRNG driving obfuscation sampling.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Install a selection advisor (default: registry order).
    pub fn advisor(mut self, advisor: Box<dyn Advisor>) -> Self {
        self.advisor = advisor;
        self
    }

    /// Register an additional rewriting strategy.
    pub fn register_strategy(&mut self, strategy: Box<dyn Strategy>) {
        self.registry.register(strategy);
    }

    /// Register an additional obfuscation strategy.
    pub fn register_obfuscation(&mut self, strategy: Box<dyn Strategy>) {
        self.obf_registry.register(strategy);
    }

    /// Rewrite `input` into a blob free of the configured bad bytes.
    pub fn rewrite(&self, input: &[u8]) -> RewriteResult<RewriteOutput> {
        if self.iteration_ceiling < 1 {
            return Err(RewriteError::Config(
                "iteration ceiling must be at least 1".to_string(),
            ));
        }
        if self.bad.is_empty() {
            // Nothing is forbidden: identity pass-through.
            return Ok(RewriteOutput {
                bytes: input.to_vec(),
                residuals: Vec::new(),
                records: Vec::new(),
            });
        }

        let staged;
        let input = if self.obfuscate {
            let mut rng = SmallRng::seed_from_u64(self.seed);
            let out = self.run_pass(input, &self.obf_registry, Some(&mut rng))?;
            staged = out.bytes;
            &staged[..]
        } else {
            input
        };

        self.run_pass(input, &self.registry, None)
    }

    fn check_cancel(&self) -> RewriteResult<()> {
        if let Some(flag) = &self.cancel {
            if flag.load(Ordering::Relaxed) {
                return Err(RewriteError::Cancelled);
            }
        }
        Ok(())
    }

    fn run_pass(
        &self,
        input: &[u8],
        registry: &StrategyRegistry,
        obf_rng: Option<&mut SmallRng>,
    ) -> RewriteResult<RewriteOutput> {
        let insts = decode::disassemble(input, self.base, self.arch)?;
        if insts.len() > self.instruction_ceiling {
            return Err(RewriteError::RelocationUnconvergent { iterations: 0 });
        }
        let picks = obf_rng.map(|rng| self.sample_obfuscation(&insts, registry, rng));

        let pass = reloc::converge(&insts, self.base, self.iteration_ceiling, |map, widen| {
            self.emit_pass(&insts, widen, map, registry, picks.as_deref(), input.len())
        })?;

        debug_assert_eq!(pass.records.len(), insts.len());
        Ok(RewriteOutput {
            bytes: pass.buf.into_vec(),
            residuals: pass.residuals,
            records: pass.records,
        })
    }

    /// Sample the obfuscation decision for every instruction, once per job.
    fn sample_obfuscation(
        &self,
        insts: &[DecodedInst],
        registry: &StrategyRegistry,
        rng: &mut SmallRng,
    ) -> Vec<Option<ObfPick>> {
        insts
            .iter()
            .map(|inst| {
                for idx in registry.candidates(self.arch, inst, &self.bad) {
                    if rng.random::<f64>() < registry.get(idx).rate() {
                        return Some(ObfPick {
                            strategy: idx,
                            seed: rng.random::<u64>(),
                        });
                    }
                }
                None
            })
            .collect()
    }

    fn emit_pass(
        &self,
        insts: &[DecodedInst],
        widen: &mut [u8],
        map: &AddressMap,
        registry: &StrategyRegistry,
        picks: Option<&[Option<ObfPick>]>,
        input_len: usize,
    ) -> RewriteResult<Pass> {
        let mut buf = OutputBuffer::with_capacity(input_len * 2);
        let mut records = Vec::with_capacity(insts.len());
        let mut sites = Vec::new();
        let mut residuals = Vec::new();
        let mut grew = false;

        for (i, inst) in insts.iter().enumerate() {
            self.check_cancel()?;
            let start = buf.cur_offset();
            let seed = picks
                .and_then(|p| p[i].as_ref().map(|pk| pk.seed))
                .unwrap_or(0);
            let mut ctx = EmitCtx::new(
                &mut buf,
                &self.bad,
                self.arch,
                self.base,
                input_len as u64,
                map,
                i,
                seed,
                &mut sites,
            );

            // Candidate order: the sampled pick in the obfuscation pass,
            // the advisor-permuted registry filter otherwise.
            let order: Vec<usize> = match picks {
                Some(p) => p[i].as_ref().map(|pk| vec![pk.strategy]).unwrap_or_default(),
                None => {
                    let mut order = registry.candidates(self.arch, inst, &self.bad);
                    if order.len() > 1 {
                        let refs: Vec<&dyn Strategy> =
                            order.iter().map(|&x| registry.get(x)).collect();
                        apply_advice(&mut order, self.advisor.advise(inst, &refs));
                    }
                    order
                }
            };

            let mut chosen: Option<&'static str> = None;
            let mut unsupported = false;
            for idx in order {
                let strategy = registry.get(idx);
                let mark = ctx.buf.cur_offset();
                let smark = ctx.sites_len();
                let result = strategy.emit(inst, &mut ctx);
                let appended_ok = result.is_ok() && {
                    let appended = ctx.buf.slice_from(mark);
                    !appended.is_empty() && self.bad.bytes_ok(appended)
                };
                if appended_ok {
                    debug_assert!(
                        ctx.buf.slice_from(mark).len() <= strategy.worst_size(inst),
                        "{} overran its size bound",
                        strategy.name()
                    );
                    chosen = Some(strategy.name());
                    break;
                }
                if result == Err(StrategyError::Unsupported) {
                    unsupported = true;
                }
                ctx.buf.truncate(mark);
                ctx.truncate_sites(smark);
                log::trace!(
                    "strategy {} failed for {:#x} {}",
                    strategy.name(),
                    inst.address,
                    inst.mnemonic
                );
            }

            let name = match chosen {
                Some(name) => name,
                None if inst.is_relative_flow() => {
                    let outcome = isa::emit_branch(inst, &mut widen[i], &mut ctx);
                    grew |= outcome.grew;
                    if !outcome.clean {
                        residuals.push(Residual {
                            address: inst.address,
                            reason: ResidualReason::NoCleanEncoding,
                        });
                    }
                    outcome.name
                }
                None => {
                    ctx.buf.put_bytes(&inst.bytes);
                    let mut name = "identity";
                    if self.arch == Arch::X64 {
                        if let Some(clean) = patch_rip_relative(inst, start, map, &mut ctx) {
                            name = "rip-repoint";
                            if !clean {
                                residuals.push(Residual {
                                    address: inst.address,
                                    reason: ResidualReason::NoCleanEncoding,
                                });
                            }
                        }
                    }
                    if name == "identity" && !self.bad.bytes_ok(&inst.bytes) {
                        residuals.push(Residual {
                            address: inst.address,
                            reason: if unsupported {
                                ResidualReason::UnsupportedInstruction
                            } else {
                                ResidualReason::NoCleanEncoding
                            },
                        });
                    }
                    name
                }
            };

            records.push(RewriteRecord {
                old_address: inst.address,
                old_size: inst.size() as u32,
                new_offset: start,
                new_size: buf.cur_offset() - start,
                strategy: name,
            });
        }

        Ok(Pass {
            buf,
            records,
            sites,
            residuals,
            grew,
        })
    }
}

/// Re-point an identity-emitted RIP-relative displacement at its target's
/// new location. Returns `None` for instructions without a RIP-relative
/// memory operand, otherwise whether the patched bytes are clean.
fn patch_rip_relative(
    inst: &DecodedInst,
    start: u32,
    map: &AddressMap,
    ctx: &mut EmitCtx,
) -> Option<bool> {
    let mem = inst.operands.iter().find_map(|op| match op {
        Operand::Mem(m) if m.pc_relative => Some(m),
        _ => None,
    })?;
    let len = inst.size() as u64;
    let old_target = inst
        .address
        .wrapping_add(len)
        .wrapping_add(mem.disp as u64);
    let new_target = match map.lookup(old_target) {
        Some(off) => ctx.base + u64::from(off),
        None => old_target,
    };

    // Locate the original displacement bytes inside the copied encoding.
    if inst.bytes.len() < 5 {
        return None;
    }
    let old_disp = (mem.disp as i32).to_le_bytes();
    let bytes = inst.bytes.clone();
    let pos = (0..=bytes.len() - 4)
        .rev()
        .find(|&p| bytes[p..p + 4] == old_disp)?;
    let tail = (bytes.len() - pos - 4) as u8;

    let new_disp = new_target.wrapping_sub(ctx.base + u64::from(start) + len) as i64;
    let new_disp = match i32::try_from(new_disp) {
        Ok(d) => d,
        Err(_) => return Some(false),
    };
    ctx.buf
        .patch(start + pos as u32, &new_disp.to_le_bytes());
    ctx.record_site(
        SiteKind::X86RipDisp32 { tail },
        start + pos as u32,
        old_target,
    );
    let clean = ctx
        .bad
        .bytes_ok(ctx.buf.slice_from(start));
    Some(clean)
}
