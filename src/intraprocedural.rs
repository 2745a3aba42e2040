//! Analysis of a single function: block discovery, terminator classification, clobbered-register
//! collection, and (in ABI mode) argument/return-value slot recovery.
//!
//! The analysis is a worklist traversal of all blocks reachable from the entry without crossing a
//! call edge into a different function, followed by a backward liveness pass over the claimed
//! subgraph. It always terminates (bounded by block count) and never fails: whatever cannot be
//! resolved degrades to the lattice top.

use std::collections::VecDeque;

use crate::address::MetaAddress;
use crate::cache::Cache;
use crate::config::CONFIG;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::log::*;
use crate::program::{BasicBlock, BlockKind, IndirectKind, Program, Terminator};
use crate::register_usage::{RegisterSlot, UsageLattice};
use crate::summary::{BranchType, CallSite, IntraproceduralFunctionSummary};

/// What the intraprocedural analysis hands back to the driver.
///
/// The analysis itself has no side effects; storing the summary, recording dependencies and
/// marking fake functions are the driver's decisions.
#[derive(Debug)]
pub struct IntraAnalysisOutcome {
    pub summary: IntraproceduralFunctionSummary,
    /// Direct callees with lifted blocks whose summary (cached, or the conservative stand-in for
    /// the ones not analyzed yet) was folded into this summary; the driver records dependencies
    /// on all of them and schedules the not-yet-analyzed ones
    pub discovered_callees: Vec<MetaAddress>,
    /// Callees reached through synthetic call markers; the driver marks them fake in the cache
    pub fake_callees: Vec<MetaAddress>,
}

/// How a call site's callee was resolved at fold time.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum CallResolution {
    /// Direct callee with a cached summary
    Resolved,
    /// Direct callee with lifted blocks but no summary yet
    Unresolved,
    /// Direct callee with no lifted block at the target address
    Missing,
    /// Call through a register or memory
    Indirect,
    /// Call (synthetic or otherwise) into a fake function; the body is traversed inline
    Fake,
}

struct DiscoveredCall {
    block: MetaAddress,
    callee: Option<MetaAddress>,
    resolution: CallResolution,
}

/// Analyze the function entered at `entry`.
///
/// `cache` is consulted read-only for summaries of already-analyzed callees and for the set of
/// function entries discovered so far (to tell a call target from plain fallthrough).
pub fn analyze(
    program: &Program,
    cache: &Cache,
    entry: MetaAddress,
    analyze_abi: bool,
) -> IntraAnalysisOutcome {
    let mut pass = Discovery {
        program,
        cache,
        entry,
        branches: Default::default(),
        successors: Default::default(),
        calls: Vec::new(),
        fake_return_targets: Default::default(),
        fake_return_blocks: Vec::new(),
        discovered_callees: Default::default(),
        fake_callees: Default::default(),
        has_unresolved_local_cfg: false,
    };
    pass.run();
    pass.into_outcome(analyze_abi)
}

/// State of the discovery traversal. Lives only for the duration of one [`analyze`] call.
struct Discovery<'a> {
    program: &'a Program,
    cache: &'a Cache,
    entry: MetaAddress,
    branches: UnorderedMap<MetaAddress, BranchType>,
    /// Function-local successor edges among claimed blocks, for the liveness pass
    successors: UnorderedMap<MetaAddress, Vec<MetaAddress>>,
    calls: Vec<DiscoveredCall>,
    /// fake entry -> return addresses of all its call sites in this function
    fake_return_targets: UnorderedMap<MetaAddress, UnorderedSet<MetaAddress>>,
    /// (return block, fake entry) pairs whose successor edges are resolved after the traversal,
    /// once every call site of the fake is known
    fake_return_blocks: Vec<(MetaAddress, MetaAddress)>,
    discovered_callees: UnorderedSet<MetaAddress>,
    fake_callees: UnorderedSet<MetaAddress>,
    /// Set when some function-local control flow could not be resolved (e.g. an indirect branch
    /// with no recovered targets); forces the noreturn proof to fail conservatively
    has_unresolved_local_cfg: bool,
}

/// A unit of traversal work: a block, plus the fake-function body it was reached through (if
/// any), so returns inside the body classify as FakeFunctionReturn.
struct WorkItem {
    address: MetaAddress,
    fake_body: Option<MetaAddress>,
}

impl<'a> Discovery<'a> {
    fn run(&mut self) {
        let mut worklist: VecDeque<WorkItem> = VecDeque::new();
        let mut seen: UnorderedSet<MetaAddress> = Default::default();
        worklist.push_back(WorkItem {
            address: self.entry,
            fake_body: None,
        });

        while let Some(item) = worklist.pop_front() {
            if !seen.insert(item.address) {
                continue;
            }
            // Copy the program reference out so the block borrow does not pin `self`
            let program = self.program;
            let block = match program.block(item.address) {
                Some(block) if Self::is_claimable(block) => block,
                Some(_) => continue,
                None => {
                    debug!(
                        "Reachable address has no lifted block, skipping";
                        "function" => %self.entry,
                        "address" => %item.address,
                    );
                    continue;
                }
            };

            self.visit(block, &item, &mut worklist);
        }

        // Resolve the successors of fake-body return blocks now that every call site of each
        // fake function has been seen
        for (block, fake_entry) in std::mem::take(&mut self.fake_return_blocks) {
            let mut targets: Vec<MetaAddress> = self
                .fake_return_targets
                .get(&fake_entry)
                .map(|t| t.iter().cloned().collect())
                .unwrap_or_default();
            targets.sort();
            for target in targets {
                if self.branches.contains_key(&target) {
                    self.successors.entry(block).or_default().push(target);
                }
            }
        }
    }

    /// Dispatcher and other helper blocks never belong to a function.
    fn is_claimable(block: &BasicBlock) -> bool {
        matches!(block.kind, BlockKind::JumpTarget | BlockKind::Translated)
    }

    /// Schedule `target` for claiming, unless it is the entry of another discovered function
    /// (crossing a call edge) or a non-claimable helper block. Returns whether it was scheduled.
    fn push_claim(
        &mut self,
        target: MetaAddress,
        fake_body: Option<MetaAddress>,
        worklist: &mut VecDeque<WorkItem>,
    ) -> bool {
        if !target.is_valid() {
            return false;
        }
        if target != self.entry && self.cache.is_function_entry(target) {
            debug!(
                "Control flow into another function, not claiming the target";
                "function" => %self.entry,
                "target" => %target,
            );
            return false;
        }
        if let Some(block) = self.program.block(target) {
            if !Self::is_claimable(block) {
                return false;
            }
        }
        worklist.push_back(WorkItem {
            address: target,
            fake_body,
        });
        true
    }

    /// [`Self::push_claim`], also recording the `from -> target` edge for the liveness pass.
    fn push_local(
        &mut self,
        from: MetaAddress,
        target: MetaAddress,
        fake_body: Option<MetaAddress>,
        worklist: &mut VecDeque<WorkItem>,
    ) {
        if self.push_claim(target, fake_body, worklist) {
            self.successors.entry(from).or_default().push(target);
        }
    }

    fn visit(&mut self, block: &BasicBlock, item: &WorkItem, worklist: &mut VecDeque<WorkItem>) {
        let address = block.start;
        let terminator = block.terminator.clone();
        let branch = match &terminator {
            Terminator::Jump {
                targets,
                instruction_local,
            } => {
                for &target in targets {
                    self.push_local(address, target, item.fake_body, worklist);
                }
                if *instruction_local {
                    BranchType::InstructionLocalCfg
                } else {
                    BranchType::FunctionLocalCfg
                }
            }

            Terminator::Call {
                callee,
                return_address,
                synthetic,
            } => self.visit_call(
                address,
                *callee,
                *return_address,
                *synthetic,
                item.fake_body,
                worklist,
            ),

            Terminator::IndirectJump { kind, targets } => match kind {
                IndirectKind::Branch => {
                    if targets.is_empty() {
                        // Nothing recovered: control continues somewhere we cannot see
                        self.has_unresolved_local_cfg = true;
                    }
                    for &target in targets {
                        self.push_local(address, target, item.fake_body, worklist);
                    }
                    BranchType::FunctionLocalCfg
                }
                IndirectKind::TailCall => BranchType::IndirectTailCall,
                IndirectKind::LongJmp => BranchType::LongJmp,
            },

            Terminator::Return { broken } => {
                if let Some(fake_entry) = item.fake_body {
                    self.fake_return_blocks.push((address, fake_entry));
                    BranchType::FakeFunctionReturn
                } else if *broken {
                    BranchType::BrokenReturn
                } else {
                    BranchType::Return
                }
            }

            Terminator::Killer => BranchType::Killer,
            Terminator::Unreachable => BranchType::Unreachable,
        };

        self.branches.insert(address, branch);
    }

    fn visit_call(
        &mut self,
        address: MetaAddress,
        callee: Option<MetaAddress>,
        return_address: MetaAddress,
        synthetic: bool,
        fake_body: Option<MetaAddress>,
        worklist: &mut VecDeque<WorkItem>,
    ) -> BranchType {
        let is_fake_call =
            synthetic || callee.map_or(false, |c| self.cache.is_fake_function(c));

        if is_fake_call {
            if let Some(fake_entry) = callee {
                self.fake_callees.insert(fake_entry);
                if return_address.is_valid() {
                    self.fake_return_targets
                        .entry(fake_entry)
                        .or_default()
                        .insert(return_address);
                }
                // The fake body is traversed inline: its blocks belong to this function
                self.successors.entry(address).or_default().push(fake_entry);
                worklist.push_back(WorkItem {
                    address: fake_entry,
                    fake_body: Some(fake_entry),
                });
                // Control eventually resumes at the return address, in the enclosing context;
                // the liveness edges into it come from the fake body's return blocks
                self.push_claim(return_address, fake_body, worklist);
                self.calls.push(DiscoveredCall {
                    block: address,
                    callee: Some(fake_entry),
                    resolution: CallResolution::Fake,
                });
            } else {
                debug!(
                    "Synthetic call with no callee, treating as a plain fake boundary";
                    "function" => %self.entry,
                    "block" => %address,
                );
                self.push_local(address, return_address, fake_body, worklist);
            }
            return BranchType::FakeFunctionCall;
        }

        let (branch, resolution, callee_no_return) = match callee {
            Some(c) => {
                if self.program.block(c).is_some() {
                    let resolution = if self.cache.get(c).is_some() {
                        CallResolution::Resolved
                    } else {
                        CallResolution::Unresolved
                    };
                    self.discovered_callees.insert(c);
                    (
                        BranchType::HandledCall,
                        resolution,
                        self.cache.is_no_return_function(c),
                    )
                } else {
                    debug!(
                        "Direct call to an address with no lifted block";
                        "function" => %self.entry,
                        "block" => %address,
                        "callee" => %c,
                    );
                    (BranchType::UnhandledCall, CallResolution::Missing, false)
                }
            }
            None => (BranchType::IndirectCall, CallResolution::Indirect, false),
        };

        self.calls.push(DiscoveredCall {
            block: address,
            callee,
            resolution,
        });

        // The fallthrough exists unless the callee provably never returns
        if !callee_no_return {
            self.push_local(address, return_address, fake_body, worklist);
        }

        branch
    }

    fn into_outcome(self, analyze_abi: bool) -> IntraAnalysisOutcome {
        let register_count = self.program.registers.len();

        // Clobbered registers: every write in a claimed block, plus the effect of every non-fake
        // call. Fake-function bodies are part of the claimed set, so their writes flow in
        // directly (pass-through) and no summary fold happens for them.
        let mut concrete_clobbered: UnorderedSet<usize> = Default::default();
        for address in self.branches.keys() {
            if let Some(block) = self.program.block(*address) {
                concrete_clobbered.extend(block.writes.iter());
            }
        }
        let mut has_conservative_fold = false;
        for call in &self.calls {
            match call.resolution {
                CallResolution::Resolved => {
                    let summary = self
                        .cache
                        .get(call.callee.unwrap())
                        .expect("Resolved call site lost its summary mid-analysis");
                    concrete_clobbered.extend(summary.clobbered.iter());
                }
                CallResolution::Unresolved
                | CallResolution::Missing
                | CallResolution::Indirect => {
                    has_conservative_fold = true;
                }
                CallResolution::Fake => {}
            }
        }
        let clobbered: UnorderedSet<usize> = if has_conservative_fold {
            (0..register_count).collect()
        } else {
            concrete_clobbered.iter().cloned().collect()
        };

        // The noreturn proof: no reachable terminator hands control back to a caller, and no
        // local control flow escaped the traversal
        let returns = self.branches.values().any(|&b| match b {
            BranchType::BrokenReturn => CONFIG.broken_return_counts_as_return,
            b => b.returns_to_caller(),
        });
        let no_return = !returns && !self.has_unresolved_local_cfg && !self.branches.is_empty();

        let (slots, call_sites) = if analyze_abi {
            self.compute_slots(
                register_count,
                &concrete_clobbered,
                has_conservative_fold,
                returns,
            )
        } else {
            (
                Default::default(),
                self.calls
                    .iter()
                    .map(|call| CallSite {
                        block: call.block,
                        callee: call.callee,
                        slots: Default::default(),
                    })
                    .collect(),
            )
        };

        let mut call_sites = call_sites;
        call_sites.sort_by_key(|c| c.block);

        let mut discovered: Vec<_> = self.discovered_callees.iter().cloned().collect();
        discovered.sort();
        let mut fake: Vec<_> = self.fake_callees.iter().cloned().collect();
        fake.sort();

        IntraAnalysisOutcome {
            summary: IntraproceduralFunctionSummary {
                entry: self.entry,
                clobbered,
                branches: self.branches,
                slots,
                call_sites,
                no_return,
            },
            discovered_callees: discovered,
            fake_callees: fake,
        }
    }

    /// Backward liveness over the claimed subgraph, then per-register slot assignment for the
    /// function and for each call site.
    fn compute_slots(
        &self,
        register_count: usize,
        concrete_clobbered: &UnorderedSet<usize>,
        has_conservative_fold: bool,
        returns: bool,
    ) -> (UnorderedMap<usize, RegisterSlot>, Vec<CallSite>) {
        // Per-call-block effect on liveness: registers the callee reads as arguments, and
        // registers it clobbers
        let mut callee_uses: UnorderedMap<MetaAddress, UnorderedSet<usize>> = Default::default();
        let mut callee_defs: UnorderedMap<MetaAddress, UnorderedSet<usize>> = Default::default();
        for call in &self.calls {
            let summary = match call.resolution {
                CallResolution::Resolved => {
                    std::borrow::Cow::Borrowed(self.cache.get(call.callee.unwrap()).unwrap())
                }
                CallResolution::Unresolved
                | CallResolution::Missing
                | CallResolution::Indirect => std::borrow::Cow::Owned(
                    self.cache.conservative_summary(
                        call.callee.unwrap_or_else(MetaAddress::invalid),
                    ),
                ),
                CallResolution::Fake => continue,
            };
            let uses: UnorderedSet<usize> = summary
                .slots
                .iter()
                .filter(|(_, slot)| slot.argument == UsageLattice::Yes)
                .map(|(&r, _)| r)
                .collect();
            callee_uses.insert(call.block, uses);
            callee_defs.insert(call.block, summary.clobbered.iter().cloned().collect());
        }

        // Invert the local successor edges
        let mut predecessors: UnorderedMap<MetaAddress, Vec<MetaAddress>> = Default::default();
        for (from, tos) in self.successors.iter() {
            for to in tos {
                if self.branches.contains_key(to) {
                    predecessors.entry(*to).or_default().push(*from);
                }
            }
        }

        // live_in per claimed block, to a fixed point
        let mut live_in: UnorderedMap<MetaAddress, UnorderedSet<usize>> = self
            .branches
            .keys()
            .map(|&a| (a, Default::default()))
            .collect();
        let mut worklist: VecDeque<MetaAddress> = self.branches.keys().cloned().collect();
        while let Some(address) = worklist.pop_front() {
            let block = match self.program.block(address) {
                Some(block) => block,
                None => continue,
            };

            let mut live_out: UnorderedSet<usize> = Default::default();
            if let Some(succs) = self.successors.get(&address) {
                for succ in succs {
                    if let Some(li) = live_in.get(succ) {
                        live_out.extend(li.iter());
                    }
                }
            }

            // The call happens after the block body, so its effect applies to live_out first
            let mut live_at_body_end = live_out;
            if let Some(defs) = callee_defs.get(&address) {
                for def in defs {
                    live_at_body_end.remove(def);
                }
            }
            if let Some(uses) = callee_uses.get(&address) {
                live_at_body_end.extend(uses.iter());
            }

            let mut new_live_in = live_at_body_end;
            for def in &block.writes {
                new_live_in.remove(def);
            }
            new_live_in.extend(block.reads.iter());

            if live_in.get(&address) != Some(&new_live_in) {
                live_in.insert(address, new_live_in);
                if let Some(preds) = predecessors.get(&address) {
                    for pred in preds {
                        worklist.push_back(*pred);
                    }
                }
            }
        }

        let entry_live = live_in.get(&self.entry).cloned().unwrap_or_default();
        let uncertain = has_conservative_fold || self.has_unresolved_local_cfg;

        // Which registers the function is known to touch at all, for the NotObserved cutoff
        let mut observed: UnorderedSet<usize> = concrete_clobbered.iter().cloned().collect();
        for address in self.branches.keys() {
            if let Some(block) = self.program.block(*address) {
                observed.extend(block.reads.iter());
            }
        }

        let mut slots: UnorderedMap<usize, RegisterSlot> = Default::default();
        for r in 0..register_count {
            let argument = if entry_live.contains(&r) {
                UsageLattice::Yes
            } else if uncertain {
                UsageLattice::Unknown
            } else if observed.contains(&r) {
                UsageLattice::No
            } else {
                UsageLattice::NotObserved
            };

            let return_value = if !returns {
                UsageLattice::No
            } else if concrete_clobbered.contains(&r) {
                UsageLattice::Yes
            } else if uncertain {
                UsageLattice::Unknown
            } else {
                UsageLattice::No
            };

            slots.insert(r, RegisterSlot::new(argument, return_value));
        }

        // Call-site slots: the callee's view, joined into the slot observed at the site
        let call_sites = self
            .calls
            .iter()
            .map(|call| {
                let mut site_slots: UnorderedMap<usize, RegisterSlot> = Default::default();
                match call.resolution {
                    CallResolution::Resolved => {
                        let summary = self.cache.get(call.callee.unwrap()).unwrap();
                        // Registers the caller still needs after the call resumes
                        let live_after: UnorderedSet<usize> = self
                            .successors
                            .get(&call.block)
                            .into_iter()
                            .flatten()
                            .filter_map(|s| live_in.get(s))
                            .flat_map(|li| li.iter().cloned())
                            .collect();
                        for r in 0..register_count {
                            let callee_slot = summary
                                .slots
                                .get(&r)
                                .cloned()
                                .unwrap_or_default();
                            let used_as_return = summary.clobbered.contains(&r)
                                && live_after.contains(&r);
                            let site_view = RegisterSlot::new(
                                callee_slot.argument,
                                if used_as_return {
                                    UsageLattice::Yes
                                } else {
                                    UsageLattice::No
                                },
                            );
                            let slot = site_slots.entry(r).or_default();
                            *slot = slot.join(site_view);
                        }
                    }
                    CallResolution::Unresolved
                    | CallResolution::Missing
                    | CallResolution::Indirect => {
                        // The conservative stand-in reads and produces nothing knowable
                        let stand_in = self.cache.conservative_summary(
                            call.callee.unwrap_or_else(MetaAddress::invalid),
                        );
                        for (&r, &callee_slot) in stand_in.slots.iter() {
                            let slot = site_slots.entry(r).or_default();
                            *slot = slot.join(callee_slot);
                        }
                    }
                    CallResolution::Fake => {}
                }
                CallSite {
                    block: call.block,
                    callee: call.callee,
                    slots: site_slots,
                }
            })
            .collect();

        (slots, call_sites)
    }
}
