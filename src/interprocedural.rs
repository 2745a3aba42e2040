//! The interprocedural driver: candidate-entry-point discovery, the Force/Candidate passes, and
//! the per-entry fixed point over the discovered call subgraph.

use std::collections::VecDeque;

use crate::address::MetaAddress;
use crate::cache::Cache;
use crate::config::CONFIG;
use crate::containers::unordered::UnorderedSet;
use crate::intraprocedural;
use crate::log::*;
use crate::program::{BlockKind, JtReason, Program};
use crate::results::{FunctionsSummary, ResultsPool};
use crate::summary::FunctionType;

/// A Candidate Function Entry Point.
///
/// The analysis considers two sets of functions: first (`force == true`) those that are highly
/// likely to be real functions (they have a direct call or a symbol), and then all the remaining
/// candidates whose entry point is not already included in a function of the first set.
#[derive(Clone, Copy, Debug)]
pub struct Cfep {
    pub entry: MetaAddress,
    pub force: bool,
}

/// Scan the jump-target metadata and split entry-point candidates into forced and non-forced,
/// in address order.
pub fn discover_entry_points(program: &Program) -> Vec<Cfep> {
    let mut candidates = Vec::new();

    for block in program.blocks() {
        if block.kind != BlockKind::JumpTarget {
            continue;
        }

        let reasons = block.reasons;
        let is_function_symbol = reasons.has(JtReason::FunctionSymbol);
        let is_callee = reasons.has(JtReason::Callee);
        let is_unused_global_data = reasons.has(JtReason::UnusedGlobalData);
        let is_memory_store = reasons.has(JtReason::MemoryStore);
        let is_pc_store = reasons.has(JtReason::PcStore);
        let is_return_address = reasons.has(JtReason::ReturnAddress);
        let is_load_address = reasons.has(JtReason::LoadAddress);

        if is_function_symbol || is_callee {
            // Called addresses are a strong hint
            candidates.push(Cfep {
                entry: block.start,
                force: true,
            });
        } else if !is_load_address
            && (is_unused_global_data
                || (is_memory_store
                    && !is_pc_store
                    && (!is_return_address || CONFIG.keep_return_address_candidates)))
        {
            // Consider addresses found in global data that have not been used, or addresses that
            // are not return addresses and do not end up in the PC directly
            candidates.push(Cfep {
                entry: block.start,
                force: false,
            });
        }
    }

    for cfep in &candidates {
        info!(
            "Candidate function entry point";
            "entry" => %cfep.entry,
            "forced" => cfep.force,
        );
    }

    candidates
}

/// One interprocedural run: repeatedly applies the intraprocedural analysis across the call
/// subgraph reachable from a single entry point until every summary in that subgraph is stable.
pub struct InterproceduralAnalysis<'a> {
    program: &'a Program,
    analyze_abi: bool,
}

impl<'a> InterproceduralAnalysis<'a> {
    pub fn new(program: &'a Program, analyze_abi: bool) -> Self {
        Self {
            program,
            analyze_abi,
        }
    }

    /// Run to a fixed point starting at `entry`, consulting and updating `cache`, and claim the
    /// blocks of every summary produced into `results`.
    pub fn run(&mut self, cache: &mut Cache, entry: MetaAddress, results: &mut ResultsPool) {
        // Monotonicity bound: each entry's summary can only move a bounded number of steps
        // through the finite-height lattice, so re-analyses per entry are bounded too. Exceeding
        // the bound means a transfer function is not monotone, which is a bug, not bad input.
        let per_entry_bound = 4 + 4 * cache.register_count() + self.program.block_count();
        let mut analysis_counts: crate::containers::unordered::UnorderedMap<MetaAddress, usize> =
            Default::default();

        let mut worklist: VecDeque<MetaAddress> = VecDeque::new();
        let mut enqueued: UnorderedSet<MetaAddress> = Default::default();
        worklist.push_back(entry);
        enqueued.insert(entry);

        let mut analyzed_in_run: UnorderedSet<MetaAddress> = Default::default();

        while let Some(current) = worklist.pop_front() {
            enqueued.remove(&current);

            if self.program.block(current).is_none() {
                debug!(
                    "Skipping entry with no lifted block";
                    "entry" => %current,
                );
                continue;
            }
            if cache.is_fake_function(current) {
                // Fake functions have no standalone summary; their bodies are analyzed inline by
                // their callers
                continue;
            }

            let count = analysis_counts.entry(current).or_insert(0);
            *count += 1;
            assert!(
                *count <= per_entry_bound,
                "Entry {} was re-analyzed {} times; the fixed point is not converging",
                current,
                count
            );

            if CONFIG.trace_fixed_point {
                trace!(
                    "Intraprocedural analysis";
                    "entry" => %current,
                    "round" => *count,
                );
            }

            let outcome =
                intraprocedural::analyze(self.program, cache, current, self.analyze_abi);
            analyzed_in_run.insert(current);

            for fake in outcome.fake_callees {
                cache.note_function_entry(fake);
                if cache.mark_fake_function(fake) {
                    // Anyone who folded the old non-fake summary must reconsider
                    for dependent in cache.dependents_of(fake) {
                        if enqueued.insert(dependent) {
                            worklist.push_back(dependent);
                        }
                    }
                }
            }

            // Every folded callee summary, resolved or not, is a dependency: if it is ever
            // replaced, this entry's fold is stale and must be redone
            for callee in outcome.discovered_callees {
                cache.note_function_entry(callee);
                cache.record_dependency(current, callee);
                // A dependency cycle is recursion
                if callee == current || cache.depends_on(callee, current) {
                    cache.mark_recursive(current);
                    cache.mark_recursive(callee);
                }
                if cache.get(callee).is_none()
                    && !cache.is_fake_function(callee)
                    && enqueued.insert(callee)
                {
                    worklist.push_back(callee);
                }
            }

            let changed = cache.store(current, outcome.summary);
            if changed {
                if CONFIG.trace_fixed_point {
                    trace!("Summary replaced"; "entry" => %current);
                }
                for dependent in cache.dependents_of(current) {
                    if enqueued.insert(dependent) {
                        worklist.push_back(dependent);
                    }
                }
            }
        }

        // Only now, with the subgraph stable, claim blocks: no transient claim is ever visible
        let mut entries: Vec<_> = analyzed_in_run.into_iter().collect();
        entries.sort();
        for analyzed in entries {
            if let Some(summary) = cache.get(analyzed) {
                let blocks: Vec<MetaAddress> = summary.blocks().cloned().collect();
                results.note_visited(analyzed, blocks);
            }
        }
    }
}

/// Whole-program analysis: the top-level sequencing of discovery, the Force pass, the Candidate
/// pass, and final classification.
pub fn run_analysis(program: &Program, analyze_abi: bool) -> FunctionsSummary {
    info!("Starting function boundary analysis"; "program" => &program.name);

    let candidates = discover_entry_points(program);

    // Initialize the cache where all the results will be accumulated
    let mut cache = Cache::new(program.registers.len());
    for cfep in &candidates {
        cache.note_function_entry(cfep.entry);
    }

    // Pool where the final results will be collected
    let mut results = ResultsPool::default();

    // First analyze all the forced functions (i.e., with an explicit direct call)
    for cfep in &candidates {
        if cfep.force {
            let mut analysis = InterproceduralAnalysis::new(program, analyze_abi);
            analysis.run(&mut cache, cfep.entry, &mut results);
        }
    }

    // Now analyze all the remaining candidates which are not already part of another function
    for cfep in &candidates {
        if !cfep.force && !results.is_visited(cfep.entry) {
            let mut analysis = InterproceduralAnalysis::new(program, analyze_abi);
            analysis.run(&mut cache, cfep.entry, &mut results);
        }
    }

    // Register every candidate, forced or not, with its final classification
    for cfep in &candidates {
        let cached = cache.get(cfep.entry);
        assert!(
            cached.is_some() || cache.is_fake_function(cfep.entry),
            "Candidate entry {} was neither analyzed nor classified fake",
            cfep.entry
        );

        let ty = if cache.is_fake_function(cfep.entry) {
            FunctionType::Fake
        } else if cache.is_no_return_function(cfep.entry) {
            FunctionType::NoReturn
        } else {
            FunctionType::Regular
        };

        match cached {
            Some(summary) => {
                // Regular functions are composed of at least one basic block
                if ty == FunctionType::Regular {
                    assert!(
                        !summary.branches.is_empty(),
                        "Regular function {} has no blocks",
                        cfep.entry
                    );
                }
                results.register_function(cfep.entry, ty, Some(summary.clone()));
            }
            None => {
                results.register_function(cfep.entry, ty, None);
            }
        }
    }

    let summary = results.finalize(program, &cache);
    info!(
        "Function boundary analysis done";
        "functions" => summary.functions.len(),
    );
    summary
}
