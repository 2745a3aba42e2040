//! Accumulation of per-function results and the final, immutable whole-program summary.

use std::collections::{BTreeMap, BTreeSet};

use crate::address::MetaAddress;
use crate::cache::Cache;
use crate::config::CONFIG;
use crate::containers::unordered::UnorderedMap;
use crate::log::*;
use crate::program::Program;
use crate::register_usage::RegisterSlot;
use crate::summary::{BranchType, FunctionType, IntraproceduralFunctionSummary};

/// Collects `(entry, type, summary)` tuples as the driver classifies candidates, plus the set of
/// blocks claimed by any interprocedural run so far.
#[derive(Default)]
pub struct ResultsPool {
    functions: Vec<(
        MetaAddress,
        FunctionType,
        Option<IntraproceduralFunctionSummary>,
    )>,
    /// block -> first entry that claimed it
    claimed: UnorderedMap<MetaAddress, MetaAddress>,
}

impl ResultsPool {
    /// Record that the run rooted at `claimer` reached `blocks`. First claim wins; a later,
    /// different claimer is surfaced as a warning (overlapping-but-not-nested reachable sets).
    pub fn note_visited(
        &mut self,
        claimer: MetaAddress,
        blocks: impl IntoIterator<Item = MetaAddress>,
    ) {
        for block in blocks {
            match self.claimed.get(&block) {
                None => {
                    self.claimed.insert(block, claimer);
                }
                Some(&owner) if owner != claimer => {
                    if CONFIG.warn_on_overlapping_claims {
                        warn!(
                            "Block claimed by two functions; keeping the first claim";
                            "block" => %block,
                            "owner" => %owner,
                            "claimer" => %claimer,
                        );
                    }
                }
                Some(_) => {}
            }
        }
    }

    /// Has any run claimed `block` yet? The driver uses this to skip candidates already covered
    /// by a forced function.
    pub fn is_visited(&self, block: MetaAddress) -> bool {
        self.claimed.contains_key(&block)
    }

    /// Register a classified candidate. Fake functions may carry no summary; nothing is ever
    /// discarded for being uncertain.
    pub fn register_function(
        &mut self,
        entry: MetaAddress,
        ty: FunctionType,
        summary: Option<IntraproceduralFunctionSummary>,
    ) {
        assert!(
            !self.functions.iter().any(|(e, _, _)| *e == entry),
            "Function {} registered twice",
            entry
        );
        self.functions.push((entry, ty, summary));
    }

    /// Produce the immutable whole-program summary. Names are synthesized from entry addresses
    /// and call-site callees are resolved against the final set of functions.
    pub fn finalize(self, program: &Program, cache: &Cache) -> FunctionsSummary {
        let entries: BTreeSet<MetaAddress> =
            self.functions.iter().map(|(e, _, _)| *e).collect();

        let mut functions = BTreeMap::new();
        for (entry, ty, summary) in self.functions {
            let name = format!("fn_{:#x}", entry.address);

            let description = match summary {
                Some(summary) => {
                    let call_sites = summary
                        .call_sites
                        .iter()
                        .map(|site| {
                            let callee = match site.callee {
                                Some(c) => {
                                    if !entries.contains(&c) && !cache.is_fake_function(c) {
                                        debug!(
                                            "Call site target is not a registered function";
                                            "caller" => %entry,
                                            "callee" => %c,
                                        );
                                    }
                                    c
                                }
                                None => MetaAddress::invalid(),
                            };
                            CallSiteDescription {
                                block: site.block,
                                callee,
                                slots: site.slots.iter().map(|(&r, &s)| (r, s)).collect(),
                            }
                        })
                        .collect();

                    FunctionDescription {
                        entry,
                        name,
                        ty,
                        clobbered: summary.clobbered.iter().cloned().collect(),
                        blocks: summary.branches.iter().map(|(&a, &b)| (a, b)).collect(),
                        slots: summary.slots.iter().map(|(&r, &s)| (r, s)).collect(),
                        call_sites,
                        recursive: cache.is_recursive_function(entry),
                    }
                }
                None => FunctionDescription {
                    entry,
                    name,
                    ty,
                    clobbered: Default::default(),
                    blocks: Default::default(),
                    slots: Default::default(),
                    call_sites: Vec::new(),
                    recursive: false,
                },
            };

            functions.insert(entry, description);
        }

        FunctionsSummary {
            program_name: program.name.clone(),
            functions,
        }
    }
}

/// One call site in the final summary. `callee` is the invalid address for indirect calls.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CallSiteDescription {
    pub block: MetaAddress,
    pub callee: MetaAddress,
    pub slots: BTreeMap<usize, RegisterSlot>,
}

/// Everything recovered about one function.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FunctionDescription {
    pub entry: MetaAddress,
    pub name: String,
    pub ty: FunctionType,
    pub clobbered: BTreeSet<usize>,
    pub blocks: BTreeMap<MetaAddress, BranchType>,
    pub slots: BTreeMap<usize, RegisterSlot>,
    pub call_sites: Vec<CallSiteDescription>,
    pub recursive: bool,
}

/// The final, read-only aggregation of the whole analysis, keyed and ordered by entry address.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FunctionsSummary {
    pub program_name: String,
    pub functions: BTreeMap<MetaAddress, FunctionDescription>,
}

static EMPTY_CLOBBER_SET: BTreeSet<usize> = BTreeSet::new();

impl FunctionsSummary {
    /// The clobbered-register set of the function entered at `entry`, or the empty set for
    /// addresses that are not function entries.
    pub fn get_clobbered(&self, entry: MetaAddress) -> &BTreeSet<usize> {
        match self.functions.get(&entry) {
            Some(description) => &description.clobbered,
            None => &EMPTY_CLOBBER_SET,
        }
    }

    /// One `name: r1 r2 ...` line per function, the quick-glance clobber report.
    pub fn clobbered_report(&self, program: &Program) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for function in self.functions.values() {
            write!(out, "{}:", function.name).unwrap();
            for &r in &function.clobbered {
                write!(out, " {}", program.registers.name(r)).unwrap();
            }
            out.push('\n');
        }
        out
    }

    /// The human-readable dump of the whole result.
    pub fn dump(&self, program: &Program) -> String {
        let mut out = String::new();
        self.dump_to(&mut out, program).unwrap();
        out
    }

    fn dump_to(&self, f: &mut String, program: &Program) -> std::fmt::Result {
        use std::fmt::Write;

        writeln!(f, "FUNCTIONS of {}", self.program_name)?;
        for function in self.functions.values() {
            writeln!(f)?;
            writeln!(
                f,
                "{} at {} [{}]{}",
                function.name,
                function.entry,
                function.ty.name(),
                if function.recursive { " (recursive)" } else { "" },
            )?;

            write!(f, "\tclobbered:")?;
            for &r in &function.clobbered {
                write!(f, " {}", program.registers.name(r))?;
            }
            writeln!(f)?;

            for (block, branch) in &function.blocks {
                writeln!(f, "\tblock {} {}", block, branch.name())?;
            }

            for (&r, slot) in &function.slots {
                use crate::register_usage::UsageLattice;
                if slot.argument == UsageLattice::NotObserved
                    && slot.return_value == UsageLattice::NotObserved
                {
                    continue;
                }
                writeln!(
                    f,
                    "\tslot {} argument={} return-value={}",
                    program.registers.name(r),
                    slot.argument.value_name(),
                    slot.return_value.value_name(),
                )?;
            }

            for site in &function.call_sites {
                writeln!(f, "\tcall at {} to {}", site.block, site.callee)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_claim_wins() {
        let mut pool = ResultsPool::default();
        let a = MetaAddress::code(0x100);
        let b = MetaAddress::code(0x200);
        let block = MetaAddress::code(0x300);
        pool.note_visited(a, [block]);
        pool.note_visited(b, [block]);
        assert!(pool.is_visited(block));
        assert!(!pool.is_visited(MetaAddress::code(0x400)));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn double_registration_is_fatal() {
        let mut pool = ResultsPool::default();
        let entry = MetaAddress::code(0x100);
        pool.register_function(entry, FunctionType::Regular, None);
        pool.register_function(entry, FunctionType::Fake, None);
    }
}
