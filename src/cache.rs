//! Memoization of intraprocedural summaries across the interprocedural fixed point.

use crate::address::MetaAddress;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::log::*;
use crate::summary::IntraproceduralFunctionSummary;

/// The interprocedural cache: per-entry-point summaries, fake/noreturn classification, and the
/// dependency bookkeeping that drives re-analysis when a callee's summary becomes available or
/// improves.
///
/// Owned exclusively by the analysis driver for the duration of one whole-program run; there is
/// no concurrent mutation. Stored summaries are only ever replaced wholesale, so a reader can
/// never observe a partially updated entry.
pub struct Cache {
    register_count: usize,
    summaries: UnorderedMap<MetaAddress, IntraproceduralFunctionSummary>,
    fake_functions: UnorderedSet<MetaAddress>,
    recursive_functions: UnorderedSet<MetaAddress>,
    /// Entries known to be function entry points (initial candidates plus callees discovered
    /// mid-run). The intraprocedural analysis consults this to decide whether a branch target is
    /// a call boundary or plain fallthrough.
    function_entries: UnorderedSet<MetaAddress>,
    /// callee -> callers that folded some form of the callee's summary and must be re-run when
    /// it changes
    dependents: UnorderedMap<MetaAddress, UnorderedSet<MetaAddress>>,
}

impl Cache {
    pub fn new(register_count: usize) -> Self {
        Self {
            register_count,
            summaries: Default::default(),
            fake_functions: Default::default(),
            recursive_functions: Default::default(),
            function_entries: Default::default(),
            dependents: Default::default(),
        }
    }

    /// The memoized summary for `entry`, if it has ever been analyzed.
    pub fn get(&self, entry: MetaAddress) -> Option<&IntraproceduralFunctionSummary> {
        self.summaries.get(&entry)
    }

    /// Store (or replace) the summary for `entry`. Returns `true` if the stored value differs
    /// from what was previously cached, i.e. if dependents of `entry` need re-analysis.
    pub fn store(&mut self, entry: MetaAddress, summary: IntraproceduralFunctionSummary) -> bool {
        debug_assert_eq!(summary.entry, entry);
        match self.summaries.get(&entry) {
            Some(old) if *old == summary => false,
            _ => {
                self.summaries.insert(entry, summary);
                true
            }
        }
    }

    /// The conservative stand-in for a callee with no cached summary yet.
    pub fn conservative_summary(&self, entry: MetaAddress) -> IntraproceduralFunctionSummary {
        IntraproceduralFunctionSummary::conservative(entry, self.register_count)
    }

    pub fn is_fake_function(&self, entry: MetaAddress) -> bool {
        self.fake_functions.contains(&entry)
    }

    /// Mark `entry` as a fake function. Returns `true` on the first marking. Any summary cached
    /// under a previous non-fake classification is dropped, so callers re-fold it as fake.
    pub fn mark_fake_function(&mut self, entry: MetaAddress) -> bool {
        let newly_marked = self.fake_functions.insert(entry);
        if newly_marked && self.summaries.remove(&entry).is_some() {
            debug!(
                "Dropping summary of a function discovered to be fake";
                "entry" => %entry,
            );
        }
        newly_marked
    }

    /// A function is noreturn when its analysis proved that no control path returns to a caller.
    pub fn is_no_return_function(&self, entry: MetaAddress) -> bool {
        self.summaries
            .get(&entry)
            .map(|s| s.no_return)
            .unwrap_or(false)
    }

    pub fn note_function_entry(&mut self, entry: MetaAddress) {
        self.function_entries.insert(entry);
    }

    pub fn is_function_entry(&self, address: MetaAddress) -> bool {
        self.function_entries.contains(&address)
    }

    /// Record that `caller` folded an unresolved (or since-changed) summary of `callee` and must
    /// be re-analyzed when `callee`'s summary is stored or replaced.
    pub fn record_dependency(&mut self, caller: MetaAddress, callee: MetaAddress) {
        self.dependents.entry(callee).or_default().insert(caller);
    }

    /// The callers waiting on `callee`, in deterministic order.
    pub fn dependents_of(&self, callee: MetaAddress) -> Vec<MetaAddress> {
        self.dependents
            .get(&callee)
            .map(|d| {
                let mut v: Vec<_> = d.iter().cloned().collect();
                v.sort();
                v
            })
            .unwrap_or_default()
    }

    /// Does `caller` have a recorded dependency on `callee`?
    pub fn depends_on(&self, caller: MetaAddress, callee: MetaAddress) -> bool {
        self.dependents
            .get(&callee)
            .map(|d| d.contains(&caller))
            .unwrap_or(false)
    }

    /// Remember that `entry` participates in a recursive call cycle. Purely informational: the
    /// fixed point converges through re-analysis either way, but dumps and logs surface it.
    pub fn mark_recursive(&mut self, entry: MetaAddress) {
        if self.recursive_functions.insert(entry) {
            debug!("Detected recursion"; "entry" => %entry);
        }
    }

    pub fn is_recursive_function(&self, entry: MetaAddress) -> bool {
        self.recursive_functions.contains(&entry)
    }

    pub fn register_count(&self) -> usize {
        self.register_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(addr: u64) -> MetaAddress {
        MetaAddress::code(addr)
    }

    #[test]
    fn store_reports_change() {
        let mut cache = Cache::new(4);
        let e = entry(0x1000);
        let summary = IntraproceduralFunctionSummary::empty(e);
        assert!(cache.store(e, summary.clone()));
        // Storing an identical summary is not a change
        assert!(!cache.store(e, summary.clone()));

        let mut changed = summary;
        changed.no_return = true;
        assert!(cache.store(e, changed));
        assert!(cache.is_no_return_function(e));
    }

    #[test]
    fn marking_fake_drops_the_stale_summary() {
        let mut cache = Cache::new(4);
        let e = entry(0x2000);
        cache.store(e, IntraproceduralFunctionSummary::empty(e));
        assert!(cache.mark_fake_function(e));
        assert!(cache.is_fake_function(e));
        assert!(cache.get(e).is_none());
        assert!(!cache.mark_fake_function(e));
    }

    #[test]
    fn dependency_bookkeeping() {
        let mut cache = Cache::new(4);
        let (a, b, c) = (entry(0x1), entry(0x2), entry(0x3));
        cache.record_dependency(a, c);
        cache.record_dependency(b, c);
        cache.record_dependency(a, c); // duplicates collapse
        assert_eq!(cache.dependents_of(c), vec![a, b]);
        assert!(cache.depends_on(a, c));
        assert!(!cache.depends_on(c, a));
        assert!(cache.dependents_of(a).is_empty());
    }

    #[test]
    fn conservative_summary_clobbers_everything() {
        let cache = Cache::new(3);
        let s = cache.conservative_summary(entry(0x10));
        assert_eq!(s.clobbered.len(), 3);
        assert!(!s.no_return);
        assert!(s.branches.is_empty());
    }
}
