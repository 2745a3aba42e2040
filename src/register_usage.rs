//! The abstract domain tracking how a machine register is used across a function or call site.
//!
//! The lattice is a four-point diamond:
//!
//! ```text
//!         Unknown          (conflicting or unresolvable observations)
//!         /     \
//!       Yes     No
//!         \     /
//!       NotObserved        (no observation yet)
//! ```
//!
//! `join` is the least upper bound. The lattice has height 2, so any monotone fixed point over it
//! stabilizes after at most two changes per tracked slot.

/// One lattice element. Pure value type; no side effects anywhere in this module.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum UsageLattice {
    /// Bottom: the analysis has seen nothing about this register yet
    NotObserved,
    /// The register is used this way
    Yes,
    /// The register is provably not used this way
    No,
    /// Top: observations conflict, or the information source was unresolvable
    Unknown,
}

impl UsageLattice {
    /// Least upper bound of `self` and `other`.
    pub fn join(self, other: Self) -> Self {
        use UsageLattice::*;
        match (self, other) {
            (NotObserved, x) | (x, NotObserved) => x,
            (Unknown, _) | (_, Unknown) => Unknown,
            (Yes, Yes) => Yes,
            (No, No) => No,
            (Yes, No) | (No, Yes) => Unknown,
        }
    }

    /// The name used in metadata records and textual dumps.
    pub fn value_name(self) -> &'static str {
        match self {
            UsageLattice::NotObserved => "NotObserved",
            UsageLattice::Yes => "Yes",
            UsageLattice::No => "No",
            UsageLattice::Unknown => "Unknown",
        }
    }

    pub fn from_value_name(name: &str) -> Option<Self> {
        match name {
            "NotObserved" => Some(UsageLattice::NotObserved),
            "Yes" => Some(UsageLattice::Yes),
            "No" => Some(UsageLattice::No),
            "Unknown" => Some(UsageLattice::Unknown),
            _ => None,
        }
    }
}

impl Default for UsageLattice {
    fn default() -> Self {
        UsageLattice::NotObserved
    }
}

/// Per-register classification of argument/return-value usage, for one function or one call site.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct RegisterSlot {
    pub argument: UsageLattice,
    pub return_value: UsageLattice,
}

impl RegisterSlot {
    pub fn new(argument: UsageLattice, return_value: UsageLattice) -> Self {
        Self {
            argument,
            return_value,
        }
    }

    /// Component-wise least upper bound.
    pub fn join(self, other: Self) -> Self {
        Self {
            argument: self.argument.join(other.argument),
            return_value: self.return_value.join(other.return_value),
        }
    }
}
