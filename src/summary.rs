//! Per-function analysis results: branch classification and the intraprocedural summary that the
//! interprocedural cache memoizes.

use crate::address::MetaAddress;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::register_usage::RegisterSlot;

/// Classification of how control leaves a basic block, as decided by the analysis.
///
/// The first four values classify whole functions rather than branches; they appear in textual
/// dumps but never in a summary's per-block map.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum BranchType {
    Invalid,
    /// The entry of a fake function (whole-function classification)
    FakeFunction,
    /// The entry of a regular function (whole-function classification)
    RegularFunction,
    /// The entry of a noreturn function (whole-function classification)
    NoReturnFunction,
    /// Control flow between blocks belonging to a single machine instruction
    InstructionLocalCfg,
    /// A regular branch within the function
    FunctionLocalCfg,
    /// A call to a fake function
    FakeFunctionCall,
    /// A return from a fake function back to its caller
    FakeFunctionReturn,
    /// A call for which the cache produced (or will produce) a callee summary
    HandledCall,
    /// A call whose direct callee could not be resolved to a known block
    UnhandledCall,
    /// A call through a register or memory location
    IndirectCall,
    /// A proper return to the caller
    Return,
    /// A return leaving the stack in an unexpected state
    BrokenReturn,
    /// An indirect branch leaving the function with the stack already unwound
    IndirectTailCall,
    /// A `longjmp` or similar construct
    LongJmp,
    /// A killer basic block (killer syscall or endless loop)
    Killer,
    /// The block ends with an unreachable instruction
    Unreachable,
}

impl BranchType {
    pub fn name(self) -> &'static str {
        match self {
            BranchType::Invalid => "Invalid",
            BranchType::FakeFunction => "FakeFunction",
            BranchType::RegularFunction => "RegularFunction",
            BranchType::NoReturnFunction => "NoReturnFunction",
            BranchType::InstructionLocalCfg => "InstructionLocalCFG",
            BranchType::FunctionLocalCfg => "FunctionLocalCFG",
            BranchType::FakeFunctionCall => "FakeFunctionCall",
            BranchType::FakeFunctionReturn => "FakeFunctionReturn",
            BranchType::HandledCall => "HandledCall",
            BranchType::UnhandledCall => "UnhandledCall",
            BranchType::IndirectCall => "IndirectCall",
            BranchType::Return => "Return",
            BranchType::BrokenReturn => "BrokenReturn",
            BranchType::IndirectTailCall => "IndirectTailCall",
            BranchType::LongJmp => "LongJmp",
            BranchType::Killer => "Killer",
            BranchType::Unreachable => "Unreachable",
        }
    }

    /// Does a block with this terminator classification hand control back to the caller?
    pub fn returns_to_caller(self) -> bool {
        matches!(
            self,
            BranchType::Return | BranchType::BrokenReturn | BranchType::IndirectTailCall
        )
    }
}

/// Final classification of a recovered function.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FunctionType {
    Invalid,
    Regular,
    NoReturn,
    Fake,
}

impl FunctionType {
    pub fn name(self) -> &'static str {
        match self {
            FunctionType::Invalid => "Invalid",
            FunctionType::Regular => "Regular",
            FunctionType::NoReturn => "NoReturn",
            FunctionType::Fake => "Fake",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Invalid" => Some(FunctionType::Invalid),
            "Regular" => Some(FunctionType::Regular),
            "NoReturn" => Some(FunctionType::NoReturn),
            "Fake" => Some(FunctionType::Fake),
            _ => None,
        }
    }
}

/// One call site observed while analyzing a function.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CallSite {
    /// The block whose terminator is the call
    pub block: MetaAddress,
    /// The direct callee, if resolved
    pub callee: Option<MetaAddress>,
    /// Per-register argument/return-value usage at this call site (empty unless ABI analysis is
    /// enabled)
    pub slots: UnorderedMap<usize, RegisterSlot>,
}

/// The memoized result of analyzing one function entry point.
///
/// Owned by the [`Cache`](crate::cache::Cache): created on first analysis of an entry, replaced
/// wholesale whenever the interprocedural fixed point refines call-site information. No partially
/// updated summary is ever visible outside the cache.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct IntraproceduralFunctionSummary {
    pub entry: MetaAddress,
    /// Registers whose value at function exit cannot be guaranteed equal to their value at entry
    pub clobbered: UnorderedSet<usize>,
    /// Branch classification for every block the function claims
    pub branches: UnorderedMap<MetaAddress, BranchType>,
    /// Per-register argument/return-value usage across the whole function (empty unless ABI
    /// analysis is enabled)
    pub slots: UnorderedMap<usize, RegisterSlot>,
    /// Call sites in block-address order
    pub call_sites: Vec<CallSite>,
    /// Whether the analysis proved that no control path returns to a caller
    pub no_return: bool,
}

impl IntraproceduralFunctionSummary {
    /// An empty summary for `entry`.
    pub fn empty(entry: MetaAddress) -> Self {
        Self {
            entry,
            clobbered: Default::default(),
            branches: Default::default(),
            slots: Default::default(),
            call_sites: Vec::new(),
            no_return: false,
        }
    }

    /// The stand-in used for a callee that has not been analyzed yet: it clobbers every register,
    /// returns, and its register usage is unknown. Callers folding this summary degrade to the
    /// lattice top instead of failing.
    pub fn conservative(entry: MetaAddress, register_count: usize) -> Self {
        use crate::register_usage::UsageLattice;
        Self {
            entry,
            clobbered: (0..register_count).collect(),
            branches: Default::default(),
            slots: (0..register_count)
                .map(|r| {
                    (
                        r,
                        RegisterSlot::new(UsageLattice::Unknown, UsageLattice::Unknown),
                    )
                })
                .collect(),
            call_sites: Vec::new(),
            no_return: false,
        }
    }

    /// The blocks this function claims.
    pub fn blocks(&self) -> impl Iterator<Item = &MetaAddress> {
        self.branches.keys()
    }
}
