//! The persistent model the analysis results are committed into: functions with typed CFG edges,
//! keyed by entry address, plus its deterministic text form.

use std::collections::{BTreeMap, BTreeSet};

use crate::address::MetaAddress;
use crate::config::CONFIG;
use crate::log::*;
use crate::program::{Program, Terminator};
use crate::results::FunctionsSummary;
use crate::summary::{BranchType, FunctionType};

/// The type of a CFG edge recorded in the model.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum FunctionEdgeType {
    /// Invalid value
    Invalid,
    /// Branch due to function-local CFG (a regular branch)
    DirectBranch,
    /// A call to a fake function
    FakeFunctionCall,
    /// A return from a fake function
    FakeFunctionReturn,
    /// A function call for which the cache was able to produce a summary
    FunctionCall,
    /// A function call for which the target is unknown
    IndirectCall,
    /// A proper function return
    Return,
    /// A branch returning to the return address, but leaving the stack in an unexpected situation
    BrokenReturn,
    /// A branch representing an indirect tail call
    IndirectTailCall,
    /// A branch representing a longjmp or similar constructs
    LongJmp,
    /// A killer basic block (killer syscall or endless loop)
    Killer,
    /// The basic block ends with an unreachable instruction
    Unreachable,
}

impl FunctionEdgeType {
    pub fn name(self) -> &'static str {
        match self {
            FunctionEdgeType::Invalid => "Invalid",
            FunctionEdgeType::DirectBranch => "DirectBranch",
            FunctionEdgeType::FakeFunctionCall => "FakeFunctionCall",
            FunctionEdgeType::FakeFunctionReturn => "FakeFunctionReturn",
            FunctionEdgeType::FunctionCall => "FunctionCall",
            FunctionEdgeType::IndirectCall => "IndirectCall",
            FunctionEdgeType::Return => "Return",
            FunctionEdgeType::BrokenReturn => "BrokenReturn",
            FunctionEdgeType::IndirectTailCall => "IndirectTailCall",
            FunctionEdgeType::LongJmp => "LongJmp",
            FunctionEdgeType::Killer => "Killer",
            FunctionEdgeType::Unreachable => "Unreachable",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Invalid" => Some(FunctionEdgeType::Invalid),
            "DirectBranch" => Some(FunctionEdgeType::DirectBranch),
            "FakeFunctionCall" => Some(FunctionEdgeType::FakeFunctionCall),
            "FakeFunctionReturn" => Some(FunctionEdgeType::FakeFunctionReturn),
            "FunctionCall" => Some(FunctionEdgeType::FunctionCall),
            "IndirectCall" => Some(FunctionEdgeType::IndirectCall),
            "Return" => Some(FunctionEdgeType::Return),
            "BrokenReturn" => Some(FunctionEdgeType::BrokenReturn),
            "IndirectTailCall" => Some(FunctionEdgeType::IndirectTailCall),
            "LongJmp" => Some(FunctionEdgeType::LongJmp),
            "Killer" => Some(FunctionEdgeType::Killer),
            "Unreachable" => Some(FunctionEdgeType::Unreachable),
            _ => None,
        }
    }
}

/// One CFG edge. Ordered on (source, destination, type) so a function's CFG forms a sorted set
/// that supports the range lookups below.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct FunctionEdge {
    pub source: MetaAddress,
    pub destination: MetaAddress,
    pub ty: FunctionEdgeType,
}

/// One recovered function in the model.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Function {
    pub entry: MetaAddress,
    pub name: String,
    pub ty: FunctionType,
    pub cfg: BTreeSet<FunctionEdge>,
}

impl Function {
    pub fn new(entry: MetaAddress) -> Self {
        Self {
            entry,
            name: String::new(),
            ty: FunctionType::Invalid,
            cfg: BTreeSet::new(),
        }
    }

    /// Derive the (start, exclusive end) address ranges of this function's basic blocks by
    /// walking the sorted direct-branch edges: each block extends to the start of the next block
    /// known to the CFG. A block with no later edge gets a zero-length range (extent unknown).
    /// The entry block's range comes first; the rest are sorted.
    pub fn basic_block_ranges(&self) -> Vec<(MetaAddress, MetaAddress)> {
        let mut result = Vec::new();

        // The entry point enters through a "virtual" edge into the entry address
        self.process_edge(
            &mut result,
            &FunctionEdge {
                source: MetaAddress::invalid(),
                destination: self.entry,
                ty: FunctionEdgeType::Invalid,
            },
        );

        for edge in &self.cfg {
            self.process_edge(&mut result, edge);
        }

        if result.len() > 1 {
            result[1..].sort();
        }

        result
    }

    fn process_edge(&self, result: &mut Vec<(MetaAddress, MetaAddress)>, edge: &FunctionEdge) {
        // Only direct branches (and the virtual entry edge) start a block we can bound
        match edge.ty {
            FunctionEdgeType::Invalid if !edge.source.is_valid() => {}
            FunctionEdgeType::DirectBranch => {}
            _ => return,
        }
        if !edge.destination.is_valid() {
            return;
        }

        // Find the next edge in the sorted list whose source lies past this block: its source
        // bounds the block
        let probe = FunctionEdge {
            source: edge.destination,
            destination: MetaAddress::invalid(),
            ty: FunctionEdgeType::Invalid,
        };
        let end = self
            .cfg
            .range(probe..)
            .map(|e| e.source)
            .find(|&source| source > edge.destination)
            .unwrap_or(edge.destination);

        result.push((edge.destination, end));
    }
}

/// The persistent model: all recovered functions, keyed by unique entry address.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Binary {
    pub functions: BTreeMap<MetaAddress, Function>,
}

/// A consistency problem found by [`verify_cfg`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CfgViolation {
    pub function: MetaAddress,
    pub edge: FunctionEdge,
}

/// Remap a block's branch classification to the edge type recorded in the model.
///
/// The whole-function classification values can never reach here; seeing one is a developer
/// error. `InstructionLocalCfg` maps to `Invalid`, meaning "emit no edge".
fn edge_type_for(branch: BranchType) -> FunctionEdgeType {
    match branch {
        BranchType::Invalid
        | BranchType::FakeFunction
        | BranchType::RegularFunction
        | BranchType::NoReturnFunction => {
            panic!(
                "Whole-function classification {} found in a per-block map",
                branch.name()
            )
        }

        BranchType::InstructionLocalCfg => FunctionEdgeType::Invalid,
        BranchType::FunctionLocalCfg => FunctionEdgeType::DirectBranch,
        BranchType::FakeFunctionCall => FunctionEdgeType::FakeFunctionCall,
        BranchType::FakeFunctionReturn => FunctionEdgeType::FakeFunctionReturn,
        BranchType::HandledCall => FunctionEdgeType::FunctionCall,
        // A direct call to un-lifted code degrades to an indirect call edge rather than
        // aborting: the target is simply unknown to the model
        BranchType::UnhandledCall => FunctionEdgeType::IndirectCall,
        BranchType::IndirectCall => FunctionEdgeType::IndirectCall,
        BranchType::Return => FunctionEdgeType::Return,
        BranchType::BrokenReturn => FunctionEdgeType::BrokenReturn,
        BranchType::IndirectTailCall => FunctionEdgeType::IndirectTailCall,
        BranchType::LongJmp => FunctionEdgeType::LongJmp,
        BranchType::Killer => FunctionEdgeType::Killer,
        BranchType::Unreachable => FunctionEdgeType::Unreachable,
    }
}

/// The destinations of the edge(s) leaving `block`, given its classification.
fn edge_destinations(
    program: &Program,
    block: MetaAddress,
    edge_type: FunctionEdgeType,
) -> Vec<MetaAddress> {
    let terminator = match program.block(block) {
        Some(b) => &b.terminator,
        None => return vec![MetaAddress::invalid()],
    };

    match (edge_type, terminator) {
        (FunctionEdgeType::DirectBranch, Terminator::Jump { targets, .. })
        | (FunctionEdgeType::DirectBranch, Terminator::IndirectJump { targets, .. }) => {
            // The lifter may repeat a target (e.g. both arms of a conditional); the CFG wants it
            // once
            let mut targets = targets.clone();
            targets.sort();
            targets.dedup();
            targets
        }
        (
            FunctionEdgeType::FunctionCall | FunctionEdgeType::FakeFunctionCall,
            Terminator::Call { callee, .. },
        ) => {
            vec![callee.unwrap_or_else(MetaAddress::invalid)]
        }
        _ => vec![MetaAddress::invalid()],
    }
}

/// Commit the final summary into the model as Function/FunctionEdge records.
///
/// Entry addresses must be unique; a duplicate means the caller is committing into a model that
/// already contains this analysis, which is a developer error.
pub fn commit_to_model(summary: &FunctionsSummary, program: &Program, binary: &mut Binary) {
    for description in summary.functions.values() {
        let entry = description.entry;
        assert!(entry.is_valid());
        assert!(
            !binary.functions.contains_key(&entry),
            "Function at {} committed twice",
            entry
        );

        let mut function = Function::new(entry);
        function.name = description.name.clone();
        function.ty = description.ty;

        for (&block, &branch) in &description.blocks {
            let edge_type = edge_type_for(branch);
            if edge_type == FunctionEdgeType::Invalid {
                continue;
            }

            for destination in edge_destinations(program, block, edge_type) {
                let edge = FunctionEdge {
                    source: block,
                    destination,
                    ty: edge_type,
                };
                assert!(
                    function.cfg.insert(edge),
                    "Duplicate CFG edge {} -> {} in {}",
                    block,
                    destination,
                    function.name
                );
            }
        }

        binary.functions.insert(entry, function);
    }

    if CONFIG.enable_cfg_verification {
        for violation in verify_cfg(binary) {
            warn!(
                "CFG consistency violation";
                "function" => %violation.function,
                "source" => %violation.edge.source,
                "destination" => %violation.edge.destination,
            );
        }
    }
}

/// Check, per function, that every DirectBranch edge's destination is the source of some edge of
/// the same function. Violations are collected, never fatal: an inconsistent CFG degrades the
/// model's usefulness but must not abort the pipeline.
pub fn verify_cfg(binary: &Binary) -> Vec<CfgViolation> {
    let mut violations = Vec::new();

    for function in binary.functions.values() {
        let sources: BTreeSet<MetaAddress> = function.cfg.iter().map(|e| e.source).collect();

        for edge in &function.cfg {
            if edge.ty != FunctionEdgeType::DirectBranch {
                continue;
            }
            if !edge.destination.is_valid() {
                continue;
            }
            if !sources.contains(&edge.destination) {
                violations.push(CfgViolation {
                    function: function.entry,
                    edge: *edge,
                });
            }
        }
    }

    violations
}

impl Binary {
    /// Deterministic text form: one stanza per function, functions and edges in address order.
    pub fn serialize(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        writeln!(out, "MODEL").unwrap();
        for function in self.functions.values() {
            writeln!(
                out,
                "FUNCTION\t{}\t{}\t{}",
                function.entry,
                function.name,
                function.ty.name()
            )
            .unwrap();
            for edge in &function.cfg {
                writeln!(
                    out,
                    "EDGE\t{}\t{}\t{}",
                    edge.source,
                    edge.destination,
                    edge.ty.name()
                )
                .unwrap();
            }
        }
        out
    }

    /// Parse the form produced by [`Binary::serialize`], returning `None` if unsuccessful.
    pub fn parse_from(s: &str) -> Option<Self> {
        let mut lines = s.lines();
        if lines.next()? != "MODEL" {
            return None;
        }

        let mut binary = Binary::default();
        let mut current: Option<Function> = None;

        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            match &fields[..] {
                ["FUNCTION", entry, name, ty] => {
                    if let Some(done) = current.take() {
                        binary.functions.insert(done.entry, done);
                    }
                    let mut function = Function::new(MetaAddress::parse_from(entry)?);
                    function.name = (*name).to_owned();
                    function.ty = FunctionType::from_name(ty)?;
                    current = Some(function);
                }
                ["EDGE", source, destination, ty] => {
                    let function = current.as_mut()?;
                    function.cfg.insert(FunctionEdge {
                        source: MetaAddress::parse_from(source)?,
                        destination: MetaAddress::parse_from(destination)?,
                        ty: FunctionEdgeType::from_name(ty)?,
                    });
                }
                _ => return None,
            }
        }

        if let Some(done) = current.take() {
            binary.functions.insert(done.entry, done);
        }

        Some(binary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(source: u64, destination: u64, ty: FunctionEdgeType) -> FunctionEdge {
        FunctionEdge {
            source: MetaAddress::code(source),
            destination: if destination == 0 {
                MetaAddress::invalid()
            } else {
                MetaAddress::code(destination)
            },
            ty,
        }
    }

    fn two_block_function() -> Function {
        let mut function = Function::new(MetaAddress::code(0x1000));
        function.name = "fn_0x1000".into();
        function.ty = FunctionType::Regular;
        function
            .cfg
            .insert(edge(0x1000, 0x1010, FunctionEdgeType::DirectBranch));
        function.cfg.insert(edge(0x1010, 0, FunctionEdgeType::Return));
        function
    }

    #[test]
    fn verify_accepts_consistent_cfg() {
        let mut binary = Binary::default();
        let function = two_block_function();
        binary.functions.insert(function.entry, function);
        assert!(verify_cfg(&binary).is_empty());
    }

    #[test]
    fn verify_flags_dangling_direct_branch() {
        let mut binary = Binary::default();
        let mut function = two_block_function();
        function
            .cfg
            .insert(edge(0x1010, 0x9999, FunctionEdgeType::DirectBranch));
        binary.functions.insert(function.entry, function);

        let violations = verify_cfg(&binary);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].edge.destination, MetaAddress::code(0x9999));
    }

    #[test]
    fn basic_block_ranges_bounds_blocks_by_next_edge() {
        let function = two_block_function();
        let ranges = function.basic_block_ranges();
        // Entry range first, bounded by the next block's start; the last block has no later
        // edge, so its extent is unknown (zero-length)
        assert_eq!(
            ranges[0],
            (MetaAddress::code(0x1000), MetaAddress::code(0x1010))
        );
        assert_eq!(
            ranges[1],
            (MetaAddress::code(0x1010), MetaAddress::code(0x1010))
        );
    }

    #[test]
    fn serialize_parse_round_trip() {
        let mut binary = Binary::default();
        let function = two_block_function();
        binary.functions.insert(function.entry, function);

        let mut noreturn = Function::new(MetaAddress::code(0x2000));
        noreturn.name = "fn_0x2000".into();
        noreturn.ty = FunctionType::NoReturn;
        noreturn.cfg.insert(edge(0x2000, 0, FunctionEdgeType::Killer));
        binary.functions.insert(noreturn.entry, noreturn);

        let text = binary.serialize();
        let parsed = Binary::parse_from(&text).expect("serialized model must parse back");
        assert_eq!(parsed, binary);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Binary::parse_from("not a model").is_none());
        assert!(Binary::parse_from("MODEL\nEDGE\tbroken").is_none());
    }
}
