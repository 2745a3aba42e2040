//! Block-annotation metadata derived from the final summary: one record per recovered function,
//! one per call site, and a membership record per basic block.
//!
//! These are explicit structures with their own text form, produced once after finalization and
//! handed to downstream consumers; nothing is mutated in place on the underlying code.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::address::MetaAddress;
use crate::program::Program;
use crate::register_usage::RegisterSlot;
use crate::results::FunctionsSummary;
use crate::summary::{BranchType, FunctionType};

/// The `(register, argument, return value)` triple attached to functions and call sites.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SlotTriple {
    pub register: String,
    pub argument: &'static str,
    pub return_value: &'static str,
}

/// The `func.entry` record: everything a consumer needs to know about one function.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FunctionEntryRecord {
    pub name: String,
    pub address: MetaAddress,
    pub ty: FunctionType,
    pub clobbered: Vec<String>,
    pub slots: Vec<SlotTriple>,
}

/// The `func.call` record for one call site.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CallSiteRecord {
    pub function: MetaAddress,
    pub block: MetaAddress,
    pub slots: Vec<SlotTriple>,
}

/// The `func.member.of` record: which functions claim a block, and with what branch
/// classification.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MemberOfRecord {
    pub block: MetaAddress,
    pub members: Vec<(MetaAddress, BranchType)>,
}

/// All annotation records for one analysis run.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Annotations {
    pub entries: Vec<FunctionEntryRecord>,
    pub call_sites: Vec<CallSiteRecord>,
    pub member_of: Vec<MemberOfRecord>,
}

fn slot_triples(
    program: &Program,
    slots: &BTreeMap<usize, RegisterSlot>,
) -> Vec<SlotTriple> {
    slots
        .iter()
        .filter(|(&r, _)| !program.registers.is_service_register(r))
        .map(|(&r, slot)| SlotTriple {
            register: program.registers.name(r).to_owned(),
            argument: slot.argument.value_name(),
            return_value: slot.return_value.value_name(),
        })
        .collect()
}

/// Build the annotation records from the final summary. Slot triples are emitted only when the
/// ABI analysis ran; service registers are excluded from clobber lists and slots throughout.
pub fn build(summary: &FunctionsSummary, program: &Program, analyze_abi: bool) -> Annotations {
    let mut annotations = Annotations::default();

    // Accumulate memberships here so each block gets a single record at the end
    let mut member_of: BTreeMap<MetaAddress, Vec<(MetaAddress, BranchType)>> = BTreeMap::new();

    for function in summary.functions.values() {
        if function.blocks.is_empty() {
            continue;
        }

        let clobbered = function
            .clobbered
            .iter()
            .filter(|&&r| !program.registers.is_service_register(r))
            .map(|&r| program.registers.name(r).to_owned())
            .collect();

        annotations.entries.push(FunctionEntryRecord {
            name: function.name.clone(),
            address: function.entry,
            ty: function.ty,
            clobbered,
            slots: if analyze_abi {
                slot_triples(program, &function.slots)
            } else {
                Vec::new()
            },
        });

        if analyze_abi {
            for site in &function.call_sites {
                annotations.call_sites.push(CallSiteRecord {
                    function: function.entry,
                    block: site.block,
                    slots: slot_triples(program, &site.slots),
                });
            }
        }

        for (&block, &branch) in &function.blocks {
            member_of
                .entry(block)
                .or_default()
                .push((function.entry, branch));
        }
    }

    annotations.member_of = member_of
        .into_iter()
        .map(|(block, members)| MemberOfRecord { block, members })
        .collect();

    annotations
}

impl Annotations {
    /// Serialize all records to the tab-separated text form.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        self.serialize_to(&mut out).unwrap();
        out
    }

    fn serialize_to(&self, f: &mut String) -> std::fmt::Result {
        use std::fmt::Write;

        writeln!(f, "FUNC_ENTRY")?;
        for entry in &self.entries {
            writeln!(
                f,
                "\t{}\t{}\t{}\t{{{}}}\t{{{}}}",
                entry.name,
                entry.address,
                entry.ty.name(),
                entry.clobbered.iter().join(" "),
                entry
                    .slots
                    .iter()
                    .map(|s| format!("({} {} {})", s.register, s.argument, s.return_value))
                    .join(" "),
            )?;
        }
        writeln!(f)?;

        writeln!(f, "FUNC_CALL")?;
        for site in &self.call_sites {
            writeln!(
                f,
                "\t{}\t{}\t{{{}}}",
                site.function,
                site.block,
                site.slots
                    .iter()
                    .map(|s| format!("({} {} {})", s.register, s.argument, s.return_value))
                    .join(" "),
            )?;
        }
        writeln!(f)?;

        writeln!(f, "FUNC_MEMBER_OF")?;
        for record in &self.member_of {
            writeln!(
                f,
                "\t{}\t{{{}}}",
                record.block,
                record
                    .members
                    .iter()
                    .map(|(entry, branch)| format!("({} {})", entry, branch.name()))
                    .join(" "),
            )?;
        }

        Ok(())
    }
}
