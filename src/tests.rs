use crate::address::MetaAddress;
use crate::program::{
    BasicBlock, BlockKind, JtReason, JtReasons, Program, RegisterFile, Terminator,
};

#[cfg(test)]
use crate::interprocedural::run_analysis;
#[cfg(test)]
use crate::summary::{BranchType, FunctionType};

/// The register file used by all test programs: pc, sp and three general-purpose registers
/// (indices 2, 3, 4).
pub fn test_registers() -> RegisterFile {
    RegisterFile::new(
        vec![
            "pc".into(),
            "sp".into(),
            "r0".into(),
            "r1".into(),
            "r2".into(),
        ],
        0,
        1,
    )
}

pub const R0: usize = 2;
pub const R1: usize = 3;
pub const R2: usize = 4;

fn jump_target(start: u64, reasons: JtReasons) -> BasicBlock {
    BasicBlock {
        start: MetaAddress::code(start),
        kind: BlockKind::JumpTarget,
        reasons,
        reads: vec![],
        writes: vec![],
        terminator: Terminator::Return { broken: false },
    }
}

fn translated(start: u64) -> BasicBlock {
    BasicBlock {
        start: MetaAddress::code(start),
        kind: BlockKind::Translated,
        reasons: JtReasons::empty(),
        reads: vec![],
        writes: vec![],
        terminator: Terminator::Return { broken: false },
    }
}

fn call_to(callee: u64, return_address: u64) -> Terminator {
    Terminator::Call {
        callee: Some(MetaAddress::code(callee)),
        return_address: MetaAddress::code(return_address),
        synthetic: false,
    }
}

/// The three-block scenario: `main` (forced) directly calls `f`, which clobbers r1 and returns;
/// a fourth "dead" block is known only from unused global data.
pub fn call_pair_program() -> Program {
    let mut program = Program::new("call_pair", test_registers());

    let mut main = jump_target(0x1000, JtReasons::empty().with(JtReason::FunctionSymbol));
    main.terminator = call_to(0x2000, 0x1008);
    program.add_block(main);

    program.add_block(translated(0x1008));

    let mut f = jump_target(0x2000, JtReasons::empty().with(JtReason::Callee));
    f.writes = vec![R1];
    program.add_block(f);

    program.add_block(jump_target(
        0x3000,
        JtReasons::empty().with(JtReason::UnusedGlobalData),
    ));

    program
}

/// `main` sets up r0, calls `f` (which reads r0 and writes r1), then reads r1 after the return.
pub fn abi_program() -> Program {
    let mut program = Program::new("abi", test_registers());

    let mut main = jump_target(0x1000, JtReasons::empty().with(JtReason::FunctionSymbol));
    main.writes = vec![R0];
    main.terminator = call_to(0x2000, 0x1008);
    program.add_block(main);

    let mut after = translated(0x1008);
    after.reads = vec![R1];
    program.add_block(after);

    let mut f = jump_target(0x2000, JtReasons::empty().with(JtReason::Callee));
    f.reads = vec![R0];
    f.writes = vec![R1];
    program.add_block(f);

    program
}

/// `f` calls itself, then returns.
pub fn self_recursive_program() -> Program {
    let mut program = Program::new("self_recursive", test_registers());

    let mut f = jump_target(0x1000, JtReasons::empty().with(JtReason::FunctionSymbol));
    f.writes = vec![R0];
    f.terminator = Terminator::Jump {
        targets: vec![MetaAddress::code(0x1004), MetaAddress::code(0x1010)],
        instruction_local: false,
    };
    program.add_block(f);

    let mut recurse = translated(0x1004);
    recurse.terminator = call_to(0x1000, 0x1010);
    program.add_block(recurse);

    program.add_block(translated(0x1010));

    program
}

/// `f` and `g` call each other, with a conditional escape to a return in each.
pub fn mutual_recursion_program() -> Program {
    let mut program = Program::new("mutual_recursion", test_registers());

    for (entry, other, writes) in [(0x1000u64, 0x2000u64, R0), (0x2000, 0x1000, R1)] {
        let mut head = jump_target(entry, JtReasons::empty().with(JtReason::Callee));
        head.writes = vec![writes];
        head.terminator = Terminator::Jump {
            targets: vec![
                MetaAddress::code(entry + 0x4),
                MetaAddress::code(entry + 0x10),
            ],
            instruction_local: false,
        };
        program.add_block(head);

        let mut call = translated(entry + 0x4);
        call.terminator = call_to(other, entry + 0x10);
        program.add_block(call);

        program.add_block(translated(entry + 0x10));
    }

    program
}

/// `exit` never returns (killer); `main` calls it and has a fallthrough that is never reachable.
pub fn noreturn_program() -> Program {
    let mut program = Program::new("noreturn", test_registers());

    let mut main = jump_target(0x1000, JtReasons::empty().with(JtReason::FunctionSymbol));
    main.terminator = call_to(0x2000, 0x1008);
    program.add_block(main);

    program.add_block(translated(0x1008));

    let mut exit = jump_target(0x2000, JtReasons::empty().with(JtReason::Callee));
    exit.terminator = Terminator::Killer;
    program.add_block(exit);

    program
}

/// `caller` reaches a code fragment through a synthetic call marker: the fragment has no real
/// call/return discipline and becomes a fake function.
pub fn fake_function_program() -> Program {
    let mut program = Program::new("fake", test_registers());

    let mut caller = jump_target(0x1000, JtReasons::empty().with(JtReason::FunctionSymbol));
    caller.terminator = Terminator::Call {
        callee: Some(MetaAddress::code(0x2000)),
        return_address: MetaAddress::code(0x1008),
        synthetic: true,
    };
    program.add_block(caller);

    program.add_block(translated(0x1008));

    let mut fragment = jump_target(0x2000, JtReasons::empty().with(JtReason::Callee));
    fragment.writes = vec![R2];
    program.add_block(fragment);

    program
}

/// `a` (forced) owns two blocks; `b` (candidate) can reach everything `a` can, plus its own
/// entry block.
pub fn force_precedence_program() -> Program {
    let mut program = Program::new("force_precedence", test_registers());

    let mut b = jump_target(0x1000, JtReasons::empty().with(JtReason::UnusedGlobalData));
    b.terminator = Terminator::Jump {
        targets: vec![MetaAddress::code(0x2000)],
        instruction_local: false,
    };
    program.add_block(b);

    let mut a = jump_target(0x2000, JtReasons::empty().with(JtReason::FunctionSymbol));
    a.terminator = Terminator::Jump {
        targets: vec![MetaAddress::code(0x2010)],
        instruction_local: false,
    };
    program.add_block(a);

    program.add_block(translated(0x2010));

    program
}

/// `main` (forced) calls `helper`, whose only jump-target evidence is weak; the helper must end
/// up covered by the force pass and skipped by the candidate pass.
pub fn callee_covered_candidate_program() -> Program {
    let mut program = Program::new("callee_covered", test_registers());

    let mut main = jump_target(0x1000, JtReasons::empty().with(JtReason::FunctionSymbol));
    main.terminator = call_to(0x2000, 0x1008);
    program.add_block(main);

    program.add_block(translated(0x1008));

    let mut helper = jump_target(0x2000, JtReasons::empty().with(JtReason::UnusedGlobalData));
    helper.writes = vec![R0];
    program.add_block(helper);

    program
}

#[cfg(test)]
mod integration {
    use super::*;
    use crate::program::IndirectKind;
    use crate::register_usage::UsageLattice;

    #[test]
    fn end_to_end_call_pair() {
        let program = call_pair_program();
        let summary = run_analysis(&program, false);

        assert_eq!(summary.functions.len(), 3);

        let main = &summary.functions[&MetaAddress::code(0x1000)];
        assert_eq!(main.ty, FunctionType::Regular);
        assert_eq!(
            main.blocks[&MetaAddress::code(0x1000)],
            BranchType::HandledCall
        );
        assert_eq!(main.blocks[&MetaAddress::code(0x1008)], BranchType::Return);
        // main's clobbers are exactly what f does to r1
        assert!(main.clobbered.iter().eq([&R1]));

        let f = &summary.functions[&MetaAddress::code(0x2000)];
        assert_eq!(f.ty, FunctionType::Regular);
        assert!(f.clobbered.iter().eq([&R1]));

        // The dead block was not claimed by anyone, so it is its own candidate function
        let dead = &summary.functions[&MetaAddress::code(0x3000)];
        assert_eq!(dead.ty, FunctionType::Regular);
        assert!(dead.blocks.contains_key(&MetaAddress::code(0x3000)));
    }

    #[test]
    fn end_to_end_model_commit() {
        use crate::model::{self, FunctionEdge, FunctionEdgeType};

        let program = call_pair_program();
        let summary = run_analysis(&program, false);

        let mut binary = model::Binary::default();
        model::commit_to_model(&summary, &program, &mut binary);

        let main = &binary.functions[&MetaAddress::code(0x1000)];
        assert!(main.cfg.contains(&FunctionEdge {
            source: MetaAddress::code(0x1000),
            destination: MetaAddress::code(0x2000),
            ty: FunctionEdgeType::FunctionCall,
        }));

        // Round-trip: the text form reproduces the same entries, names, types and edges
        let parsed = model::Binary::parse_from(&binary.serialize()).unwrap();
        assert_eq!(parsed, binary);
    }

    #[test]
    fn abi_analysis_recovers_arguments_and_return_values() {
        let program = abi_program();
        let summary = run_analysis(&program, true);

        let f = &summary.functions[&MetaAddress::code(0x2000)];
        assert_eq!(f.slots[&R0].argument, UsageLattice::Yes);
        assert_eq!(f.slots[&R1].argument, UsageLattice::No);
        assert_eq!(f.slots[&R1].return_value, UsageLattice::Yes);
        assert_eq!(f.slots[&R0].return_value, UsageLattice::No);

        let main = &summary.functions[&MetaAddress::code(0x1000)];
        // main consumes r0 itself; it takes no arguments
        assert_eq!(main.slots[&R0].argument, UsageLattice::No);

        // At the call site, the callee's view flows in through the join
        let site = &main.call_sites[0];
        assert_eq!(site.callee, MetaAddress::code(0x2000));
        assert_eq!(site.slots[&R0].argument, UsageLattice::Yes);
        assert_eq!(site.slots[&R1].return_value, UsageLattice::Yes);
        assert_eq!(site.slots[&R2].return_value, UsageLattice::No);
    }

    #[test]
    fn self_recursion_converges() {
        let program = self_recursive_program();
        let summary = run_analysis(&program, true);

        let f = &summary.functions[&MetaAddress::code(0x1000)];
        assert_eq!(f.ty, FunctionType::Regular);
        assert!(f.recursive);
        // The conservative seed for the recursive callee never shrinks below "everything"
        assert!(f.clobbered.contains(&R0));
        assert_eq!(f.blocks[&MetaAddress::code(0x1004)], BranchType::HandledCall);
    }

    #[test]
    fn mutual_recursion_converges() {
        let program = mutual_recursion_program();
        let summary = run_analysis(&program, true);

        let f = &summary.functions[&MetaAddress::code(0x1000)];
        let g = &summary.functions[&MetaAddress::code(0x2000)];
        assert_eq!(f.ty, FunctionType::Regular);
        assert_eq!(g.ty, FunctionType::Regular);
        assert!(f.clobbered.contains(&R0));
        assert!(g.clobbered.contains(&R1));
    }

    #[test]
    fn noreturn_propagates_to_callers() {
        let program = noreturn_program();
        let summary = run_analysis(&program, false);

        let exit = &summary.functions[&MetaAddress::code(0x2000)];
        assert_eq!(exit.ty, FunctionType::NoReturn);
        assert_eq!(exit.blocks[&MetaAddress::code(0x2000)], BranchType::Killer);

        // Nothing past the call to a noreturn callee is reachable, so main never returns either
        let main = &summary.functions[&MetaAddress::code(0x1000)];
        assert_eq!(main.ty, FunctionType::NoReturn);
        assert!(!main.blocks.contains_key(&MetaAddress::code(0x1008)));
    }

    #[test]
    fn fake_functions_are_inlined_and_registered() {
        let program = fake_function_program();
        let summary = run_analysis(&program, false);

        let caller = &summary.functions[&MetaAddress::code(0x1000)];
        assert_eq!(caller.ty, FunctionType::Regular);
        assert_eq!(
            caller.blocks[&MetaAddress::code(0x1000)],
            BranchType::FakeFunctionCall
        );
        // The fragment's blocks belong to the caller, and its effects flow through directly
        assert_eq!(
            caller.blocks[&MetaAddress::code(0x2000)],
            BranchType::FakeFunctionReturn
        );
        assert!(caller.clobbered.iter().eq([&R2]));

        // The fragment itself is registered as a fake function with no summary of its own
        let fake = &summary.functions[&MetaAddress::code(0x2000)];
        assert_eq!(fake.ty, FunctionType::Fake);
        assert!(fake.blocks.is_empty());
    }

    #[test]
    fn forced_entries_own_their_blocks() {
        let program = force_precedence_program();
        let summary = run_analysis(&program, false);

        // a was forced, so it claims its blocks even though b can reach all of them
        let a = &summary.functions[&MetaAddress::code(0x2000)];
        assert_eq!(a.ty, FunctionType::Regular);
        assert!(a.blocks.contains_key(&MetaAddress::code(0x2000)));
        assert!(a.blocks.contains_key(&MetaAddress::code(0x2010)));

        // b still exists, but a's blocks are excluded from it
        let b = &summary.functions[&MetaAddress::code(0x1000)];
        assert!(b.blocks.contains_key(&MetaAddress::code(0x1000)));
        assert!(!b.blocks.contains_key(&MetaAddress::code(0x2000)));
        assert!(!b.blocks.contains_key(&MetaAddress::code(0x2010)));
    }

    #[test]
    fn candidates_covered_by_the_force_pass_are_not_rerun() {
        let program = callee_covered_candidate_program();
        let summary = run_analysis(&program, false);

        // helper was analyzed as a callee of main and registered from the cache
        let helper = &summary.functions[&MetaAddress::code(0x2000)];
        assert_eq!(helper.ty, FunctionType::Regular);
        assert!(helper.blocks.contains_key(&MetaAddress::code(0x2000)));
        assert!(helper.clobbered.contains(&R0));

        let main = &summary.functions[&MetaAddress::code(0x1000)];
        assert!(!main.blocks.contains_key(&MetaAddress::code(0x2000)));
    }

    #[test]
    fn unresolved_callees_degrade_to_unknown() {
        // A call to an address with no lifted block: everything about it is uncertain
        let mut program = Program::new("unresolved", test_registers());
        let mut main = jump_target(0x1000, JtReasons::empty().with(JtReason::FunctionSymbol));
        main.terminator = call_to(0x9000, 0x1008);
        program.add_block(main);
        program.add_block(translated(0x1008));

        let summary = run_analysis(&program, true);
        let main = &summary.functions[&MetaAddress::code(0x1000)];
        assert_eq!(
            main.blocks[&MetaAddress::code(0x1000)],
            BranchType::UnhandledCall
        );
        // Conservative fold: the unknown callee may clobber anything
        assert_eq!(main.clobbered.len(), program.registers.len());
        assert_eq!(main.call_sites[0].slots[&R0].argument, UsageLattice::Unknown);
    }

    #[test]
    fn annotations_exclude_service_registers() {
        let program = abi_program();
        let summary = run_analysis(&program, true);
        let annotations = crate::annotate::build(&summary, &program, true);

        for entry in &annotations.entries {
            assert!(entry.clobbered.iter().all(|r| r != "pc" && r != "sp"));
            assert!(entry
                .slots
                .iter()
                .all(|s| s.register != "pc" && s.register != "sp"));
        }
        assert!(!annotations.call_sites.is_empty());
        assert!(!annotations.member_of.is_empty());
    }

    #[test]
    fn dump_and_reports_render() {
        let program = call_pair_program();
        let summary = run_analysis(&program, false);

        let dump = summary.dump(&program);
        assert!(dump.contains("fn_0x1000"));
        assert!(dump.contains("HandledCall"));

        let clobbered = summary.clobbered_report(&program);
        assert!(clobbered.contains("fn_0x2000: r1"));

        let dot = crate::callgraph_dot::generate_dot(&summary);
        assert!(dot.contains("digraph CallGraph"));
        assert!(dot.contains("fn_0x2000"));
    }

    #[test]
    fn get_clobbered_is_total() {
        let program = call_pair_program();
        let summary = run_analysis(&program, false);
        assert!(summary
            .get_clobbered(MetaAddress::code(0x2000))
            .contains(&R1));
        assert!(summary.get_clobbered(MetaAddress::code(0xdead)).is_empty());
    }

    #[test]
    fn loader_feeds_the_analysis() {
        let text = "\
PROGRAM
name loaded

REGISTERS
pc pc
sp sp
reg r0
reg r1

BLOCKS

block 0x1000 JumpTargetBlock FunctionSymbol
call 0x2000 0x1008

block 0x1008 TranslatedBlock -
return

block 0x2000 JumpTargetBlock Callee
writes r1
return
";
        let program = crate::loader::load_from(text);
        let summary = run_analysis(&program, false);
        assert_eq!(summary.functions.len(), 2);
        let f = &summary.functions[&MetaAddress::code(0x2000)];
        assert!(f.clobbered.contains(&3)); // r1 in this four-register file
    }

    #[test]
    fn instruction_local_edges_stay_out_of_the_model() {
        use crate::model::{self, FunctionEdgeType};

        let mut program = Program::new("instr_local", test_registers());
        let mut entry = jump_target(0x1000, JtReasons::empty().with(JtReason::FunctionSymbol));
        entry.terminator = Terminator::Jump {
            targets: vec![MetaAddress::code(0x1004)],
            instruction_local: true,
        };
        program.add_block(entry);
        program.add_block(translated(0x1004));

        let summary = run_analysis(&program, false);
        let function = &summary.functions[&MetaAddress::code(0x1000)];
        assert_eq!(
            function.blocks[&MetaAddress::code(0x1000)],
            BranchType::InstructionLocalCfg
        );

        let mut binary = model::Binary::default();
        model::commit_to_model(&summary, &program, &mut binary);
        let committed = &binary.functions[&MetaAddress::code(0x1000)];
        assert!(committed
            .cfg
            .iter()
            .all(|e| e.ty != FunctionEdgeType::Invalid && e.source != MetaAddress::code(0x1000)));
    }

    #[test]
    fn indirect_tail_calls_count_as_returning() {
        let mut program = Program::new("tailcall", test_registers());
        let mut entry = jump_target(0x1000, JtReasons::empty().with(JtReason::FunctionSymbol));
        entry.terminator = Terminator::IndirectJump {
            kind: IndirectKind::TailCall,
            targets: vec![],
        };
        program.add_block(entry);

        let summary = run_analysis(&program, false);
        let function = &summary.functions[&MetaAddress::code(0x1000)];
        assert_eq!(function.ty, FunctionType::Regular);
        assert_eq!(
            function.blocks[&MetaAddress::code(0x1000)],
            BranchType::IndirectTailCall
        );
    }
}
