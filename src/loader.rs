//! A loader for `.blocks-exported` files: the text form in which the external disassembler/lifter
//! hands over its basic blocks, register file, and jump-target metadata.
//!
//! This is the I/O boundary of the crate; after [`load_from`] returns, the analysis runs without
//! touching the filesystem. Malformed input is a hard error: the exporter and this loader must
//! agree on the format, so a parse failure is a bug on one of the two sides, not a recoverable
//! condition.

use itertools::Itertools;

use crate::address::MetaAddress;
use crate::program::{
    BasicBlock, BlockKind, IndirectKind, JtReason, JtReasons, Program, RegisterFile, Terminator,
};

/// Parse an address: either the full structured form (`0:0:Code:0x400000`) or a bare hex value,
/// which is shorthand for a code address in the default space and epoch.
fn parse_address(s: &str) -> MetaAddress {
    if let Some(addr) = MetaAddress::parse_from(s) {
        return addr;
    }
    if let Some(hex) = s.strip_prefix("0x") {
        if let Ok(value) = u64::from_str_radix(hex, 16) {
            return MetaAddress::code(value);
        }
    }
    panic!("Expected an address, got {:?}", s)
}

fn parse_reasons(s: &str) -> JtReasons {
    if s == "-" {
        return JtReasons::empty();
    }
    s.split('|')
        .map(|name| {
            JtReason::from_name(name)
                .unwrap_or_else(|| panic!("Unknown jump-target reason {:?}", name))
        })
        .collect()
}

fn parse_register_list(tokens: &[&str], registers: &RegisterFile) -> Vec<usize> {
    tokens
        .iter()
        .map(|name| {
            registers
                .index_of(name)
                .unwrap_or_else(|| panic!("Unknown register {:?}", name))
        })
        .collect()
}

fn parse_terminator(line: &str) -> Terminator {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match &*tokens {
        ["jump", "instruction-local", targets @ ..] => Terminator::Jump {
            targets: targets.iter().map(|t| parse_address(t)).collect(),
            instruction_local: true,
        },
        ["jump", targets @ ..] => Terminator::Jump {
            targets: targets.iter().map(|t| parse_address(t)).collect(),
            instruction_local: false,
        },
        ["call", callee, return_address, rest @ ..] => {
            let synthetic = match rest {
                [] => false,
                ["synthetic"] => true,
                l => panic!("Trailing tokens on call terminator: {:?}", l),
            };
            Terminator::Call {
                callee: (*callee != "indirect").then(|| parse_address(callee)),
                return_address: parse_address(return_address),
                synthetic,
            }
        }
        ["indirect", kind, targets @ ..] => Terminator::IndirectJump {
            kind: IndirectKind::from_name(kind)
                .unwrap_or_else(|| panic!("Unknown indirect-branch kind {:?}", kind)),
            targets: targets.iter().map(|t| parse_address(t)).collect(),
        },
        ["return"] => Terminator::Return { broken: false },
        ["return", "broken"] => Terminator::Return { broken: true },
        ["killer"] => Terminator::Killer,
        ["unreachable"] => Terminator::Unreachable,
        l => panic!("Expected a terminator, got {:?}", l),
    }
}

fn parse_block(stanza: &str, registers: &RegisterFile) -> BasicBlock {
    let mut lines = stanza.lines().map(str::trim).filter(|l| !l.is_empty());

    let header = lines.next().unwrap();
    let (start, kind, reasons) = match &*header.split_whitespace().collect::<Vec<_>>() {
        ["block", start, kind, reasons] => (
            parse_address(start),
            BlockKind::from_name(kind)
                .unwrap_or_else(|| panic!("Unknown block kind {:?}", kind)),
            parse_reasons(reasons),
        ),
        l => panic!("Expected `block <addr> <kind> <reasons>`, got {:?}", l),
    };

    let mut reads = vec![];
    let mut writes = vec![];
    let mut terminator = None;
    for line in lines {
        match &*line.split_whitespace().collect::<Vec<_>>() {
            ["reads", names @ ..] => reads = parse_register_list(names, registers),
            ["writes", names @ ..] => writes = parse_register_list(names, registers),
            _ => {
                assert!(
                    terminator.is_none(),
                    "Block {} has more than one terminator line",
                    start
                );
                terminator = Some(parse_terminator(line));
            }
        }
    }

    BasicBlock {
        start,
        kind,
        reasons,
        reads,
        writes,
        terminator: terminator
            .unwrap_or_else(|| panic!("Block {} has no terminator line", start)),
    }
}

/// Load a `.blocks-exported` program from its textual form.
pub fn load_from(blocks_exported: &str) -> Program {
    // Sanity check that we have a loadable `.blocks-exported` file
    assert!(blocks_exported.starts_with("PROGRAM\n"));
    assert!(blocks_exported.contains("REGISTERS\n"));
    assert!(blocks_exported.contains("BLOCKS"));

    // Grab the sections
    let mut sections = blocks_exported.trim().split("\n\n");
    let program_section: &str = sections
        .next()
        .unwrap()
        .strip_prefix("PROGRAM\n")
        .unwrap()
        .trim();
    let registers_section: &str = sections
        .next()
        .unwrap()
        .strip_prefix("REGISTERS\n")
        .unwrap()
        .trim();
    let block_stanzas = {
        let mut s: Vec<&str> = sections.map(|x| x.trim()).collect();
        assert!(!s.is_empty());
        s[0] = s[0].strip_prefix("BLOCKS").unwrap().trim();
        if s[0].is_empty() {
            s.into_iter().skip(1).collect()
        } else {
            s
        }
    };

    // Parse the program section
    let program_name = match &*program_section
        .lines()
        .next()
        .unwrap()
        .split_whitespace()
        .collect::<Vec<_>>()
    {
        ["name", n] => (*n).to_owned(),
        l => panic!("Expected `name`, got {:?}", l),
    };

    // Parse the register file: `pc`/`sp` declare the service registers, `reg` the rest; indices
    // are assigned in order of appearance
    let mut names = vec![];
    let mut pc = None;
    let mut sp = None;
    for line in registers_section.lines() {
        match &*line.trim().split_whitespace().collect::<Vec<_>>() {
            ["pc", name] => {
                assert!(pc.is_none(), "Duplicate pc declaration");
                pc = Some(names.len());
                names.push((*name).to_owned());
            }
            ["sp", name] => {
                assert!(sp.is_none(), "Duplicate sp declaration");
                sp = Some(names.len());
                names.push((*name).to_owned());
            }
            ["reg", name] => names.push((*name).to_owned()),
            l => panic!("Expected a register declaration, got {:?}", l),
        }
    }
    assert!(
        names.iter().duplicates().next().is_none(),
        "Register names must be unique"
    );
    let registers = RegisterFile::new(
        names,
        pc.expect("The register file declares no pc"),
        sp.expect("The register file declares no sp"),
    );

    // Parse the block stanzas
    let mut program = Program::new(program_name, registers.clone());
    for stanza in block_stanzas {
        program.add_block(parse_block(stanza, &registers));
    }

    program
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINY: &str = "\
PROGRAM
name tiny

REGISTERS
pc pc
sp sp
reg r0
reg r1

BLOCKS

block 0x1000 JumpTargetBlock FunctionSymbol
writes r0
call 0x2000 0x1008

block 0x1008 TranslatedBlock -
reads r0
return

block 0x2000 JumpTargetBlock Callee
writes r1
return
";

    #[test]
    fn loads_a_tiny_program() {
        let program = load_from(TINY);
        assert_eq!(program.name, "tiny");
        assert_eq!(program.registers.len(), 4);
        assert_eq!(program.registers.pc(), 0);
        assert_eq!(program.registers.sp(), 1);
        assert_eq!(program.block_count(), 3);

        let entry = program.block(MetaAddress::code(0x1000)).unwrap();
        assert_eq!(entry.kind, BlockKind::JumpTarget);
        assert!(entry.reasons.has(JtReason::FunctionSymbol));
        assert_eq!(entry.writes, vec![2]);
        match &entry.terminator {
            Terminator::Call {
                callee,
                return_address,
                synthetic,
            } => {
                assert_eq!(*callee, Some(MetaAddress::code(0x2000)));
                assert_eq!(*return_address, MetaAddress::code(0x1008));
                assert!(!synthetic);
            }
            t => panic!("Unexpected terminator {:?}", t),
        }
    }

    #[test]
    fn parses_terminator_variants() {
        assert_eq!(
            parse_terminator("jump 0x10 0x20"),
            Terminator::Jump {
                targets: vec![MetaAddress::code(0x10), MetaAddress::code(0x20)],
                instruction_local: false,
            }
        );
        assert_eq!(
            parse_terminator("jump instruction-local 0x10"),
            Terminator::Jump {
                targets: vec![MetaAddress::code(0x10)],
                instruction_local: true,
            }
        );
        assert_eq!(
            parse_terminator("call indirect 0x30"),
            Terminator::Call {
                callee: None,
                return_address: MetaAddress::code(0x30),
                synthetic: false,
            }
        );
        assert_eq!(
            parse_terminator("indirect tailcall"),
            Terminator::IndirectJump {
                kind: IndirectKind::TailCall,
                targets: vec![],
            }
        );
        assert_eq!(parse_terminator("return broken"), Terminator::Return { broken: true });
    }

    #[test]
    #[should_panic(expected = "no terminator")]
    fn block_without_terminator_is_rejected() {
        let registers = RegisterFile::new(vec!["pc".into(), "sp".into()], 0, 1);
        parse_block("block 0x1000 TranslatedBlock -\nreads pc", &registers);
    }
}
