use stackc::vm::code::{BasicBlockGraph, LinkedMethod};
use stackc::vm::module::ModuleFile;
use stackc::*;

use clap::{crate_version, value_parser, Arg, ArgMatches, Command};
use std::io;
use std::path::PathBuf;
use vm::{Error, InstructionSet, StandardInstructionSet};

fn main() -> Result<(), Error> {
    env_logger::init();

    let file_arg = || {
        Arg::new("FILE")
            .help("Module file to read")
            .required(true)
            .value_parser(value_parser!(PathBuf))
    };
    let method_arg = || {
        Arg::new("method")
            .long("method")
            .value_name("NAME")
            .help("Only show the method with this name")
    };

    let matches = Command::new("stackc")
        .version(crate_version!())
        .about("Inspects compiled modules for the stack VM")
        .subcommand_required(true)
        .subcommand(
            Command::new("verify")
                .about("Checks the checksum and method table of a module")
                .arg(file_arg()),
        )
        .subcommand(
            Command::new("disassemble")
                .about("Prints the instructions of every method")
                .arg(file_arg())
                .arg(method_arg()),
        )
        .subcommand(
            Command::new("blocks")
                .about("Prints the basic blocks of every method")
                .arg(file_arg())
                .arg(method_arg()),
        )
        .get_matches();

    let isa = StandardInstructionSet;
    match matches.subcommand() {
        Some(("verify", sub)) => {
            let module = load(sub)?;
            let program = module.decode(&isa)?;
            println!(
                "ok: {} methods, {} bytes of script, compiled by '{}' from '{}'",
                program.methods.len(),
                module.script.len(),
                module.compiler,
                module.source
            );
        }
        Some(("disassemble", sub)) => {
            let program = load(sub)?.decode(&isa)?;
            for method in selected(&program.methods, sub) {
                print_header(method);
                for (address, _, insn) in &method.instructions {
                    println!("  {:>6}  {}", address.0, insn);
                }
            }
        }
        Some(("blocks", sub)) => {
            let program = load(sub)?.decode(&isa)?;
            for method in selected(&program.methods, sub) {
                print_header(method);
                print_blocks(method, &isa)?;
            }
        }
        _ => (),
    }

    Ok(())
}

fn load(matches: &ArgMatches) -> Result<ModuleFile, Error> {
    let path = matches
        .get_one::<PathBuf>("FILE")
        .ok_or_else(|| Error::IoError(io::Error::new(io::ErrorKind::InvalidInput, "no file")))?;
    log::info!("Reading '{}'", path.display());
    ModuleFile::load_from_path(path)
}

fn selected<'p>(
    methods: &'p [LinkedMethod],
    matches: &ArgMatches,
) -> impl Iterator<Item = &'p LinkedMethod> {
    let wanted = matches.get_one::<String>("method").cloned();
    methods
        .iter()
        .filter(move |method| wanted.as_ref().map_or(true, |name| &method.name == name))
}

fn print_header(method: &LinkedMethod) {
    println!(
        "{} ({} params, {} locals, flags {:?}) @ {}..{}",
        method.name,
        method.params,
        method.locals,
        method.flags,
        method.start().0,
        method.end().0
    );
}

fn print_blocks(method: &LinkedMethod, isa: &dyn InstructionSet) -> Result<(), Error> {
    let graph = BasicBlockGraph::build(method, isa)?;
    let reachable = graph.reachable();
    for (idx, block) in graph.blocks().iter().enumerate() {
        let successors: Vec<String> = graph
            .successors(vm::code::BlockId(idx))
            .map(|id| format!("B{}", id.0))
            .collect();
        let predecessors: Vec<String> = block
            .predecessors
            .iter()
            .map(|id| format!("B{}", id.0))
            .collect();
        println!(
            "  B{} @ {} ({} instructions, {:?}){}",
            idx,
            block.start.0,
            block.instructions.len(),
            graph.terminator_flow(vm::code::BlockId(idx)),
            if reachable[idx] { "" } else { " unreachable" }
        );
        println!("      preds: [{}]", predecessors.join(", "));
        println!("      succs: [{}]", successors.join(", "));
    }
    Ok(())
}
