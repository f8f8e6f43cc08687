use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use aptscript::{decompile, parse_listing, InstructionStream, Outcome, PoolEntry, VirtualMachine};

#[derive(Parser)]
#[command(name = "aptscript", version, about = "Bytecode interpreter and decompiler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a listing and print trace output and the final result.
    Run {
        file: PathBuf,
        /// Constant pool entry; repeat the flag for each slot.
        #[arg(short = 'c', long = "constant")]
        constants: Vec<String>,
    },
    /// Reconstruct pseudo-source from a listing.
    Decompile {
        file: PathBuf,
        #[arg(short = 'c', long = "constant")]
        constants: Vec<String>,
    },
    /// Print the parsed listing as JSON.
    Dump { file: PathBuf },
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), String> {
    match cli.command {
        Command::Run { file, constants } => {
            let stream = load(&file)?;
            let pool = string_pool(&constants);
            let mut vm = VirtualMachine::new();
            let outcome = vm
                .run_stream(stream, &pool)
                .map_err(|e| format!("execution failed: {e}"))?;
            for line in &vm.trace_log {
                println!("{line}");
            }
            match outcome {
                Outcome::Result(value) => println!("=> {value}"),
                Outcome::Thrown(value) => return Err(format!("uncaught: {value}")),
            }
            Ok(())
        }
        Command::Decompile { file, constants } => {
            let stream = load(&file)?;
            let pool = string_pool(&constants);
            let output = decompile(&stream, &pool);
            print!("{}", output.source);
            for diagnostic in &output.diagnostics {
                eprintln!("// {diagnostic}");
            }
            Ok(())
        }
        Command::Dump { file } => {
            let stream = load(&file)?;
            let json = serde_json::to_string_pretty(&stream)
                .map_err(|e| format!("serialization failed: {e}"))?;
            println!("{json}");
            Ok(())
        }
    }
}

fn load(path: &PathBuf) -> Result<InstructionStream, String> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    parse_listing(&source).map_err(|e| format!("{}: {e}", path.display()))
}

fn string_pool(constants: &[String]) -> Vec<PoolEntry> {
    constants.iter().map(|c| PoolEntry::Str(c.clone())).collect()
}
