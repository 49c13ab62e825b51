//! `lumen` — the command-line entry point: run a single script file
//! (spec.md §6). One positional argument, no subcommands: Lumen has no
//! REPL, bytecode dump, or package manager in scope.

use camino::Utf8PathBuf;
use clap::Parser;
use lumen_core::Error;

/// Run a Lumen script.
#[derive(Parser)]
#[command(name = "lumen", version, about = "Run a Lumen script")]
struct Cli {
    /// Path to the `.lm` entry script.
    script: Utf8PathBuf,
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(&cli.script) {
        eprintln!("{}", format_error(&cli.script, &e));
        std::process::exit(1);
    }
    Ok(())
}

fn run(path: &Utf8PathBuf) -> lumen_core::Result<()> {
    let source = std::fs::read_to_string(path).map_err(Error::Io)?;
    let mut vm = lumen_vm::Vm::new()?;
    vm.run_file(path.as_std_path(), &source)?;
    Ok(())
}

/// spec.md §7: compile errors print `<file>:<line> "<message>"`; runtime
/// errors print only the message; io/mem errors are fatal at the point of
/// detection and get a `<file>: <message>` line since there's no source
/// line to point at.
fn format_error(path: &Utf8PathBuf, e: &Error) -> String {
    match e {
        Error::Compile(msg) => format!("{path}:{msg}"),
        Error::Lex(msg) => format!("{path}:{msg}"),
        Error::Runtime(msg) => msg.clone(),
        Error::Io(err) => format!("{path}: {err}"),
        Error::Mem(msg) => format!("{path}: {msg}"),
    }
}
