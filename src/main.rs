//! lazyrun — run a static executable with demand-paged segment loading

use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::error;

use lazyrun::elf::ElfParser;
use lazyrun::start::EntryStarter;
use lazyrun::{logging, Loader};

/// Runs a statically linked executable, mapping each segment page on its
/// first access instead of up front.
#[derive(Parser, Debug)]
#[command(name = "lazyrun", version, about)]
struct Args {
    /// Path to the executable image
    program: PathBuf,

    /// Arguments forwarded verbatim to the loaded program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() {
    logging::init();
    let args = Args::parse();

    let mut argv = vec![args.program.display().to_string()];
    argv.extend(args.args);

    let loader = Loader::new(Box::new(ElfParser), Box::new(EntryStarter));
    if let Err(err) = loader.init() {
        error!("{}", err);
        process::exit(err.exit_status());
    }

    // On success execute never returns: the loaded program owns the
    // process from its first instruction on.
    let err = match loader.execute(&args.program, &argv) {
        Ok(never) => match never {},
        Err(err) => err,
    };
    error!("{}", err);
    process::exit(err.exit_status());
}
