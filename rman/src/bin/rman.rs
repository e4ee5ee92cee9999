//! Thin executable wrapper: parse arguments, dispatch, translate errors
//! into the `LEVEL: message` triad and an exit code.

use clap::Parser;
use rman::cli::Cli;

fn main() {
    let cli = Cli::parse();
    if let Err(e) = rman::cli::run(cli) {
        eprint!("{}", e.report());
        std::process::exit(e.kind.exit_code());
    }
}
