#![forbid(unsafe_code)]

use std::process::ExitCode;

use clap::Parser;
use tj_cli::{init_tracing, run, Args};

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("tablejoin: error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
