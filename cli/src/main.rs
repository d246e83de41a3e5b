use std::{path::PathBuf, process::ExitCode};

use clap::Parser;

/// Importpatch replaces line 18 of a file with the dashboard card imports.
#[derive(Debug, Parser, Clone)]
#[clap(version, author)]
pub struct CLIOpts {
    /// File to patch in place.
    #[clap(value_name = "FILE")]
    pub file: PathBuf,
}

mod logging;
mod patch;

fn main() -> ExitCode {
    let opts = CLIOpts::parse();
    logging::init();

    match patch::run(&opts.file) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}
