//! Binary entry point for the Capsule CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;

mod cli;
mod commands;

use cli::Cli;
use commands::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    commands::init_tracing();
    let exit_code = match commands::dispatch(cli, &mut io::stdout()).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "error: {err}").ok();
}

#[cfg(test)]
mod main_tests;
