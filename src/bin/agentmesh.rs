//! agentmesh CLI Binary
//!
//! Command-line interface for creating agents and running an in-process mesh.

use agentmesh::logging::init_logging;
use agentmesh::tooling::cli::{Cli, CliContext};
use anyhow::Context;
use clap::Parser;
use std::process;

fn run(cli: &Cli) -> anyhow::Result<String> {
    let context = CliContext::new(cli.config.clone()).context("Error loading configuration")?;
    let logging = cli.logging_config(&context.config().logging);
    init_logging(Some(&logging)).context("Error initializing logging")?;
    Ok(context.execute(&cli.command)?)
}

fn main() {
    let cli = Cli::parse();

    match run(&cli) {
        Ok(output) => {
            println!("{}", output);
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}
