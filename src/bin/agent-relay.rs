//! agent-relay CLI binary
//!
//! Agents invoke `agent-relay call` as their blocking tool; operators use the
//! listing and maintenance commands.

use agent_relay::cli::{Cli, CliContext};
use agent_relay::logging::init_logging;
use clap::Parser;
use std::process;

fn main() {
    let cli = Cli::parse();

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = init_logging(Some(&config.logging)) {
        eprintln!("Error initializing logging: {}", e);
        process::exit(1);
    }

    let context = match CliContext::new(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error opening relay store: {}", e);
            process::exit(1);
        }
    };

    match context.execute(&cli.command) {
        Ok(output) => {
            println!("{}", output.text);
            if output.exit_code != 0 {
                process::exit(output.exit_code);
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
