use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use commands::{AskOptions, ListOptions, handle_ask, handle_kinds, handle_list};
use labio::{LabConfig, error::CommResult};

mod commands;

#[derive(Parser, Debug, Clone)]
#[command(version, long_about = None)]
struct Cli {
    /// TOML file with timeout, cooldown and default connection settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// List connectable resources
    #[command(name = "list", alias = "l")]
    List(ListOptions),

    /// Send a query and print the reply
    #[command(name = "ask", alias = "a")]
    Ask(AskOptions),

    /// Show the backend kinds available on this machine
    #[command(name = "kinds")]
    Kinds,
}

fn main() -> CommResult<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match &cli.config {
        Some(path) => LabConfig::load(path)?,
        None => LabConfig::default(),
    };

    match cli.command {
        Command::List(opts) => handle_list(opts)?,
        Command::Ask(opts) => handle_ask(opts, &config)?,
        Command::Kinds => handle_kinds(),
    }

    Ok(())
}
