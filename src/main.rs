//! callguard CLI: inspect configuration and maintain cache snapshots.

mod cli;

use clap::Parser;

use cli::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli::init_logging(cli.json);
    cli::run(cli)
}
