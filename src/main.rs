use clap::Parser;

use mirror_recon::cli::Cli;
use mirror_recon::commands;
use mirror_recon::config::Config;
use mirror_recon::logging;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logger(cli.verbose, cli.quiet);
    let command = cli.command.clone();
    let config = Config::try_from(cli)?;
    commands::run(&command, &config)
}
