use clap::Parser;

use workerman_cli::args::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    workerman_cli::app::run(cli)
}
