use clap::Parser;

mod cli;
mod logging;

fn main() -> anyhow::Result<()> {
    cli::Args::parse().exec()
}
