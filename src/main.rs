mod auth;
mod cli;
mod config;
mod eligibility;
mod error;
mod history;
mod merge;
mod output;
mod patterns;
mod providers;
mod supervisor;
mod watch;

#[cfg(test)]
mod test_utils;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    if cli.shows_banner() {
        output::print_banner();
    }
    info!("Starting cigate");
    let code = cli.execute().await?;

    std::process::exit(code);
}
