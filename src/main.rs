use anyhow::Context;
use clap::Parser;
use launchpad_lib::Cli;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    launchpad_lib::init_tracing(cli.output_mode(), cli.verbose, cli.log_file.as_deref())
        .context("failed to initialise logging")?;
    Ok(launchpad_lib::run(cli).await)
}
