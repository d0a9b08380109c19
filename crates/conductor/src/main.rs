use anyhow::Result;
use clap::Parser;

use conductor::cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let default_filter = if args.verbose() { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let code = cli::run(args).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
