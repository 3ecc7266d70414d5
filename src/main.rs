use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    let cli = comicsync::cli::Cli::parse();

    let default_level = if cli.quiet { "warn" } else { "info" };
    comicsync::logging::init(default_level).context("init logging")?;
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        comicsync::cli::Command::Sync(args) => {
            comicsync::sync::run(args).await.context("sync")?;
        }
        comicsync::cli::Command::Resolve(args) => {
            comicsync::sync::run_resolve(args).await.context("resolve")?;
        }
        comicsync::cli::Command::Download(args) => {
            comicsync::sync::run_download(args)
                .await
                .context("download")?;
        }
        comicsync::cli::Command::Convert(args) => {
            comicsync::sync::run_convert(args).await.context("convert")?;
        }
    }

    Ok(())
}
