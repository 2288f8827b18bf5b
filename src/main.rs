mod cli;

use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::{bail, eyre, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use terradozer::provider::install::{default_install_dir, ProviderInstaller};
use terradozer::{destroy_resources, init_providers, State};

use cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    // parse by hand so flag errors exit with code 1, not clap's default 2
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                // --help and --version land here
                ExitCode::SUCCESS
            };
        }
    };

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = color_eyre::install() {
        error!("{err:#}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    if cli.force && cli.dry_run {
        bail!("--force and --dry-run cannot be used together");
    }

    let path = cli
        .state_file
        .ok_or_else(|| eyre!("path to a Terraform state file is required (see --help)"))?;

    let state = State::from_file(&path)?;
    info!(file = %path.display(), "using state");

    let installer = ProviderInstaller::new(default_install_dir()?);
    let providers = init_providers(&state.provider_names(), cli.timeout, &installer).await?;

    if !cli.force {
        info!("showing resources that would be deleted (dry run)");
        let summary = destroy_resources(state.resources(&providers), true, cli.parallel).await;

        if summary.deleted == 0 {
            info!("all resources have already been deleted");
            return Ok(ExitCode::SUCCESS);
        }
        info!(
            "total number of resources that would be deleted: {}",
            summary.deleted
        );
    }

    if !cli.dry_run {
        if !cli::user_confirmed_deletion(cli.force)? {
            return Ok(ExitCode::SUCCESS);
        }

        info!("starting to delete resources");
        let summary = destroy_resources(state.resources(&providers), false, cli.parallel).await;
        info!("total number of deleted resources: {}", summary.deleted);
    }

    Ok(ExitCode::SUCCESS)
}
