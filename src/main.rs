use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fargate_rds::cli::Cli;
use fargate_rds::config::load_dot_env;

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // DEPLOY_REGION / DEPLOY_ACCOUNT may come from the .env next to the config,
    // which is only known after parsing
    let mut cli = Cli::parse();
    if load_dot_env(&cli.dot_env_path())? > 0 {
        cli = Cli::parse();
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(cli.execute())
}
