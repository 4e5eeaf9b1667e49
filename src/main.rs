use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use wsk_invoker::{ContainerPool, DockerBackend, InvokerConfig, logging::setup_logging};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = if let Some(path) = cli.config {
        InvokerConfig::from_path(path.to_str().unwrap())?
    } else {
        InvokerConfig::default()
    };

    setup_logging(&config)?;

    let backend = Arc::new(DockerBackend::with_endpoint(&config.self_docker_endpoint)?);
    let pool = Arc::new(ContainerPool::new(&config, backend));

    let removed = pool.kill_stragglers().await?;
    tracing::info!(removed, "Straggler cleanup complete");

    let cancel = CancellationToken::new();
    let gc_pool = pool.clone();
    let gc_token = cancel.clone();
    tokio::spawn(async move { gc_pool.run_gc(gc_token).await });

    tracing::info!(
        max_active = pool.max_active(),
        max_idle = pool.max_idle(),
        "Invoker pool ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    cancel.cancel();
    Ok(())
}
