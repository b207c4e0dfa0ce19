use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use arbor_node::config::Config;
use arbor_node::node::Node;

#[derive(Parser, Debug)]
#[clap(author, version, about = "arbor sync node")]
struct Args {
    /// Path to the config file
    #[clap(short = 'c', long, default_value = "etc/arbor-node.yml")]
    config: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_file(&args.config).context("can't open config file")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let node = Node::build(config)?;
    node.run().await?;
    info!("node started");

    tokio::signal::ctrl_c()
        .await
        .context("can't listen for the exit signal")?;
    info!("received exit signal, stopping");
    node.shutdown().await;
    info!("goodbye");
    Ok(())
}
