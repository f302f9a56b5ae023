//! Node-agent binary. Run one per intersection.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use greenwave::agent::NodeAgent;
use greenwave::config::NodeConfig;

#[derive(Parser)]
#[command(name = "node-agent", about = "Intersection control agent")]
struct Args {
    /// JSON configuration file with the node identity and edge cameras.
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("greenwave=info".parse().unwrap()))
        .init();

    let args = Args::parse();
    let config = match NodeConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    println!("Starting traffic node {}", config.node_id);

    let agent = Arc::new(NodeAgent::new(config));
    if let Err(err) = agent.run().await {
        eprintln!("node agent failed: {err}");
        std::process::exit(1);
    }
}
