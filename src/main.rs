//! Coordinator binary - Axum server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use greenwave::api::{create_router, AppState};
use greenwave::config::CoordinatorConfig;
use greenwave::detector::RoiDetector;
use greenwave::store::MemRepo;

#[derive(Parser)]
#[command(name = "greenwave", about = "Traffic-control coordinator")]
struct Args {
    /// JSON configuration file; stock defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("greenwave=info".parse().unwrap()))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => match CoordinatorConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{err}");
                std::process::exit(1);
            }
        },
        None => CoordinatorConfig::default(),
    };
    let addr = args.listen.unwrap_or(config.listen_addr);

    let repo = Arc::new(MemRepo::new());
    let detector = Arc::new(RoiDetector::new(config.cameras));
    let state = Arc::new(AppState::new(
        repo,
        detector,
        config.dv,
        config.table,
        config.green,
    ));
    let app = create_router(state);

    println!("Coordinator listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
