//! LiveObj Server - hosts the demo object model over WebSocket.
//!
//! Clients connect to `ws://<host>:<port><path>`, fetch the root object and
//! from there reach the pinned `testobj`.

mod demo;
mod server;

use anyhow::Result;
use clap::Parser;
use liveobj_core::config::ServerConfig;
use liveobj_core::{Server, ServerOptions};
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "liveobj-server")]
#[command(about = "WebSocket host for remote objects")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value_t = ServerConfig::DEFAULT_PORT)]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = ServerConfig::DEFAULT_HOST)]
    host: String,

    /// WebSocket route
    #[arg(long, default_value = ServerConfig::DEFAULT_PATH)]
    path: String,

    /// Seconds between collector sweeps
    #[arg(long, default_value_t = ServerConfig::GC_INTERVAL.as_secs())]
    gc_interval_secs: u64,

    /// Seconds an unreachable, unpinged object survives
    #[arg(long, default_value_t = ServerConfig::GC_TIMEOUT.as_secs())]
    gc_timeout_secs: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting LiveObj Server");

    let options = ServerOptions::default()
        .with_gc_interval(Duration::from_secs(args.gc_interval_secs))
        .with_gc_timeout(Duration::from_secs(args.gc_timeout_secs));
    let server = Server::new(demo::registry()?, options);
    let thing = demo::populate(&server);
    server.start();
    tokio::spawn(demo::tick(server.clone(), thing));

    let addr = server::start_server(server.clone(), &args.host, args.port, &args.path).await?;

    // Print port for supervising processes to read (intentional stdout)
    println!("LIVEOBJ_PORT={}", addr.port());

    info!("Object server running on ws://{}{}", addr, args.path);

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    server.shutdown();

    Ok(())
}
