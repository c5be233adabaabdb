//! Pylon Devops - control server and remote agent in one binary.
//!
//! `server` mode listens for agents and opens an interactive shell to drive
//! them. `client` mode (the default) runs an agent that serves shell command
//! execution and file downloads to the server.

mod services;
mod shell;

use anyhow::Result;
use clap::Parser;
use pylon_core::{RpcClient, RpcConfig, RpcServer};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Server,
    Client,
}

#[derive(Parser, Debug)]
#[command(name = "pylon-devops")]
#[command(about = "Devops control server and agent over Pylon RPC")]
struct Args {
    /// `server` or `client`; anything else runs as client
    mode: Option<String>,

    /// Host to bind to (server) or connect to (client)
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on or connect to
    #[arg(short, long, default_value = "8999")]
    port: u16,

    /// Endpoint name; agents are addressed by it
    #[arg(short, long, default_value = "agent1")]
    name: String,

    /// Worker tasks executing services
    #[arg(long)]
    workers: Option<usize>,

    /// Heartbeat period in seconds
    #[arg(long)]
    heartbeat_secs: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn mode(&self) -> Mode {
        match self.mode.as_deref() {
            Some("server") => Mode::Server,
            _ => Mode::Client,
        }
    }

    fn rpc_config(&self) -> RpcConfig {
        let mut config = RpcConfig::default();
        if let Some(workers) = self.workers {
            config = config.with_worker_threads(workers);
        }
        if let Some(secs) = self.heartbeat_secs {
            config = config.with_heartbeat_period(Duration::from_secs(secs));
        }
        config
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn log_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if self.debug { "debug" } else { "info" })
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging; RUST_LOG overrides --debug
    FmtSubscriber::builder()
        .with_env_filter(args.log_filter())
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.mode() {
        Mode::Server => run_server(&args).await,
        Mode::Client => run_client(&args).await,
    }
}

async fn run_server(args: &Args) -> Result<()> {
    let server = RpcServer::builder(args.name.clone(), args.addr())
        .config(args.rpc_config())
        .start()
        .await?;
    info!("Devops server running on {}", server.local_addr());

    tokio::select! {
        result = shell::run(&server) => result?,
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received");
        }
    }

    server.stop().await;
    Ok(())
}

async fn run_client(args: &Args) -> Result<()> {
    let client = RpcClient::builder(args.name.clone(), args.addr())
        .config(args.rpc_config())
        .register_service(services::EXECUTE, services::execute)
        .register_service(services::DOWNLOAD, services::download)
        .build()?;

    info!("Agent {} connecting to {}", args.name, args.addr());
    client.connect();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, disconnecting");
    client.disconnect().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode_is_client() {
        let args = Args::parse_from(["pylon-devops"]);
        assert_eq!(args.mode(), Mode::Client);
        assert_eq!(Args::parse_from(["pylon-devops", "agent"]).mode(), Mode::Client);
        assert_eq!(args.addr(), "127.0.0.1:8999");
        assert_eq!(args.name, "agent1");
    }

    #[test]
    fn test_flags_map_onto_config() {
        let args = Args::parse_from([
            "pylon-devops",
            "server",
            "--port",
            "9100",
            "--workers",
            "3",
            "--heartbeat-secs",
            "2",
        ]);
        assert_eq!(args.mode(), Mode::Server);

        let config = args.rpc_config();
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.heartbeat_period, Duration::from_secs(2));
        assert_eq!(config.read_timeout(), Duration::from_secs(4));
    }
}
