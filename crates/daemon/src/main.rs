/// Veilnet daemon
///
/// Runs one node of the overlay in one of three roles:
/// - relay: forwards cells for other nodes' circuits
/// - client: builds a circuit and serves a local HTTP proxy over it
/// - directory: runs the relay discovery service

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};

use veilnet_common::config::directory::DEFAULT_PORT as DIRECTORY_PORT;
use veilnet_common::{AgentId, NodeConfig};
use veilnet_core::{
    CircuitInitiator, DirectoryServer, Directory, JsonDirectory, RelayDescriptor, RelayNode,
};
use veilnet_daemon::{ApiServer, HttpProxy};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting Veilnet Daemon v{}", env!("CARGO_PKG_VERSION"));

    let args: Vec<String> = std::env::args().collect();
    let mode = args.get(1).map(String::as_str).unwrap_or("relay");

    match mode {
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        "version" | "--version" | "-v" => {
            println!("Veilnet Daemon v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "relay" => run_relay_mode(load_config()?).await,
        "client" => run_client_mode(load_config()?).await,
        "directory" => run_directory_mode(load_config()?).await,
        other => {
            eprintln!("Unknown command: {}", other);
            eprintln!("Run with 'help' to see available commands");
            std::process::exit(1);
        }
    }
}

fn load_config() -> Result<NodeConfig> {
    let config_path = PathBuf::from("veilnet.toml");
    if config_path.exists() {
        info!("Loading configuration from {:?}", config_path);
        NodeConfig::from_file(&config_path).context("loading veilnet.toml")
    } else {
        info!("No configuration file found, using defaults");
        let config = NodeConfig::default();
        if let Err(e) = config.to_file(&config_path) {
            warn!("Failed to save default config: {}", e);
        } else {
            info!("Saved default configuration to {:?}", config_path);
        }
        Ok(config)
    }
}

/// Run as a forwarding relay, registered with the directory.
async fn run_relay_mode(config: NodeConfig) -> Result<()> {
    let agent = AgentId::new(config.group, config.instance);
    info!("Running as relay {}", agent);

    let node = RelayNode::new(agent);
    let listen = format!("{}:{}", config.listen_addr, config.listen_port);
    let (bound, accept_handle) = node.listen(&listen).await?;

    // a wildcard bind address is not dialable; advertise loopback instead
    let advertise_host = if config.listen_addr == "0.0.0.0" {
        "127.0.0.1".to_string()
    } else {
        config.listen_addr.clone()
    };
    let descriptor = RelayDescriptor::new(agent, advertise_host, bound.port());
    let name = format!("{}-{}", config.name, agent);

    let directory = JsonDirectory::new(config.directory_addr.clone());
    let lease = directory
        .register(&name, descriptor.clone())
        .await
        .context("initial directory registration")?;
    info!("Registered as {:?}, lease {}s", name, lease.as_secs());

    tokio::spawn(renew_lease(directory, name, descriptor, lease));
    spawn_api(&config, node.clone());

    accept_handle.await?;
    Ok(())
}

/// Re-register at half the lease interval so the entry never expires.
async fn renew_lease(
    directory: JsonDirectory,
    name: String,
    descriptor: RelayDescriptor,
    mut lease: Duration,
) {
    loop {
        tokio::time::sleep(lease / 2).await;
        match directory.register(&name, descriptor.clone()).await {
            Ok(renewed) => {
                lease = renewed;
            }
            Err(e) => {
                warn!("Lease renewal failed: {}", e);
                lease = Duration::from_secs(10);
            }
        }
    }
}

/// Run as a client: build a circuit and serve the HTTP proxy over it.
async fn run_client_mode(config: NodeConfig) -> Result<()> {
    let agent = AgentId::new(config.group, config.instance);
    info!("Running as client {}", agent);

    let node = RelayNode::new(agent);
    let directory = Arc::new(JsonDirectory::new(config.directory_addr.clone()));
    let initiator = CircuitInitiator::new(node.clone(), directory, format!("{}-", config.name));

    info!("Building a {}-hop circuit...", config.circuit_length);
    let circuit = initiator
        .build(config.circuit_length)
        .await
        .context("building circuit")?;
    info!("Circuit {} ready", circuit.circuit_id());

    spawn_api(&config, node);

    let proxy_addr: SocketAddr = format!("127.0.0.1:{}", config.proxy_port).parse()?;
    let proxy = HttpProxy::new(proxy_addr, circuit);
    proxy.start().await
}

/// Run the relay discovery service.
async fn run_directory_mode(config: NodeConfig) -> Result<()> {
    let port = config
        .directory_addr
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .unwrap_or(DIRECTORY_PORT);

    let server = DirectoryServer::new();
    let (bound, handle) = server.listen(&format!("0.0.0.0:{}", port)).await?;
    info!("Directory service running on {}", bound);

    handle.await?;
    Ok(())
}

fn spawn_api(config: &NodeConfig, node: Arc<RelayNode>) {
    let api_addr = match format!("127.0.0.1:{}", config.api_port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("Bad API address: {}", e);
            return;
        }
    };
    let api = ApiServer::new(api_addr, node);
    tokio::spawn(async move {
        if let Err(e) = api.start().await {
            warn!("API server error: {}", e);
        }
    });
}

fn print_help() {
    println!("Veilnet Daemon v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("    veilnet-daemon [COMMAND]");
    println!();
    println!("COMMANDS:");
    println!("    relay        Run as a forwarding relay (default)");
    println!("    client       Build a circuit and serve a local HTTP proxy");
    println!("    directory    Run the relay discovery service");
    println!("    help         Show this help message");
    println!("    version      Show version information");
    println!();
    println!("Configuration is read from veilnet.toml in the working");
    println!("directory; a default file is written on first run.");
}
