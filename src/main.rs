//! statewire - Real-time state synchronization
//!
//! Runs the demo counter server or a terminal client.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use statewire::config::{self, Config};
use statewire::network::{Client, ClientEvent, Manager, Server, ServerEvent};
use statewire::protocol;
use statewire::state::{map_from_json, Map, Value};

/// statewire - Real-time state synchronization
#[derive(Parser)]
#[command(name = "statewire")]
#[command(author = "Statewire Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Synchronize a state tree between a server and its clients", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo counter server
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Server id clients join with
        #[arg(long, default_value = "main")]
        id: String,
    },

    /// Connect to a server and print what happens
    Connect {
        /// Manager origin, e.g. ws://127.0.0.1:3000
        #[arg(short, long)]
        url: Option<String>,

        /// Server id to join
        #[arg(long)]
        server_id: Option<String>,

        /// Name sent with the connect request
        #[arg(short, long, default_value = "terminal")]
        name: String,

        /// Ask the server to reset its counter once connected
        #[arg(long)]
        reset: bool,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve { port, id } => {
            run_server(config, port, id).await?;
        }
        Commands::Connect {
            url,
            server_id,
            name,
            reset,
        } => {
            run_client(config, url, server_id, name, reset).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

fn demo_state() -> Map {
    map_from_json(json!({ "counter": 0, "clients": {} }))
}

/// Wire up the demo behaviour: a ticking counter and a client roster
fn install_demo(server: &Server) {
    let resetting = server.clone();
    server.on("reset_counter", move |client, _| {
        let server = resetting.clone();
        async move {
            tracing::info!("Connection {} reset the counter", client.id());
            server.set_state(map_from_json(json!({ "counter": 0 }))).await;
        }
    });

    let ticking = server.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            ticking
                .update_state(|state| {
                    let counter = state.get("counter").and_then(Value::as_i64).unwrap_or(0);
                    map_from_json(json!({ "counter": counter + 1 }))
                })
                .await;
        }
    });
}

fn roster_entry(id: u64, entry: Value) -> Map {
    let mut clients = Map::new();
    clients.insert(id.to_string(), entry);

    let mut partial = Map::new();
    partial.insert("clients".to_string(), Value::map(clients));
    partial
}

/// Run the manager with the demo server
async fn run_server(config: Config, port: Option<u16>, id: String) -> anyhow::Result<()> {
    let mut manager_config = config.manager.clone();
    if let Some(port) = port {
        manager_config.port = port;
    }

    let mut server_config = config.server.clone();
    server_config.id = Some(id);

    let initial = config.initial_state()?;
    let initial = if initial.is_empty() { demo_state() } else { initial };

    let manager = Manager::from_config(&manager_config);
    let server = manager.create_server(&server_config, initial)?;
    let mut event_rx = server
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("Server events already taken"))?;
    install_demo(&server);

    let bind_addr = manager.listen(&manager_config.listen_address()).await?;

    println!("\n========================================");
    println!("  statewire Server Running");
    println!("========================================");
    println!("  Listening: {}", bind_addr);
    println!("  Socket:    {}/ether_{}", manager.route(), server.id());
    println!("  Protocol:  v{}", protocol::PROTOCOL_VERSION);
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::Connected { client, metadata } => {
                        let name = metadata
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("anonymous")
                            .to_string();
                        println!("Client connected: {} ({})", name, client.id());
                        let entry = map_from_json(json!({ "name": name }));
                        server.set_state(roster_entry(client.id(), Value::map(entry))).await;
                    }
                    ServerEvent::Disconnected { id, reason } => {
                        println!("Client disconnected: {} - {}", id, reason);
                        let roster = server.state().await;
                        let listed = roster
                            .get("clients")
                            .and_then(|clients| clients.get(&id.to_string()))
                            .is_some();
                        if listed {
                            server.set_state(roster_entry(id, Value::Null)).await;
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    manager.stop().await?;
    tracing::info!("Server stopped");

    Ok(())
}

/// Run a terminal client
async fn run_client(
    config: Config,
    url: Option<String>,
    server_id: Option<String>,
    name: String,
    reset: bool,
) -> anyhow::Result<()> {
    let mut client_config = config.client.clone();
    if let Some(url) = url {
        client_config.url = url;
    }
    if let Some(server_id) = server_id {
        client_config.server_id = server_id;
    }

    let mut client = Client::new(client_config.clone());
    let mut event_rx = client
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("Client events already taken"))?;

    println!("Connecting to {}...", client_config.socket_url());
    client.connect(map_from_json(json!({ "name": name })).into()).await?;

    if reset {
        client.emit("reset_counter", vec![]).await?;
    }

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ClientEvent::Connected { state, welcome } => {
                        println!("Connected. State: {}", Value::map((*state).clone()));
                        if !welcome.is_null() {
                            println!("Welcome: {}", welcome);
                        }
                    }
                    ClientEvent::StateUpdate { diff, .. } => {
                        println!("Update: {}", Value::map((*diff).clone()));
                    }
                    ClientEvent::Message { name, args } => {
                        println!("Event {}: {}", name, Value::list(args));
                    }
                    ClientEvent::Disconnected { reason } => {
                        println!("Disconnected: {}", reason);
                        return Ok(());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    client.disconnect().await?;
    tracing::info!("Client disconnected");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["statewire", "serve", "--port", "4000"]);
        assert!(matches!(
            cli.map(|c| c.command),
            Ok(Commands::Serve { port: Some(4000), .. })
        ));

        let cli = Cli::try_parse_from(["statewire", "connect", "--reset"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_roster_entry_shape() {
        let partial = roster_entry(3, Value::Null);
        let clients = partial.get("clients").and_then(Value::as_map).unwrap();
        assert_eq!(clients.get("3"), Some(&Value::Null));
    }
}
