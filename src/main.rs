mod cli;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, ServerCommand, SubCommand, TopCommand};
use relayctl::{Config, Protocol, RelayClient, Server};

/// Env var holding a `tracing` filter; overrides `[log] level`.
const LOG_ENV: &str = "RELAYCTL_LOG";

fn init_logging(config: &Config, verbose: bool) {
    let fallback = if verbose { "debug" } else { config.log.level.as_str() };
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    init_logging(&config, cli.verbose);

    let client = RelayClient::open(config)?;
    match cli.command {
        TopCommand::Server { command } => server_command(&client, command).await,
        TopCommand::Sub { command } => sub_command(&client, command).await,
        TopCommand::Connect { id, best } => connect(&client, id, best).await,
        TopCommand::Best { ping } => {
            if ping {
                client.ping_all().await?;
            }
            let server = client.servers().best_server()?;
            print_server(&server);
            Ok(())
        }
    }
}

/// `true`/`false` and numbers keep their JSON type; anything else is a string.
fn parse_param(raw: &str) -> anyhow::Result<(String, serde_json::Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("parameter '{raw}' is not KEY=VALUE");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("parameter '{raw}' has an empty key");
    }
    let value = match serde_json::from_str::<serde_json::Value>(value) {
        Ok(v @ (serde_json::Value::Bool(_) | serde_json::Value::Number(_))) => v,
        _ => serde_json::Value::String(value.to_string()),
    };
    Ok((key.to_string(), value))
}

fn print_server(server: &Server) {
    let ping = match server.ping {
        0 => "-".to_string(),
        ms => format!("{ms}ms"),
    };
    println!(
        "{:<36}  {:<24}  {:<12}  {:<28}  {:>7}  {}",
        server.id,
        server.name,
        server.protocol,
        server.address(),
        ping,
        if server.enabled { "enabled" } else { "disabled" }
    );
}

async fn server_command(client: &RelayClient, command: ServerCommand) -> anyhow::Result<()> {
    let servers = client.servers();
    match command {
        ServerCommand::Add {
            name,
            host,
            port,
            protocol,
            id,
            params,
        } => {
            let mut server = Server::new(name, host, port, Protocol::from(protocol));
            if let Some(id) = id {
                server = server.with_id(id);
            }
            for raw in &params {
                let (key, value) = parse_param(raw)?;
                server.params.insert(key, value);
            }
            let added = servers.add(server)?;
            println!("added {}", added.id);
        }
        ServerCommand::List { enabled } => {
            let list = if enabled {
                servers.list_enabled()?
            } else {
                servers.list_all()?
            };
            if list.is_empty() {
                println!("no servers");
            }
            for server in &list {
                print_server(server);
            }
        }
        ServerCommand::Show { id } => {
            let server = servers.get(&id)?;
            let json = serde_json::to_string_pretty(&server).context("Failed to render server")?;
            println!("{json}");
        }
        ServerCommand::Remove { id } => {
            servers.delete(&id)?;
            println!("removed {id}");
        }
        ServerCommand::Enable { id } => {
            servers.set_enabled(&id, true)?;
            println!("enabled {id}");
        }
        ServerCommand::Disable { id } => {
            servers.set_enabled(&id, false)?;
            println!("disabled {id}");
        }
        ServerCommand::Ping { id: Some(id) } => {
            let ms = client.ping(&id).await?;
            println!("{id}: {ms}ms");
        }
        ServerCommand::Ping { id: None } => {
            let report = client.ping_all().await?;
            println!("{} reachable, {} failed", report.succeeded, report.failed);
        }
    }
    Ok(())
}

async fn sub_command(client: &RelayClient, command: SubCommand) -> anyhow::Result<()> {
    let subscriptions = client.subscriptions();
    match command {
        SubCommand::Add { url } => {
            let sub = subscriptions.import(&url).await?;
            println!("imported {} ({} servers) as {}", sub.name, sub.server_count, sub.id);
        }
        SubCommand::List => {
            let list = subscriptions.list()?;
            if list.is_empty() {
                println!("no subscriptions");
            }
            for sub in list {
                let updated = sub
                    .last_update
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".into());
                println!(
                    "{:<36}  {:<24}  {:>4} servers  updated {}  {}",
                    sub.id, sub.name, sub.server_count, updated, sub.url
                );
            }
        }
        SubCommand::Refresh { id } => {
            let report = subscriptions.refresh(&id).await?;
            println!(
                "{} added, {} updated, {} failed",
                report.added, report.updated, report.failed
            );
        }
        SubCommand::Remove { id } => {
            subscriptions.delete(&id)?;
            println!("removed {id}");
        }
    }
    Ok(())
}

async fn connect(client: &RelayClient, id: Option<String>, best: bool) -> anyhow::Result<()> {
    let server = match id {
        Some(id) if !best => client.connect(&id).await?,
        _ => client.connect_best().await?,
    };
    println!(
        "connected to {} ({} via {}); press Ctrl-C to disconnect",
        server.name,
        server.address(),
        server.protocol
    );
    client.start_background();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    let stats = client.stats();
    client.shutdown().await?;
    println!(
        "disconnected after {}s: {} bytes sent, {} bytes received",
        stats.uptime_secs, stats.bytes_sent, stats.bytes_received
    );
    Ok(())
}
