use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "relayctl", about = "Relay catalog and tunnel control", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: TopCommand,

    /// Config file (defaults to $RELAYCTL_CONFIG or the platform config dir)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum TopCommand {
    /// Manage the server catalog
    Server {
        #[command(subcommand)]
        command: ServerCommand,
    },

    /// Manage subscription feeds
    Sub {
        #[command(subcommand)]
        command: SubCommand,
    },

    /// Connect and stay in the foreground until Ctrl-C
    Connect {
        /// Server id
        #[arg(required_unless_present = "best", conflicts_with = "best")]
        id: Option<String>,

        /// Pick the enabled server with the lowest ping
        #[arg(long)]
        best: bool,
    },

    /// Show the enabled server with the lowest ping
    Best {
        /// Run a ping sweep first
        #[arg(long)]
        ping: bool,
    },
}

#[derive(Subcommand)]
pub enum ServerCommand {
    /// Add a server
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long)]
        port: u16,
        /// wireguard, vmess, shadowsocks, trojan
        #[arg(long)]
        protocol: String,
        /// Explicit id (a random one is assigned otherwise)
        #[arg(long)]
        id: Option<String>,
        /// Protocol parameter as key=value, repeatable
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },

    /// List servers
    List {
        /// Only enabled servers
        #[arg(long)]
        enabled: bool,
    },

    /// Show one server as JSON
    Show { id: String },

    /// Remove a server
    Remove { id: String },

    /// Enable a server
    Enable { id: String },

    /// Disable a server
    Disable { id: String },

    /// Measure latency for one server, or all when no id is given
    Ping { id: Option<String> },
}

#[derive(Subcommand)]
pub enum SubCommand {
    /// Import a subscription URL
    Add { url: String },

    /// List subscriptions
    List,

    /// Re-fetch a subscription and merge its servers
    Refresh { id: String },

    /// Remove a subscription (its servers stay)
    Remove { id: String },
}
