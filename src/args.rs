//! Command-line front-end (out of core scope per the spec; a thin
//! bootstrap over the core engine).

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "pushbot", about = "Self-hosted continuous-deployment dispatcher")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Write a starter configuration file at PUSHBOT_CONFIG (or ./pushbot.yaml).
    Init,
    /// Run the HTTP surface and deployment engine.
    Serve {
        #[arg(long, default_value = "0.0.0.0:8001")]
        bind: std::net::SocketAddr,
    },
    /// Trigger a deployment for a configured service by name, without going
    /// through a webhook.
    Deploy {
        service: String,
    },
}
