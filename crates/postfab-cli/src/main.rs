//! postfab command line.
//!
//! One binary, two roles: `postfab relay` runs the central broker,
//! `postfab agent` announces the local host to a relay and executes the
//! instructions it is handed.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use postfab_agent::{Agent, AgentOptions};
use postfab_relay::{Server, ServerOptions};

#[derive(Parser, Debug)]
#[command(name = "postfab")]
#[command(version, about = "Post-boot command execution fabric")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent and connect to a relay
    Agent {
        /// Address of the relay to connect to
        #[arg(long, env = "POSTFAB_RELAY_ADDRESS")]
        relay_address: String,

        /// Path to a CA certificate if the relay uses a self-signed certificate
        #[arg(long)]
        cacert: Option<PathBuf>,

        /// Connect without TLS (for testing only)
        #[arg(long)]
        insecure: bool,

        /// Seconds to wait for instructions from the relay before exiting
        #[arg(long, default_value_t = 60)]
        timeout: u64,

        /// Extra authorized-key lines to include in the announcement
        #[arg(long = "authorized-key")]
        authorized_keys: Vec<String>,
    },
    /// Run the relay server
    Relay {
        /// Path to the PEM-encoded serving certificate
        #[arg(long)]
        serving_cert: Option<PathBuf>,

        /// Path to the PEM-encoded serving key
        #[arg(long)]
        serving_key: Option<PathBuf>,

        /// Serve without TLS (for testing only)
        #[arg(long)]
        insecure: bool,

        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:9292")]
        listen: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "postfab=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match Cli::parse().command {
        Commands::Agent {
            relay_address,
            cacert,
            insecure,
            timeout,
            authorized_keys,
        } => {
            info!(version = env!("CARGO_PKG_VERSION"), "starting postfab agent");
            let mut options = AgentOptions::new(relay_address)
                .with_insecure(insecure)
                .with_timeout(Duration::from_secs(timeout))
                .with_extra_authorized_keys(authorized_keys);
            if let Some(cacert) = cacert {
                options = options.with_ca_cert(cacert);
            }
            Agent::new(options).run().await?;
        }
        Commands::Relay {
            serving_cert,
            serving_key,
            insecure,
            listen,
        } => {
            info!(version = env!("CARGO_PKG_VERSION"), "starting postfab relay");
            let options = ServerOptions {
                listen_address: listen,
                serving_cert,
                serving_key,
                insecure,
            };
            Server::new(options).serve().await?;
        }
    }
    Ok(())
}
