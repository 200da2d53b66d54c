//! remotefs server binary
//!
//! Serves the local filesystem to clients whose address falls inside the
//! allow-list.
//!
//! Usage:
//!   remotefs_server [OPTIONS] <LISTEN_ADDRESS> <IP_RANGE>
//!
//! Example:
//!   remotefs_server 0.0.0.0 "192.168.1.0/24, 10.0.0.5"

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use remotefs::network::Server;
use remotefs::{ServerConfig, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(name = "remotefs_server", version, about = "Remote filesystem server")]
struct Cli {
    /// Address to bind (IPv4 or IPv6, without port)
    listen_address: String,

    /// Allowed client addresses: `addr`, `low-high` or `addr/prefix`,
    /// separated by commas or spaces
    ip_range: String,

    /// TCP port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Seconds of silence before a client is disconnected
    #[arg(long, default_value_t = 25)]
    idle_timeout: u64,

    /// Seconds allowed for any read or write inside a request
    #[arg(long, default_value_t = 60)]
    io_timeout: u64,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            listen_address: self.listen_address,
            port: self.port,
            allowed: self.ip_range,
            idle_timeout: Duration::from_secs(self.idle_timeout),
            io_timeout: Duration::from_secs(self.io_timeout),
            ..Default::default()
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
        EnvFilter::new(level.to_string())
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = cli.into_config();
    tracing::info!(
        "remotefs server v{} on {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.listen_address,
        config.port
    );

    let mut server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Fatal error: {e}");
            return ExitCode::FAILURE;
        }
    };
    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Fatal error: {e}");
            ExitCode::FAILURE
        }
    }
}
