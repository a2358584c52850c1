use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;

use wirerun::ClientConfig;
use wirerun::ServerConfig;
use wirerun::Value;

#[derive(Debug, Parser)]
#[command(name = "wirecall")]
#[command(about = "Serve the demo service, or call any wirecall service")]
#[command(version)]
pub struct Cli {
    /// Log filter, e.g. `debug` or `wirerun=trace`. Overrides RUST_LOG.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the demo server
    Serve {
        /// TOML server configuration
        #[arg(long)]
        config: Option<PathBuf>,

        /// Listen address, overrides the configuration
        #[arg(long)]
        bind: Option<String>,

        /// Per-connection bound on concurrently executing requests
        #[arg(long)]
        max_in_flight: Option<usize>,
    },

    /// Call one method and print the answer
    Call {
        service: String,
        method: String,

        /// Parameters: integers, floats, true/false, null, anything else is a string
        params: Vec<String>,

        /// TOML client configuration
        #[arg(long)]
        config: Option<PathBuf>,

        /// Server address, overrides the configuration
        #[arg(long)]
        addr: Option<String>,

        /// Call timeout in milliseconds, overrides the configuration
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

pub fn server_config(
    path: Option<&PathBuf>,
    bind: Option<String>,
    max_in_flight: Option<usize>,
) -> anyhow::Result<ServerConfig> {
    let mut config = match path {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = bind {
        config.bind = bind;
    }
    if max_in_flight.is_some() {
        config.max_in_flight = max_in_flight;
    }
    config.validate()?;
    Ok(config)
}

pub fn client_config(
    path: Option<&PathBuf>,
    addr: Option<String>,
    timeout_ms: Option<u64>,
) -> anyhow::Result<ClientConfig> {
    let mut config = match path {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    if let Some(addr) = addr {
        config.addr = addr;
    }
    if timeout_ms.is_some() {
        config.call_timeout_ms = timeout_ms;
    }
    config.validate()?;
    Ok(config)
}

/// Reads a command-line parameter as the narrowest value it spells.
pub fn parse_param(raw: &str) -> Value {
    match raw {
        "null" => return Value::Null,
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(v) = raw.parse::<i64>() {
        return Value::Int(v);
    }
    if let Ok(v) = raw.parse::<f64>() {
        return Value::Float(v);
    }
    Value::Str(raw.to_string())
}
