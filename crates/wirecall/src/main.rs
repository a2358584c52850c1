use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use wirerun::Client;
use wirerun::Server;
use wirerun::ServiceRegistry;

mod cli;
mod demo;


use cli::Cli;
use cli::Command;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Serve { config, bind, max_in_flight } => {
            let config = cli::server_config(config.as_ref(), bind, max_in_flight)?;
            serve(config).await
        }
        Command::Call { service, method, params, config, addr, timeout_ms } => {
            let config = cli::client_config(config.as_ref(), addr, timeout_ms)?;
            let params = params.iter().map(|p| cli::parse_param(p)).collect();
            call(config, &service, &method, params).await
        }
    }
}

async fn serve(config: wirerun::ServerConfig) -> anyhow::Result<()> {
    let registry = ServiceRegistry::builder()
        .service(demo::SERVICE_NAME, demo::service())
        .aliases(config.services.clone())
        .build()
        .context("invalid service table")?;

    let server = Arc::new(Server::bind(&config, registry).await?);
    info!(version = env!("CARGO_PKG_VERSION"), addr = %server.local_addr()?, "wirecall server starting");

    tokio::spawn({
        let server = server.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("interrupt received, shutting down"),
                Err(e) => warn!(error = %e, "cannot listen for interrupts"),
            }
            server.shutdown();
        }
    });

    server.run().await?;
    Ok(())
}

async fn call(
    config: wirerun::ClientConfig,
    service: &str,
    method: &str,
    params: Vec<wirerun::Value>,
) -> anyhow::Result<()> {
    let client = Client::connect(&config).await?;
    let result = client.call(service, method, params).await;
    client.close().await;

    let answer = result.with_context(|| format!("{}.{} failed", service, method))?;
    println!("{}", answer);
    Ok(())
}
