use anyhow::{Context, Result};
use clap::Parser;
use conduit_client::{MetricsCollector, ServiceClient};
use conduit_core::config::{LogFormat, LogSettings};
use conduit_core::{default_logger, ClientRegistry, Config, Protocol};
use conduit_discovery::{ConsulDirectory, DiscoveryRegistrar, ServiceRegistration};
use conduit_server::{limiter, HttpHandler, ServerCoordinator};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

mod http;
mod line;

use line::{LineEchoHandler, LineTransport};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file; JSON when it ends in `.json`, TOML otherwise
    #[clap(short, long, env = "CONDUIT_CONFIG", default_value = "conduit.toml")]
    config: String,
}

fn init_tracing(settings: &LogSettings) {
    let default_level = settings.level.parse().unwrap_or(LevelFilter::INFO);
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    match settings.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_file(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config))?;
    init_tracing(&config.log);

    info!("Starting conduit-node for {}...", config.server.service_name);
    let logger = default_logger();

    let registry = Arc::new(ClientRegistry::from_raw(&config.clients, logger.as_ref()));
    let metrics = MetricsCollector::new()?;

    let directory = if config.discovery.enabled {
        Some(Arc::new(ConsulDirectory::from_settings(&config.discovery)?))
    } else {
        None
    };

    let mut client = ServiceClient::new(registry, LineTransport).with_metrics(metrics.clone());
    if let Some(directory) = &directory {
        client = client.with_resolver(directory.clone());
    }
    let client = Arc::new(client);
    info!("Service client initialized");

    let http_client = client.clone();
    let mut coordinator = ServerCoordinator::new(config.server.clone())
        .with_logger(logger.clone())
        .with_limiter(limiter::from_settings(&config.rate_limit))
        .with_handler(Protocol::Rpc, Arc::new(LineEchoHandler))
        .with_handler(
            Protocol::Http,
            Arc::new(HttpHandler::new(move |req| {
                http::handle_request(req, http_client.clone())
            })),
        )
        .with_connection_caches(client.connection_caches())
        .with_profiling(config.pprof.port);

    if config.metrics.enabled {
        coordinator = coordinator.with_metrics(metrics, config.metrics.port);
    }

    if let Some(directory) = directory {
        match ServiceRegistration::from_settings(&config.server, &config.discovery) {
            Ok(registration) => {
                let registrar = DiscoveryRegistrar::new(directory, config.discovery.renew_interval())
                    .with_logger(logger.clone());
                coordinator = coordinator.with_discovery(Arc::new(registrar), registration);
            }
            Err(e) => logger.error(&format!("warning: init discovery failed: {}", e)),
        }
    }

    let code = coordinator.run().await?;
    info!("conduit-node exiting with code {}", code);
    std::process::exit(code);
}
