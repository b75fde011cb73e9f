//! NetSentinel - Home Network Fault Attribution
//!
//! Probes the router, ISP gateway, DNS and HTTP layers on a fixed interval and
//! attributes confirmed failures to the responsible party.

mod config;
mod db;
mod diagnosis;
mod probe;
mod publish;
mod scheduler;
mod web;

use config::SentinelConfig;
use db::Store;
use publish::{Fanout, LogPublisher, Publisher};
use scheduler::Scheduler;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("netsentinel=info".parse()?))
        .init();

    // Load configuration
    let cfg = match SentinelConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(
        "Starting NetSentinel: router {}, ISP gateway {}, {} DNS resolvers x {} domains, {} HTTP endpoints",
        cfg.targets.router,
        cfg.isp_gateway().unwrap_or("not configured"),
        cfg.targets.dns_resolvers.len(),
        cfg.targets.dns_domains.len(),
        cfg.targets.http_endpoints.len()
    );
    tracing::info!("Using database at {}", cfg.server.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.server.db_path)?);
    tracing::info!("Database initialized successfully");

    let publisher: Arc<dyn Publisher> = Arc::new(Fanout::new(vec![
        Arc::new(LogPublisher) as Arc<dyn Publisher>,
        store.clone(),
    ]));

    // Start web server
    if cfg.server.http_port != 0 {
        let server = Server::new(cfg.server.clone(), store);
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                tracing::error!("Web server failed: {}", e);
            }
        });
    }

    // Run scheduler until Ctrl-C
    let scheduler = Scheduler::from_config(&cfg, publisher)?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    let _ = shutdown_tx.send(());
    scheduler_task.await?;

    Ok(())
}
