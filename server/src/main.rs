//! Lane Proxy - Main Entry Point
//!
//! Receives bot webhooks and relays them to the lane that owns each bot.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use lane_server::broker::{AmqpConnector, BrokerClient, BrokerConfig};
use lane_server::lane::{LaneResolver, PgLaneBindingStore};
use lane_server::routing::ServiceRouter;
use lane_server::webhooks::{self, EventForwarder, ForwardTarget};
use lane_server::{api, config, db};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lane_server=debug,tower_http=debug".into()),
        )
        .json()
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = config::Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        lane = config.lane.as_deref().unwrap_or("prod"),
        "Starting lane proxy"
    );

    // Initialize database
    let db_pool = db::create_pool(&config.database_url).await?;

    // Lane bindings
    let resolver = Arc::new(LaneResolver::with_ttl(
        Arc::new(PgLaneBindingStore::new(db_pool.clone())),
        config.lane_cache_ttl(),
    ));

    // Service routing (an unreachable registry is not fatal)
    let http = reqwest::Client::builder()
        .build()
        .context("Failed to build HTTP client")?;
    let router =
        ServiceRouter::start(&config.registry_url, config.registry_poll_interval(), http).await;

    // Message broker (optional - disabled if not configured)
    let broker = if config.has_broker() {
        let broker = BrokerClient::new(BrokerConfig::from_config(&config), Arc::new(AmqpConnector));
        broker
            .connect()
            .await
            .context("Failed to connect to message broker")?;
        broker
            .declare_topology()
            .await
            .context("Failed to declare broker topology")?;
        Some(broker)
    } else {
        info!("RABBITMQ_URL not set, message broker disabled");
        None
    };

    // Bot webhooks
    let bots = webhooks::bots::load_http_bots(&db_pool, config.production)
        .await
        .context("Failed to load bot configs")?;
    let forwarder = EventForwarder::new(
        Arc::clone(&resolver),
        router.clone(),
        config.inner_http_secret.clone(),
        ForwardTarget::from_config(&config),
    );

    // Build application state
    let drain_timeout = config.forward_drain_timeout();
    let bind_address = config.bind_address.clone();
    let state = api::AppState::new(
        config,
        router.clone(),
        resolver,
        forwarder.clone(),
        bots,
    );

    // Build router
    let app = api::create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(address = %bind_address, "Server listening");

    // Graceful shutdown handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install CTRL+C signal handler");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    router.stop();
    forwarder.drain(drain_timeout).await;
    if let Some(broker) = broker {
        broker.close().await;
    }

    info!("Server shutdown complete");

    Ok(())
}
