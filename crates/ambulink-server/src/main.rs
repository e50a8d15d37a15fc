//! # ambulink-server
//!
//! Real-time synchronization bridge between the Ambulink store and an MQTT
//! broker.
//!
//! This binary provides:
//! - **Topic router** that applies device updates (sessions, ambulances,
//!   hospitals, equipment, calls) to the store inside one transaction each
//! - **Publish gateway** that mirrors every committed change on retained
//!   broker topics
//! - **Broker auth hooks** (ACL and superuser checks) backed by a swappable
//!   permission cache
//! - **REST API** (axum) for health checks, session upserts and permission
//!   administration

mod acl;
mod api;
mod config;
mod error;
mod gateway;
mod handlers;
mod permissions;
mod router;
mod session;
mod state;

use std::time::Duration;

use ambulink_net::BrokerConnection;
use ambulink_shared::constants::APP_NAME;
use ambulink_store::Database;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::gateway::PublishGateway;
use crate::router::TopicRouter;
use crate::state::Bridge;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ambulink_server=debug")),
        )
        .init();

    info!("Starting {} bridge v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the store (runs pending migrations)
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)?;
    info!(path = %config.database_path.display(), "Store opened");

    // -----------------------------------------------------------------------
    // 4. Reap sessions left live by a previous run
    // -----------------------------------------------------------------------
    // Nothing is published yet; seeding below covers the released resources.
    let reaped = db.transaction(session::reap)?;
    if !reaped.is_empty() {
        info!(resources = reaped.len(), "Released resources of stale sessions");
    }

    // -----------------------------------------------------------------------
    // 5. Connect to the broker and register the route subscriptions
    // -----------------------------------------------------------------------
    let (conn, inbound_rx, event_loop) = BrokerConnection::connect(&config.broker());
    let bridge = Bridge::new(db, PublishGateway::new(conn.clone()));
    let router = TopicRouter::new(bridge.clone());

    router.subscribe_all().await?;

    // -----------------------------------------------------------------------
    // 6. Seed retained state
    // -----------------------------------------------------------------------
    if config.seed_on_start {
        bridge.gateway.seed_all(&bridge.db).await?;
    } else if !reaped.is_empty() {
        bridge.gateway.publish_all(&reaped).await;
    }

    // -----------------------------------------------------------------------
    // 7. Spawn the router (one task per inbound message)
    // -----------------------------------------------------------------------
    tokio::spawn(router.run(inbound_rx));

    // -----------------------------------------------------------------------
    // 8. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let http_addr = config.http_addr;
    let app_state = AppState::new(bridge, config);

    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    // -----------------------------------------------------------------------
    // 9. Clean broker disconnect (suppresses the last will)
    // -----------------------------------------------------------------------
    if let Err(e) = conn.disconnect().await {
        warn!(error = %e, "Broker disconnect failed");
    }
    if tokio::time::timeout(Duration::from_secs(5), event_loop)
        .await
        .is_err()
    {
        warn!("Broker event loop did not stop in time");
    }

    Ok(())
}
