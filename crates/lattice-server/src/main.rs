//! Demo region process.
//!
//! Boots one region, serves the inbound `/agent2` endpoint, brings a
//! neighbor up and walks an avatar session through the root lifecycle so
//! the presence machinery can be watched end to end with RUST_LOG=debug.

mod agent_service;
mod session;

use std::sync::Arc;
use std::time::Duration;

use eyre::WrapErr;
use lattice_comms::HttpInterregionChannel;
use lattice_grid::{LocalPosition, NeighborTopology, RegionInfo};
use lattice_presence::AvatarIdentity;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

use crate::agent_service::ViewerRegistry;
use crate::session::AvatarSession;

const DEFAULT_DRAW_DISTANCE: u32 = 256;
const DEFAULT_MAX_RANGE: u32 = 2;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lattice_server=info".parse()?),
        )
        .init();

    let bind = std::env::var("LATTICE_BIND").unwrap_or_else(|_| "127.0.0.1:9000".to_string());
    let send_key = std::env::var("LATTICE_SEND_KEY").unwrap_or_default();

    let listener = TcpListener::bind(&bind)
        .await
        .wrap_err_with(|| format!("binding agent service on {bind}"))?;
    let endpoint = listener.local_addr()?;
    info!(%endpoint, "agent service listening");

    let local = RegionInfo {
        loc_x: 1000,
        loc_y: 1000,
        endpoint,
        http_uri: format!("http://{endpoint}"),
    };
    let topology = Arc::new(NeighborTopology::new(local));

    let registry = ViewerRegistry::new();
    let service = tokio::spawn(agent_service::serve(listener, Arc::clone(&registry)));

    // Point the eastern neighbor at our own endpoint so the demo has a
    // live peer to talk to.
    topology.neighbor_up(RegionInfo {
        loc_x: 1001,
        loc_y: 1000,
        endpoint,
        http_uri: format!("http://{endpoint}"),
    });

    let channel = Arc::new(HttpInterregionChannel::new(send_key));
    let avatar_id = Uuid::new_v4();
    let session = AvatarSession::new(
        AvatarIdentity::new(avatar_id, "Demo", "Avatar"),
        Arc::clone(&topology),
        channel,
        DEFAULT_DRAW_DISTANCE,
    );

    info!(%avatar_id, "avatar entering region");
    session.on_became_root(
        DEFAULT_DRAW_DISTANCE,
        DEFAULT_MAX_RANGE,
        LocalPosition::new(128.0, 128.0, 25.0),
    );

    // The neighbor's viewer-wait lands on our own registry; satisfy it
    // shortly after the handshake starts.
    {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            registry.viewer_connected(avatar_id).await;
        });
    }

    info!("running; press Ctrl-C to log the avatar out and exit");
    tokio::signal::ctrl_c().await?;

    info!(%avatar_id, "avatar logging out");
    // Logout closes peers with the blocking channel variant; keep it off
    // the runtime threads.
    tokio::task::spawn_blocking(move || session.logout()).await?;
    service.abort();
    Ok(())
}
