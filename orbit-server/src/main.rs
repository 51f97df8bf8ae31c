//! OrbitOS document sync server.
//!
//! Hosts the authoritative copy of every shared document and relays edits
//! and presence between participants over WebSocket.
//!
//! Configuration comes from the environment:
//!
//! - `ORBIT_BIND_ADDR` (default `127.0.0.1:9090`)
//! - `ORBIT_MAX_PEERS` per document
//! - `ORBIT_BROADCAST_CAPACITY` frames buffered per document
//! - `ORBIT_MAX_HISTORY` operations kept for transforming stale edits
//!
//! Logging follows `RUST_LOG`.

use log::{error, info};
use orbit_collab::config::ServerConfig;
use orbit_collab::server::SyncServer;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!(
        "Starting OrbitOS sync server (max {} peers per document, history {})",
        config.max_peers_per_room, config.max_history
    );

    let server = SyncServer::new(config);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connections served, {} operations applied",
                stats.total_connections, stats.operations_applied
            );
        }
    }
}
