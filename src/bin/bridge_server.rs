//! `bridge-server`: the thread event log HTTP server.

use agent_bridge::presence::PresenceRegistry;
use agent_bridge::server::{self, AppState};
use agent_bridge::store::Store;
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    env_logger::init();

    let root = std::env::var("BRIDGE_DATA_DIR").unwrap_or_else(|_| "conversations".to_string());
    let store = match Store::open(&root) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("failed to open store at {root}: {e}");
            std::process::exit(2);
        }
    };

    let addr: SocketAddr = std::env::var("BRIDGE_LISTEN_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:5111".to_string())
        .parse()
        .unwrap_or_else(|e| {
            eprintln!("invalid BRIDGE_LISTEN_ADDR: {e}");
            std::process::exit(2);
        });

    let state = AppState {
        store,
        presence: Arc::new(PresenceRegistry::new()),
    };

    if let Err(e) = server::run(addr, state).await {
        log::error!("bridge-server exited: {e}");
        std::process::exit(1);
    }
}
