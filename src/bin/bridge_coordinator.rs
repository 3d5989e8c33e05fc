//! `bridge-coordinator`: the always-on dispatch loop.

use agent_bridge::config::{self, CoordinatorConfig};
use agent_bridge::coordinator::{self, BridgeClient};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match CoordinatorConfig::load_from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("coordinator misconfiguration: {e}");
            std::process::exit(2);
        }
    };

    let state_path = config::state_path_from_env();
    let client = BridgeClient::new(config.bridge_url.clone());

    log::info!(
        "bridge-coordinator starting: {} agent(s), polling every {}s",
        config.agents.len(),
        config.poll_threads_s
    );

    coordinator::run(config, client, &state_path).await;
}
