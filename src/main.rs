use anyhow::Result;
use dotenv::dotenv;
use log::{info, warn};
use peer_relay::networking::{interface, start_relay_server};
use peer_relay::RelayConfig;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv().ok();

    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = RelayConfig::from_env();
    info!(
        "Starting relay: peer timeout {}s, sweep every {}s, default room '{}'",
        config.peer_timeout.as_secs(),
        config.sweep_interval.as_secs(),
        config.default_room
    );
    info!(
        "Transfer ceilings: chunked {} bytes, swarm {} bytes",
        config.limits.chunked_max_bytes, config.limits.swarm_max_bytes
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(true);
    })?;

    let relay_path = config.relay_path.clone();
    let running = start_relay_server(config, shutdown_rx).await?;

    match interface::best_lan_address() {
        Ok(ip) => info!(
            "Peers on the LAN can connect to ws://{}:{}{}",
            ip,
            running.addr.port(),
            relay_path
        ),
        Err(e) => warn!("Could not determine LAN address: {}", e),
    }
    println!("Relay running (Press Ctrl+C to stop)...");

    running.wait().await?;
    println!("\nRelay stopped");
    Ok(())
}
