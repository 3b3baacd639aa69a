use anyhow::Result;
use dotenv::dotenv;
use log::info;
use peer_relay::networking::{interface, DiscoveryAgent};
use peer_relay::protocol::JoinPayload;
use peer_relay::DiscoveryConfig;
use std::env;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv().ok();

    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    println!("=== Peer Discovery Test Utility ===");
    println!("Run it on several machines pointed at the same relay to see them find each other.");
    println!();

    // Peer name from args or env
    let name = std::env::args()
        .nth(1)
        .or_else(|| env::var("PEER_NAME").ok())
        .unwrap_or_else(|| "test-peer".to_string());
    let url = std::env::args()
        .nth(2)
        .or_else(|| env::var("RELAY_URL").ok())
        .unwrap_or_else(|| "ws://127.0.0.1:8080/relay".to_string());

    println!("=== Network Interfaces ===");
    match interface::lan_addresses() {
        Ok(addresses) => {
            for (i, address) in addresses.iter().enumerate() {
                println!("{}: {} - {} ({:?})", i + 1, address.interface, address.ip, address.kind);
            }
        }
        Err(e) => println!("Failed to list network interfaces: {}", e),
    }

    let identity = JoinPayload {
        user_id: Uuid::new_v4().to_string(),
        user_name: name.clone(),
        peer_id: Uuid::new_v4().to_string(),
        avatar: None,
    };
    println!("\n=== Local Peer ===");
    println!("ID: {}", identity.user_id);
    println!("Name: {}", identity.user_name);
    println!("Peer ID: {}", identity.peer_id);
    println!("Relay: {}", url);

    let agent = Arc::new(DiscoveryAgent::new(url, identity, DiscoveryConfig::default()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(true);
    })?;

    let mut peers = agent.subscribe();
    let task = agent.start(shutdown_rx.clone());
    let mut shutdown = shutdown_rx;

    println!("\n=== Discovery Running (Press Ctrl+C to exit) ===");
    let mut last_ids: Vec<String> = Vec::new();
    loop {
        tokio::select! {
            changed = peers.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = peers.borrow_and_update().clone();
                let ids: Vec<String> = snapshot.iter().map(|p| p.id.clone()).collect();
                if ids == last_ids {
                    continue;
                }
                last_ids = ids;

                println!("\n=== Discovered Peers ({}) ===", snapshot.len());
                if snapshot.is_empty() {
                    println!("No peers yet. Make sure other instances use the same relay.");
                }
                for (i, peer) in snapshot.iter().enumerate() {
                    println!("{}: {} ({})", i + 1, peer.name, peer.id);
                    println!("   Peer ID: {}", peer.peer_id);
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    task.await?;
    info!("Discovery test finished");
    Ok(())
}
