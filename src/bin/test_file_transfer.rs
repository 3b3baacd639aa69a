use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;
use log::{error, info};
use peer_relay::networking::RelayClient;
use peer_relay::protocol::{EventKind, JoinPayload, Message};
use peer_relay::transfer::{OutgoingFile, TransferCoordinator};
use peer_relay::TransferLimits;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

fn print_help() {
    println!("Usage:");
    println!("  test_file_transfer receive <name> <dir>");
    println!("  test_file_transfer send <name> <receivers> <file>...");
    println!();
    println!("RELAY_URL selects the relay (default ws://127.0.0.1:8080/relay)");
}

fn identity(name: &str) -> JoinPayload {
    JoinPayload {
        user_id: Uuid::new_v4().to_string(),
        user_name: name.to_string(),
        peer_id: Uuid::new_v4().to_string(),
        avatar: None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv().ok();

    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let url = env::var("RELAY_URL").unwrap_or_else(|_| "ws://127.0.0.1:8080/relay".to_string());
    let args: Vec<String> = std::env::args().collect();

    let result = match args.get(1).map(String::as_str) {
        Some("receive") if args.len() == 4 => receive(&url, &args[2], PathBuf::from(&args[3])).await,
        Some("send") if args.len() >= 5 => {
            let receivers: usize = args[3].parse().context("receivers must be a number")?;
            let files = args[4..].iter().map(PathBuf::from).collect();
            send(&url, &args[2], receivers, files).await
        }
        _ => {
            print_help();
            return Ok(());
        }
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

async fn receive(url: &str, name: &str, dir: PathBuf) -> Result<()> {
    std::fs::create_dir_all(&dir)?;
    let me = identity(name);
    let coordinator = TransferCoordinator::new(name, me.peer_id.clone(), TransferLimits::from_env());

    let mut completed = None;
    let mut client = RelayClient::connect(url, |session| {
        completed = Some(coordinator.install_receiver(session));
    })
    .await?;
    let mut completed = completed.ok_or_else(|| anyhow!("receiver not installed"))?;
    client.send(&Message::Join(me))?;
    info!("Waiting for transfers, saving into {}", dir.display());

    loop {
        tokio::select! {
            received = completed.recv() => {
                let Some(received) = received else { break };
                info!("Transfer from {} complete (sha256 {})", received.sender, received.sha256);
                for (meta, bytes) in received.files() {
                    let path = dir.join(&meta.name);
                    std::fs::write(&path, bytes)?;
                    info!("  saved {} ({} bytes)", path.display(), bytes.len());
                }
            }
            _ = client.closed() => break,
        }
    }

    info!("Relay connection closed");
    Ok(())
}

async fn send(url: &str, name: &str, receivers: usize, paths: Vec<PathBuf>) -> Result<()> {
    let me = identity(name);
    let coordinator = TransferCoordinator::new(name, me.peer_id.clone(), TransferLimits::from_env());

    let mut files = Vec::with_capacity(paths.len());
    for path in &paths {
        files.push(OutgoingFile::from_path(path).await?);
    }
    // Fail before touching the relay if the payload is too large
    coordinator.prepare(&files, receivers)?;

    let (roster_tx, mut rosters) = mpsc::unbounded_channel();
    let mut acks = None;
    let client = RelayClient::connect(url, |session| {
        acks = Some(TransferCoordinator::install_ack_listener(session));
        session.on(EventKind::Peers, move |msg| {
            if let Message::Peers(roster) = msg {
                let _ = roster_tx.send(roster);
            }
        });
    })
    .await?;
    let mut acks = acks.ok_or_else(|| anyhow!("ack listener not installed"))?;
    client.send(&Message::Join(me))?;

    // Wait until enough peers are around to acknowledge
    loop {
        let roster = tokio::time::timeout(Duration::from_secs(60), rosters.recv())
            .await
            .context("Timed out waiting for receivers")?
            .ok_or_else(|| anyhow!("relay connection closed"))?;
        info!("{} peer(s) online", roster.peers.len());
        if roster.peers.len() >= receivers {
            break;
        }
    }

    let report = coordinator
        .send_files(files, receivers, &client.handle(), &mut acks)
        .await?;
    info!(
        "Sent {} bytes in {} chunks, paused {} times, {:.1} KB/s",
        report.bytes_sent,
        report.chunks,
        report.pauses,
        report.bytes_sent as f64 / 1024.0 / report.elapsed.as_secs_f64().max(0.001)
    );

    client.close().await;
    Ok(())
}
