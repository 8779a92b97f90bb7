//! # Loopback Rendezvous Example
//!
//! Runs both sides of an auto-matched rendezvous in one process:
//!
//! 1. The host opens a TCP listener and publishes its address as invite data
//! 2. The host auto-matches into an in-memory match service and takes its turn
//! 3. A client auto-matches into the same room, reads the invite and probes
//!    the listener over TCP
//! 4. The host sees the client's greeting and closes its room
//!
//! ## Running
//!
//! ```sh
//! cargo run --example loopback_rendezvous
//!
//! # Watch the handlers work:
//! RUST_LOG=match_rendezvous=debug cargo run --example loopback_rendezvous
//! ```

use std::sync::Arc;
use std::time::Duration;

use match_rendezvous::protocol::InviteInfo;
use match_rendezvous::services::{MemoryMatchHub, TcpReachabilityProbe};
use match_rendezvous::{
    AutoMatchConfig, AutoMatchSession, AutoMatchSide, HandlerConfig, MatchService,
    ReachabilityProbe,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Host listener ───────────────────────────────────────────────
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let invite = InviteInfo::new("127.0.0.1", port)
        .with_player_id("host")
        .to_invite_string()?;
    tracing::info!(%invite, "host listening");

    let greeting = tokio::spawn(async move {
        let (stream, peer) = listener.accept().await?;
        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).await?;
        tracing::info!(%peer, client = line.trim(), "host greeted by client");
        Ok::<_, std::io::Error>(line.trim().to_owned())
    });

    // ── Match service ───────────────────────────────────────────────
    let hub = MemoryMatchHub::new();
    let handler = HandlerConfig::default()
        .with_first_turn_wait(Duration::from_secs(5))
        .with_jitter_max(Duration::from_millis(200));
    let config = AutoMatchConfig::default().with_handler(handler);

    // ── Host ────────────────────────────────────────────────────────
    let host_service: Arc<dyn MatchService> = Arc::new(hub.service("host"));
    let hosted = AutoMatchSession::new(
        host_service,
        AutoMatchSide::Host { invite_data: invite },
        config.clone(),
    )
    .run()
    .await?;
    tracing::info!(match_id = %hosted.match_id, "host published its invite");

    // ── Client ──────────────────────────────────────────────────────
    let client_service: Arc<dyn MatchService> = Arc::new(hub.service("client"));
    let probe: Arc<dyn ReachabilityProbe> =
        Arc::new(TcpReachabilityProbe::new().with_connect_timeout(Duration::from_secs(2)));
    let joined = AutoMatchSession::new(
        client_service,
        AutoMatchSide::Client {
            probe,
            local_id: "client".to_owned(),
        },
        config,
    )
    .run()
    .await?;
    tracing::info!(
        match_id = %joined.match_id,
        attempts = joined.attempts,
        invite = joined.invite_data.as_deref().unwrap_or_default(),
        "client reached the host"
    );

    // ── Shutdown ────────────────────────────────────────────────────
    let client_id = greeting.await??;
    println!("rendezvous complete: host met {client_id}");

    if let Some(room) = hosted.hosted {
        room.close().await;
    }
    Ok(())
}
