//! Parley voice client
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and command line.
//! 2. Wiring the WebRTC transport, the audio devices and the signaling gateway.
//! 3. Holding one voice session open, printing presence and transcript changes.
//! 4. Hanging up on Ctrl+C, or exiting when the connection drops.

mod audio;
mod g711;
mod peer;
mod render;

use anyhow::{Context, anyhow};
use audio::CpalDevices;
use clap::Parser;
use parley_core::{ClientConfig, HttpSignalingGateway, PresenceState, VoiceClient};
use peer::WebRtcTransport;
use render::Renderer;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Talk to a voice agent from the terminal")]
struct Cli {
    /// Base URL of the voice server. Overrides PARLEY_SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,
    /// Access token for the signaling service. Overrides PARLEY_AUTH_TOKEN.
    #[arg(long)]
    token: Option<String>,
    /// Transcript presentation: `current` or `history`.
    #[arg(long)]
    transcript: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let mut config = ClientConfig::from_env().context("Failed to load configuration")?;
    if let Some(url) = cli.server_url {
        config.server_url = url.trim_end_matches('/').to_string();
    }
    if let Some(token) = cli.token {
        config.auth_token = Some(token);
    }
    if let Some(policy) = cli.transcript {
        config.transcript_policy = policy
            .parse()
            .map_err(|value| anyhow!("Unknown transcript policy '{value}'"))?;
    }

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    // --- 3. Build the Client ---
    let credential = SecretString::from(config.require_auth_token()?.to_string());
    let signaling = Arc::new(HttpSignalingGateway::new(&config.server_url, credential));
    info!(url = %signaling.offer_url(), "Configuration loaded");

    let mut renderer = Renderer::new(config.transcript_policy);
    let mut client = VoiceClient::new(
        config,
        Arc::new(WebRtcTransport),
        signaling,
        Arc::new(CpalDevices),
    );
    let mut presence = client.presence();
    let mut transcript = client.transcript();

    // --- 4. Run the Session ---
    let session = client
        .connect()
        .await
        .context("Failed to start the voice session")?;
    info!(session_id = %session.session_id, "Connected. Press Ctrl+C to hang up.");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for Ctrl+C");
                }
                info!("Hanging up");
                break;
            }
            changed = presence.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *presence.borrow_and_update();
                if let Some(line) = renderer.presence(state) {
                    println!("{line}");
                }
                if state == PresenceState::Disconnected {
                    warn!("Voice connection dropped");
                    break;
                }
            }
            changed = transcript.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = transcript.borrow_and_update().clone();
                for line in renderer.transcript(&view) {
                    println!("{line}");
                }
            }
        }
    }

    client.disconnect().await;
    info!("Voice session closed");
    Ok(())
}
