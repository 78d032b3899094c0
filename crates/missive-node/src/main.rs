//! # missive-node
//!
//! A headless messaging node: joins the GossipSub mesh over QUIC, feeds every
//! received envelope through the message sender's receive pipeline and runs
//! the periodic resend and segment-expiry sweeps.

mod config;
mod identity;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use libp2p::Multiaddr;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use missive_net::{
    libp2p_keypair, spawn_swarm, GossipTransport, SwarmCommand, SwarmConfig, SwarmNotification,
    Transport,
};
use missive_sender::{
    BatchingDataSync, Collaborators, EphemeralKeyStore, MessageSender, SealedBoxProtocol,
    SenderConfig,
};
use missive_store::Database;

use crate::config::NodeConfig;

const IDENTITY_FILE: &str = "identity.key";
const DATABASE_FILE: &str = "missive.db";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,missive_node=debug,missive_sender=debug")),
        )
        .init();

    info!("Starting missive node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::from_env();
    info!(?config, "Loaded configuration");

    let data_dir = config.data_dir()?;
    std::fs::create_dir_all(&data_dir)?;
    let identity = identity::load_or_create(&data_dir.join(IDENTITY_FILE))?;
    let db = Arc::new(Mutex::new(Database::open_at(&data_dir.join(DATABASE_FILE))?));
    info!(identity = %identity.public_key(), "Node identity loaded");

    let keypair = libp2p_keypair(&identity)?;
    let (cmd_tx, mut notifications, peer_id) = spawn_swarm(
        keypair,
        SwarmConfig {
            listen_port: config.listen_port,
            bootstrap: config.bootstrap_peers.clone(),
            max_message_size: config.max_message_size,
        },
    )
    .await?;
    info!(%peer_id, port = config.listen_port, "Swarm running in background");

    let transport = Arc::new(GossipTransport::new(
        cmd_tx.clone(),
        identity.clone(),
        config.max_message_size,
    ));
    let sender = MessageSender::new(
        identity.clone(),
        db,
        Collaborators {
            protocol: Arc::new(SealedBoxProtocol::new()),
            transport: transport.clone(),
            datasync: Arc::new(BatchingDataSync::new(
                identity.public_key(),
                config.datasync_interval,
            )),
            key_store: Arc::new(EphemeralKeyStore::new()),
        },
        SenderConfig {
            datasync_enabled: config.datasync_enabled,
            ..Default::default()
        },
    );

    transport.load_key_filters(&identity).await?;
    for chat in &config.public_chats {
        sender.join_public(chat).await?;
        info!(chat = %chat, "Joined public chat");
    }

    spawn_sweeps(&config, Arc::clone(&sender), Arc::clone(&transport), cmd_tx.clone());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Some(SwarmNotification::MessageReceived { source, topic, data }) => {
                    debug!(?source, topic = %topic, len = data.len(), "Envelope received");
                    handle_envelope(&sender, &data).await;
                }
                Some(SwarmNotification::PeerConnected { peer_id, address }) => {
                    info!(%peer_id, %address, "Peer connected");
                }
                Some(SwarmNotification::PeerDisconnected { peer_id }) => {
                    info!(%peer_id, "Peer disconnected");
                }
                None => {
                    warn!("Swarm task exited, shutting down");
                    break;
                }
            },
            _ = &mut shutdown => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    sender.stop();
    let _ = cmd_tx.send(SwarmCommand::Shutdown).await;
    Ok(())
}

async fn handle_envelope(sender: &MessageSender, wire: &[u8]) {
    let handled = match sender.handle_messages(wire).await {
        Ok(handled) => handled,
        Err(e) => {
            debug!(error = %e, "Dropping envelope");
            return;
        }
    };

    if !handled.acks.is_empty() {
        match sender.process_acks(&handled.acks) {
            Ok(confirmed) => {
                for id in confirmed {
                    info!(id = %id, "Message confirmed");
                }
            }
            Err(e) => warn!(error = %e, "Failed to process acknowledgements"),
        }
    }

    for message in handled.messages {
        info!(
            id = %message.id,
            from = %message.signer.short(),
            message_type = ?message.message_type,
            len = message.payload.len(),
            "Message received"
        );
    }
}

/// Dial the bootstrap peers when no peer is connected. Returns false once
/// the swarm task has stopped taking commands.
async fn redial_when_isolated(cmd_tx: &mpsc::Sender<SwarmCommand>, bootstrap: &[Multiaddr]) -> bool {
    let (tx, rx) = oneshot::channel();
    if cmd_tx.send(SwarmCommand::GetPeers(tx)).await.is_err() {
        return false;
    }
    let Ok(peers) = rx.await else {
        return false;
    };

    debug!(peers = peers.len(), "Connected peers");
    if peers.is_empty() {
        for addr in bootstrap {
            if cmd_tx.send(SwarmCommand::Dial(addr.clone())).await.is_err() {
                return false;
            }
        }
    }
    true
}

fn spawn_sweeps(
    config: &NodeConfig,
    sender: Arc<MessageSender>,
    transport: Arc<GossipTransport>,
    cmd_tx: mpsc::Sender<SwarmCommand>,
) {
    let resend_sender = Arc::clone(&sender);
    let resend_every = config.resend_sweep_interval;
    let bootstrap = config.bootstrap_peers.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(resend_every);
        loop {
            interval.tick().await;
            if let Err(e) = resend_sender.resend_raw_messages().await {
                warn!(error = %e, "Resend sweep failed");
            }
            for (hash, ids) in transport.monitor().take_expired(Instant::now()) {
                debug!(hash = %hex::encode(&hash[..8]), ids = ids.len(), "Envelope expired");
            }

            if !redial_when_isolated(&cmd_tx, &bootstrap).await {
                warn!("Swarm task gone, stopping resend sweep");
                return;
            }
        }
    });

    let segment_every = config.segment_sweep_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(segment_every);
        loop {
            interval.tick().await;
            match sender.cleanup_segments() {
                Ok(removed) if removed > 0 => info!(removed, "Removed expired message segments"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Segment sweep failed"),
            }
        }
    });
}
