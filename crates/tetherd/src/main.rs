//! tetherd: tether overlay node daemon.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};

use tether_core::config::TetherConfig;
use tether_core::Identity;
use tether_services::{Delivery, Node, NodeHandles, PeerRegistry, SendWorker, SystemClock};

mod udp;

use udp::UdpTransport;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TetherConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TetherConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TetherConfig::default()
    });

    let identity = Identity::load_or_generate(&config.identity.path, config.remote.pow_difficulty)
        .with_context(|| format!("failed to load identity {}", config.identity.path.display()))?;
    let identity = Arc::new(identity);
    tracing::info!(
        public_key = %identity.public_key(),
        network_id = config.remote.network_id,
        "tetherd starting"
    );

    // Sockets
    let bind: SocketAddr = format!("{}:{}", config.network.bind, config.network.port)
        .parse()
        .context("invalid bind address")?;
    let socket = Arc::new(udp::bind_unicast(bind)?);
    tracing::info!(addr = %socket.local_addr()?, "udp socket bound");

    let multicast = if config.remote.local_discovery {
        Some(Arc::new(udp::bind_multicast().context("failed to join multicast group")?))
    } else {
        None
    };

    // Node
    let peers = PeerRegistry::new();
    let (node, NodeHandles { outgoing, deliveries }) = Node::new(
        &config.remote,
        identity,
        Arc::new(peers.clone()),
        SystemClock::shared(),
    )
    .context("invalid remote configuration")?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let send_worker_task = tokio::spawn(
        SendWorker::new(
            Arc::new(UdpTransport::new(socket.clone())),
            outgoing,
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    let unicast_task = tokio::spawn(udp::recv_loop(
        "unicast",
        socket,
        node.clone(),
        shutdown_tx.subscribe(),
    ));

    let multicast_task = multicast.map(|socket| {
        tokio::spawn(udp::recv_loop(
            "multicast",
            socket,
            node.clone(),
            shutdown_tx.subscribe(),
        ))
    });

    let delivery_task = tokio::spawn(log_deliveries(deliveries));

    node.start();

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    let clean = tokio::select! {
        _ = shutdown_rx.recv() => {
            tracing::info!("shutting down");
            true
        }
        r = send_worker_task => {
            tracing::error!("send worker exited: {:?}", r);
            false
        }
        r = unicast_task => {
            tracing::error!("unicast receive loop exited: {:?}", r);
            false
        }
        r = async {
            match multicast_task {
                Some(task) => task.await,
                None => std::future::pending().await,
            }
        } => {
            tracing::error!("multicast receive loop exited: {:?}", r);
            false
        }
        r = delivery_task => {
            tracing::error!("delivery logger exited: {:?}", r);
            false
        }
    };

    if clean {
        node.stop();
    } else {
        node.fail();
    }
    tracing::info!(peers = peers.len(), "tetherd stopped");
    Ok(())
}

async fn log_deliveries(mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(Delivery { sender, payload }) = deliveries.recv().await {
        tracing::info!(
            peer = %sender,
            len = payload.len(),
            text = %String::from_utf8_lossy(&payload),
            "application message received"
        );
    }
}
