//! Node lifecycle: builds the stage chain and drives the heartbeat.
//!
//! A node is inert until [`Node::start`]. Starting fires `NodeUp` through
//! the chain and spawns one heartbeat task; stopping aborts it and fires
//! `NodeDown`, which makes every stage drop its caches before `stop`
//! returns.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use tether_core::config::{ConfigError, RemoteConfig};
use tether_core::{Body, Envelope, Identity, PublicKey};

use crate::arm::ArmStage;
use crate::chunking::{ChunkAssembler, ChunkingStage};
use crate::clock::SharedClock;
use crate::codec::WireCodec;
use crate::discovery::{InternetDiscovery, LocalNetworkDiscovery, StaticRoutes};
use crate::error::PipelineError;
use crate::filters::{HopCountGuard, OtherNetworkFilter, ProofOfWorkFilter};
use crate::peers::SharedPeersManager;
use crate::pipeline::{Address, Delivery, NodeEvent, Outgoing, Pipeline, Stage};
use crate::rate_limit::RateLimiter;

/// Receiving ends of the pipeline's two exits.
pub struct NodeHandles {
    /// Frames for the transport.
    pub outgoing: mpsc::UnboundedReceiver<Outgoing>,
    /// Application messages addressed to this node.
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

struct Inner {
    identity: Arc<Identity>,
    network_id: i32,
    ping_interval: Duration,
    pipeline: Pipeline,
    discovery: Arc<InternetDiscovery>,
    running: AtomicBool,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    /// Held for a whole heartbeat and while shutting down.
    ticking: Mutex<()>,
}

impl Node {
    pub fn new(
        config: &RemoteConfig,
        identity: Arc<Identity>,
        peers_manager: SharedPeersManager,
        clock: SharedClock,
    ) -> Result<(Self, NodeHandles), ConfigError> {
        let super_peers = config.super_peer_endpoints()?;
        let static_routes = config.static_route_endpoints()?;
        let me = identity.public_key();

        let discovery = Arc::new(InternetDiscovery::new(
            identity.clone(),
            config,
            super_peers,
            peers_manager.clone(),
            clock.clone(),
        ));
        let assembler = ChunkAssembler::new(
            config.message_max_content_length,
            config.message_composed_transfer_timeout_ms,
            clock.clone(),
        );

        let mut stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(WireCodec),
            Arc::new(OtherNetworkFilter::new(config.network_id)),
            Arc::new(ProofOfWorkFilter::new(config.pow_difficulty)),
            Arc::new(ChunkingStage::new(me, config.message_mtu, assembler)),
            Arc::new(RateLimiter::new(me, config.rate_limit_window_ms, clock.clone())),
            Arc::new(ArmStage::new(identity.clone(), config.message_arm_enabled)),
            Arc::new(HopCountGuard::new(config.message_hop_limit)),
            discovery.clone() as Arc<dyn Stage>,
        ];
        if config.local_discovery {
            stages.push(Arc::new(LocalNetworkDiscovery::new(
                identity.clone(),
                config.network_id,
                config.ping_timeout_ms,
                peers_manager.clone(),
                clock,
            )));
        }
        stages.push(Arc::new(StaticRoutes::new(static_routes, peers_manager)));

        let (outgoing_tx, outgoing) = mpsc::unbounded_channel();
        let (deliveries_tx, deliveries) = mpsc::unbounded_channel();
        let pipeline = Pipeline::new(stages, outgoing_tx, deliveries_tx);
        tracing::debug!(stages = ?pipeline.stage_names(), "stage chain built");

        let node = Self {
            inner: Arc::new(Inner {
                identity,
                network_id: config.network_id,
                ping_interval: config.ping_interval().max(Duration::from_millis(1)),
                pipeline,
                discovery,
                running: AtomicBool::new(false),
                heartbeat: Mutex::new(None),
                ticking: Mutex::new(()),
            }),
        };
        Ok((node, NodeHandles { outgoing, deliveries }))
    }

    pub fn public_key(&self) -> PublicKey {
        self.inner.identity.public_key()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn discovery(&self) -> &InternetDiscovery {
        &self.inner.discovery
    }

    /// Must be called within a tokio runtime. Starting twice is a no-op.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(public_key = %self.public_key(), "node up");
        self.inner.pipeline.fire(NodeEvent::NodeUp);

        let period = self.inner.ping_interval;
        let delay = Duration::from_millis(rand::thread_rng().gen_range(0..period.as_millis().max(1) as u64));
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                inner.tick();
            }
        });
        if let Some(old) = self.lock_heartbeat().replace(task) {
            old.abort();
        }
    }

    pub fn stop(&self) {
        self.shut_down(NodeEvent::NodeDown);
    }

    /// The transport failed for good. Behaves like [`Node::stop`].
    pub fn fail(&self) {
        self.shut_down(NodeEvent::UnrecoverableError);
    }

    /// Send an application payload to `recipient`.
    pub fn send(&self, recipient: PublicKey, payload: Bytes) -> Result<(), PipelineError> {
        if !self.is_running() {
            return Err(PipelineError::Stopped);
        }
        let envelope = Envelope::new(
            self.inner.network_id,
            self.public_key(),
            self.inner.identity.proof_of_work(),
            recipient,
            Body::Application(payload),
        );
        tracing::trace!(peer = %recipient, id = %envelope.id(), "sending application message");
        self.inner.pipeline.outbound(Address::Peer(recipient), envelope.into())
    }

    /// Feed a frame the transport received from `from`.
    pub fn receive(&self, from: SocketAddr, bytes: Bytes) -> Result<(), PipelineError> {
        if !self.is_running() {
            return Err(PipelineError::Stopped);
        }
        self.inner.pipeline.inbound(from, bytes)
    }

    /// Run one heartbeat now. Ignored while stopped.
    pub fn tick(&self) {
        self.inner.tick();
    }

    fn shut_down(&self, event: NodeEvent) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.lock_heartbeat().take() {
            task.abort();
        }
        // a heartbeat already past its running check finishes first
        let _ticking = self.inner.lock_ticking();
        tracing::info!(public_key = %self.public_key(), ?event, "node down");
        self.inner.pipeline.fire(event);
    }

    fn lock_heartbeat(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.heartbeat.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn tick(&self) {
        let _ticking = self.lock_ticking();
        if self.running.load(Ordering::SeqCst) {
            self.pipeline.tick();
        }
    }

    fn lock_ticking(&self) -> std::sync::MutexGuard<'_, ()> {
        self.ticking.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
