// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Cluster health monitor: tracks peer liveness over a pub/sub intercom.
//!
//! Two workers share the intercom endpoint. The publisher drains the event
//! channel and publishes every event; the processor subscribes to the
//! intercom (and, transitively, to monitored peers' heartbeat endpoints) and
//! owns the entire peer map. Feeding every state change through the intercom
//! keeps the map single-writer: probes and external callers never touch it
//! directly, they only emit events.
//!
//! Peers move through two phases. A peer that merely advertised routes is
//! *tracked*: no heartbeats are expected yet, and prolonged silence triggers
//! a connectivity probe. Once this node actually talks to the peer it is
//! promoted to *monitored*: heartbeats are expected, and missing too many in
//! a row declares the peer dead and asks the router to evict it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::Barrier;
use tokio::task::JoinHandle;
use tokio::time::interval_at;
use tokio::time::Instant as TokioInstant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::HealthMonitorConfig;
use crate::errors::MessagingError;
use crate::errors::TransportError;
use crate::identifiers::Health;
use crate::identifiers::NodeAddress;
use crate::identifiers::ReceiverIdentifier;
use crate::message::HealthMessage;
use crate::message::Payload;
use crate::message::RouterMessage;
use crate::message::ServiceMessage;
use crate::router::RouterHandle;
use crate::security::SecurityProvider;
use crate::transport::SocketFactory;
use crate::transport::TransportSocket;


/// Dead-peer sweep period before the first monitored peer arrives. Shrinks
/// to the fastest peer heartbeat interval as peers are promoted.
const INITIAL_DEAD_PEERS_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Cheap clonable handle other components emit liveness events through
#[derive(Clone)]
pub struct ClusterHealthMonitorHandle {
    pub(crate) events: mpsc::UnboundedSender<HealthMessage>,
}

impl ClusterHealthMonitorHandle {
    /// Start tracking a peer that advertised routes, without monitoring it
    pub fn add_peer(&self, peer: NodeAddress, health: Health) -> Result<(), MessagingError> {
        self.emit(HealthMessage::AddPeer { peer, health })
    }

    /// Promote a peer to heartbeat monitoring
    pub fn start_peer_monitoring(
        &self,
        peer: NodeAddress,
        health: Health,
    ) -> Result<(), MessagingError> {
        self.emit(HealthMessage::StartPeerMonitoring { peer, health })
    }

    /// Stop tracking a peer
    pub fn delete_peer(&self, node_identity: ReceiverIdentifier) -> Result<(), MessagingError> {
        self.emit(HealthMessage::DeletePeer { node_identity })
    }

    fn emit(&self, event: HealthMessage) -> Result<(), MessagingError> {
        self.events
            .send(event)
            .map_err(|_| MessagingError::RouterChannelClosed)
    }
}

/// The monitor itself; [ClusterHealthMonitor::start] splits it into its two
/// workers
pub struct ClusterHealthMonitor {
    config: HealthMonitorConfig,
    sockets: Arc<dyn SocketFactory>,
    security: Arc<dyn SecurityProvider>,
    router: RouterHandle,
    events_tx: mpsc::UnboundedSender<HealthMessage>,
    events_rx: mpsc::UnboundedReceiver<HealthMessage>,
}

impl ClusterHealthMonitor {
    /// Create a monitor and the handle used to feed it events
    pub fn new(
        config: HealthMonitorConfig,
        sockets: Arc<dyn SocketFactory>,
        security: Arc<dyn SecurityProvider>,
        router: RouterHandle,
    ) -> (Self, ClusterHealthMonitorHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = ClusterHealthMonitorHandle {
            events: events_tx.clone(),
        };
        let this = Self {
            config,
            sockets,
            security,
            router,
            events_tx,
            events_rx,
        };
        (this, handle)
    }

    /// Spawn the publisher and processor workers. Returns once both have
    /// finished their socket setup, so events emitted after this call are
    /// guaranteed to reach the processor.
    pub async fn start(
        self,
        cancellation: CancellationToken,
    ) -> (JoinHandle<()>, JoinHandle<()>) {
        let barrier = Arc::new(Barrier::new(3));

        let publisher = tokio::spawn(publish_intercom_events(
            self.config.intercom_endpoint.clone(),
            self.sockets.clone(),
            self.events_rx,
            barrier.clone(),
            cancellation.clone(),
        ));

        let processor = HealthProcessor {
            config: self.config,
            sockets: self.sockets,
            security: self.security,
            router: self.router,
            events: self.events_tx,
            peers: HashMap::new(),
        };
        let processor = tokio::spawn(processor.run(barrier.clone(), cancellation));

        barrier.wait().await;
        info!("Cluster health monitor started");
        (publisher, processor)
    }
}

/// Publisher worker: drains the event channel onto the intercom
async fn publish_intercom_events(
    intercom_endpoint: String,
    sockets: Arc<dyn SocketFactory>,
    mut events: mpsc::UnboundedReceiver<HealthMessage>,
    barrier: Arc<Barrier>,
    cancellation: CancellationToken,
) {
    let mut socket = sockets.publisher_socket();
    let bound = socket.bind(&intercom_endpoint).await;
    barrier.wait().await;
    if let Err(err) = bound {
        error!("Health intercom publisher failed to bind {intercom_endpoint}: {err}");
        return;
    }

    loop {
        let event = tokio::select! {
            _ = cancellation.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        if let Err(err) = socket.send(RouterMessage::health(event)).await {
            warn!("Failed to publish health intercom event: {err}");
        }
    }
    debug!("Health intercom publisher stopped");
}

/// What woke the processor loop up
enum Wake {
    Cancelled,
    StaleTick,
    DeadTick,
    Inbound(Result<Option<RouterMessage>, TransportError>),
}

/// Processor worker state. `peers` is owned here and mutated nowhere else.
struct HealthProcessor {
    config: HealthMonitorConfig,
    sockets: Arc<dyn SocketFactory>,
    security: Arc<dyn SecurityProvider>,
    router: RouterHandle,
    events: mpsc::UnboundedSender<HealthMessage>,
    peers: HashMap<ReceiverIdentifier, ClusterMemberMeta>,
}

impl HealthProcessor {
    async fn run(mut self, barrier: Arc<Barrier>, cancellation: CancellationToken) {
        let mut socket = self.sockets.subscriber_socket();
        let connected = socket
            .connect(&self.config.intercom_endpoint, true)
            .await;
        socket.subscribe(None);
        barrier.wait().await;
        if let Err(err) = connected {
            error!(
                "Health processor failed to connect intercom {}: {err}",
                self.config.intercom_endpoint
            );
            return;
        }

        let stale_period = self.config.stale_peers_check_interval;
        let mut stale_check = interval_at(TokioInstant::now() + stale_period, stale_period);
        let mut dead_period = INITIAL_DEAD_PEERS_CHECK_INTERVAL;
        let mut dead_check = interval_at(TokioInstant::now() + dead_period, dead_period);

        loop {
            let wake = tokio::select! {
                _ = cancellation.cancelled() => Wake::Cancelled,
                _ = stale_check.tick() => Wake::StaleTick,
                _ = dead_check.tick() => Wake::DeadTick,
                inbound = socket.receive(&cancellation) => Wake::Inbound(inbound),
            };
            match wake {
                Wake::Cancelled => break,
                Wake::StaleTick => self.check_stale_peers(),
                Wake::DeadTick => self.check_dead_peers(&mut *socket).await,
                Wake::Inbound(Ok(Some(message))) => {
                    if let Some(interval) = self.handle_message(message, &mut *socket).await {
                        // sweep at least as often as the fastest peer
                        // heartbeats; the timer only ever gets faster
                        if interval < dead_period {
                            dead_period = interval;
                            dead_check =
                                interval_at(TokioInstant::now() + dead_period, dead_period);
                        }
                    }
                }
                Wake::Inbound(Ok(None)) => break,
                Wake::Inbound(Err(err)) => {
                    warn!("Health intercom receive failed: {err}");
                }
            }
        }
        debug!("Health processor stopped");
    }

    /// Handle one intercom message; returns a new heartbeat interval when a
    /// peer was promoted to monitoring
    async fn handle_message(
        &mut self,
        message: RouterMessage,
        socket: &mut dyn TransportSocket,
    ) -> Option<Duration> {
        let Payload::Health(event) = message.payload else {
            warn!(
                "Unexpected message {} on health intercom",
                message.identifier
            );
            return None;
        };
        match event {
            HealthMessage::HeartBeat { node_identity } => {
                self.on_heartbeat(node_identity);
                None
            }
            HealthMessage::AddPeer { peer, health } => {
                self.on_add_peer(peer, health);
                None
            }
            HealthMessage::StartPeerMonitoring { peer, health } => {
                self.on_start_peer_monitoring(peer, health, socket).await
            }
            HealthMessage::DeletePeer { node_identity } => {
                self.on_delete_peer(node_identity, socket).await;
                None
            }
        }
    }

    fn on_heartbeat(&mut self, node_identity: ReceiverIdentifier) {
        match self.peers.get_mut(&node_identity) {
            Some(meta) => meta.refresh_heartbeat(Instant::now()),
            None => warn!("HeartBeat from unknown peer {node_identity}"),
        }
    }

    /// Track a peer without expecting heartbeats yet. Re-adding a known peer
    /// changes nothing, the first registration wins.
    fn on_add_peer(&mut self, peer: NodeAddress, health: Health) {
        debug!("AddPeer {peer}");
        self.peers
            .entry(peer.identity.clone())
            .or_insert_with(|| ClusterMemberMeta::new(peer.uri, health));
    }

    /// Promote a peer to heartbeat monitoring and subscribe to its heartbeat
    /// endpoint
    async fn on_start_peer_monitoring(
        &mut self,
        peer: NodeAddress,
        health: Health,
        socket: &mut dyn TransportSocket,
    ) -> Option<Duration> {
        let meta = self
            .peers
            .entry(peer.identity.clone())
            .or_insert_with(|| ClusterMemberMeta::new(peer.uri.clone(), health.clone()));
        info!(
            "Start monitoring peer {peer} on {}",
            meta.health_uri
        );
        meta.connection_established = true;
        meta.refresh_heartbeat(Instant::now());
        let health_uri = meta.health_uri.clone();
        let interval = meta.heartbeat_interval;

        if let Err(err) = socket.connect(&health_uri, false).await {
            warn!("Failed to connect heartbeat endpoint {health_uri}: {err}");
        }
        Some(interval)
    }

    async fn on_delete_peer(
        &mut self,
        node_identity: ReceiverIdentifier,
        socket: &mut dyn TransportSocket,
    ) {
        match self.peers.remove(&node_identity) {
            Some(meta) => {
                if meta.connection_established {
                    if let Err(err) = socket.disconnect(&meta.health_uri).await {
                        warn!(
                            "Failed to disconnect heartbeat endpoint {}: {err}",
                            meta.health_uri
                        );
                    }
                }
            }
            None => warn!("DeletePeer for unknown peer {node_identity}"),
        }
    }

    /// Drop monitored peers whose heartbeats stopped and ask the router to
    /// evict them
    async fn check_dead_peers(&mut self, socket: &mut dyn TransportSocket) {
        let now = Instant::now();
        let allowed_missing = self.config.missing_heartbeats_before_deletion;
        let dead: Vec<ReceiverIdentifier> = self
            .peers
            .iter()
            .filter(|(_, meta)| {
                meta.connection_established
                    && now.duration_since(meta.last_known_heartbeat)
                        > meta.heartbeat_interval * allowed_missing
            })
            .map(|(identity, _)| identity.clone())
            .collect();

        for identity in dead {
            if let Some(meta) = self.peers.remove(&identity) {
                warn!(
                    "Peer {identity} declared dead, last heartbeat {:?} ago",
                    now.duration_since(meta.last_known_heartbeat)
                );
                if self
                    .router
                    .route(RouterMessage::service(ServiceMessage::UnregisterNode {
                        node_identity: identity,
                    }))
                    .is_err()
                {
                    warn!("Router is gone, cannot evict dead peer");
                }
                if let Err(err) = socket.disconnect(&meta.health_uri).await {
                    warn!(
                        "Failed to disconnect heartbeat endpoint {}: {err}",
                        meta.health_uri
                    );
                }
            }
        }
    }

    /// Probe tracked-but-unmonitored peers that have been silent too long.
    /// Probing happens off-loop; outcomes come back as events.
    fn check_stale_peers(&self) {
        let now = Instant::now();
        let stale: Vec<NodeAddress> = self
            .peers
            .iter()
            .filter(|(_, meta)| {
                !meta.connection_established
                    && now.duration_since(meta.last_known_heartbeat)
                        > self.config.peer_is_stale_after
            })
            .map(|(identity, meta)| NodeAddress {
                uri: meta.scale_out_uri.clone(),
                identity: identity.clone(),
            })
            .collect();
        if stale.is_empty() {
            return;
        }

        debug!("Probing {} stale peer(s)", stale.len());
        tokio::spawn(check_connectivity(
            self.sockets.clone(),
            self.security.clone(),
            self.router.clone(),
            self.events.clone(),
            stale,
        ));
    }
}

/// Liveness bookkeeping for one peer
struct ClusterMemberMeta {
    health_uri: String,
    heartbeat_interval: Duration,
    scale_out_uri: String,
    last_known_heartbeat: Instant,
    connection_established: bool,
}

impl ClusterMemberMeta {
    fn new(scale_out_uri: String, health: Health) -> Self {
        Self {
            health_uri: health.heartbeat_uri,
            heartbeat_interval: health.heartbeat_interval,
            scale_out_uri,
            last_known_heartbeat: Instant::now(),
            connection_established: false,
        }
    }

    /// Timestamps only move forward; a late probe result cannot rewind a
    /// fresher heartbeat
    fn refresh_heartbeat(&mut self, seen_at: Instant) {
        if seen_at > self.last_known_heartbeat {
            self.last_known_heartbeat = seen_at;
        }
    }
}

/// Probe each peer once. A reachable peer is reported live through the
/// event channel; an unreachable one is handed to the router for eviction.
/// One peer's failure never stops the rest of the sweep.
async fn check_connectivity(
    sockets: Arc<dyn SocketFactory>,
    security: Arc<dyn SecurityProvider>,
    router: RouterHandle,
    events: mpsc::UnboundedSender<HealthMessage>,
    peers: Vec<NodeAddress>,
) {
    for peer in peers {
        match probe_peer(&*sockets, &*security, &peer).await {
            Ok(()) => {
                let _ = events.send(HealthMessage::HeartBeat {
                    node_identity: peer.identity,
                });
            }
            Err(err) => {
                warn!("Stale peer {peer} is unreachable: {err}");
                let _ = router.route(RouterMessage::service(ServiceMessage::UnregisterNode {
                    node_identity: peer.identity,
                }));
            }
        }
    }
}

/// Send one signed ping to a peer's scale-out socket over a throwaway
/// connection
async fn probe_peer(
    sockets: &dyn SocketFactory,
    security: &dyn SecurityProvider,
    peer: &NodeAddress,
) -> Result<(), TransportError> {
    let mut socket = sockets.router_socket();
    socket.set_mandatory_routing();
    socket.connect(&peer.uri, true).await?;
    let mut ping = RouterMessage::service(ServiceMessage::Ping);
    ping.set_receiver_node(peer.identity.clone());
    security.sign(&mut ping);
    socket.send(ping).await?;
    socket.disconnect(&peer.uri).await?;
    Ok(())
}
