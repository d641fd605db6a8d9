// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The message router: one dispatch loop that owns both routing tables.
//!
//! Everything flows through a single task. Local receivers register through
//! the handle, locally produced and wire-received envelopes arrive on the
//! message channel, and the loop decides per envelope whether it is consumed
//! locally, forwarded to peers, or surfaced to the cluster as unhandled.
//! Because the loop is the only mutator, the tables need no locking.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::cluster::compute_advertisement_delta;
use crate::cluster::health::ClusterHealthMonitorHandle;
use crate::cluster::{advertisement_groups, ClusterBootstrap};
use crate::config::RouterConfig;
use crate::errors::MessagingError;
use crate::errors::ProcessingError;
use crate::errors::TransportError;
use crate::identifiers::Distribution;
use crate::message::Payload;
use crate::message::RouterMessage;
use crate::message::ServiceMessage;
use crate::routing::external::ExternalRouteLookupRequest;
use crate::routing::external::ExternalRoutingTable;
use crate::routing::external::PeerConnection;
use crate::routing::internal::InternalRouteLookupRequest;
use crate::routing::internal::InternalRouteRegistration;
use crate::routing::internal::InternalRoutingTable;
use crate::security::SecurityProvider;
use crate::transport::SocketFactory;
use crate::transport::TransportSocket;

mod service;


/// Cheap clonable handle for feeding the router
#[derive(Clone)]
pub struct RouterHandle {
    pub(crate) messages: mpsc::UnboundedSender<RouterMessage>,
    pub(crate) registrations: mpsc::UnboundedSender<InternalRouteRegistration>,
}

impl RouterHandle {
    /// Hand an envelope to the router for dispatch
    pub fn route(&self, message: RouterMessage) -> Result<(), MessagingError> {
        self.messages
            .send(message)
            .map_err(|_| MessagingError::RouterChannelClosed)
    }

    /// Register a local receiver and its message contracts
    pub fn register(&self, registration: InternalRouteRegistration) -> Result<(), MessagingError> {
        self.registrations
            .send(registration)
            .map_err(|_| MessagingError::RouterChannelClosed)
    }
}

/// What woke the dispatch loop up
enum Turn {
    Stop,
    Message(RouterMessage),
    Registration(InternalRouteRegistration),
}

/// The router; [MessageRouter::start] turns it into the dispatch task
pub struct MessageRouter {
    sockets: Arc<dyn SocketFactory>,
    messages_rx: mpsc::UnboundedReceiver<RouterMessage>,
    registrations_rx: mpsc::UnboundedReceiver<InternalRouteRegistration>,
    core: RouterCore,
}

impl MessageRouter {
    /// Create a router and the handle used to feed it
    pub fn new(
        config: RouterConfig,
        sockets: Arc<dyn SocketFactory>,
        security: Arc<dyn SecurityProvider>,
        bootstrap: Arc<dyn ClusterBootstrap>,
        health: ClusterHealthMonitorHandle,
    ) -> (Self, RouterHandle) {
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (registrations_tx, registrations_rx) = mpsc::unbounded_channel();
        let handle = RouterHandle {
            messages: messages_tx,
            registrations: registrations_tx,
        };
        let this = Self {
            sockets,
            messages_rx,
            registrations_rx,
            core: RouterCore {
                config,
                security,
                bootstrap,
                health,
                internal: InternalRoutingTable::new(),
                external: ExternalRoutingTable::new(),
            },
        };
        (this, handle)
    }

    /// Spawn the dispatch loop
    pub fn start(self, cancellation: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancellation))
    }

    async fn run(self, cancellation: CancellationToken) {
        let Self {
            sockets,
            mut messages_rx,
            mut registrations_rx,
            mut core,
        } = self;
        let mut backend = sockets.router_socket();
        backend.set_mandatory_routing();
        info!("Message router started as {}", core.config.scale_out_address);

        loop {
            let turn = tokio::select! {
                _ = cancellation.cancelled() => Turn::Stop,
                message = messages_rx.recv() => message.map(Turn::Message).unwrap_or(Turn::Stop),
                registration = registrations_rx.recv() => {
                    registration.map(Turn::Registration).unwrap_or(Turn::Stop)
                }
            };
            match turn {
                Turn::Stop => break,
                Turn::Message(message) => core.dispatch(message, &mut *backend).await,
                Turn::Registration(registration) => {
                    core.handle_internal_registration(registration)
                }
            }
        }
        debug!("Message router stopped");
    }
}

/// Dispatch state: the two tables plus every collaborator the handlers need.
/// Only the dispatch task (or a test driving it directly) ever holds one.
pub(crate) struct RouterCore {
    pub(crate) config: RouterConfig,
    pub(crate) security: Arc<dyn SecurityProvider>,
    pub(crate) bootstrap: Arc<dyn ClusterBootstrap>,
    pub(crate) health: ClusterHealthMonitorHandle,
    pub(crate) internal: InternalRoutingTable,
    pub(crate) external: ExternalRoutingTable,
}

impl RouterCore {
    /// Dispatch one envelope
    pub(crate) async fn dispatch(
        &mut self,
        message: RouterMessage,
        backend: &mut dyn TransportSocket,
    ) {
        if let Payload::Service(service) = &message.payload {
            let service = service.clone();
            self.handle_service_message(service, backend).await;
        } else {
            self.handle_operation_message(message, backend).await;
        }
    }

    async fn handle_operation_message(
        &mut self,
        message: RouterMessage,
        backend: &mut dyn TransportSocket,
    ) {
        let addressed_elsewhere = message.receiver_node_identity.is_set()
            && message.receiver_node_identity != self.config.scale_out_address.identity;

        let mut handled = false;
        if !addressed_elsewhere {
            handled = self.handle_message_locally(&message);
        }
        if !handled || message.distribution == Distribution::Broadcast {
            handled = self.forward_message_away(&message, backend).await || handled;
        }
        if !handled {
            self.process_unhandled_message(&message);
        }
    }

    /// Deliver to matching local receivers. A dead receiver is purged on the
    /// spot and its vacated routes retracted from the cluster; the failure
    /// never aborts the message.
    fn handle_message_locally(&mut self, message: &RouterMessage) -> bool {
        let destinations = self
            .internal
            .find_routes(&InternalRouteLookupRequest::of(message));
        let mut vacated = Vec::new();
        for destination in &destinations {
            if let Err(err) = destination.send(message.clone()) {
                warn!(
                    "Local receiver gone, dropping message {}: {err}",
                    message.identifier
                );
                vacated.extend(self.internal.remove_endpoint(destination.id()));
            }
        }
        if !vacated.is_empty() {
            self.bootstrap.unregister_self(vacated);
        }
        !destinations.is_empty()
    }

    /// Forward to matching peers. Returns whether any peer routes matched;
    /// an unreachable peer is evicted through the normal UnregisterNode
    /// path but still counts as a matched route.
    async fn forward_message_away(
        &mut self,
        message: &RouterMessage,
        backend: &mut dyn TransportSocket,
    ) -> bool {
        // a broadcast received over the wire was already fanned out by its
        // origin node; forwarding it again would loop it through the cluster
        if message.distribution == Distribution::Broadcast && !message.came_from_local_actor() {
            return false;
        }

        let routes = self
            .external
            .find_routes(&ExternalRouteLookupRequest::of(message));
        let mut unreachable = Vec::new();
        for route in &routes {
            if let Err(err) = self.forward_to_peer(message, route, backend).await {
                warn!(
                    "Failed to forward message {} to {}: {err}",
                    message.identifier, route.node
                );
                let host_unreachable = err
                    .downcast_ref::<TransportError>()
                    .map(|err| matches!(err, TransportError::HostUnreachable(_)))
                    .unwrap_or(false);
                if host_unreachable {
                    unreachable.push(route.node.identity.clone());
                }
            }
        }
        for node_identity in unreachable {
            self.handle_service_message(ServiceMessage::UnregisterNode { node_identity }, backend)
                .await;
        }
        !routes.is_empty()
    }

    /// Send one envelope to one peer, dialing the connection first if this
    /// is the peer's first use. The caller's envelope is cloned before any
    /// routing state is written to it.
    async fn forward_to_peer(
        &mut self,
        message: &RouterMessage,
        route: &PeerConnection,
        backend: &mut dyn TransportSocket,
    ) -> Result<(), ProcessingError> {
        if !route.connected {
            backend.connect(&route.node.uri, true).await?;
            self.external.mark_connected(&route.node.identity);
            if let Err(err) = self
                .health
                .start_peer_monitoring(route.node.clone(), route.health.clone())
            {
                warn!("Health monitor unavailable: {err}");
            }
        }

        let mut outbound = message.clone();
        outbound.set_receiver_node(route.node.identity.clone());
        outbound.add_hop();
        outbound.push_router_address(self.config.scale_out_address.clone());
        self.security.sign(&mut outbound);
        backend.send(outbound).await?;
        debug!("Message {} forwarded to {}", message.identifier, route.node);
        Ok(())
    }

    /// No route matched anywhere. Ask the cluster for one; this is a normal
    /// outcome during route propagation, not an error.
    fn process_unhandled_message(&mut self, message: &RouterMessage) {
        let identifier = message.handler_identifier();
        self.bootstrap.discover_route(&identifier);
        if !message.came_from_local_actor() {
            // the sender routed here off a stale advertisement; retract it
            self.bootstrap.unregister_self(vec![identifier.clone()]);
            warn!("Message {identifier} received from another node has no local handler");
        } else {
            debug!("No handler for locally produced message {identifier}");
        }
    }

    /// Register a local receiver and advertise whatever became newly
    /// advertisable, grouped by security domain
    pub(crate) fn handle_internal_registration(&mut self, registration: InternalRouteRegistration) {
        let before = self.internal.advertisable_routes();
        self.internal.add_message_route(registration);
        let after = self.internal.advertisable_routes();

        let (to_register, to_unregister) = compute_advertisement_delta(&before, &after);
        if !to_unregister.is_empty() {
            self.bootstrap.unregister_self(to_unregister);
        }
        for (domain, identifiers) in advertisement_groups(to_register, &*self.security) {
            self.bootstrap.register_self(identifiers, &domain);
        }
    }
}
