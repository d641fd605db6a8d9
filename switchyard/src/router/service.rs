// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Service-message handling: the cluster-facing verbs the router consumes
//! off its own channel. Handlers run as ordered match arms; each verb has
//! exactly one.

use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::cluster::advertisement_groups;
use crate::identifiers::{Health, MessageIdentifier, NodeAddress, ReceiverIdentifier};
use crate::message::{RouteContract, ServiceMessage};
use crate::routing::external::{
    ExternalRouteRegistration, ExternalRouteRemoval, PeerConnectionAction,
};
use crate::transport::TransportSocket;

use super::RouterCore;

impl RouterCore {
    /// Handle one service message
    pub(crate) async fn handle_service_message(
        &mut self,
        message: ServiceMessage,
        backend: &mut dyn TransportSocket,
    ) {
        match message {
            ServiceMessage::RegisterExternalRoutes {
                peer,
                health,
                routes,
            } => self.register_external_routes(peer, health, routes),
            ServiceMessage::UnregisterMessageRoutes { peer, routes } => {
                self.unregister_message_routes(peer, routes, backend).await
            }
            ServiceMessage::UnregisterNode { node_identity } => {
                self.unregister_node(node_identity, backend).await
            }
            ServiceMessage::DiscoverRoutes { identifier } => {
                self.respond_to_route_discovery(identifier)
            }
            ServiceMessage::Ping => trace!("Ping received"),
        }
    }

    /// A peer advertised routes. Register what passes the domain check and
    /// start tracking the peer's liveness; the connection itself is dialed
    /// lazily on first use.
    fn register_external_routes(
        &mut self,
        peer: NodeAddress,
        health: Health,
        routes: Vec<RouteContract>,
    ) {
        if peer.identity == self.config.scale_out_address.identity {
            // own advertisement echoed back through the cluster
            return;
        }

        let mut registered_any = false;
        for route in routes {
            // hub (wildcard) routes are announced per allowed domain by the
            // peer already; only exact identifiers need the domain check here
            if !route.message.is_wildcard() {
                match self.security.domain_of(route.message.identity()) {
                    Ok(domain) if self.security.domain_is_allowed(&domain) => {}
                    Ok(domain) => {
                        warn!(
                            "Route {} from {peer} skipped, domain {domain} not allowed",
                            route.message
                        );
                        continue;
                    }
                    Err(err) => {
                        warn!("Route {} from {peer} skipped: {err}", route.message);
                        continue;
                    }
                }
            }
            match self.external.add_message_route(ExternalRouteRegistration {
                peer: peer.clone(),
                health: health.clone(),
                route,
            }) {
                Ok(_) => registered_any = true,
                Err(err) => warn!("Route registration from {peer} failed: {err}"),
            }
        }

        if registered_any {
            if let Err(err) = self.health.add_peer(peer, health) {
                warn!("Health monitor unavailable: {err}");
            }
        }
    }

    /// A peer retracted routes. When its last receiver goes, the node's
    /// liveness tracking stops, and the connection is torn down unless other
    /// nodes share the URI.
    async fn unregister_message_routes(
        &mut self,
        peer: NodeAddress,
        routes: Vec<RouteContract>,
        backend: &mut dyn TransportSocket,
    ) {
        let mut node_removed = false;
        let mut disconnect_uri = None;
        for route in routes {
            let result = self.external.remove_message_route(&ExternalRouteRemoval {
                node_identity: peer.identity.clone(),
                route,
            });
            match result.connection_action {
                PeerConnectionAction::Disconnect => {
                    node_removed = true;
                    disconnect_uri = result.uri;
                }
                PeerConnectionAction::KeepConnection => node_removed = true,
                PeerConnectionAction::NotFound => {}
            }
        }

        if let Some(uri) = disconnect_uri {
            if let Err(err) = backend.disconnect(&uri).await {
                warn!("Failed to disconnect {uri}: {err}");
            }
        }
        if node_removed {
            if let Err(err) = self.health.delete_peer(peer.identity) {
                warn!("Health monitor unavailable: {err}");
            }
        }
    }

    /// Drop every route to a node, stop tracking its liveness and tear down
    /// the connection when the node was the last one behind its URI
    async fn unregister_node(
        &mut self,
        node_identity: ReceiverIdentifier,
        backend: &mut dyn TransportSocket,
    ) {
        let result = self.external.remove_node_route(&node_identity);
        match result.connection_action {
            PeerConnectionAction::Disconnect => {
                if let Some(uri) = &result.uri {
                    if let Err(err) = backend.disconnect(uri).await {
                        warn!("Failed to disconnect {uri}: {err}");
                    }
                }
            }
            PeerConnectionAction::KeepConnection => {}
            PeerConnectionAction::NotFound => {
                debug!("UnregisterNode for untracked node {node_identity}");
                return;
            }
        }
        if let Err(err) = self.health.delete_peer(node_identity) {
            warn!("Health monitor unavailable: {err}");
        }
    }

    /// A peer is looking for a route. Re-advertise when this node handles
    /// the message, either exactly or through a hub.
    fn respond_to_route_discovery(&mut self, identifier: MessageIdentifier) {
        let advertisable = self.internal.advertisable_routes();
        let wildcard = MessageIdentifier::any(identifier.identity().clone());

        let matched = if advertisable.contains(&identifier) {
            identifier
        } else if advertisable.contains(&wildcard) {
            wildcard
        } else {
            return;
        };
        for (domain, identifiers) in advertisement_groups(vec![matched], &*self.security) {
            self.bootstrap.register_self(identifiers, &domain);
        }
    }
}
