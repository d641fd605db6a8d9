// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! External routing table: message identifiers to cluster peers.
//!
//! Six coupled indices keep the peer topology queryable from every
//! direction: which nodes handle a message, which receivers live on a node,
//! which messages an actor handles, and which nodes share one physical
//! connection (several node identities can sit behind a single URI).
//! Owned and mutated exclusively by the message router's dispatch task.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::errors::RouteRegistrationError;
use crate::identifiers::{Distribution, Health, MessageIdentifier, NodeAddress, ReceiverIdentifier};
use crate::message::{RouteContract, RouterMessage};

#[cfg(test)]
mod tests;

/// Connection state of one peer node
#[derive(Clone, Debug)]
pub struct PeerConnection {
    /// The peer's scale-out address
    pub node: NodeAddress,
    /// The peer's liveness contract
    pub health: Health,
    /// Whether the underlying socket connection has been established
    pub connected: bool,
}

/// What the caller must do with the physical connection after a removal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerConnectionAction {
    /// Last node behind the URI is gone, disconnect the socket
    Disconnect,
    /// Other nodes still share the URI, keep the socket connected
    KeepConnection,
    /// The node was not tracked
    NotFound,
}

/// Outcome of a node or route removal
#[derive(Clone, Debug)]
pub struct PeerRemoveResult {
    /// URI of the removed node's connection, when the node was tracked
    pub uri: Option<String>,
    /// Required action on the physical connection
    pub connection_action: PeerConnectionAction,
}

/// One route advertised by a peer
#[derive(Clone, Debug)]
pub struct ExternalRouteRegistration {
    /// The advertising peer
    pub peer: NodeAddress,
    /// The peer's liveness contract
    pub health: Health,
    /// The advertised route
    pub route: RouteContract,
}

/// A lookup against the external table
#[derive(Clone, Debug)]
pub struct ExternalRouteLookupRequest {
    /// Directed destination node, if the envelope names one
    pub receiver_node_identity: ReceiverIdentifier,
    /// The message identifier to match
    pub message: MessageIdentifier,
    /// Requested fan-out
    pub distribution: Distribution,
}

impl ExternalRouteLookupRequest {
    /// Build a lookup from an envelope's routing fields
    pub fn of(message: &RouterMessage) -> Self {
        Self {
            receiver_node_identity: message.receiver_node_identity.clone(),
            message: message.identifier.clone(),
            distribution: message.distribution,
        }
    }
}

/// One route retraction from a peer. An unset receiver retracts the message
/// from every actor on the node.
#[derive(Clone, Debug)]
pub struct ExternalRouteRemoval {
    /// Identity of the retracting node
    pub node_identity: ReceiverIdentifier,
    /// The route being retracted
    pub route: RouteContract,
}

/// Peer route registry with round-robin unicast selection and shared-URI
/// connection accounting
#[derive(Default)]
pub struct ExternalRoutingTable {
    /// Node -> message hubs living on it
    node_message_hubs: HashMap<ReceiverIdentifier, HashSet<ReceiverIdentifier>>,
    /// Node -> actors living on it
    node_actors: HashMap<ReceiverIdentifier, HashSet<ReceiverIdentifier>>,
    /// Actor -> messages it handles
    actor_messages: HashMap<ReceiverIdentifier, HashSet<MessageIdentifier>>,
    /// Message -> nodes handling it, in round-robin order
    message_nodes: HashMap<MessageIdentifier, VecDeque<ReceiverIdentifier>>,
    /// Node -> its connection state
    node_connection: HashMap<ReceiverIdentifier, PeerConnection>,
    /// Connection URI -> nodes reachable through it
    connection_nodes: HashMap<String, HashSet<ReceiverIdentifier>>,
}

impl ExternalRoutingTable {
    /// An empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one advertised route. Returns the (possibly pre-existing)
    /// connection state for the peer; a node seen for the first time starts
    /// out not connected.
    pub fn add_message_route(
        &mut self,
        registration: ExternalRouteRegistration,
    ) -> Result<PeerConnection, RouteRegistrationError> {
        let node_identity = registration.peer.identity.clone();

        if registration.route.receiver.is_actor() {
            self.map_message_to_node(&registration.route.message, &node_identity);
            self.actor_messages
                .entry(registration.route.receiver.clone())
                .or_default()
                .insert(registration.route.message.clone());
            self.node_actors
                .entry(node_identity.clone())
                .or_default()
                .insert(registration.route.receiver.clone());
        } else if registration.route.receiver.is_message_hub() {
            self.node_message_hubs
                .entry(node_identity.clone())
                .or_default()
                .insert(registration.route.receiver.clone());
        } else {
            return Err(RouteRegistrationError::UnknownReceiverKind(
                registration.route.receiver,
            ));
        }

        let connection = self
            .node_connection
            .entry(node_identity.clone())
            .or_insert_with(|| PeerConnection {
                node: registration.peer,
                health: registration.health,
                connected: false,
            });
        self.connection_nodes
            .entry(connection.node.uri.clone())
            .or_default()
            .insert(node_identity);

        Ok(connection.clone())
    }

    fn map_message_to_node(
        &mut self,
        message: &MessageIdentifier,
        node_identity: &ReceiverIdentifier,
    ) {
        let nodes = self.message_nodes.entry(message.clone()).or_default();
        if !nodes.contains(node_identity) {
            nodes.push_back(node_identity.clone());
        }
    }

    /// Resolve a lookup to peer connections.
    ///
    /// A lookup directed at a tracked node resolves to that node alone.
    /// Otherwise the message index decides: unicast takes the node at the
    /// front of the rotation and moves it to the back, broadcast returns
    /// every node handling the message.
    pub fn find_routes(&mut self, lookup: &ExternalRouteLookupRequest) -> Vec<PeerConnection> {
        if lookup.receiver_node_identity.is_set() {
            if let Some(connection) = self.node_connection.get(&lookup.receiver_node_identity) {
                return vec![connection.clone()];
            }
        }

        let mut peers = Vec::new();
        if let Some(nodes) = self.message_nodes.get_mut(&lookup.message) {
            match lookup.distribution {
                Distribution::Unicast => {
                    if let Some(node) = nodes.pop_front() {
                        nodes.push_back(node.clone());
                        if let Some(connection) = self.node_connection.get(&node) {
                            peers.push(connection.clone());
                        }
                    }
                }
                Distribution::Broadcast => {
                    for node in nodes.iter() {
                        if let Some(connection) = self.node_connection.get(node) {
                            peers.push(connection.clone());
                        }
                    }
                }
            }
        }
        peers
    }

    /// Record that the physical connection to a node has been established
    pub fn mark_connected(&mut self, node_identity: &ReceiverIdentifier) {
        if let Some(connection) = self.node_connection.get_mut(node_identity) {
            connection.connected = true;
        }
    }

    /// The connection state for a node, if tracked
    pub fn connection_of(&self, node_identity: &ReceiverIdentifier) -> Option<&PeerConnection> {
        self.node_connection.get(node_identity)
    }

    /// Drop a node and every route pointing at it
    pub fn remove_node_route(&mut self, node_identity: &ReceiverIdentifier) -> PeerRemoveResult {
        let Some(connection) = self.node_connection.remove(node_identity) else {
            return PeerRemoveResult {
                uri: None,
                connection_action: PeerConnectionAction::NotFound,
            };
        };

        let connection_action = self.remove_peer_node(&connection.node.uri, node_identity);
        self.node_message_hubs.remove(node_identity);
        if let Some(actors) = self.node_actors.remove(node_identity) {
            for actor in actors {
                if let Some(messages) = self.actor_messages.remove(&actor) {
                    for message in messages {
                        self.unmap_message_from_node(&message, node_identity);
                    }
                }
            }
        }

        debug!(
            "External route removed Uri:{} Socket:{}",
            connection.node.uri, node_identity
        );
        PeerRemoveResult {
            uri: Some(connection.node.uri),
            connection_action,
        }
    }

    /// Retract one route from a node. The node itself (and its connection
    /// accounting) goes away only when its last receiver does.
    pub fn remove_message_route(&mut self, removal: &ExternalRouteRemoval) -> PeerRemoveResult {
        let node_identity = &removal.node_identity;
        let Some(connection) = self.node_connection.get(node_identity).cloned() else {
            return PeerRemoveResult {
                uri: None,
                connection_action: PeerConnectionAction::NotFound,
            };
        };

        if removal.route.receiver.is_message_hub() {
            self.remove_message_hub_route(removal, node_identity);
        } else if removal.route.receiver.is_actor() {
            self.remove_actor_route(removal, node_identity);
        } else {
            self.remove_message_from_all_actors(removal, node_identity);
        }

        let mut connection_action = PeerConnectionAction::NotFound;
        if !self.node_actors.contains_key(node_identity)
            && !self.node_message_hubs.contains_key(node_identity)
        {
            self.node_connection.remove(node_identity);
            connection_action = self.remove_peer_node(&connection.node.uri, node_identity);
            debug!(
                "External route removed Uri:{} Socket:{}",
                connection.node.uri, node_identity
            );
        }

        PeerRemoveResult {
            uri: Some(connection.node.uri),
            connection_action,
        }
    }

    fn remove_peer_node(
        &mut self,
        uri: &str,
        node_identity: &ReceiverIdentifier,
    ) -> PeerConnectionAction {
        if let Some(nodes) = self.connection_nodes.get_mut(uri) {
            if nodes.remove(node_identity) {
                if nodes.is_empty() {
                    self.connection_nodes.remove(uri);
                    return PeerConnectionAction::Disconnect;
                }
                return PeerConnectionAction::KeepConnection;
            }
        }
        PeerConnectionAction::NotFound
    }

    fn remove_message_hub_route(
        &mut self,
        removal: &ExternalRouteRemoval,
        node_identity: &ReceiverIdentifier,
    ) {
        if let Some(hubs) = self.node_message_hubs.get_mut(node_identity) {
            if hubs.remove(&removal.route.receiver) {
                if hubs.is_empty() {
                    self.node_message_hubs.remove(node_identity);
                }
                debug!(
                    "External MessageHub removed Node:[{}] Identity:[{}]",
                    node_identity, removal.route.receiver
                );
            }
        }
    }

    fn remove_actor_route(
        &mut self,
        removal: &ExternalRouteRemoval,
        node_identity: &ReceiverIdentifier,
    ) {
        if let Some(messages) = self.actor_messages.get_mut(&removal.route.receiver) {
            messages.remove(&removal.route.message);
            if messages.is_empty() {
                self.actor_messages.remove(&removal.route.receiver);
                if let Some(actors) = self.node_actors.get_mut(node_identity) {
                    actors.remove(&removal.route.receiver);
                    if actors.is_empty() {
                        self.node_actors.remove(node_identity);
                    }
                }
            }
            // the node stays in the message's rotation only while some other
            // actor on it still handles the message
            if !self.node_handles_message(node_identity, &removal.route.message) {
                self.unmap_message_from_node(&removal.route.message, node_identity);
            }
            debug!(
                "External message route removed Socket:{} Message:[{}]",
                node_identity, removal.route.message
            );
        }
    }

    fn node_handles_message(
        &self,
        node_identity: &ReceiverIdentifier,
        message: &MessageIdentifier,
    ) -> bool {
        self.node_actors
            .get(node_identity)
            .is_some_and(|actors| {
                actors.iter().any(|actor| {
                    self.actor_messages
                        .get(actor)
                        .is_some_and(|messages| messages.contains(message))
                })
            })
    }

    fn remove_message_from_all_actors(
        &mut self,
        removal: &ExternalRouteRemoval,
        node_identity: &ReceiverIdentifier,
    ) {
        let message = &removal.route.message;
        let Some(nodes) = self.message_nodes.get_mut(message) else {
            return;
        };
        let Some(position) = nodes.iter().position(|node| node == node_identity) else {
            return;
        };
        let _ = nodes.remove(position);
        if nodes.is_empty() {
            self.message_nodes.remove(message);
        }

        if let Some(actors) = self.node_actors.get_mut(node_identity) {
            let mut empty_actors = Vec::new();
            for actor in actors.iter() {
                if let Some(messages) = self.actor_messages.get_mut(actor) {
                    if messages.remove(message) && messages.is_empty() {
                        self.actor_messages.remove(actor);
                        empty_actors.push(actor.clone());
                    }
                }
            }
            for actor in empty_actors {
                actors.remove(&actor);
            }
            if actors.is_empty() {
                self.node_actors.remove(node_identity);
            }
        }
    }

    fn unmap_message_from_node(
        &mut self,
        message: &MessageIdentifier,
        node_identity: &ReceiverIdentifier,
    ) {
        if let Some(nodes) = self.message_nodes.get_mut(message) {
            if let Some(position) = nodes.iter().position(|node| node == node_identity) {
                let _ = nodes.remove(position);
            }
            if nodes.is_empty() {
                self.message_nodes.remove(message);
            }
        }
    }
}
