// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The message envelope moved by the router, plus the control payloads the
//! fabric itself exchanges (service and health messages).

use bytes::Bytes;

use crate::identifiers::{Distribution, Health, MessageIdentifier, NodeAddress, ReceiverIdentifier};

/// Version every fabric-internal control message is registered under
pub const CONTROL_MESSAGE_VERSION: u16 = 1;

/// The envelope routed through the fabric.
///
/// The payload is opaque to the router; routing decisions are made on the
/// envelope fields alone. Envelopes that leave the node are cloned before any
/// routing state (receiver node, hops, trail, signature) is written, so the
/// caller's copy is never mutated mid-flight.
#[derive(Clone, Debug)]
pub struct RouterMessage {
    /// What message type this is
    pub identifier: MessageIdentifier,
    /// Unicast or broadcast fan-out
    pub distribution: Distribution,
    /// Optional directed receiver (actor or hub) on the destination node
    pub receiver_identity: ReceiverIdentifier,
    /// Optional destination node; unset means "route by identifier"
    pub receiver_node_identity: ReceiverIdentifier,
    /// Number of node-to-node forwards this envelope has taken
    pub hops: u16,
    /// Scale-out addresses of every router that forwarded this envelope
    pub trail: Vec<NodeAddress>,
    /// Signature written by the security provider before leaving the node
    pub signature: Bytes,
    /// The payload being routed
    pub payload: Payload,
}

impl RouterMessage {
    /// An application operation message
    pub fn operation(
        identifier: MessageIdentifier,
        distribution: Distribution,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            identifier,
            distribution,
            receiver_identity: ReceiverIdentifier::empty(),
            receiver_node_identity: ReceiverIdentifier::empty(),
            hops: 0,
            trail: Vec::new(),
            signature: Bytes::new(),
            payload: Payload::Operation(body.into()),
        }
    }

    /// A fabric control message
    pub fn service(message: ServiceMessage) -> Self {
        Self {
            identifier: message.identifier(),
            distribution: Distribution::Unicast,
            receiver_identity: ReceiverIdentifier::empty(),
            receiver_node_identity: ReceiverIdentifier::empty(),
            hops: 0,
            trail: Vec::new(),
            signature: Bytes::new(),
            payload: Payload::Service(message),
        }
    }

    /// A liveness message published on a health intercom
    pub fn health(message: HealthMessage) -> Self {
        Self {
            identifier: message.identifier(),
            distribution: Distribution::Broadcast,
            receiver_identity: ReceiverIdentifier::empty(),
            receiver_node_identity: ReceiverIdentifier::empty(),
            hops: 0,
            trail: Vec::new(),
            signature: Bytes::new(),
            payload: Payload::Health(message),
        }
    }

    /// Record one node-to-node forward
    pub fn add_hop(&mut self) {
        self.hops = self.hops.saturating_add(1);
    }

    /// Append a forwarding router's scale-out address to the trail
    pub fn push_router_address(&mut self, address: NodeAddress) {
        self.trail.push(address);
    }

    /// Direct the envelope at a specific node
    pub fn set_receiver_node(&mut self, node: ReceiverIdentifier) {
        self.receiver_node_identity = node;
    }

    /// True when the envelope was produced on this node and has not yet been
    /// forwarded anywhere
    pub fn came_from_local_actor(&self) -> bool {
        self.hops == 0
    }

    /// The identifier routing should match on: a directed envelope is looked
    /// up by its receiver identity, everything else by its message identifier.
    pub fn handler_identifier(&self) -> MessageIdentifier {
        if self.receiver_identity.is_set() {
            MessageIdentifier::any(self.receiver_identity.as_bytes().clone())
        } else {
            self.identifier.clone()
        }
    }
}

/// Payload variants carried by a [RouterMessage]
#[derive(Clone, Debug)]
pub enum Payload {
    /// Opaque application payload
    Operation(Bytes),
    /// Fabric control payload, consumed by the message router
    Service(ServiceMessage),
    /// Liveness payload, exchanged over health intercoms
    Health(HealthMessage),
}

/// One advertised route: a receiver on some node and a message it handles
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteContract {
    /// The receiver handling the message
    pub receiver: ReceiverIdentifier,
    /// The message it handles
    pub message: MessageIdentifier,
}

/// Control messages the router consumes off its own channel. These are the
/// cluster-facing verbs: peers advertising and retracting routes, node
/// eviction, route discovery and connectivity pings.
#[derive(Clone, Debug)]
pub enum ServiceMessage {
    /// A peer advertises routes it can handle
    RegisterExternalRoutes {
        /// The advertising peer's scale-out address
        peer: NodeAddress,
        /// The peer's liveness contract
        health: Health,
        /// The routes being advertised
        routes: Vec<RouteContract>,
    },
    /// A peer retracts previously advertised routes
    UnregisterMessageRoutes {
        /// The retracting peer's scale-out address
        peer: NodeAddress,
        /// The routes being retracted
        routes: Vec<RouteContract>,
    },
    /// Drop every route to a node and tear down its connection if unused
    UnregisterNode {
        /// Identity of the node being evicted
        node_identity: ReceiverIdentifier,
    },
    /// Ask the cluster who handles a message
    DiscoverRoutes {
        /// The unresolved message identifier
        identifier: MessageIdentifier,
    },
    /// Connectivity probe; elicits no reply, reachability is what is tested
    Ping,
}

impl ServiceMessage {
    /// The well-known identifier this control message is routed under
    pub fn identifier(&self) -> MessageIdentifier {
        let identity: &'static [u8] = match self {
            Self::RegisterExternalRoutes { .. } => b"SVC.REGISTER-EXTERNAL-ROUTES",
            Self::UnregisterMessageRoutes { .. } => b"SVC.UNREGISTER-MESSAGE-ROUTES",
            Self::UnregisterNode { .. } => b"SVC.UNREGISTER-NODE",
            Self::DiscoverRoutes { .. } => b"SVC.DISCOVER-ROUTES",
            Self::Ping => b"SVC.PING",
        };
        MessageIdentifier::exact(identity, CONTROL_MESSAGE_VERSION, Bytes::new())
    }
}

/// Liveness events published between a node's health publisher and the peer
/// monitors subscribed to it
#[derive(Clone, Debug)]
pub enum HealthMessage {
    /// Start tracking a peer without monitoring it yet
    AddPeer {
        /// The peer's scale-out address
        peer: NodeAddress,
        /// The peer's liveness contract
        health: Health,
    },
    /// Promote a peer to full heartbeat monitoring
    StartPeerMonitoring {
        /// The peer's scale-out address
        peer: NodeAddress,
        /// The peer's liveness contract
        health: Health,
    },
    /// Stop tracking a peer
    DeletePeer {
        /// Identity of the peer to drop
        node_identity: ReceiverIdentifier,
    },
    /// A peer's periodic proof of life
    HeartBeat {
        /// Identity of the live peer
        node_identity: ReceiverIdentifier,
    },
}

impl HealthMessage {
    /// The well-known identifier this liveness message is published under
    pub fn identifier(&self) -> MessageIdentifier {
        let identity: &'static [u8] = match self {
            Self::AddPeer { .. } => b"HC.ADD-PEER",
            Self::StartPeerMonitoring { .. } => b"HC.START-PEER-MONITORING",
            Self::DeletePeer { .. } => b"HC.DELETE-PEER",
            Self::HeartBeat { .. } => b"HC.HEARTBEAT",
        };
        MessageIdentifier::exact(identity, CONTROL_MESSAGE_VERSION, Bytes::new())
    }
}
