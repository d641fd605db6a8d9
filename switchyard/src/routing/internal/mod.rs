// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Internal routing table: message identifiers to local receivers.
//!
//! Owned and mutated exclusively by the message router's dispatch task; no
//! interior locking anywhere in here.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::errors::MessagingError;
use crate::identifiers::{Distribution, MessageIdentifier, ReceiverIdentifier};
use crate::message::RouterMessage;


/// Endpoint id allocator. The id is only unique per-node, which is all the
/// purge bookkeeping needs.
static ENDPOINT_ID_ALLOCATOR: AtomicU64 = AtomicU64::new(0u64);

/// The local delivery side of a receiver: a cheap clonable handle the table
/// stores and the router sends into
#[derive(Clone, Debug)]
pub struct LocalEndpoint {
    id: u64,
    tx: mpsc::UnboundedSender<RouterMessage>,
}

impl LocalEndpoint {
    /// Mint an endpoint together with the receiving half its owner reads from
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RouterMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let this = Self {
            id: ENDPOINT_ID_ALLOCATOR.fetch_add(1u64, Ordering::Relaxed),
            tx,
        };
        (this, rx)
    }

    /// The node-unique endpoint id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Deliver one message to the receiver behind this endpoint
    pub fn send(&self, message: RouterMessage) -> Result<(), MessagingError> {
        self.tx
            .send(message)
            .map_err(|_| MessagingError::EndpointUnreachable)
    }
}

impl PartialEq for LocalEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LocalEndpoint {}

/// One message identifier a receiver registers, with its visibility flag
#[derive(Clone, Debug)]
pub struct IdentityRegistration {
    /// The message identifier being registered
    pub identifier: MessageIdentifier,
    /// When set, the route is never advertised to the cluster
    pub keep_local: bool,
}

/// A batch registration for one local receiver
#[derive(Debug)]
pub struct InternalRouteRegistration {
    /// The receiver's identity, for directed lookups
    pub receiver: ReceiverIdentifier,
    /// Where matched messages are delivered
    pub destination: LocalEndpoint,
    /// The message identifiers the receiver handles
    pub contracts: Vec<IdentityRegistration>,
}

/// A lookup against the internal table
#[derive(Clone, Debug)]
pub struct InternalRouteLookupRequest {
    /// Directed receiver, if the envelope names one
    pub receiver_identity: ReceiverIdentifier,
    /// The message identifier to match
    pub message: MessageIdentifier,
    /// Requested fan-out
    pub distribution: Distribution,
}

impl InternalRouteLookupRequest {
    /// Build a lookup from an envelope's routing fields
    pub fn of(message: &RouterMessage) -> Self {
        Self {
            receiver_identity: message.receiver_identity.clone(),
            message: message.identifier.clone(),
            distribution: message.distribution,
        }
    }
}

/// Message identifier to local receiver map with a wildcard index and
/// directed (receiver-identity) lookups
#[derive(Default)]
pub struct InternalRoutingTable {
    /// Exact identifier -> endpoints, in registration order
    exact_routes: HashMap<MessageIdentifier, Vec<LocalEndpoint>>,
    /// Wildcard base identity -> endpoints, in registration order
    wildcard_routes: HashMap<Bytes, Vec<LocalEndpoint>>,
    /// Receiver identity -> its endpoint, for directed delivery
    receivers: HashMap<ReceiverIdentifier, LocalEndpoint>,
    /// Endpoint id -> identifiers it registered, for purge
    endpoint_routes: HashMap<u64, HashSet<MessageIdentifier>>,
    /// Identifiers excluded from cluster advertisement
    keep_local: HashSet<MessageIdentifier>,
}

impl InternalRoutingTable {
    /// An empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a receiver and its message contracts. Re-registering an
    /// identifier for the same endpoint is idempotent, except that it
    /// refreshes the endpoint's recency for unicast selection.
    pub fn add_message_route(&mut self, registration: InternalRouteRegistration) {
        let InternalRouteRegistration {
            receiver,
            destination,
            contracts,
        } = registration;

        if receiver.is_set() {
            self.receivers.insert(receiver, destination.clone());
        }

        for contract in contracts {
            let routes = match &contract.identifier {
                MessageIdentifier::Any { identity } => {
                    self.wildcard_routes.entry(identity.clone()).or_default()
                }
                exact => self.exact_routes.entry(exact.clone()).or_default(),
            };
            routes.retain(|endpoint| endpoint.id != destination.id);
            routes.push(destination.clone());

            self.endpoint_routes
                .entry(destination.id)
                .or_default()
                .insert(contract.identifier.clone());
            if contract.keep_local {
                self.keep_local.insert(contract.identifier.clone());
            }
        }
    }

    /// Resolve a lookup to delivery endpoints.
    ///
    /// A directed lookup resolves through the receiver index alone. An
    /// undirected lookup matches the exact index plus the wildcard index for
    /// the message's base identity; unicast picks the most recently
    /// registered match, broadcast returns every match once.
    pub fn find_routes(&self, lookup: &InternalRouteLookupRequest) -> Vec<LocalEndpoint> {
        if lookup.receiver_identity.is_set() {
            return self
                .receivers
                .get(&lookup.receiver_identity)
                .cloned()
                .into_iter()
                .collect();
        }

        let mut matched = Vec::new();
        if let Some(routes) = self.exact_routes.get(&lookup.message) {
            matched.extend(routes.iter().cloned());
        }
        if let Some(routes) = self.wildcard_routes.get(lookup.message.identity()) {
            matched.extend(routes.iter().cloned());
        }

        match lookup.distribution {
            Distribution::Unicast => matched.pop().into_iter().collect(),
            Distribution::Broadcast => {
                let mut seen = HashSet::new();
                matched.retain(|endpoint| seen.insert(endpoint.id));
                matched
            }
        }
    }

    /// Drop every route owned by an endpoint. Returns the advertised
    /// identifiers the node can no longer handle at all, which the caller
    /// must retract from the cluster.
    pub fn remove_endpoint(&mut self, endpoint_id: u64) -> Vec<MessageIdentifier> {
        self.receivers
            .retain(|_, endpoint| endpoint.id != endpoint_id);

        let Some(identifiers) = self.endpoint_routes.remove(&endpoint_id) else {
            return Vec::new();
        };

        let mut retracted = Vec::new();
        for identifier in identifiers {
            let emptied = match &identifier {
                MessageIdentifier::Any { identity } => {
                    prune_routes(&mut self.wildcard_routes, identity, endpoint_id)
                }
                exact => prune_routes(&mut self.exact_routes, exact, endpoint_id),
            };
            if emptied {
                if self.keep_local.remove(&identifier) {
                    continue;
                }
                retracted.push(identifier);
            }
        }
        retracted
    }

    /// Every identifier this node advertises to the cluster
    pub fn advertisable_routes(&self) -> HashSet<MessageIdentifier> {
        self.exact_routes
            .keys()
            .cloned()
            .chain(
                self.wildcard_routes
                    .keys()
                    .map(|identity| MessageIdentifier::any(identity.clone())),
            )
            .filter(|identifier| !self.keep_local.contains(identifier))
            .collect()
    }
}

/// Remove one endpoint from a route list, dropping the key when the last
/// route goes. Returns whether the key was dropped.
fn prune_routes<K>(
    routes: &mut HashMap<K, Vec<LocalEndpoint>>,
    key: &K,
    endpoint_id: u64,
) -> bool
where
    K: std::hash::Hash + Eq,
{
    if let Some(endpoints) = routes.get_mut(key) {
        endpoints.retain(|endpoint| endpoint.id != endpoint_id);
        if endpoints.is_empty() {
            routes.remove(key);
            return true;
        }
    }
    false
}
