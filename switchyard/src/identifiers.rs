// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Identity types shared by the routing tables, the router and the cluster
//! layer.
//!
//! A [MessageIdentifier] names a message type flowing through the fabric.
//! A [ReceiverIdentifier] names something that can receive such a message:
//! a local actor, a local message hub, or a remote node's scale-out socket.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

/// First byte of a [ReceiverIdentifier] produced by [ReceiverIdentifier::actor]
const RECEIVER_TAG_ACTOR: u8 = 1;
/// First byte of a [ReceiverIdentifier] produced by
/// [ReceiverIdentifier::message_hub]
const RECEIVER_TAG_MESSAGE_HUB: u8 = 2;

/// The name of a message type. Routing keys are compared structurally, so two
/// identifiers built from the same parts are the same route.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageIdentifier {
    /// A fully-qualified message type: base identity plus version plus
    /// partition. This is what concrete actor handlers register.
    Exact {
        /// Base message identity
        identity: Bytes,
        /// Contract version
        version: u16,
        /// Partition the message belongs to
        partition: Bytes,
    },
    /// A wildcard over a base identity, matching every version and partition.
    /// This is what message hubs register.
    Any {
        /// Base message identity
        identity: Bytes,
    },
}

impl MessageIdentifier {
    /// Build a fully-qualified identifier
    pub fn exact(identity: impl Into<Bytes>, version: u16, partition: impl Into<Bytes>) -> Self {
        Self::Exact {
            identity: identity.into(),
            version,
            partition: partition.into(),
        }
    }

    /// Build a wildcard identifier over a base identity
    pub fn any(identity: impl Into<Bytes>) -> Self {
        Self::Any {
            identity: identity.into(),
        }
    }

    /// The base message identity
    pub fn identity(&self) -> &Bytes {
        match self {
            Self::Exact { identity, .. } => identity,
            Self::Any { identity } => identity,
        }
    }

    /// Contract version, 0 for wildcards
    pub fn version(&self) -> u16 {
        match self {
            Self::Exact { version, .. } => *version,
            Self::Any { .. } => 0,
        }
    }

    /// Partition, empty for wildcards
    pub fn partition(&self) -> Bytes {
        match self {
            Self::Exact { partition, .. } => partition.clone(),
            Self::Any { .. } => Bytes::new(),
        }
    }

    /// Is this a wildcard (hub-style) identifier?
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Any { .. })
    }
}

impl fmt::Display for MessageIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact {
                identity,
                version,
                partition,
            } => write!(
                f,
                "{}:{}:{}",
                printable(identity),
                version,
                printable(partition)
            ),
            Self::Any { identity } => write!(f, "{}:*", printable(identity)),
        }
    }
}

/// Kinds of local receivers a tagged [ReceiverIdentifier] can denote
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiverKind {
    /// A concrete actor handling exact message identifiers
    Actor,
    /// A message hub handling wildcard identifiers
    MessageHub,
}

/// An opaque receiver identity.
///
/// Identities minted by [ReceiverIdentifier::actor] and
/// [ReceiverIdentifier::message_hub] carry a leading tag byte so the routing
/// layer can tell the two kinds apart. Node identities arrive from the wire
/// and are untagged; for those [ReceiverIdentifier::kind] returns `None`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceiverIdentifier(Bytes);

impl ReceiverIdentifier {
    /// Mint an actor receiver identity
    pub fn actor(identity: impl Into<Bytes>) -> Self {
        Self(tag_identity(RECEIVER_TAG_ACTOR, &identity.into()))
    }

    /// Mint a message-hub receiver identity
    pub fn message_hub(identity: impl Into<Bytes>) -> Self {
        Self(tag_identity(RECEIVER_TAG_MESSAGE_HUB, &identity.into()))
    }

    /// Wrap raw identity bytes (node identities from the wire)
    pub fn from_bytes(identity: impl Into<Bytes>) -> Self {
        Self(identity.into())
    }

    /// An unset receiver identity
    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    /// Is this identity set at all?
    pub fn is_set(&self) -> bool {
        !self.0.is_empty()
    }

    /// The raw identity bytes
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    /// The receiver kind encoded in the tag byte, if any
    pub fn kind(&self) -> Option<ReceiverKind> {
        match self.0.first() {
            Some(&RECEIVER_TAG_ACTOR) => Some(ReceiverKind::Actor),
            Some(&RECEIVER_TAG_MESSAGE_HUB) => Some(ReceiverKind::MessageHub),
            _ => None,
        }
    }

    /// Does the tag byte say "actor"?
    pub fn is_actor(&self) -> bool {
        self.kind() == Some(ReceiverKind::Actor)
    }

    /// Does the tag byte say "message hub"?
    pub fn is_message_hub(&self) -> bool {
        self.kind() == Some(ReceiverKind::MessageHub)
    }
}

impl fmt::Display for ReceiverIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", printable(&self.0))
    }
}

fn tag_identity(tag: u8, identity: &Bytes) -> Bytes {
    let mut tagged = Vec::with_capacity(identity.len() + 1);
    tagged.push(tag);
    tagged.extend_from_slice(identity);
    Bytes::from(tagged)
}

fn printable(bytes: &Bytes) -> String {
    if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// How a message fans out over matching routes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Distribution {
    /// Deliver to exactly one matching route
    Unicast,
    /// Deliver to every matching route
    Broadcast,
}

/// Where a node's scale-out socket lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAddress {
    /// Endpoint URI of the node's scale-out socket
    pub uri: String,
    /// The node's socket identity
    pub identity: ReceiverIdentifier,
}

impl NodeAddress {
    /// Construct a node address from a URI and raw identity bytes
    pub fn new(uri: impl Into<String>, identity: impl Into<Bytes>) -> Self {
        Self {
            uri: uri.into(),
            identity: ReceiverIdentifier::from_bytes(identity),
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.identity, self.uri)
    }
}

/// A peer's liveness contract: where it publishes heartbeats and how often
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Health {
    /// URI the peer publishes heartbeats on
    pub heartbeat_uri: String,
    /// Interval between two heartbeats of a healthy peer
    pub heartbeat_interval: Duration,
}
