// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! # switchyard
//!
//! Message routing and cluster liveness for a distributed actor fabric.
//!
//! A node in the fabric runs one [router::MessageRouter] and one
//! [cluster::health::ClusterHealthMonitor]. The router owns two tables: the
//! internal routing table maps message identifiers to local receivers, the
//! external routing table maps them to peer nodes across the cluster. Local
//! receivers register their message contracts through the
//! [router::RouterHandle]; registrations are advertised to the cluster
//! through a pluggable [cluster::ClusterBootstrap], grouped by security
//! domain.
//!
//! An envelope handed to the router is delivered to matching local
//! receivers first and forwarded to peers when no local receiver consumed it
//! (broadcasts do both). Connections to peers are dialed lazily on first
//! use, which also promotes the peer to heartbeat monitoring in the health
//! monitor. Peers that stop heartbeating, or that fail a connectivity
//! probe, are evicted from the routing tables through the same service
//! message path advertisement retractions use.
//!
//! The wire itself is abstracted behind [transport::TransportSocket] and
//! [transport::SocketFactory]; the crate ships no concrete transport.

#![deny(missing_docs)]
#![warn(unsafe_code)]
#![warn(unused_imports)]

pub mod cluster;
pub mod config;
pub mod errors;
pub mod identifiers;
pub mod message;
pub mod router;
pub mod routing;
pub mod security;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::HealthMonitorConfig;
pub use config::RouterConfig;
pub use identifiers::Distribution;
pub use identifiers::Health;
pub use identifiers::MessageIdentifier;
pub use identifiers::NodeAddress;
pub use identifiers::ReceiverIdentifier;
pub use message::RouterMessage;
pub use router::MessageRouter;
pub use router::RouterHandle;
