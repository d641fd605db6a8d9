// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Transport abstraction the router and health monitor are written against.
//!
//! The fabric never touches a concrete wire library; it asks a
//! [SocketFactory] for message-oriented sockets and drives them through the
//! [TransportSocket] trait. Production wires a real transport in, tests wire
//! an in-memory one.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::TransportError;
use crate::message::RouterMessage;

/// A message-oriented socket.
///
/// Semantics the fabric relies on:
/// * `connect`/`disconnect` are idempotent per URI.
/// * `send` on a router socket with mandatory routing set fails with
///   [TransportError::HostUnreachable] when the receiver node is not
///   connected, instead of buffering silently.
/// * `receive` returns `Ok(None)` when the cancellation token fires while
///   waiting.
#[async_trait]
pub trait TransportSocket: Send {
    /// Connect to an endpoint. When `wait_for_establishment` is set the call
    /// returns only once the connection is usable (or errors).
    async fn connect(&mut self, uri: &str, wait_for_establishment: bool)
        -> Result<(), TransportError>;

    /// Disconnect from an endpoint
    async fn disconnect(&mut self, uri: &str) -> Result<(), TransportError>;

    /// Bind to an endpoint and start accepting traffic
    async fn bind(&mut self, uri: &str) -> Result<(), TransportError>;

    /// Send one message
    async fn send(&mut self, message: RouterMessage) -> Result<(), TransportError>;

    /// Receive one message, or `None` if cancelled while waiting
    async fn receive(
        &mut self,
        cancellation: &CancellationToken,
    ) -> Result<Option<RouterMessage>, TransportError>;

    /// Make sends fail when the destination is unknown instead of dropping
    fn set_mandatory_routing(&mut self);

    /// Subscribe to a topic on a subscriber socket; `None` subscribes to all
    fn subscribe(&mut self, topic: Option<&[u8]>);
}

/// Mints the sockets the fabric needs
pub trait SocketFactory: Send + Sync {
    /// A bidirectional, identity-addressed socket for node-to-node traffic
    fn router_socket(&self) -> Box<dyn TransportSocket>;

    /// A publish socket for the health intercom and heartbeats
    fn publisher_socket(&self) -> Box<dyn TransportSocket>;

    /// A subscribe socket for consuming heartbeats and intercom events
    fn subscriber_socket(&self) -> Box<dyn TransportSocket>;
}
