// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Error types for routing, transport and security operations

use std::error::Error;
use std::fmt::Display;

use crate::identifiers::ReceiverIdentifier;

/// Boxed error for fallible message-processing paths where the concrete
/// failure only matters for logging
pub type ProcessingError = Box<dyn Error + Send + Sync + 'static>;

/// Failures raised by a [crate::transport::TransportSocket]
#[derive(Debug)]
pub enum TransportError {
    /// The destination peer cannot be reached (mandatory routing failed)
    HostUnreachable(String),
    /// Connecting to an endpoint failed
    ConnectionFailed {
        /// Endpoint that refused the connection
        uri: String,
        /// Transport-specific reason
        reason: String,
    },
    /// A send did not complete in time
    SendTimeout,
    /// The socket is closed
    Closed,
}

impl Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HostUnreachable(who) => write!(f, "Host unreachable: {who}"),
            Self::ConnectionFailed { uri, reason } => {
                write!(f, "Connection to {uri} failed: {reason}")
            }
            Self::SendTimeout => write!(f, "Send timed out"),
            Self::Closed => write!(f, "Socket closed"),
        }
    }
}

impl Error for TransportError {}

/// Failures registering a route in the external routing table
#[derive(Debug)]
pub enum RouteRegistrationError {
    /// The receiver identity carries no known kind tag, so the table cannot
    /// tell whether to index it as an actor or a message hub
    UnknownReceiverKind(ReceiverIdentifier),
}

impl Display for RouteRegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownReceiverKind(receiver) => {
                write!(f, "Receiver {receiver} is neither an actor nor a message hub")
            }
        }
    }
}

impl Error for RouteRegistrationError {}

/// Failures raised by a [crate::security::SecurityProvider]
#[derive(Debug)]
pub enum SecurityError {
    /// No security domain is mapped for the given message identity
    MessageNotSupported(String),
    /// The domain exists but is not allowed on this node
    DomainNotAllowed(String),
}

impl Display for SecurityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageNotSupported(identity) => {
                write!(f, "No security domain registered for message {identity}")
            }
            Self::DomainNotAllowed(domain) => write!(f, "Domain {domain} is not allowed"),
        }
    }
}

impl Error for SecurityError {}

/// Failures handing messages between the fabric's workers
#[derive(Debug)]
pub enum MessagingError {
    /// The router's inbound channel is closed, the router has shut down
    RouterChannelClosed,
    /// A local endpoint's channel is closed, the receiver is gone
    EndpointUnreachable,
}

impl Display for MessagingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RouterChannelClosed => write!(f, "Router channel closed"),
            Self::EndpointUnreachable => write!(f, "Local endpoint is unreachable"),
        }
    }
}

impl Error for MessagingError {}
