// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Test doubles: an in-memory transport with scriptable failures, a
//! recording cluster bootstrap and a polling assertion helper

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterBootstrap;
use crate::errors::TransportError;
use crate::identifiers::MessageIdentifier;
use crate::identifiers::ReceiverIdentifier;
use crate::message::RouterMessage;
use crate::transport::SocketFactory;
use crate::transport::TransportSocket;

const ENDPOINT_CAPACITY: usize = 64;

/// A process-local "network". Bound endpoints are broadcast channels keyed
/// by URI; subscriber connects tap into them, router-socket sends are
/// recorded for inspection. URIs and node identities can be marked
/// unreachable to script failures.
#[derive(Clone, Default)]
pub(crate) struct InMemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: Mutex<HashMap<String, broadcast::Sender<RouterMessage>>>,
    sent: Mutex<Vec<RouterMessage>>,
    unreachable_uris: Mutex<HashSet<String>>,
    unreachable_nodes: Mutex<HashSet<ReceiverIdentifier>>,
    connects: Mutex<Vec<String>>,
    disconnects: Mutex<Vec<String>>,
}

impl InMemoryNetwork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make every connect to this URI fail
    pub(crate) fn make_uri_unreachable(&self, uri: &str) {
        self.inner
            .unreachable_uris
            .lock()
            .unwrap()
            .insert(uri.to_string());
    }

    /// Make every router-socket send addressed at this node fail with
    /// `HostUnreachable`
    pub(crate) fn make_node_unreachable(&self, node: ReceiverIdentifier) {
        self.inner.unreachable_nodes.lock().unwrap().insert(node);
    }

    /// Everything sent through router sockets so far
    pub(crate) fn sent(&self) -> Vec<RouterMessage> {
        self.inner.sent.lock().unwrap().clone()
    }

    pub(crate) fn connects(&self) -> Vec<String> {
        self.inner.connects.lock().unwrap().clone()
    }

    pub(crate) fn disconnects(&self) -> Vec<String> {
        self.inner.disconnects.lock().unwrap().clone()
    }

    /// Publish a message on an endpoint, as a remote publisher would
    pub(crate) fn publish(&self, uri: &str, message: RouterMessage) {
        let sender = self.endpoint(uri);
        // no subscribers yet is fine
        let _ = sender.send(message);
    }

    fn endpoint(&self, uri: &str) -> broadcast::Sender<RouterMessage> {
        self.inner
            .endpoints
            .lock()
            .unwrap()
            .entry(uri.to_string())
            .or_insert_with(|| broadcast::channel(ENDPOINT_CAPACITY).0)
            .clone()
    }
}

impl SocketFactory for InMemoryNetwork {
    fn router_socket(&self) -> Box<dyn TransportSocket> {
        Box::new(InMemorySocket::new(self.clone(), SocketKind::Router))
    }

    fn publisher_socket(&self) -> Box<dyn TransportSocket> {
        Box::new(InMemorySocket::new(self.clone(), SocketKind::Publisher))
    }

    fn subscriber_socket(&self) -> Box<dyn TransportSocket> {
        Box::new(InMemorySocket::new(self.clone(), SocketKind::Subscriber))
    }
}

#[derive(Clone, Copy, PartialEq)]
enum SocketKind {
    Router,
    Publisher,
    Subscriber,
}

struct InMemorySocket {
    network: InMemoryNetwork,
    kind: SocketKind,
    bound: Option<broadcast::Sender<RouterMessage>>,
    incoming_tx: mpsc::UnboundedSender<RouterMessage>,
    incoming_rx: mpsc::UnboundedReceiver<RouterMessage>,
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl InMemorySocket {
    fn new(network: InMemoryNetwork, kind: SocketKind) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            network,
            kind,
            bound: None,
            incoming_tx,
            incoming_rx,
            forwarders: HashMap::new(),
        }
    }
}

#[async_trait]
impl TransportSocket for InMemorySocket {
    async fn connect(
        &mut self,
        uri: &str,
        _wait_for_establishment: bool,
    ) -> Result<(), TransportError> {
        if self
            .network
            .inner
            .unreachable_uris
            .lock()
            .unwrap()
            .contains(uri)
        {
            return Err(TransportError::ConnectionFailed {
                uri: uri.to_string(),
                reason: "unreachable".to_string(),
            });
        }
        self.network
            .inner
            .connects
            .lock()
            .unwrap()
            .push(uri.to_string());

        if self.kind == SocketKind::Subscriber && !self.forwarders.contains_key(uri) {
            let mut endpoint_rx = self.network.endpoint(uri).subscribe();
            let incoming = self.incoming_tx.clone();
            let forwarder = tokio::spawn(async move {
                loop {
                    match endpoint_rx.recv().await {
                        Ok(message) => {
                            if incoming.send(message).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            self.forwarders.insert(uri.to_string(), forwarder);
        }
        Ok(())
    }

    async fn disconnect(&mut self, uri: &str) -> Result<(), TransportError> {
        self.network
            .inner
            .disconnects
            .lock()
            .unwrap()
            .push(uri.to_string());
        if let Some(forwarder) = self.forwarders.remove(uri) {
            forwarder.abort();
        }
        Ok(())
    }

    async fn bind(&mut self, uri: &str) -> Result<(), TransportError> {
        self.bound = Some(self.network.endpoint(uri));
        Ok(())
    }

    async fn send(&mut self, message: RouterMessage) -> Result<(), TransportError> {
        match self.kind {
            SocketKind::Publisher => match &self.bound {
                Some(endpoint) => {
                    let _ = endpoint.send(message);
                    Ok(())
                }
                None => Err(TransportError::Closed),
            },
            SocketKind::Router => {
                if self
                    .network
                    .inner
                    .unreachable_nodes
                    .lock()
                    .unwrap()
                    .contains(&message.receiver_node_identity)
                {
                    return Err(TransportError::HostUnreachable(
                        message.receiver_node_identity.to_string(),
                    ));
                }
                self.network.inner.sent.lock().unwrap().push(message);
                Ok(())
            }
            SocketKind::Subscriber => Err(TransportError::Closed),
        }
    }

    async fn receive(
        &mut self,
        cancellation: &CancellationToken,
    ) -> Result<Option<RouterMessage>, TransportError> {
        tokio::select! {
            _ = cancellation.cancelled() => Ok(None),
            message = self.incoming_rx.recv() => Ok(message),
        }
    }

    fn set_mandatory_routing(&mut self) {}

    fn subscribe(&mut self, _topic: Option<&[u8]>) {}
}

impl Drop for InMemorySocket {
    fn drop(&mut self) {
        for forwarder in self.forwarders.values() {
            forwarder.abort();
        }
    }
}

/// Records every announcement the router makes to the cluster
#[derive(Default)]
pub(crate) struct RecordingBootstrap {
    registered: Mutex<Vec<(String, Vec<MessageIdentifier>)>>,
    unregistered: Mutex<Vec<MessageIdentifier>>,
    discovered: Mutex<Vec<MessageIdentifier>>,
}

impl RecordingBootstrap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn registered(&self) -> Vec<(String, Vec<MessageIdentifier>)> {
        self.registered.lock().unwrap().clone()
    }

    pub(crate) fn unregistered(&self) -> Vec<MessageIdentifier> {
        self.unregistered.lock().unwrap().clone()
    }

    pub(crate) fn discovered(&self) -> Vec<MessageIdentifier> {
        self.discovered.lock().unwrap().clone()
    }
}

impl ClusterBootstrap for RecordingBootstrap {
    fn register_self(&self, identifiers: Vec<MessageIdentifier>, domain: &str) {
        self.registered
            .lock()
            .unwrap()
            .push((domain.to_string(), identifiers));
    }

    fn unregister_self(&self, identifiers: Vec<MessageIdentifier>) {
        self.unregistered.lock().unwrap().extend(identifiers);
    }

    fn discover_route(&self, identifier: &MessageIdentifier) {
        self.discovered.lock().unwrap().push(identifier.clone());
    }
}

/// Poll `check` until it holds or `timeout` elapses, then assert it
pub(crate) async fn periodic_check<F>(check: F, timeout: Duration)
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(check(), "Periodic check failed.");
}
