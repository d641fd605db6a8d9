// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

use std::time::Duration;

use super::*;

fn peer(name: &str) -> NodeAddress {
    NodeAddress::new(format!("tcp://{name}:5000"), name.as_bytes().to_vec())
}

fn health(name: &str) -> Health {
    Health {
        heartbeat_uri: format!("tcp://{name}:5001"),
        heartbeat_interval: Duration::from_secs(5),
    }
}

fn register(
    table: &mut ExternalRoutingTable,
    peer: &NodeAddress,
    receiver: ReceiverIdentifier,
    message: MessageIdentifier,
) -> PeerConnection {
    table
        .add_message_route(ExternalRouteRegistration {
            peer: peer.clone(),
            health: health("hb"),
            route: RouteContract { receiver, message },
        })
        .expect("registration should succeed")
}

fn lookup(message: MessageIdentifier, distribution: Distribution) -> ExternalRouteLookupRequest {
    ExternalRouteLookupRequest {
        receiver_node_identity: ReceiverIdentifier::empty(),
        message,
        distribution,
    }
}

/// Walk all six indices and assert their cross-references hold
fn assert_consistent(table: &ExternalRoutingTable) {
    for (node, connection) in &table.node_connection {
        assert!(
            table.node_actors.contains_key(node) || table.node_message_hubs.contains_key(node),
            "tracked node {node} has neither actors nor hubs"
        );
        assert!(
            table
                .connection_nodes
                .get(&connection.node.uri)
                .is_some_and(|nodes| nodes.contains(node)),
            "node {node} missing from its connection's node set"
        );
    }
    for node in table.node_actors.keys().chain(table.node_message_hubs.keys()) {
        assert!(
            table.node_connection.contains_key(node),
            "receiver owner {node} has no tracked connection"
        );
    }
    for (message, nodes) in &table.message_nodes {
        assert!(!nodes.is_empty(), "empty node rotation left for {message}");
        for node in nodes {
            assert!(
                table.node_connection.contains_key(node),
                "message {message} routed to untracked node {node}"
            );
        }
    }
    for (uri, nodes) in &table.connection_nodes {
        assert!(!nodes.is_empty(), "empty node set left for connection {uri}");
        for node in nodes {
            assert_eq!(
                table.node_connection.get(node).map(|c| c.node.uri.as_str()),
                Some(uri.as_str()),
                "connection set for {uri} references node {node} with a different uri"
            );
        }
    }
    for actor in table.actor_messages.keys() {
        assert!(
            table
                .node_actors
                .values()
                .any(|actors| actors.contains(actor)),
            "actor {actor} mapped to messages but owned by no node"
        );
    }
}

#[test]
fn actor_registration_populates_all_indices() {
    let mut table = ExternalRoutingTable::new();
    let node = peer("n1");
    let message = MessageIdentifier::exact("msg", 1, "");
    let connection = register(
        &mut table,
        &node,
        ReceiverIdentifier::actor("a1"),
        message.clone(),
    );

    assert!(!connection.connected);
    assert_eq!(connection.node, node);
    assert_consistent(&table);

    let found = table.find_routes(&lookup(message, Distribution::Unicast));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].node.identity, node.identity);
}

#[test]
fn unknown_receiver_kind_is_rejected_without_side_effects() {
    let mut table = ExternalRoutingTable::new();
    let untagged = ReceiverIdentifier::from_bytes(&b"raw"[..]);
    let result = table.add_message_route(ExternalRouteRegistration {
        peer: peer("n1"),
        health: health("n1"),
        route: RouteContract {
            receiver: untagged,
            message: MessageIdentifier::exact("msg", 1, ""),
        },
    });
    assert!(matches!(
        result,
        Err(RouteRegistrationError::UnknownReceiverKind(_))
    ));
    assert!(table.node_connection.is_empty());
    assert!(table.connection_nodes.is_empty());
    assert_consistent(&table);
}

#[test]
fn unicast_round_robins_over_nodes() {
    let mut table = ExternalRoutingTable::new();
    let message = MessageIdentifier::exact("msg", 1, "");
    for name in ["n1", "n2", "n3"] {
        register(
            &mut table,
            &peer(name),
            ReceiverIdentifier::actor(format!("a-{name}")),
            message.clone(),
        );
    }

    let mut order = Vec::new();
    for _ in 0..6 {
        let found = table.find_routes(&lookup(message.clone(), Distribution::Unicast));
        assert_eq!(found.len(), 1);
        order.push(found[0].node.uri.clone());
    }
    // fair rotation over all three, twice around
    assert_eq!(order[0..3], order[3..6]);
    let mut distinct = order[0..3].to_vec();
    distinct.sort();
    distinct.dedup();
    assert_eq!(distinct.len(), 3);
    assert_consistent(&table);
}

#[test]
fn broadcast_returns_all_nodes() {
    let mut table = ExternalRoutingTable::new();
    let message = MessageIdentifier::exact("msg", 1, "");
    for name in ["n1", "n2"] {
        register(
            &mut table,
            &peer(name),
            ReceiverIdentifier::actor(format!("a-{name}")),
            message.clone(),
        );
    }
    let found = table.find_routes(&lookup(message, Distribution::Broadcast));
    assert_eq!(found.len(), 2);
}

#[test]
fn directed_lookup_hits_the_named_node_and_falls_back_when_unknown() {
    let mut table = ExternalRoutingTable::new();
    let message = MessageIdentifier::exact("msg", 1, "");
    let n1 = peer("n1");
    register(
        &mut table,
        &n1,
        ReceiverIdentifier::actor("a1"),
        message.clone(),
    );
    register(
        &mut table,
        &peer("n2"),
        ReceiverIdentifier::actor("a2"),
        message.clone(),
    );

    let directed = table.find_routes(&ExternalRouteLookupRequest {
        receiver_node_identity: n1.identity.clone(),
        message: message.clone(),
        distribution: Distribution::Unicast,
    });
    assert_eq!(directed.len(), 1);
    assert_eq!(directed[0].node.identity, n1.identity);

    // a directed lookup for an untracked node falls back to the message index
    let fallback = table.find_routes(&ExternalRouteLookupRequest {
        receiver_node_identity: ReceiverIdentifier::from_bytes(&b"gone"[..]),
        message,
        distribution: Distribution::Unicast,
    });
    assert_eq!(fallback.len(), 1);
}

#[test]
fn remove_node_cascades_through_every_index() {
    let mut table = ExternalRoutingTable::new();
    let n1 = peer("n1");
    let shared = MessageIdentifier::exact("shared", 1, "");
    register(
        &mut table,
        &n1,
        ReceiverIdentifier::actor("a1"),
        shared.clone(),
    );
    register(
        &mut table,
        &n1,
        ReceiverIdentifier::actor("a1"),
        MessageIdentifier::exact("solo", 1, ""),
    );
    register(
        &mut table,
        &n1,
        ReceiverIdentifier::message_hub("h1"),
        MessageIdentifier::any("h1"),
    );
    register(
        &mut table,
        &peer("n2"),
        ReceiverIdentifier::actor("a2"),
        shared.clone(),
    );

    let result = table.remove_node_route(&n1.identity);
    assert_eq!(result.uri.as_deref(), Some(n1.uri.as_str()));
    assert_eq!(result.connection_action, PeerConnectionAction::Disconnect);
    assert_consistent(&table);

    // the other node still serves the shared message
    let found = table.find_routes(&lookup(shared, Distribution::Broadcast));
    assert_eq!(found.len(), 1);
    assert!(table
        .find_routes(&lookup(MessageIdentifier::exact("solo", 1, ""), Distribution::Unicast))
        .is_empty());
}

#[test]
fn remove_untracked_node_reports_not_found() {
    let mut table = ExternalRoutingTable::new();
    let result = table.remove_node_route(&ReceiverIdentifier::from_bytes(&b"ghost"[..]));
    assert!(result.uri.is_none());
    assert_eq!(result.connection_action, PeerConnectionAction::NotFound);
}

#[test]
fn shared_uri_connection_survives_until_last_node_leaves() {
    let mut table = ExternalRoutingTable::new();
    // two node identities behind one URI
    let uri = "tcp://host:5000";
    let n1 = NodeAddress::new(uri, &b"node-1"[..]);
    let n2 = NodeAddress::new(uri, &b"node-2"[..]);
    register(
        &mut table,
        &n1,
        ReceiverIdentifier::actor("a1"),
        MessageIdentifier::exact("m1", 1, ""),
    );
    register(
        &mut table,
        &n2,
        ReceiverIdentifier::actor("a2"),
        MessageIdentifier::exact("m2", 1, ""),
    );

    let first = table.remove_node_route(&n1.identity);
    assert_eq!(first.connection_action, PeerConnectionAction::KeepConnection);
    assert_consistent(&table);

    let second = table.remove_node_route(&n2.identity);
    assert_eq!(second.connection_action, PeerConnectionAction::Disconnect);
    assert_consistent(&table);
}

#[test]
fn retracting_a_message_prunes_the_node_from_its_rotation() {
    let mut table = ExternalRoutingTable::new();
    let n1 = peer("n1");
    let m1 = MessageIdentifier::exact("m1", 1, "");
    let m2 = MessageIdentifier::exact("m2", 1, "");
    let actor = ReceiverIdentifier::actor("a1");
    register(&mut table, &n1, actor.clone(), m1.clone());
    register(&mut table, &n1, actor.clone(), m2.clone());

    // retracting m1 leaves the actor alive for m2, but m1 is unroutable
    let result = table.remove_message_route(&ExternalRouteRemoval {
        node_identity: n1.identity.clone(),
        route: RouteContract {
            receiver: actor.clone(),
            message: m1.clone(),
        },
    });
    assert_eq!(result.connection_action, PeerConnectionAction::NotFound);
    assert!(table.find_routes(&lookup(m1, Distribution::Unicast)).is_empty());
    assert_eq!(
        table
            .find_routes(&lookup(m2.clone(), Distribution::Unicast))
            .len(),
        1
    );
    assert_consistent(&table);

    // retracting the last message removes the actor, the node and the
    // connection
    let result = table.remove_message_route(&ExternalRouteRemoval {
        node_identity: n1.identity.clone(),
        route: RouteContract {
            receiver: actor,
            message: m2.clone(),
        },
    });
    assert_eq!(result.connection_action, PeerConnectionAction::Disconnect);
    assert!(table.find_routes(&lookup(m2, Distribution::Unicast)).is_empty());
    assert!(table.node_connection.is_empty());
    assert_consistent(&table);
}

#[test]
fn node_stays_in_rotation_while_another_actor_handles_the_message() {
    let mut table = ExternalRoutingTable::new();
    let n1 = peer("n1");
    let m1 = MessageIdentifier::exact("m1", 1, "");
    let m2 = MessageIdentifier::exact("m2", 1, "");
    let a1 = ReceiverIdentifier::actor("a1");
    let a2 = ReceiverIdentifier::actor("a2");
    register(&mut table, &n1, a1.clone(), m1.clone());
    register(&mut table, &n1, a1.clone(), m2.clone());
    register(&mut table, &n1, a2.clone(), m1.clone());

    // a2 still serves m1 after a1 drops it
    let result = table.remove_message_route(&ExternalRouteRemoval {
        node_identity: n1.identity.clone(),
        route: RouteContract {
            receiver: a1,
            message: m1.clone(),
        },
    });
    assert_eq!(result.connection_action, PeerConnectionAction::NotFound);
    assert_eq!(
        table
            .find_routes(&lookup(m1.clone(), Distribution::Unicast))
            .len(),
        1
    );
    assert_consistent(&table);

    // once a2 drops it too, the node leaves the m1 rotation but stays
    // tracked for m2
    let result = table.remove_message_route(&ExternalRouteRemoval {
        node_identity: n1.identity.clone(),
        route: RouteContract {
            receiver: a2,
            message: m1.clone(),
        },
    });
    assert_eq!(result.connection_action, PeerConnectionAction::NotFound);
    assert!(table.find_routes(&lookup(m1, Distribution::Unicast)).is_empty());
    assert_eq!(
        table.find_routes(&lookup(m2, Distribution::Unicast)).len(),
        1
    );
    assert_consistent(&table);
}

#[test]
fn undirected_removal_strips_a_message_from_every_actor() {
    let mut table = ExternalRoutingTable::new();
    let n1 = peer("n1");
    let m1 = MessageIdentifier::exact("m1", 1, "");
    register(
        &mut table,
        &n1,
        ReceiverIdentifier::actor("a1"),
        m1.clone(),
    );
    register(
        &mut table,
        &n1,
        ReceiverIdentifier::actor("a2"),
        m1.clone(),
    );

    let result = table.remove_message_route(&ExternalRouteRemoval {
        node_identity: n1.identity.clone(),
        route: RouteContract {
            receiver: ReceiverIdentifier::empty(),
            message: m1.clone(),
        },
    });
    assert_eq!(result.connection_action, PeerConnectionAction::Disconnect);
    assert!(table.find_routes(&lookup(m1, Distribution::Broadcast)).is_empty());
    assert!(table.node_connection.is_empty());
    assert_consistent(&table);
}

#[test]
fn hub_removal_keeps_node_while_actors_remain() {
    let mut table = ExternalRoutingTable::new();
    let n1 = peer("n1");
    let hub = ReceiverIdentifier::message_hub("h1");
    register(&mut table, &n1, hub.clone(), MessageIdentifier::any("h1"));
    register(
        &mut table,
        &n1,
        ReceiverIdentifier::actor("a1"),
        MessageIdentifier::exact("m1", 1, ""),
    );

    let result = table.remove_message_route(&ExternalRouteRemoval {
        node_identity: n1.identity.clone(),
        route: RouteContract {
            receiver: hub,
            message: MessageIdentifier::any("h1"),
        },
    });
    assert_eq!(result.connection_action, PeerConnectionAction::NotFound);
    assert!(table.node_connection.contains_key(&n1.identity));
    assert_consistent(&table);
}

#[test]
fn mark_connected_flips_the_stored_state() {
    let mut table = ExternalRoutingTable::new();
    let n1 = peer("n1");
    let message = MessageIdentifier::exact("m1", 1, "");
    register(
        &mut table,
        &n1,
        ReceiverIdentifier::actor("a1"),
        message.clone(),
    );

    table.mark_connected(&n1.identity);
    let found = table.find_routes(&lookup(message, Distribution::Unicast));
    assert!(found[0].connected);
}
