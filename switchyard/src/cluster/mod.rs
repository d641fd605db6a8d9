// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Cluster-facing collaborators: self-advertisement bookkeeping and the
//! bootstrap seam the router announces itself through

use std::collections::{BTreeMap, HashSet};

use tracing::warn;

use crate::identifiers::MessageIdentifier;
use crate::security::SecurityProvider;

pub mod health;


/// The router's outbound face to the auto-discovery layer. Implementations
/// carry announcements to whatever discovery medium the deployment uses.
pub trait ClusterBootstrap: Send + Sync {
    /// Advertise message identifiers this node now handles, per domain
    fn register_self(&self, identifiers: Vec<MessageIdentifier>, domain: &str);

    /// Retract message identifiers this node no longer handles
    fn unregister_self(&self, identifiers: Vec<MessageIdentifier>);

    /// Ask the cluster who handles a message
    fn discover_route(&self, identifier: &MessageIdentifier);
}

/// Diff two advertisement snapshots: what became newly advertisable and what
/// stopped being advertisable
pub fn compute_advertisement_delta(
    before: &HashSet<MessageIdentifier>,
    after: &HashSet<MessageIdentifier>,
) -> (Vec<MessageIdentifier>, Vec<MessageIdentifier>) {
    let to_register = after.difference(before).cloned().collect();
    let to_unregister = before.difference(after).cloned().collect();
    (to_register, to_unregister)
}

/// Group identifiers by the security domain they are announced under.
///
/// Exact identifiers go to the single domain their identity maps to;
/// identifiers with no mapped domain are skipped with a warning. Wildcard
/// (hub) identifiers are announced in every allowed domain. Groups come back
/// in stable domain order.
pub fn advertisement_groups(
    identifiers: Vec<MessageIdentifier>,
    security: &dyn SecurityProvider,
) -> Vec<(String, Vec<MessageIdentifier>)> {
    let mut groups: BTreeMap<String, Vec<MessageIdentifier>> = BTreeMap::new();
    for identifier in identifiers {
        if identifier.is_wildcard() {
            for domain in security.allowed_domains() {
                groups.entry(domain).or_default().push(identifier.clone());
            }
        } else {
            match security.domain_of(identifier.identity()) {
                Ok(domain) => groups.entry(domain).or_default().push(identifier),
                Err(error) => {
                    warn!("Message {identifier} not advertised: {error}");
                }
            }
        }
    }
    groups.into_iter().collect()
}
