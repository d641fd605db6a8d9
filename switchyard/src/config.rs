// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Configuration for the message router and the cluster health monitor

use std::time::Duration;

use crate::identifiers::NodeAddress;

/// Configuration of a node's message router
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// This node's scale-out address, stamped onto every forwarded envelope
    pub scale_out_address: NodeAddress,
}

/// Configuration of the cluster health monitor
#[derive(Clone, Debug)]
pub struct HealthMonitorConfig {
    /// Endpoint of the monitor's internal pub/sub intercom
    pub intercom_endpoint: String,
    /// How often tracked-but-unmonitored peers are checked for staleness
    pub stale_peers_check_interval: Duration,
    /// Silence after which a tracked-but-unmonitored peer is probed
    pub peer_is_stale_after: Duration,
    /// Heartbeats a monitored peer may miss before it is declared dead
    pub missing_heartbeats_before_deletion: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            intercom_endpoint: "inproc://health".to_string(),
            stale_peers_check_interval: Duration::from_secs(1),
            peer_is_stale_after: Duration::from_secs(30),
            missing_heartbeats_before_deletion: 3,
        }
    }
}
