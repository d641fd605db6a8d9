// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Security seam: message signing and domain mapping.
//!
//! Every message identity belongs to a security domain, and cluster
//! advertisements are grouped per domain. The fabric only consumes this
//! trait; key handling is the provider's business.

use crate::errors::SecurityError;
use crate::message::RouterMessage;

/// Domain every identity maps to under the [NullSecurityProvider]
const GLOBAL_DOMAIN: &str = "global";

/// Maps message identities to security domains and signs outbound envelopes
pub trait SecurityProvider: Send + Sync {
    /// Write the signature for an envelope about to leave the node
    fn sign(&self, message: &mut RouterMessage);

    /// The security domain a message identity belongs to
    fn domain_of(&self, message_identity: &[u8]) -> Result<String, SecurityError>;

    /// Is this domain allowed on this node?
    fn domain_is_allowed(&self, domain: &str) -> bool;

    /// All domains allowed on this node
    fn allowed_domains(&self) -> Vec<String>;
}

/// A provider with a single permissive domain and no real signatures.
/// Suitable for closed deployments and tests.
pub struct NullSecurityProvider;

impl SecurityProvider for NullSecurityProvider {
    fn sign(&self, message: &mut RouterMessage) {
        message.signature = bytes::Bytes::new();
    }

    fn domain_of(&self, _message_identity: &[u8]) -> Result<String, SecurityError> {
        Ok(GLOBAL_DOMAIN.to_string())
    }

    fn domain_is_allowed(&self, domain: &str) -> bool {
        domain == GLOBAL_DOMAIN
    }

    fn allowed_domains(&self) -> Vec<String> {
        vec![GLOBAL_DOMAIN.to_string()]
    }
}
