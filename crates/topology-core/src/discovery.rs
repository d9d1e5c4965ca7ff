//! Discovery results.
//!
//! A scan yields `{role_hint, address}` hellos. Each distinct address
//! becomes one ephemeral node whose identity is derived from a stable hash
//! of the address, so the same address seen twice (in one scan or across
//! scans) maps to the same node.

use crate::hash::fnv1a_hash;
use serde::Serialize;

const DISCOVERED_PREFIX: &str = "discovered-";

/// Identity of the node standing in for a discovered address.
pub fn discovered_identity(address: &str) -> String {
    format!("{DISCOVERED_PREFIX}{:016x}", fnv1a_hash(address))
}

/// Summary of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryReport {
    /// Hellos received before the scan ended
    pub seen: usize,
    /// Identities of newly inserted nodes
    pub added: Vec<String>,
    /// Hellos for addresses we already knew
    pub duplicates: usize,
    /// Whether our own deadline cut the scan short
    pub timed_out: bool,
}
