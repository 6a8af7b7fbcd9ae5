//! Node identity and the process-wide node list.
//!
//! A [`NodeId`] is the opaque identity of one process in the cluster.
//! The identity of *this* process and the global node list are
//! process-wide cells, set exactly once during communication init; the
//! main node is the head of the list.

use crate::error::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Identifier for a node in the cluster.
///
/// Nodes are opaque identifiers: totally ordered, hashable, displayable,
/// and serializable. The runtime does not interpret them beyond that;
/// the transport layer maps a `NodeId` to its network address.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a new node identifier from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the node identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

static MY_NODE: OnceLock<NodeId> = OnceLock::new();
static ALL_NODES: OnceLock<Vec<NodeId>> = OnceLock::new();

/// Returns this process's node identity.
///
/// Fails with [`ErrorKind::NodeIdUnset`] before communication init.
pub fn my_node() -> Result<NodeId> {
    MY_NODE
        .get()
        .cloned()
        .ok_or_else(|| Error::new(ErrorKind::NodeIdUnset))
}

/// Returns this process's node identity, or `None` before init.
#[must_use]
pub fn try_my_node() -> Option<NodeId> {
    MY_NODE.get().cloned()
}

/// Returns the global node list, main node first.
pub fn all_nodes() -> Result<Vec<NodeId>> {
    ALL_NODES
        .get()
        .cloned()
        .ok_or_else(|| Error::new(ErrorKind::NodeIdUnset).with_context("node list not published"))
}

/// Returns the main node (the head of the global node list).
pub fn main_node() -> Result<NodeId> {
    all_nodes().map(|ns| ns[0].clone())
}

/// Returns true if this process is the main node.
pub fn is_main() -> Result<bool> {
    Ok(main_node()? == my_node()?)
}

/// Sets this process's node identity.
///
/// Setting the same value again is a no-op; a conflicting value is an
/// internal error.
pub(crate) fn set_my_node(node: NodeId) -> Result<()> {
    match MY_NODE.set(node.clone()) {
        Ok(()) => Ok(()),
        Err(_) if MY_NODE.get() == Some(&node) => Ok(()),
        Err(_) => Err(Error::new(ErrorKind::Internal)
            .with_context(format!("node identity already set, refusing {node}"))),
    }
}

/// Publishes the global node list (main first).
pub(crate) fn set_all_nodes(nodes: Vec<NodeId>) -> Result<()> {
    debug_assert!(!nodes.is_empty());
    match ALL_NODES.set(nodes.clone()) {
        Ok(()) => Ok(()),
        Err(_) if ALL_NODES.get() == Some(&nodes) => Ok(()),
        Err(_) => {
            Err(Error::new(ErrorKind::Internal).with_context("node list already published"))
        }
    }
}

/// Returns true if the node list has been published.
pub(crate) fn nodes_published() -> bool {
    ALL_NODES.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_display_is_raw_address() {
        let n = NodeId::new("127.0.0.1:7001");
        assert_eq!(n.to_string(), "127.0.0.1:7001");
        assert_eq!(n.as_str(), "127.0.0.1:7001");
    }

    #[test]
    fn node_ids_are_totally_ordered() {
        let a = NodeId::new("a");
        let b = NodeId::new("b");
        assert!(a < b);
        assert_eq!(a.clone().max(b.clone()), b);
    }

    #[test]
    fn set_twice_with_equal_value_is_noop() {
        // The process-wide cells are shared across tests; only the
        // idempotence contract can be exercised here.
        set_my_node(NodeId::new("test-node")).expect("first set");
        set_my_node(NodeId::new("test-node")).expect("idempotent set");
        let err = set_my_node(NodeId::new("other-node")).expect_err("conflict");
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
